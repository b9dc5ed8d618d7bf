//! Content type detection: magic bytes first, then the file extension.

const OCTET_STREAM: &str = "application/octet-stream";

/// Signatures checked against the start of the content.
const MAGIC: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
];

/// Detect the MIME type of `content` stored at `path`.
pub fn detect(content: &[u8], path: &str) -> String {
    if let Some(mime) = sniff(content) {
        return mime.to_string();
    }
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn sniff(content: &[u8]) -> Option<&'static str> {
    // RIFF container: the format tag sits at offset 8.
    if content.len() >= 12 && &content[..4] == b"RIFF" && &content[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    MAGIC
        .iter()
        .find(|(magic, _)| content.starts_with(magic))
        .map(|(_, mime)| *mime)
}
