//! Conditional request evaluation (`If-Match`, `If-None-Match`,
//! `If-Modified-Since`, `If-Unmodified-Since`).
//!
//! HTTP dates carry whole seconds, so timestamps are truncated to the
//! second before comparing.

use crate::daemon::services::files::FileRecord;
use crate::error::{Error, Result};
use crate::utils::parse_http_date;

/// Parsed entity-tag list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntityTags {
    Any,
    Tags(Vec<String>),
}

impl EntityTags {
    fn parse(header: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "*" {
            return Ok(EntityTags::Any);
        }
        let tags = value
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|tag| {
                let opaque = tag.strip_prefix("W/").unwrap_or(tag);
                if opaque.len() >= 2 && opaque.starts_with('"') && opaque.ends_with('"') {
                    Ok(tag.to_string())
                } else {
                    Err(Error::validation(format!("Invalid entity tag in {header}: {tag}")))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        if tags.is_empty() {
            return Err(Error::validation(format!("Empty {header} header")));
        }
        Ok(EntityTags::Tags(tags))
    }

    /// Strong comparison: weak tags never match.
    fn matches_strong(&self, etag: &str) -> bool {
        match self {
            EntityTags::Any => true,
            EntityTags::Tags(tags) => tags.iter().any(|t| t == etag),
        }
    }

    /// Weak comparison: the `W/` prefix is ignored.
    fn matches_weak(&self, etag: &str) -> bool {
        match self {
            EntityTags::Any => true,
            EntityTags::Tags(tags) => tags
                .iter()
                .any(|t| t.strip_prefix("W/").unwrap_or(t) == etag),
        }
    }
}

/// Outcome of evaluating preconditions for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    Proceed,
    NotModified,
}

/// Raw header values, as received.
#[derive(Debug, Clone, Default)]
pub struct ConditionalHeaders<'a> {
    pub if_match: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
    pub if_unmodified_since: Option<&'a str>,
}

/// Validated preconditions of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    if_match: Option<EntityTags>,
    if_none_match: Option<EntityTags>,
    if_modified_since: Option<i64>,
    if_unmodified_since: Option<i64>,
}

fn parse_date(header: &str, value: Option<&str>) -> Result<Option<i64>> {
    value
        .map(|v| {
            parse_http_date(v)
                .ok_or_else(|| Error::validation(format!("Invalid {header} date: {v}")))
        })
        .transpose()
}

fn whole_seconds(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(1000)
}

impl Preconditions {
    /// Validate raw header values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for unparseable dates and for entity
    /// tags that are neither `*` nor quoted.
    pub fn parse(headers: &ConditionalHeaders<'_>) -> Result<Self> {
        Ok(Self {
            if_match: headers
                .if_match
                .map(|v| EntityTags::parse("If-Match", v))
                .transpose()?,
            if_none_match: headers
                .if_none_match
                .map(|v| EntityTags::parse("If-None-Match", v))
                .transpose()?,
            if_modified_since: parse_date("If-Modified-Since", headers.if_modified_since)?,
            if_unmodified_since: parse_date("If-Unmodified-Since", headers.if_unmodified_since)?,
        })
    }

    /// Check preconditions before a write or delete of a resource whose
    /// current state is `current`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PreconditionFailed`] with the current ETag when a
    /// precondition does not hold.
    pub fn check_write(&self, current: Option<&FileRecord>) -> Result<()> {
        let Some(record) = current else {
            if self.if_match.is_some() {
                return Err(Error::precondition_failed(
                    "Cannot match ETag for non-existent file",
                    None,
                ));
            }
            return Ok(());
        };

        let etag = record.etag();
        if let Some(tags) = &self.if_match
            && !tags.matches_strong(&etag)
        {
            return Err(Error::precondition_failed(
                "File has been modified by another client",
                Some(etag),
            ));
        }
        if let Some(tags) = &self.if_none_match
            && tags.matches_weak(&etag)
        {
            return Err(Error::precondition_failed(
                "File already exists with matching ETag",
                Some(etag),
            ));
        }
        if let Some(date) = self.if_unmodified_since
            && whole_seconds(record.timestamp) > date
        {
            return Err(Error::precondition_failed(
                "File has been modified since specified date",
                Some(etag),
            ));
        }
        Ok(())
    }

    /// Decide between a full response and 304 for a read of `record`.
    pub fn check_read(&self, record: &FileRecord) -> ReadDecision {
        if let Some(tags) = &self.if_none_match {
            // If-Modified-Since is ignored whenever If-None-Match is present.
            return if tags.matches_weak(&record.etag()) {
                ReadDecision::NotModified
            } else {
                ReadDecision::Proceed
            };
        }
        if let Some(date) = self.if_modified_since
            && whole_seconds(record.timestamp) <= date
        {
            return ReadDecision::NotModified;
        }
        ReadDecision::Proceed
    }
}
