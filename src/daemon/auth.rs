//! Signed identity assertions.
//!
//! A client proves its identity by posting a signed assertion (kind
//! 27235) bound to the session URL and the `POST` method. This module
//! checks everything about the assertion except the signature itself,
//! which is delegated to an [`IdentityVerifier`].

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::constants::AUTH_ASSERTION_KIND;
use crate::error::{Error, Result};

const UNKNOWN_APP: &str = "Unknown App";

/// Signed assertion as posted to `POST /auth/session`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityAssertion {
    #[serde(default)]
    pub id: Option<String>,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl IdentityAssertion {
    /// Hex sha256 of the canonical serialization
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().is_some_and(|t| t == name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Values of every `scope` tag.
    pub fn permissions(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|tag| tag.first().is_some_and(|t| t == "scope"))
            .filter_map(|tag| tag.get(1).cloned())
            .collect()
    }

    /// The `app` tag, else the `app` field of JSON content.
    pub fn app_name(&self) -> String {
        if let Some(app) = self.tag("app") {
            return app.to_string();
        }
        serde_json::from_str::<serde_json::Value>(&self.content)
            .ok()
            .and_then(|content| content.get("app")?.as_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_APP.to_string())
    }

    /// Structural checks done before anything else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if required fields are empty.
    pub fn check_shape(&self) -> Result<()> {
        if self.pubkey.is_empty() || self.sig.is_empty() || self.kind == 0 {
            return Err(Error::validation(
                "Assertion must contain pubkey, sig, kind, and tags",
            ));
        }
        Ok(())
    }

    /// Check kind, age, URL binding and method binding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first rule that fails.
    pub fn check_binding(&self, expected_url: &str, max_age_secs: u64, now_secs: i64) -> Result<()> {
        if self.kind != AUTH_ASSERTION_KIND {
            return Err(Error::validation(format!(
                "Assertion kind must be {AUTH_ASSERTION_KIND}"
            )));
        }
        let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
        if now_secs.saturating_sub(self.created_at) > max_age {
            return Err(Error::validation("Assertion is too old"));
        }
        if self.tag("u") != Some(expected_url) {
            return Err(Error::validation(
                "Assertion does not match expected URL and method",
            ));
        }
        if self.tag("method") != Some("POST") {
            return Err(Error::validation(
                "Assertion does not match expected URL and method",
            ));
        }
        Ok(())
    }

    /// A present `id` must equal [`IdentityAssertion::compute_id`].
    pub fn id_matches(&self) -> bool {
        self.id.as_ref().is_none_or(|id| *id == self.compute_id())
    }
}

/// Signature verification seam.
pub trait IdentityVerifier: Send + Sync {
    /// True if `assertion.sig` is a valid signature by `assertion.pubkey`
    /// over the assertion id.
    fn verify(&self, assertion: &IdentityAssertion) -> bool;
}

/// Rejects every assertion. Installed when no verifier is configured.
#[derive(Debug, Default)]
pub struct RejectAll;

impl IdentityVerifier for RejectAll {
    fn verify(&self, assertion: &IdentityAssertion) -> bool {
        warn!(
            pubkey = %assertion.pubkey,
            "No signature verifier installed; rejecting identity assertion"
        );
        false
    }
}

/// Accepts any signature. Only for `auth.allow_unsigned = true`.
#[derive(Debug, Default)]
pub struct AcceptUnsigned;

impl IdentityVerifier for AcceptUnsigned {
    fn verify(&self, assertion: &IdentityAssertion) -> bool {
        warn!(
            pubkey = %assertion.pubkey,
            "Accepting identity assertion without signature check"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://localhost:3000/auth/session";

    fn assertion(tags: Vec<Vec<&str>>, content: &str) -> IdentityAssertion {
        let mut a = IdentityAssertion {
            id: None,
            pubkey: "ab".repeat(32),
            created_at: 1_000,
            kind: AUTH_ASSERTION_KIND,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.to_string(),
            sig: "cd".repeat(64),
        };
        a.id = Some(a.compute_id());
        a
    }

    fn bound() -> IdentityAssertion {
        assertion(
            vec![
                vec!["u", URL],
                vec!["method", "POST"],
                vec!["scope", "read"],
                vec!["scope", "write"],
            ],
            "",
        )
    }

    #[test]
    fn test_binding_accepts_fresh_assertion() {
        let a = bound();
        assert!(a.check_shape().is_ok());
        assert!(a.check_binding(URL, 3600, 1_000 + 3600).is_ok());
        assert!(a.id_matches());
    }

    #[test]
    fn test_binding_rejects_old_wrong_url_method_kind() {
        let a = bound();
        assert!(a.check_binding(URL, 3600, 1_000 + 3601).is_err());
        assert!(a.check_binding("http://evil/auth/session", 3600, 1_000).is_err());

        let mut wrong_method = bound();
        wrong_method.tags[1][1] = "GET".into();
        assert!(wrong_method.check_binding(URL, 3600, 1_000).is_err());

        let mut wrong_kind = bound();
        wrong_kind.kind = 1;
        assert!(wrong_kind.check_binding(URL, 3600, 1_000).is_err());
    }

    #[test]
    fn test_tampered_assertion_fails_id_check() {
        let mut a = bound();
        a.content = "changed".into();
        assert!(!a.id_matches());
        a.id = None;
        assert!(a.id_matches());
    }

    #[test]
    fn test_permissions_and_app_name() {
        let a = bound();
        assert_eq!(a.permissions(), vec!["read", "write"]);
        assert_eq!(a.app_name(), "Unknown App");

        let tagged = assertion(vec![vec!["app", "Notes"]], r#"{"app":"Ignored"}"#);
        assert_eq!(tagged.app_name(), "Notes");

        let from_content = assertion(vec![], r#"{"app":"Drive"}"#);
        assert_eq!(from_content.app_name(), "Drive");
    }

    #[test]
    fn test_canonical_id_is_stable() {
        let a = assertion(vec![vec!["u", URL]], "hello");
        assert_eq!(a.compute_id(), a.compute_id());
        assert_eq!(a.compute_id().len(), 64);
    }

    #[test]
    fn test_verifiers() {
        let a = bound();
        assert!(!RejectAll.verify(&a));
        assert!(AcceptUnsigned.verify(&a));
    }
}
