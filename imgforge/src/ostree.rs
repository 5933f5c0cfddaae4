//! OSTree commit references, symbolic and resolved.

use serde::{Deserialize, Serialize};

/// A commit to pull, named by remote and ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: String,
    /// Pin to this commit (or ref) instead of the remote head.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Fetch with subscription credentials.
    #[serde(default)]
    pub rhsm: bool,
}

impl SourceSpec {
    pub fn new(url: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference: reference.into(),
            parent: None,
            rhsm: false,
        }
    }
}

pub const RHSM_CONSUMER_SECRET: &str = "org.osbuild.rhsm.consumer";

/// A commit pinned to its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSpec {
    #[serde(rename = "ref")]
    pub reference: String,
    pub url: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<String>,
}

/// A ref is a slash separated path of `[A-Za-z0-9_.-]` components.
pub fn is_valid_ref(reference: &str) -> bool {
    !reference.is_empty()
        && reference.split('/').all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs() {
        assert!(is_valid_ref("fedora/42/x86_64/iot"));
        assert!(!is_valid_ref("fedora//iot"));
        assert!(!is_valid_ref("fedora/iot "));
        assert!(!is_valid_ref(""));
    }

    #[test]
    fn ref_field_is_renamed() {
        let spec = SourceSpec::new("https://ostree.example.com/repo", "fedora/42/x86_64/iot");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ref"], "fedora/42/x86_64/iot");
    }
}
