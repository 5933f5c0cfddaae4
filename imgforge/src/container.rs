//! Container image references, symbolic and resolved.

use imgforge_common::checksum;
use serde::{Deserialize, Serialize};

/// A container the image wants embedded, as written by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Registry reference, e.g. `registry.example.com/org/app:latest`.
    pub source: String,
    /// Name the image gets inside the target's container storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Pin to a manifest digest instead of following the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    /// Take the image from the build host's container storage.
    #[serde(default)]
    pub local: bool,
    /// Architecture to select from a manifest list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl SourceSpec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: None,
            digest: None,
            tls_verify: None,
            local: false,
            arch: None,
        }
    }

    /// The name the image is stored under; defaults to the source.
    pub fn local_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }
}

/// A container pinned to content digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub source: String,
    /// Manifest digest.
    pub digest: String,
    /// Digest of the image config, used as the image id.
    pub image_id: String,
    /// Digest of the manifest list the image was selected from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_digest: Option<String>,
    pub local_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    #[serde(default)]
    pub local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl Spec {
    /// Whether every digest is a well formed `sha256:` digest.
    pub fn is_well_formed(&self) -> bool {
        let ok = |d: &str| checksum::split_digest(d).is_ok();
        ok(&self.digest) && ok(&self.image_id) && self.list_digest.as_deref().is_none_or(ok)
    }
}
