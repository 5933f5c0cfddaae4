use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::stage::StageKind;

const URL_SCHEMES: &[&str] = &["input://", "mount://", "tree://"];

fn check_url(stage: &'static str, field: &str, url: &str) -> Result<(), StageError> {
    if URL_SCHEMES.iter().any(|s| url.starts_with(s)) {
        Ok(())
    } else {
        Err(invalid(
            stage,
            field,
            format!("{url:?} must start with one of {}", URL_SCHEMES.join(", ")),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyPath {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove_destination: bool,
}

impl CopyPath {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            remove_destination: false,
        }
    }
}

/// Copy files or trees between inputs, mounts and the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyOptions {
    pub paths: Vec<CopyPath>,
}

impl StageKind for CopyOptions {
    const TYPE: &'static str = "org.osbuild.copy";

    fn validate(&self) -> Result<(), StageError> {
        if self.paths.is_empty() {
            return Err(invalid(Self::TYPE, "paths", "at least one path is required"));
        }
        for (i, path) in self.paths.iter().enumerate() {
            check_url(Self::TYPE, &format!("paths[{i}].from"), &path.from)?;
            check_url(Self::TYPE, &format!("paths[{i}].to"), &path.to)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkdirPath {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parents: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exist_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkdirOptions {
    pub paths: Vec<MkdirPath>,
}

impl StageKind for MkdirOptions {
    const TYPE: &'static str = "org.osbuild.mkdir";

    fn validate(&self) -> Result<(), StageError> {
        for (i, dir) in self.paths.iter().enumerate() {
            let field = format!("paths[{i}]");
            if !dir.path.starts_with('/') && !URL_SCHEMES.iter().any(|s| dir.path.starts_with(s))
            {
                return Err(invalid(Self::TYPE, field, format!("{:?} must be absolute", dir.path)));
            }
            if dir.mode.is_some_and(|m| m > 0o7777) {
                return Err(invalid(Self::TYPE, field, "mode out of range"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChmodItem {
    /// Symbolic or octal mode as accepted by chmod(1).
    pub mode: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChmodOptions {
    pub items: BTreeMap<String, ChmodItem>,
}

fn is_chmod_mode(mode: &str) -> bool {
    if !mode.is_empty() && mode.chars().all(|c| ('0'..='7').contains(&c)) {
        return mode.len() <= 4;
    }
    mode.split(',').all(|clause| {
        let ops = clause.trim_start_matches(['u', 'g', 'o', 'a']);
        let mut chars = ops.chars();
        matches!(chars.next(), Some('+' | '-' | '='))
            && chars.all(|c| "rwxXst".contains(c))
    })
}

impl StageKind for ChmodOptions {
    const TYPE: &'static str = "org.osbuild.chmod";

    fn validate(&self) -> Result<(), StageError> {
        for (path, item) in &self.items {
            super::check_abs_path(Self::TYPE, "items", path)?;
            if !is_chmod_mode(&item.mode) {
                return Err(invalid(
                    Self::TYPE,
                    format!("items.{path}.mode"),
                    format!("invalid mode {:?}", item.mode),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LnPath {
    pub target: String,
    pub link_name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub symbolic: bool,
}

/// Create links in the tree; used for symlinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LnOptions {
    pub paths: Vec<LnPath>,
}

impl LnOptions {
    pub fn symlink(target: impl Into<String>, link_name: impl Into<String>) -> Self {
        Self {
            paths: vec![LnPath {
                target: target.into(),
                link_name: link_name.into(),
                symbolic: true,
            }],
        }
    }
}

impl StageKind for LnOptions {
    const TYPE: &'static str = "org.osbuild.ln";

    fn validate(&self) -> Result<(), StageError> {
        for (i, link) in self.paths.iter().enumerate() {
            if link.target.is_empty() {
                return Err(invalid(Self::TYPE, format!("paths[{i}].target"), "empty"));
            }
            check_url(Self::TYPE, &format!("paths[{i}].link_name"), &link.link_name)?;
        }
        Ok(())
    }
}

/// Create or resize a file; `size` is passed to truncate(1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TruncateOptions {
    pub filename: String,
    pub size: String,
}

impl TruncateOptions {
    pub fn new(filename: impl Into<String>, bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            size: bytes.to_string(),
        }
    }
}

impl StageKind for TruncateOptions {
    const TYPE: &'static str = "org.osbuild.truncate";

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        let digits = self.size.trim_start_matches(['+', '-', '<', '>', '/', '%']);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(
                Self::TYPE,
                "size",
                format!("{:?} is not a byte count", self.size),
            ));
        }
        Ok(())
    }
}
