//! Stages that assemble the final artifact from a tree or a disk file.

use serde::{Deserialize, Serialize};

use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::inputs::InputKind;
use crate::osbuild::stage::StageKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QemuFormat {
    Raw,
    Qcow2 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compat: Option<String>,
    },
    Vpc {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force_size: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subformat: Option<String>,
    },
    Vmdk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subformat: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        adapter_type: Option<String>,
    },
    Vhdx,
}

/// Convert a raw disk file with qemu-img.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QemuOptions {
    pub filename: String,
    pub format: QemuFormat,
}

impl StageKind for QemuOptions {
    const TYPE: &'static str = "org.osbuild.qemu";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("image", InputKind::Files)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        match &self.format {
            QemuFormat::Qcow2 { compat: Some(c) } if !matches!(c.as_str(), "0.10" | "1.1") => Err(
                invalid(Self::TYPE, "format.compat", format!("unsupported compat {c:?}")),
            ),
            QemuFormat::Vpc {
                subformat: Some(s), ..
            } if !matches!(s.as_str(), "dynamic" | "fixed") => Err(invalid(
                Self::TYPE,
                "format.subformat",
                format!("unsupported subformat {s:?}"),
            )),
            QemuFormat::Vmdk {
                subformat: Some(s), ..
            } if !matches!(
                s.as_str(),
                "monolithicSparse" | "monolithicFlat" | "streamOptimized"
            ) =>
            {
                Err(invalid(
                    Self::TYPE,
                    "format.subformat",
                    format!("unsupported subformat {s:?}"),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarFormat {
    Gnu,
    Oldgnu,
    Posix,
    Ustar,
    V7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarRootNode {
    Include,
    Omit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TarOptions {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TarFormat>,
    #[serde(rename = "root-node", default, skip_serializing_if = "Option::is_none")]
    pub root_node: Option<TarRootNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// `auto` picks the compressor from the file suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<bool>,
}

impl TarOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            format: None,
            root_node: None,
            paths: Vec::new(),
            compression: None,
            selinux: None,
            xattrs: None,
        }
    }
}

impl StageKind for TarOptions {
    const TYPE: &'static str = "org.osbuild.tar";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("tree", InputKind::Tree)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if let Some(c) = &self.compression {
            if !matches!(c.as_str(), "auto" | "gzip" | "xz" | "zstd") {
                return Err(invalid(
                    Self::TYPE,
                    "compression",
                    format!("unsupported compression {c:?}"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XzOptions {
    pub filename: String,
}

impl StageKind for XzOptions {
    const TYPE: &'static str = "org.osbuild.xz";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("file", InputKind::Files)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if !self.filename.ends_with(".xz") {
            return Err(invalid(Self::TYPE, "filename", "must end in .xz"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Compression {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SquashfsOptions {
    pub filename: String,
    pub compression: Compression,
}

impl StageKind for SquashfsOptions {
    const TYPE: &'static str = "org.osbuild.squashfs";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("tree", InputKind::Tree)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if !matches!(
            self.compression.method.as_str(),
            "gzip" | "lz4" | "lzo" | "xz" | "zstd"
        ) {
            return Err(invalid(
                Self::TYPE,
                "compression.method",
                format!("unsupported method {:?}", self.compression.method),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErofsOptions {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl StageKind for ErofsOptions {
    const TYPE: &'static str = "org.osbuild.erofs";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("tree", InputKind::Tree)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if let Some(c) = &self.compression {
            if !matches!(c.method.as_str(), "lz4" | "lz4hc" | "lzma" | "deflate" | "zstd") {
                return Err(invalid(
                    Self::TYPE,
                    "compression.method",
                    format!("unsupported method {:?}", c.method),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsoBoot {
    pub image: String,
    pub catalog: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XorrisofsOptions {
    pub filename: String,
    pub volid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<IsoBoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isohybridmbr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolevel: Option<u8>,
}

impl StageKind for XorrisofsOptions {
    const TYPE: &'static str = "org.osbuild.xorrisofs";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("tree", InputKind::Tree)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        let volid_ok = !self.volid.is_empty()
            && self.volid.len() <= 32
            && self
                .volid
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'));
        if !volid_ok {
            return Err(invalid(
                Self::TYPE,
                "volid",
                format!("{:?} must be at most 32 of [A-Z0-9_.-]", self.volid),
            ));
        }
        if self.isolevel.is_some_and(|l| !(1..=4).contains(&l)) {
            return Err(invalid(Self::TYPE, "isolevel", "must be between 1 and 4"));
        }
        Ok(())
    }
}

/// Write an OVF descriptor and manifest next to a vmdk in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OvfOptions {
    pub vmdk: String,
}

impl StageKind for OvfOptions {
    const TYPE: &'static str = "org.osbuild.ovf";

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "vmdk", &self.vmdk)?;
        if !self.vmdk.ends_with(".vmdk") {
            return Err(invalid(Self::TYPE, "vmdk", "must end in .vmdk"));
        }
        Ok(())
    }
}

/// Write `.<name>.hmac` files next to the given paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HmacOptions {
    pub paths: Vec<String>,
    pub algorithm: String,
}

impl StageKind for HmacOptions {
    const TYPE: &'static str = "org.osbuild.hmac";

    fn validate(&self) -> Result<(), StageError> {
        if self.paths.is_empty() {
            return Err(invalid(Self::TYPE, "paths", "at least one path is required"));
        }
        for path in &self.paths {
            super::check_abs_path(Self::TYPE, "paths", path)?;
        }
        if !matches!(
            self.algorithm.as_str(),
            "sha1" | "sha224" | "sha256" | "sha384" | "sha512"
        ) {
            return Err(invalid(
                Self::TYPE,
                "algorithm",
                format!("unsupported algorithm {:?}", self.algorithm),
            ));
        }
        Ok(())
    }
}
