//! Partitioning and formatting stages. They all operate on a device named
//! `device`; the fs-stage generator supplies it.

use serde::{Deserialize, Serialize};

use crate::disk::{Argon2id, is_dos_disk_id, is_uuid, is_vfat_id};
use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::inputs::InputKind;
use crate::osbuild::stage::StageKind;

fn check_uuid(stage: &'static str, uuid: &str) -> Result<(), StageError> {
    if is_uuid(uuid) {
        Ok(())
    } else {
        Err(invalid(stage, "uuid", format!("{uuid:?} is not a uuid")))
    }
}

fn check_label(stage: &'static str, label: Option<&str>, max: usize) -> Result<(), StageError> {
    match label {
        Some(label) if label.len() > max => Err(invalid(
            stage,
            "label",
            format!("{label:?} is longer than {max} bytes"),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SfdiskPartition {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bootable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Sectors.
    pub size: u64,
    /// Sectors.
    pub start: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

fn check_partitions(stage: &'static str, parts: &[SfdiskPartition]) -> Result<(), StageError> {
    if parts.is_empty() {
        return Err(invalid(stage, "partitions", "at least one partition is required"));
    }
    for (i, part) in parts.iter().enumerate() {
        if part.size == 0 {
            return Err(invalid(stage, format!("partitions[{i}].size"), "must be positive"));
        }
    }
    Ok(())
}

/// DOS (and GPT) partitioning via sfdisk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SfdiskOptions {
    pub label: String,
    pub uuid: String,
    pub partitions: Vec<SfdiskPartition>,
}

impl StageKind for SfdiskOptions {
    const TYPE: &'static str = "org.osbuild.sfdisk";

    fn validate(&self) -> Result<(), StageError> {
        match self.label.as_str() {
            "dos" if !is_dos_disk_id(&self.uuid) => {
                return Err(invalid(Self::TYPE, "uuid", "dos disk ids look like 0x%08x"));
            }
            "gpt" => check_uuid(Self::TYPE, &self.uuid)?,
            "dos" => {}
            other => {
                return Err(invalid(Self::TYPE, "label", format!("unknown label {other:?}")));
            }
        }
        check_partitions(Self::TYPE, &self.partitions)
    }
}

/// GPT partitioning via sgdisk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgdiskOptions {
    pub uuid: String,
    pub partitions: Vec<SfdiskPartition>,
}

impl StageKind for SgdiskOptions {
    const TYPE: &'static str = "org.osbuild.sgdisk";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        check_partitions(Self::TYPE, &self.partitions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkfsExt4Options {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StageKind for MkfsExt4Options {
    const TYPE: &'static str = "org.osbuild.mkfs.ext4";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        check_label(Self::TYPE, self.label.as_deref(), 16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkfsXfsOptions {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StageKind for MkfsXfsOptions {
    const TYPE: &'static str = "org.osbuild.mkfs.xfs";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        check_label(Self::TYPE, self.label.as_deref(), 12)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkfsFatOptions {
    /// Volume serial as eight hex digits, without the dash.
    pub volid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_size: Option<u8>,
}

impl MkfsFatOptions {
    /// Options for a filesystem whose id is written `XXXX-XXXX`.
    pub fn from_fs_uuid(uuid: &str, label: Option<&str>) -> Self {
        Self {
            volid: uuid.replace('-', ""),
            label: label.map(str::to_string),
            fat_size: None,
        }
    }
}

impl StageKind for MkfsFatOptions {
    const TYPE: &'static str = "org.osbuild.mkfs.fat";

    fn validate(&self) -> Result<(), StageError> {
        let dashed = format!(
            "{}-{}",
            self.volid.get(..4).unwrap_or_default(),
            self.volid.get(4..).unwrap_or_default()
        );
        if self.volid.len() != 8 || !is_vfat_id(&dashed) {
            return Err(invalid(
                Self::TYPE,
                "volid",
                format!("{:?} is not eight hex digits", self.volid),
            ));
        }
        if self.fat_size.is_some_and(|s| ![12, 16, 32].contains(&s)) {
            return Err(invalid(Self::TYPE, "fat_size", "must be 12, 16 or 32"));
        }
        check_label(Self::TYPE, self.label.as_deref(), 11)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkfsBtrfsOptions {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StageKind for MkfsBtrfsOptions {
    const TYPE: &'static str = "org.osbuild.mkfs.btrfs";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        check_label(Self::TYPE, self.label.as_deref(), 255)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkswapOptions {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StageKind for MkswapOptions {
    const TYPE: &'static str = "org.osbuild.mkswap";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        check_label(Self::TYPE, self.label.as_deref(), 16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BtrfsSubvolume {
    /// Path of the subvolume below the volume root, e.g. `/root`.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BtrfsSubvolOptions {
    pub subvolumes: Vec<BtrfsSubvolume>,
}

impl StageKind for BtrfsSubvolOptions {
    const TYPE: &'static str = "org.osbuild.btrfs.subvol";

    fn validate(&self) -> Result<(), StageError> {
        for (i, sv) in self.subvolumes.iter().enumerate() {
            if !sv.name.starts_with('/') || sv.name.len() < 2 {
                return Err(invalid(
                    Self::TYPE,
                    format!("subvolumes[{i}].name"),
                    format!("{:?} must be an absolute path below the volume root", sv.name),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pbkdf {
    pub method: String,
    pub iterations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u64>,
}

impl From<&Argon2id> for Pbkdf {
    fn from(kdf: &Argon2id) -> Self {
        Self {
            method: "argon2id".to_string(),
            iterations: kdf.iterations,
            memory: Some(kdf.memory),
            parallelism: Some(kdf.parallelism),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Luks2FormatOptions {
    pub uuid: String,
    pub passphrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u64>,
    pub pbkdf: Pbkdf,
}

impl StageKind for Luks2FormatOptions {
    const TYPE: &'static str = "org.osbuild.luks2.format";

    fn validate(&self) -> Result<(), StageError> {
        check_uuid(Self::TYPE, &self.uuid)?;
        if self.passphrase.is_empty() {
            return Err(invalid(Self::TYPE, "passphrase", "empty"));
        }
        if !matches!(self.pbkdf.method.as_str(), "argon2i" | "argon2id" | "pbkdf2") {
            return Err(invalid(
                Self::TYPE,
                "pbkdf.method",
                format!("unsupported method {:?}", self.pbkdf.method),
            ));
        }
        if self
            .sector_size
            .is_some_and(|s| !(512..=4096).contains(&s) || !s.is_power_of_two())
        {
            return Err(invalid(Self::TYPE, "sector_size", "must be a power of two in 512..4096"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Luks2RemoveKeyOptions {
    pub passphrase: String,
}

impl StageKind for Luks2RemoveKeyOptions {
    const TYPE: &'static str = "org.osbuild.luks2.remove-key";

    fn validate(&self) -> Result<(), StageError> {
        if self.passphrase.is_empty() {
            return Err(invalid(Self::TYPE, "passphrase", "empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClevisLuksBindOptions {
    pub passphrase: String,
    pub pin: String,
    /// JSON policy passed verbatim to `clevis luks bind`.
    pub policy: String,
}

impl StageKind for ClevisLuksBindOptions {
    const TYPE: &'static str = "org.osbuild.clevis.luks-bind";

    fn validate(&self) -> Result<(), StageError> {
        if self.pin.is_empty() {
            return Err(invalid(Self::TYPE, "pin", "empty"));
        }
        if serde_json::from_str::<serde_json::Value>(&self.policy).is_err() {
            return Err(invalid(Self::TYPE, "policy", "not valid JSON"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lvm2Volume {
    pub name: String,
    /// Size with unit, e.g. `2147483648B`.
    pub size: String,
}

impl Lvm2Volume {
    pub fn new(name: impl Into<String>, bytes: u64) -> Self {
        Self {
            name: name.into(),
            size: format!("{bytes}B"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lvm2CreateOptions {
    pub volumes: Vec<Lvm2Volume>,
}

impl StageKind for Lvm2CreateOptions {
    const TYPE: &'static str = "org.osbuild.lvm2.create";

    fn validate(&self) -> Result<(), StageError> {
        if self.volumes.is_empty() {
            return Err(invalid(Self::TYPE, "volumes", "at least one volume is required"));
        }
        for (i, lv) in self.volumes.iter().enumerate() {
            let digits = lv.size.trim_end_matches(['B', 'K', 'M', 'G', 'T', 'k', 'm', 'g', 't']);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid(
                    Self::TYPE,
                    format!("volumes[{i}].size"),
                    format!("{:?} is not a size", lv.size),
                ));
            }
            if lv.name.is_empty() || lv.name.starts_with('-') {
                return Err(invalid(Self::TYPE, format!("volumes[{i}].name"), "invalid name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lvm2MetadataOptions {
    pub vg_name: String,
    pub creation_host: String,
    pub description: String,
}

impl StageKind for Lvm2MetadataOptions {
    const TYPE: &'static str = "org.osbuild.lvm2.metadata";

    fn validate(&self) -> Result<(), StageError> {
        if self.vg_name.is_empty() {
            return Err(invalid(Self::TYPE, "vg_name", "empty"));
        }
        Ok(())
    }
}

/// Copy a file byte for byte onto a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteDeviceOptions {
    pub from: String,
}

impl StageKind for WriteDeviceOptions {
    const TYPE: &'static str = "org.osbuild.write-device";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("tree", InputKind::Tree)];

    fn validate(&self) -> Result<(), StageError> {
        match self.from.strip_prefix("input://tree/") {
            Some(path) if !path.is_empty() => Ok(()),
            _ => Err(invalid(
                Self::TYPE,
                "from",
                format!("{:?} must point into input://tree/", self.from),
            )),
        }
    }
}
