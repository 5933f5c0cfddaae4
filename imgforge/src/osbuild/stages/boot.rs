use serde::{Deserialize, Serialize};

use crate::disk::{FstabEntry, is_uuid, is_vfat_id};
use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::stage::StageKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelCmdlineOptions {
    pub root_fs_uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_opts: String,
}

impl StageKind for KernelCmdlineOptions {
    const TYPE: &'static str = "org.osbuild.kernel-cmdline";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/kernel/cmdline"];

    fn validate(&self) -> Result<(), StageError> {
        if !is_uuid(&self.root_fs_uuid) {
            return Err(invalid(Self::TYPE, "root_fs_uuid", "not a uuid"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FstabFilesystem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub vfs_type: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default)]
    pub freq: u64,
    #[serde(default)]
    pub passno: u64,
}

impl From<&FstabEntry> for FstabFilesystem {
    fn from(entry: &FstabEntry) -> Self {
        Self {
            uuid: Some(entry.uuid.clone()),
            label: None,
            vfs_type: entry.vfs_type.clone(),
            path: entry.path.clone(),
            options: Some(entry.options.clone()),
            freq: entry.freq,
            passno: entry.passno,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FstabOptions {
    pub filesystems: Vec<FstabFilesystem>,
}

impl FstabOptions {
    pub fn from_entries(entries: &[FstabEntry]) -> Self {
        Self {
            filesystems: entries.iter().map(FstabFilesystem::from).collect(),
        }
    }
}

impl StageKind for FstabOptions {
    const TYPE: &'static str = "org.osbuild.fstab";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/fstab"];

    fn validate(&self) -> Result<(), StageError> {
        for (i, fs) in self.filesystems.iter().enumerate() {
            let field = format!("filesystems[{i}]");
            if fs.uuid.is_none() && fs.label.is_none() {
                return Err(invalid(Self::TYPE, field, "either uuid or label is required"));
            }
            if fs.uuid.as_deref().is_some_and(|u| !is_fs_uuid(u)) {
                return Err(invalid(Self::TYPE, field, "malformed uuid"));
            }
            if fs.path != "none" {
                super::check_abs_path(Self::TYPE, &field, &fs.path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2Uefi {
    pub vendor: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unified: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub install: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_output: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2Options {
    pub root_fs_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_fs_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_opts: String,
    /// BIOS platform, e.g. `i386-pc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Grub2Uefi>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write_defaults: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Grub2Config>,
}

impl StageKind for Grub2Options {
    const TYPE: &'static str = "org.osbuild.grub2";
    const PATHS_CHANGED: &'static [&'static str] = &["/boot", "/etc/default/grub"];

    fn validate(&self) -> Result<(), StageError> {
        if !is_uuid(&self.root_fs_uuid) {
            return Err(invalid(Self::TYPE, "root_fs_uuid", "not a uuid"));
        }
        if let Some(boot) = &self.boot_fs_uuid {
            if !is_uuid(boot) {
                return Err(invalid(Self::TYPE, "boot_fs_uuid", "not a uuid"));
            }
        }
        if self.legacy.is_none() && self.uefi.is_none() {
            return Err(invalid(Self::TYPE, "legacy", "one of legacy or uefi is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2InstCore {
    #[serde(rename = "type")]
    pub kind: String,
    pub partlabel: String,
    pub filesystem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2InstPrefix {
    #[serde(rename = "type")]
    pub kind: String,
    pub partlabel: String,
    /// Zero-based index of the partition holding `/boot/grub2`.
    pub number: usize,
    pub path: String,
}

/// Install the BIOS core image into the disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grub2InstOptions {
    pub filename: String,
    pub platform: String,
    /// Sector at which the core image is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<u64>,
    pub core: Grub2InstCore,
    pub prefix: Grub2InstPrefix,
}

impl StageKind for Grub2InstOptions {
    const TYPE: &'static str = "org.osbuild.grub2.inst";

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if !matches!(self.core.partlabel.as_str(), "gpt" | "dos") {
            return Err(invalid(Self::TYPE, "core.partlabel", "must be gpt or dos"));
        }
        if !matches!(self.core.filesystem.as_str(), "ext4" | "xfs" | "btrfs") {
            return Err(invalid(
                Self::TYPE,
                "core.filesystem",
                format!("unsupported filesystem {}", self.core.filesystem),
            ));
        }
        if self.core.partlabel == "dos" && self.location.is_none() {
            return Err(invalid(Self::TYPE, "location", "required for dos tables"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootupdBios {
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootupdDeployment {
    pub osname: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootupdOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<BootupdDeployment>,
    #[serde(rename = "static-configs", default, skip_serializing_if = "std::ops::Not::not")]
    pub static_configs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios: Option<BootupdBios>,
}

impl StageKind for BootupdOptions {
    const TYPE: &'static str = "org.osbuild.bootupd";

    fn validate(&self) -> Result<(), StageError> {
        if self.bios.as_ref().is_some_and(|b| b.device.is_empty()) {
            return Err(invalid(Self::TYPE, "bios.device", "empty"));
        }
        Ok(())
    }
}

fn is_fs_uuid(uuid: &str) -> bool {
    is_uuid(uuid) || is_vfat_id(uuid)
}
