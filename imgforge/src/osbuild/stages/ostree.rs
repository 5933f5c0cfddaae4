use serde::{Deserialize, Serialize};

use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::inputs::InputKind;
use crate::osbuild::stage::StageKind;

fn check_osname(stage: &'static str, osname: &str) -> Result<(), StageError> {
    if osname.is_empty() || osname.contains('/') {
        return Err(invalid(stage, "osname", format!("invalid os name {osname:?}")));
    }
    Ok(())
}

/// Lay out the skeleton of an ostree sysroot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeInitFsOptions {}

impl StageKind for OstreeInitFsOptions {
    const TYPE: &'static str = "org.osbuild.ostree.init-fs";
    const PATHS_CHANGED: &'static [&'static str] = &["/boot", "/ostree", "/sysroot"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeOsInitOptions {
    pub osname: String,
}

impl StageKind for OstreeOsInitOptions {
    const TYPE: &'static str = "org.osbuild.ostree.os-init";

    fn validate(&self) -> Result<(), StageError> {
        check_osname(Self::TYPE, &self.osname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreePullOptions {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl StageKind for OstreePullOptions {
    const TYPE: &'static str = "org.osbuild.ostree.pull";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("commits", InputKind::Ostree)];

    fn validate(&self) -> Result<(), StageError> {
        super::check_abs_path(Self::TYPE, "repo", &self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeRootfs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeDeployOptions {
    pub osname: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<OstreeRootfs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_opts: Vec<String>,
}

impl StageKind for OstreeDeployOptions {
    const TYPE: &'static str = "org.osbuild.ostree.deploy";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("commits", InputKind::Ostree)];

    fn validate(&self) -> Result<(), StageError> {
        check_osname(Self::TYPE, &self.osname)?;
        if !crate::ostree::is_valid_ref(&self.reference) {
            return Err(invalid(Self::TYPE, "ref", format!("invalid ref {:?}", self.reference)));
        }
        if let Some(rootfs) = &self.rootfs {
            if rootfs.uuid.is_none() && rootfs.label.is_none() {
                return Err(invalid(Self::TYPE, "rootfs", "either uuid or label is required"));
            }
        }
        for mount in &self.mounts {
            super::check_abs_path(Self::TYPE, "mounts", mount)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeSysrootConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeRepoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysroot: Option<OstreeSysrootConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeConfigOptions {
    pub repo: String,
    pub config: OstreeRepoConfig,
}

impl StageKind for OstreeConfigOptions {
    const TYPE: &'static str = "org.osbuild.ostree.config";

    fn validate(&self) -> Result<(), StageError> {
        super::check_abs_path(Self::TYPE, "repo", &self.repo)?;
        if let Some(loader) = self
            .config
            .sysroot
            .as_ref()
            .and_then(|s| s.bootloader.as_deref())
        {
            if !matches!(loader, "auto" | "none" | "grub2" | "syslinux" | "uboot" | "zipl") {
                return Err(invalid(
                    Self::TYPE,
                    "config.sysroot.bootloader",
                    format!("unknown bootloader {loader:?}"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeDeployment {
    pub osname: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub serial: u32,
}

impl OstreeDeployment {
    pub fn new(osname: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            osname: osname.into(),
            reference: reference.into(),
            serial: 0,
        }
    }
}

/// Populate `/var` of a deployment from its tmpfiles.d snippets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeFillvarOptions {
    pub deployment: OstreeDeployment,
}

impl StageKind for OstreeFillvarOptions {
    const TYPE: &'static str = "org.osbuild.ostree.fillvar";

    fn validate(&self) -> Result<(), StageError> {
        check_osname(Self::TYPE, &self.deployment.osname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OstreeSelinuxOptions {
    pub deployment: OstreeDeployment,
}

impl StageKind for OstreeSelinuxOptions {
    const TYPE: &'static str = "org.osbuild.ostree.selinux";

    fn validate(&self) -> Result<(), StageError> {
        check_osname(Self::TYPE, &self.deployment.osname)
    }
}

/// Unpack a container image into the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerDeployOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl StageKind for ContainerDeployOptions {
    const TYPE: &'static str = "org.osbuild.container-deploy";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("images", InputKind::Containers)];
    const PATHS_CHANGED: &'static [&'static str] = &["/"];

    fn validate(&self) -> Result<(), StageError> {
        for path in &self.exclude {
            super::check_abs_path(Self::TYPE, "exclude", path)?;
        }
        Ok(())
    }
}

/// Where skopeo stores copied images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum SkopeoDestination {
    #[serde(rename = "containers-storage")]
    ContainersStorage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage_path: Option<String>,
    },
}

/// Copy container images into the tree's container storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkopeoOptions {
    pub destination: SkopeoDestination,
}

impl SkopeoOptions {
    pub fn containers_storage() -> Self {
        Self {
            destination: SkopeoDestination::ContainersStorage { storage_path: None },
        }
    }
}

impl StageKind for SkopeoOptions {
    const TYPE: &'static str = "org.osbuild.skopeo";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("images", InputKind::Containers)];
    const PATHS_CHANGED: &'static [&'static str] = &["/var/lib/containers/storage"];

    fn validate(&self) -> Result<(), StageError> {
        let SkopeoDestination::ContainersStorage { storage_path } = &self.destination;
        if let Some(path) = storage_path {
            super::check_abs_path(Self::TYPE, "destination.storage_path", path)?;
        }
        Ok(())
    }
}
