//! Filesystem mounts a stage sees while it runs.

use serde::{Deserialize, Serialize};

use crate::disk::FsType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    #[serde(rename = "org.osbuild.ext4")]
    Ext4,
    #[serde(rename = "org.osbuild.xfs")]
    Xfs,
    #[serde(rename = "org.osbuild.fat")]
    Fat,
    #[serde(rename = "org.osbuild.btrfs")]
    Btrfs,
    #[serde(rename = "org.osbuild.ostree.deployment")]
    OstreeDeployment,
}

impl From<FsType> for MountKind {
    fn from(fs_type: FsType) -> Self {
        match fs_type {
            FsType::Ext4 => MountKind::Ext4,
            FsType::Xfs => MountKind::Xfs,
            FsType::Vfat => MountKind::Fat,
            FsType::Btrfs => MountKind::Btrfs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    pub osname: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountOptions {
    Btrfs {
        subvol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compress: Option<String>,
    },
    Deployment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        deployment: DeploymentRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<MountOptions>,
}

impl Mount {
    pub fn filesystem(name: &str, fs_type: FsType, source: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: fs_type.into(),
            source: Some(source.to_string()),
            target: target.to_string(),
            options: None,
        }
    }

    pub fn btrfs_subvolume(
        name: &str,
        source: &str,
        target: &str,
        subvol: &str,
        compress: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind: MountKind::Btrfs,
            source: Some(source.to_string()),
            target: target.to_string(),
            options: Some(MountOptions::Btrfs {
                subvol: subvol.to_string(),
                compress: compress.map(str::to_string),
            }),
        }
    }

    /// Bind the deployed ostree root over the tree mount.
    pub fn ostree_deployment(osname: &str, reference: &str) -> Self {
        Self {
            name: "ostree.deployment".to_string(),
            kind: MountKind::OstreeDeployment,
            source: None,
            target: "/".to_string(),
            options: Some(MountOptions::Deployment {
                source: Some("mount".to_string()),
                deployment: DeploymentRef {
                    osname: osname.to_string(),
                    reference: reference.to_string(),
                },
            }),
        }
    }
}
