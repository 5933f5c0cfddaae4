//! The image-type catalog.
//!
//! An [`ImageType`] is one (distribution, architecture, image type)
//! combination. Its [`ImageType::manifest`] turns a blueprint into a
//! [`PreManifest`] whose sources still need resolving.

mod distro;
mod filter;
mod recipes;
mod templates;

pub use distro::{DISTROS, Distro, Family, OstreeDefaults};
pub use filter::{FilterError, ImageFilter};
pub use templates::{ESP_SIZE, Layout, bios_boot_partition, disk_template, esp_partition};

use imgforge_common::datasizes::GIB;
use imgforge_common::{Arch, CommonError, Size};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::blueprint::{Blueprint, BlueprintError};
use crate::disk::DiskError;
use crate::pipeline::PreManifest;
use crate::rpmmd::RepoConfig;

#[derive(Debug, Error)]
pub enum ImageTypeError {
    #[error("unknown distribution: {0}")]
    UnknownDistro(String),
    #[error("{distro} does not support architecture {arch}")]
    UnsupportedArch { distro: String, arch: String },
    #[error("{distro}/{arch} has no image type {name}")]
    UnknownImageType {
        distro: String,
        arch: String,
        name: String,
    },
    #[error("blueprint is for {requested}, not {distro}")]
    DistroMismatch { requested: String, distro: String },
    #[error("image type {image_type}: option {option}: {reason}")]
    InvalidOption {
        image_type: String,
        option: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Common(#[from] CommonError),
}

/// How the image boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    /// Not bootable on its own, e.g. a container archive.
    None,
    Legacy,
    Uefi,
    Hybrid,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::None => "none",
            BootMode::Legacy => "legacy",
            BootMode::Uefi => "uefi",
            BootMode::Hybrid => "hybrid",
        }
    }

    pub fn has_legacy(&self) -> bool {
        matches!(self, BootMode::Legacy | BootMode::Hybrid)
    }

    pub fn has_uefi(&self) -> bool {
        matches!(self, BootMode::Uefi | BootMode::Hybrid)
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ostree source for commit-based images; unset fields fall back to the
/// distribution's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstreeImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub rhsm: bool,
}

/// Per-request options that are not part of the blueprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOptions {
    /// Requested image size; the planner may grow it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ostree: Option<OstreeImageOptions>,
    /// Bootable container to install, for container-based disks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootc_ref: Option<String>,
}

/// One buildable image: a recipe bound to a distribution and architecture.
pub trait ImageType: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn arch(&self) -> Arch;

    fn distro(&self) -> &Distro;

    /// File name of the delivered artifact.
    fn filename(&self) -> &str;

    fn mime_type(&self) -> &str;

    fn boot_mode(&self) -> BootMode;

    /// Pipelines whose output is the artifact.
    fn exports(&self) -> Vec<String>;

    /// Assemble the pipeline graph. Warnings are advisories for the user.
    fn manifest(
        &self,
        blueprint: &Blueprint,
        options: &ImageOptions,
        repos: &[RepoConfig],
        seed: i64,
    ) -> Result<(PreManifest, Vec<String>), ImageTypeError>;
}

/// What the image-type recipe does once the OS is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Qcow2,
    Raw,
    Vhd,
    Vmdk,
    Ova,
    Gce,
    ContainerTar,
    IotRaw,
    BootcDisk,
    MinimalRawXz,
}

/// Customizations every OS-based disk image understands.
const OS_CUSTOMIZATIONS: &[&str] = &[
    "hostname",
    "kernel",
    "user",
    "group",
    "timezone",
    "locale",
    "firewall",
    "services",
    "filesystem",
    "partitioning_mode",
    "disk",
    "openscap",
    "subscription",
    "cacerts",
    "firstboot",
    "directories",
    "files",
    "fips",
];

const CONTAINER_CUSTOMIZATIONS: &[&str] = &[
    "hostname", "user", "group", "timezone", "locale", "services", "cacerts", "directories",
    "files",
];

const OSTREE_CUSTOMIZATIONS: &[&str] = &["kernel", "filesystem", "partitioning_mode", "disk"];

const BOOTC_CUSTOMIZATIONS: &[&str] = &["filesystem", "partitioning_mode", "disk"];

#[derive(Debug)]
pub(crate) struct ImageTypeDef {
    pub name: &'static str,
    pub filename: &'static str,
    pub mime_type: &'static str,
    pub kind: Kind,
    pub export: &'static str,
    pub arches: &'static [Arch],
    pub default_size: u64,
    pub customizations: &'static [&'static str],
}

const BOTH: &[Arch] = &[Arch::X86_64, Arch::Aarch64];
const X86_ONLY: &[Arch] = &[Arch::X86_64];

pub(crate) static IMAGE_TYPES: &[ImageTypeDef] = &[
    ImageTypeDef {
        name: "qcow2",
        filename: "disk.qcow2",
        mime_type: "application/x-qemu-disk",
        kind: Kind::Qcow2,
        export: "qcow2",
        arches: BOTH,
        default_size: 10 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "raw",
        filename: "disk.raw",
        mime_type: "application/octet-stream",
        kind: Kind::Raw,
        export: "image",
        arches: BOTH,
        default_size: 5 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "vhd",
        filename: "disk.vhd",
        mime_type: "application/x-vhd",
        kind: Kind::Vhd,
        export: "vpc",
        arches: X86_ONLY,
        default_size: 4 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "vmdk",
        filename: "disk.vmdk",
        mime_type: "application/x-vmdk",
        kind: Kind::Vmdk,
        export: "vmdk",
        arches: X86_ONLY,
        default_size: 4 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "ova",
        filename: "image.ova",
        mime_type: "application/ovf",
        kind: Kind::Ova,
        export: "archive",
        arches: X86_ONLY,
        default_size: 4 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "gce",
        filename: "image.tar.gz",
        mime_type: "application/gzip",
        kind: Kind::Gce,
        export: "archive",
        arches: X86_ONLY,
        default_size: 20 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "container-tar",
        filename: "container.tar",
        mime_type: "application/x-tar",
        kind: Kind::ContainerTar,
        export: "container",
        arches: BOTH,
        default_size: 0,
        customizations: CONTAINER_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "iot-raw",
        filename: "image.raw.xz",
        mime_type: "application/xz",
        kind: Kind::IotRaw,
        export: "xz",
        arches: BOTH,
        default_size: 4 * GIB,
        customizations: OSTREE_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "bootc-disk",
        filename: "disk.raw",
        mime_type: "application/octet-stream",
        kind: Kind::BootcDisk,
        export: "image",
        arches: BOTH,
        default_size: 10 * GIB,
        customizations: BOOTC_CUSTOMIZATIONS,
    },
    ImageTypeDef {
        name: "minimal-raw-xz",
        filename: "disk.raw.xz",
        mime_type: "application/xz",
        kind: Kind::MinimalRawXz,
        export: "xz",
        arches: BOTH,
        default_size: 2 * GIB,
        customizations: OS_CUSTOMIZATIONS,
    },
];

impl ImageTypeDef {
    fn available_for(&self, distro: &Distro, arch: Arch) -> bool {
        if !self.arches.contains(&arch) || !distro.supports(arch) {
            return false;
        }
        match self.kind {
            Kind::IotRaw => distro.ostree.is_some(),
            _ => true,
        }
    }

    fn boot_mode(&self, arch: Arch) -> BootMode {
        match self.kind {
            Kind::ContainerTar => BootMode::None,
            Kind::Gce | Kind::IotRaw => BootMode::Uefi,
            _ if arch == Arch::X86_64 => BootMode::Hybrid,
            _ => BootMode::Uefi,
        }
    }
}

/// A catalog entry bound to its distribution and architecture.
#[derive(Debug, Clone, Copy)]
pub struct CatalogImageType {
    distro: &'static Distro,
    arch: Arch,
    def: &'static ImageTypeDef,
}

impl ImageType for CatalogImageType {
    fn name(&self) -> &str {
        self.def.name
    }

    fn arch(&self) -> Arch {
        self.arch
    }

    fn distro(&self) -> &Distro {
        self.distro
    }

    fn filename(&self) -> &str {
        self.def.filename
    }

    fn mime_type(&self) -> &str {
        self.def.mime_type
    }

    fn boot_mode(&self) -> BootMode {
        self.def.boot_mode(self.arch)
    }

    fn exports(&self) -> Vec<String> {
        vec![self.def.export.to_string()]
    }

    fn manifest(
        &self,
        blueprint: &Blueprint,
        options: &ImageOptions,
        repos: &[RepoConfig],
        seed: i64,
    ) -> Result<(PreManifest, Vec<String>), ImageTypeError> {
        recipes::assemble(self.distro, self.arch, self.def, blueprint, options, repos, seed)
    }
}

/// Look up one image type. The distribution may be given by alias.
pub fn get(distro: &str, arch: &str, name: &str) -> Result<CatalogImageType, ImageTypeError> {
    let d = distro::find(distro).ok_or_else(|| ImageTypeError::UnknownDistro(distro.to_string()))?;
    let a: Arch = arch.parse()?;
    if !d.supports(a) {
        return Err(ImageTypeError::UnsupportedArch {
            distro: d.name.to_string(),
            arch: a.to_string(),
        });
    }
    IMAGE_TYPES
        .iter()
        .find(|def| def.name == name && def.available_for(d, a))
        .map(|def| CatalogImageType {
            distro: d,
            arch: a,
            def,
        })
        .ok_or_else(|| ImageTypeError::UnknownImageType {
            distro: d.name.to_string(),
            arch: a.to_string(),
            name: name.to_string(),
        })
}

/// Every image type of the catalog, sorted by distribution, architecture
/// and name.
pub fn all() -> Vec<CatalogImageType> {
    let mut out = Vec::new();
    for d in DISTROS {
        for &a in d.arches {
            for def in IMAGE_TYPES.iter().filter(|def| def.available_for(d, a)) {
                out.push(CatalogImageType {
                    distro: d,
                    arch: a,
                    def,
                });
            }
        }
    }
    out.sort_by(|x, y| {
        (x.distro.name, x.arch.as_str(), x.def.name).cmp(&(y.distro.name, y.arch.as_str(), y.def.name))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_alias() {
        let it = get("fedora", "x86_64", "qcow2").unwrap();
        assert_eq!(it.distro().name, "fedora-42");
        assert_eq!(it.exports(), ["qcow2"]);
        assert_eq!(it.boot_mode(), BootMode::Hybrid);
    }

    #[test]
    fn lookup_errors_name_the_culprit() {
        let err = get("debian-12", "x86_64", "qcow2").unwrap_err();
        assert!(matches!(err, ImageTypeError::UnknownDistro(d) if d == "debian-12"));
        let err = get("rhel-9.6", "s390x", "qcow2").unwrap_err();
        assert!(matches!(err, ImageTypeError::UnsupportedArch { .. }));
        let err = get("rhel-9.6", "aarch64", "vhd").unwrap_err();
        assert_eq!(err.to_string(), "rhel-9.6/aarch64 has no image type vhd");
        assert!(get("rhel-9.6", "x86_64", "iot-raw").is_err());
    }

    #[test]
    fn catalog_is_sorted() {
        let keys: Vec<_> = all()
            .iter()
            .map(|it| format!("{}/{}/{}", it.distro().name, it.arch(), it.name()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.contains(&"fedora-42/aarch64/iot-raw".to_string()));
        assert!(!keys.contains(&"fedora-42/aarch64/gce".to_string()));
    }

    #[test]
    fn boot_modes_follow_arch() {
        assert_eq!(get("rhel-9", "aarch64", "qcow2").unwrap().boot_mode(), BootMode::Uefi);
        assert_eq!(get("rhel-9", "x86_64", "gce").unwrap().boot_mode(), BootMode::Uefi);
        assert_eq!(
            get("fedora", "x86_64", "container-tar").unwrap().boot_mode(),
            BootMode::None
        );
    }

    #[test]
    fn options_parse_sizes() {
        let options: ImageOptions =
            serde_json::from_str(r#"{"size": "8 GiB", "ostree": {"ref": "test/ref"}}"#).unwrap();
        assert_eq!(options.size, Some(Size(8 * GIB)));
        assert_eq!(options.ostree.unwrap().reference.as_deref(), Some("test/ref"));
    }
}
