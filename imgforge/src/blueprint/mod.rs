//! Blueprints: the user's description of what goes into an image.
//!
//! Every field is optional. A missing field keeps whatever the image type
//! would do by default.

mod customizations;

pub use customizations::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::disk::{self, ClevisBind, EncryptionRequest, FilesystemRequest, PartitioningMode};
use crate::{container, rpmmd};

#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("{path}: {reason}")]
    Invalid { path: String, reason: String },
    #[error("failed to read blueprint {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse blueprint {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("customization {field} is not supported by image type {image_type}")]
    Unsupported { field: String, image_type: String },
}

fn invalid(path: impl Into<String>, reason: impl Into<String>) -> BlueprintError {
    BlueprintError::Invalid {
        path: path.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Package {
    pub name: String,
    /// Version glob; `*` or absent means any version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Package {
    /// The name as handed to the dependency solver.
    pub fn spec(&self) -> String {
        match self.version.as_deref() {
            None | Some("") | Some("*") => self.name.clone(),
            Some(version) => format!("{}-{}", self.name, version),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Group {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Container {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "tls-verify", default, skip_serializing_if = "Option::is_none")]
    pub tls_verify: Option<bool>,
    #[serde(rename = "local-storage", default)]
    pub local_storage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Blueprint {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Package>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Package>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Customizations>,
    /// Distribution to build for when the caller does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,
}

/// Lowercase hostname labels of letters, digits and dashes.
fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn is_valid_account_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        && name.len() <= 32
}

fn is_normalized_abs(path: &str) -> bool {
    path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//")
        && path.split('/').all(|c| c != "." && c != "..")
}

fn check_mode(path: &str, mode: Option<&str>) -> Result<(), BlueprintError> {
    if let Some(mode) = mode {
        let digits = mode.strip_prefix('0').unwrap_or(mode);
        if digits.is_empty() || u32::from_str_radix(mode, 8).map_or(true, |m| m > 0o7777) {
            return Err(invalid(format!("{path}.mode"), format!("{mode:?} is not an octal mode")));
        }
    }
    Ok(())
}

/// Paths a blueprint may not create or overwrite files under.
const PROTECTED_PATHS: &[&str] = &["/etc/fstab", "/etc/shadow", "/etc/passwd", "/etc/group"];

impl Blueprint {
    /// Load a blueprint, picking YAML or JSON by extension.
    pub fn load(path: &Path) -> Result<Self, BlueprintError> {
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| BlueprintError::Read {
            path: display.clone(),
            source,
        })?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let blueprint = if yaml {
            Self::from_yaml(&text)
        } else {
            Self::from_json(&text)
        };
        blueprint.map_err(|err| match err {
            BlueprintError::Parse { reason, .. } => BlueprintError::Parse {
                path: display,
                reason,
            },
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, BlueprintError> {
        let bp: Blueprint = serde_json::from_str(text).map_err(|e| BlueprintError::Parse {
            path: "<json>".to_string(),
            reason: e.to_string(),
        })?;
        bp.validate()?;
        Ok(bp)
    }

    pub fn from_yaml(text: &str) -> Result<Self, BlueprintError> {
        let bp: Blueprint = serde_yaml::from_str(text).map_err(|e| BlueprintError::Parse {
            path: "<yaml>".to_string(),
            reason: e.to_string(),
        })?;
        bp.validate()?;
        Ok(bp)
    }

    pub fn customizations(&self) -> Customizations {
        self.customizations.clone().unwrap_or_default()
    }

    /// Check every field that has rules beyond its type. Errors name the
    /// offending field by path.
    pub fn validate(&self) -> Result<(), BlueprintError> {
        for (i, pkg) in self.packages.iter().enumerate() {
            if pkg.name.trim().is_empty() {
                return Err(invalid(format!("packages[{i}].name"), "empty package name"));
            }
        }
        for (i, group) in self.groups.iter().enumerate() {
            if group.name.trim().is_empty() {
                return Err(invalid(format!("groups[{i}].name"), "empty group name"));
            }
        }
        for (i, ctr) in self.containers.iter().enumerate() {
            if ctr.source.trim().is_empty() {
                return Err(invalid(format!("containers[{i}].source"), "empty source"));
            }
        }
        let Some(c) = &self.customizations else {
            return Ok(());
        };
        if let Some(hostname) = &c.hostname {
            if !is_valid_hostname(hostname) {
                return Err(invalid(
                    "customizations.hostname",
                    format!("{hostname:?} is not a valid hostname"),
                ));
            }
        }
        let mut names = BTreeSet::new();
        for (i, user) in c.user.iter().enumerate() {
            if !is_valid_account_name(&user.name) {
                return Err(invalid(
                    format!("customizations.user[{i}].name"),
                    format!("{:?} is not a valid user name", user.name),
                ));
            }
            if !names.insert(user.name.as_str()) {
                return Err(invalid(
                    format!("customizations.user[{i}].name"),
                    format!("user {:?} defined more than once", user.name),
                ));
            }
            if let Some(home) = &user.home {
                if !is_normalized_abs(home) {
                    return Err(invalid(
                        format!("customizations.user[{i}].home"),
                        "must be an absolute path",
                    ));
                }
            }
        }
        for (i, group) in c.group.iter().enumerate() {
            if !is_valid_account_name(&group.name) {
                return Err(invalid(
                    format!("customizations.group[{i}].name"),
                    format!("{:?} is not a valid group name", group.name),
                ));
            }
        }
        let mut mountpoints = BTreeSet::new();
        for (i, fs) in c.filesystem.iter().enumerate() {
            let path = format!("customizations.filesystem[{i}].mountpoint");
            if !is_normalized_abs(&fs.mountpoint) {
                return Err(invalid(
                    path,
                    format!("{:?} must be an absolute, normalized path", fs.mountpoint),
                ));
            }
            if !mountpoints.insert(fs.mountpoint.as_str()) {
                return Err(invalid(
                    path,
                    format!("{:?} requested more than once", fs.mountpoint),
                ));
            }
        }
        if let Some(mode) = &c.partitioning_mode {
            mode.parse::<PartitioningMode>()
                .map_err(|e| invalid("customizations.partitioning_mode", e.to_string()))?;
        }
        if let Some(disk) = &c.disk {
            if let Some(enc) = &disk.encryption {
                if enc.passphrase.is_empty() {
                    return Err(invalid(
                        "customizations.disk.encryption.passphrase",
                        "passphrase must not be empty",
                    ));
                }
                if let Some(clevis) = &enc.clevis {
                    serde_json::from_str::<serde_json::Value>(&clevis.policy).map_err(|e| {
                        invalid(
                            "customizations.disk.encryption.clevis.policy",
                            format!("not JSON: {e}"),
                        )
                    })?;
                }
            }
            if c.partitioning_mode.as_deref() == Some("raw") && disk.volume_group.is_some() {
                return Err(invalid(
                    "customizations.disk.volume_group",
                    "a volume group needs lvm partitioning",
                ));
            }
        }
        if let Some(scap) = &c.openscap {
            if scap.profile_id.trim().is_empty() {
                return Err(invalid("customizations.openscap.profile_id", "empty profile id"));
            }
        }
        if let Some(sub) = &c.subscription {
            if sub.organization.is_empty() || sub.activation_key.is_empty() {
                return Err(invalid(
                    "customizations.subscription",
                    "organization and activation_key are required",
                ));
            }
        }
        if let Some(ca) = &c.cacerts {
            for (i, pem) in ca.pem_certs.iter().enumerate() {
                if !pem.contains("-----BEGIN CERTIFICATE-----") {
                    return Err(invalid(
                        format!("customizations.cacerts.pem_certs[{i}]"),
                        "not a PEM certificate",
                    ));
                }
            }
        }
        if let Some(ign) = &c.ignition {
            if ign.firstboot.is_some() && ign.embedded.is_some() {
                return Err(invalid(
                    "customizations.ignition",
                    "firstboot and embedded are mutually exclusive",
                ));
            }
        }
        for (i, dir) in c.directories.iter().enumerate() {
            let path = format!("customizations.directories[{i}]");
            if !is_normalized_abs(&dir.path) || dir.path == "/" {
                return Err(invalid(format!("{path}.path"), "must be an absolute path"));
            }
            check_mode(&path, dir.mode.as_deref())?;
        }
        for (i, file) in c.files.iter().enumerate() {
            let path = format!("customizations.files[{i}]");
            if !is_normalized_abs(&file.path) || file.path == "/" {
                return Err(invalid(format!("{path}.path"), "must be an absolute path"));
            }
            if PROTECTED_PATHS.contains(&file.path.as_str()) {
                return Err(invalid(
                    format!("{path}.path"),
                    format!("{} is managed by the image and cannot be replaced", file.path),
                ));
            }
            check_mode(&path, file.mode.as_deref())?;
        }
        Ok(())
    }

    /// Package names requested by the blueprint, groups as `@name`.
    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .packages
            .iter()
            .chain(&self.modules)
            .map(Package::spec)
            .collect();
        names.extend(self.groups.iter().map(|g| format!("@{}", g.name)));
        if let Some(name) = self
            .customizations
            .as_ref()
            .and_then(|c| c.kernel.as_ref())
            .and_then(|k| k.name.as_ref())
        {
            names.push(name.clone());
        }
        names
    }

    /// The blueprint's contribution to the OS package set.
    pub fn package_set(&self) -> rpmmd::PackageSet {
        rpmmd::PackageSet::new(self.package_names())
    }

    pub fn container_specs(&self) -> Vec<container::SourceSpec> {
        self.containers
            .iter()
            .map(|c| container::SourceSpec {
                source: c.source.clone(),
                name: c.name.clone(),
                digest: None,
                tls_verify: c.tls_verify,
                local: c.local_storage,
                arch: None,
            })
            .collect()
    }

    pub fn partitioning_mode(&self) -> Result<PartitioningMode, BlueprintError> {
        self.customizations
            .as_ref()
            .and_then(|c| c.partitioning_mode.as_deref())
            .unwrap_or_default()
            .parse()
            .map_err(|e: disk::DiskError| invalid("customizations.partitioning_mode", e.to_string()))
    }

    /// Disk requests for the planner.
    pub fn disk_customizations(&self) -> disk::Customizations {
        let Some(c) = &self.customizations else {
            return disk::Customizations::default();
        };
        let mut out = disk::Customizations {
            filesystems: c
                .filesystem
                .iter()
                .map(|fs| FilesystemRequest::new(&fs.mountpoint, fs.minsize.bytes()))
                .collect(),
            ..Default::default()
        };
        if let Some(d) = &c.disk {
            out.min_disk_size = d.minsize;
            out.swap_size = d.swap.filter(|s| !s.is_zero());
            out.volume_group = d.volume_group.clone();
            out.encryption = d.encryption.as_ref().map(|e| EncryptionRequest {
                passphrase: e.passphrase.clone(),
                cipher: e.cipher.clone(),
                clevis: e.clevis.as_ref().map(|c| ClevisBind {
                    pin: c.pin.clone(),
                    policy: c.policy.clone(),
                    remove_passphrase: c.remove_passphrase,
                }),
            });
        }
        out
    }

    /// Fail when a customization outside `allowed` is set.
    pub fn check_supported(&self, image_type: &str, allowed: &[&str]) -> Result<(), BlueprintError> {
        let Some(c) = &self.customizations else {
            return Ok(());
        };
        match c.set_fields().into_iter().find(|f| !allowed.contains(f)) {
            Some(field) => Err(BlueprintError::Unsupported {
                field: field.to_string(),
                image_type: image_type.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgforge_common::datasizes::GIB;
    use tempfile::TempDir;

    fn with_customizations(c: Customizations) -> Blueprint {
        Blueprint {
            customizations: Some(c),
            ..Default::default()
        }
    }

    #[test]
    fn parses_json_with_sizes_as_strings_or_numbers() {
        let bp = Blueprint::from_json(
            r#"{
                "name": "web",
                "packages": [{"name": "nginx", "version": "1.24.*"}, {"name": "tmux"}],
                "groups": [{"name": "core"}],
                "customizations": {
                    "hostname": "web01",
                    "filesystem": [
                        {"mountpoint": "/var", "minsize": "2 GiB"},
                        {"mountpoint": "/opt", "minsize": 1073741824}
                    ],
                    "disk": {"swap": "1 GiB"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(bp.package_names(), ["nginx-1.24.*", "tmux", "@core"]);
        let disk = bp.disk_customizations();
        assert_eq!(disk.filesystems[0].min_size.bytes(), 2 * GIB);
        assert_eq!(disk.filesystems[1].min_size.bytes(), GIB);
        assert_eq!(disk.swap_size.map(|s| s.bytes()), Some(GIB));
    }

    #[test]
    fn parses_yaml() {
        let bp = Blueprint::from_yaml(
            "name: base\ncustomizations:\n  partitioning_mode: btrfs\n  services:\n    enabled: [sshd]\n",
        )
        .unwrap();
        assert_eq!(bp.partitioning_mode().unwrap(), PartitioningMode::Btrfs);
        assert_eq!(bp.customizations().services.unwrap().enabled, ["sshd"]);
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("bp.yaml");
        fs::write(&yaml, "name: from-yaml\n").unwrap();
        assert_eq!(Blueprint::load(&yaml).unwrap().name, "from-yaml");
        let json = dir.path().join("bp.json");
        fs::write(&json, "{\"name\": ").unwrap();
        let err = Blueprint::load(&json).unwrap_err();
        assert!(err.to_string().starts_with(&format!("failed to parse blueprint {}", json.display())));
    }

    #[test]
    fn errors_carry_field_paths() {
        let bp = with_customizations(Customizations {
            filesystem: vec![
                FilesystemCustomization {
                    mountpoint: "/var".into(),
                    minsize: Default::default(),
                },
                FilesystemCustomization {
                    mountpoint: "var/log".into(),
                    minsize: Default::default(),
                },
            ],
            ..Default::default()
        });
        let err = bp.validate().unwrap_err();
        assert!(err.to_string().starts_with("customizations.filesystem[1].mountpoint: "));

        let bp = with_customizations(Customizations {
            hostname: Some("not a host".into()),
            ..Default::default()
        });
        assert!(bp.validate().unwrap_err().to_string().starts_with("customizations.hostname"));
    }

    #[test]
    fn bad_size_strings_are_rejected() {
        let err = Blueprint::from_json(
            r#"{"customizations": {"filesystem": [{"mountpoint": "/var", "minsize": "2 PB"}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown data size units"));
    }

    #[test]
    fn unknown_partitioning_mode() {
        let bp = with_customizations(Customizations {
            partitioning_mode: Some("zfs".into()),
            ..Default::default()
        });
        assert!(bp.validate().unwrap_err().to_string().contains("partitioning_mode"));
    }

    #[test]
    fn protected_files_and_modes() {
        let bp = with_customizations(Customizations {
            files: vec![FileCustomization {
                path: "/etc/fstab".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(bp.validate().is_err());
        let bp = with_customizations(Customizations {
            directories: vec![DirectoryCustomization {
                path: "/srv/data".into(),
                mode: Some("0989".into()),
                ensure_parents: true,
            }],
            ..Default::default()
        });
        assert!(bp.validate().unwrap_err().to_string().starts_with("customizations.directories[0].mode"));
    }

    #[test]
    fn unsupported_customizations() {
        let bp = with_customizations(Customizations {
            kickstart: Some(KickstartCustomization {
                contents: "text".into(),
            }),
            ..Default::default()
        });
        let err = bp.check_supported("qcow2", &["hostname"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "customization kickstart is not supported by image type qcow2"
        );
        assert!(Blueprint::default().check_supported("qcow2", &[]).is_ok());
    }

    #[test]
    fn encryption_maps_to_planner_request() {
        let bp = Blueprint::from_json(
            r#"{"customizations": {"partitioning_mode": "lvm", "disk": {
                "minsize": "20 GiB",
                "volume_group": "datavg",
                "encryption": {"passphrase": "secret",
                    "clevis": {"pin": "tpm2", "policy": "{}", "remove_passphrase": true}}}}}"#,
        )
        .unwrap();
        let disk = bp.disk_customizations();
        assert_eq!(disk.min_disk_size.bytes(), 20 * GIB);
        assert_eq!(disk.volume_group.as_deref(), Some("datavg"));
        let enc = disk.encryption.unwrap();
        assert!(enc.clevis.unwrap().remove_passphrase);
    }

    #[test]
    fn containers_become_source_specs() {
        let bp = Blueprint {
            containers: vec![Container {
                source: "registry.example.com/app:1".into(),
                name: Some("app".into()),
                tls_verify: Some(false),
                local_storage: true,
            }],
            ..Default::default()
        };
        let specs = bp.container_specs();
        assert_eq!(specs[0].local_name(), "app");
        assert!(specs[0].local);
    }
}
