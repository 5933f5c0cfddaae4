//! The closed catalog of stage types.
//!
//! Each stage type is one options struct implementing
//! [`StageKind`](super::stage::StageKind). [`StageOptions`] is the sum of
//! all of them; string dispatch on the type name happens only in
//! [`StageOptions::from_json`].

mod boot;
mod disk;
mod files;
mod image;
mod ostree;
mod rpm;
mod system;

pub use boot::*;
pub use disk::*;
pub use files::*;
pub use image::*;
pub use ostree::*;
pub use rpm::*;
pub use system::*;

use serde::Serialize;
use serde_json::Value;

use super::error::StageError;
use super::inputs::InputKind;
use super::stage::StageKind;

macro_rules! stage_catalog {
    ($($variant:ident($options:ty)),* $(,)?) => {
        /// Options of one stage, tagged by stage type.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        pub enum StageOptions {
            $($variant($options)),*
        }

        impl StageOptions {
            /// Every stage type the catalog knows.
            pub const TYPES: &'static [&'static str] = &[
                $(<$options as StageKind>::TYPE),*
            ];

            pub fn type_name(&self) -> &'static str {
                match self {
                    $(StageOptions::$variant(_) => <$options as StageKind>::TYPE),*
                }
            }

            pub fn validate(&self) -> Result<(), StageError> {
                match self {
                    $(StageOptions::$variant(o) => o.validate()),*
                }
            }

            pub fn required_inputs(&self) -> &'static [(&'static str, InputKind)] {
                match self {
                    $(StageOptions::$variant(_) => <$options as StageKind>::INPUTS),*
                }
            }

            pub fn paths_changed(&self) -> &'static [&'static str] {
                match self {
                    $(StageOptions::$variant(_) => <$options as StageKind>::PATHS_CHANGED),*
                }
            }

            /// Decode the options of a stage of type `type_name` and
            /// validate them.
            pub fn from_json(type_name: &str, options: Value) -> Result<Self, StageError> {
                $(
                    if type_name == <$options as StageKind>::TYPE {
                        let parsed: $options = serde_json::from_value(options)
                            .map_err(|source| StageError::Decode {
                                stage: type_name.to_string(),
                                source,
                            })?;
                        parsed.validate()?;
                        return Ok(StageOptions::$variant(parsed));
                    }
                )*
                Err(StageError::UnknownType(type_name.to_string()))
            }
        }

        $(
            impl From<$options> for StageOptions {
                fn from(options: $options) -> Self {
                    StageOptions::$variant(options)
                }
            }
        )*
    };
}

stage_catalog! {
    // packages
    Rpm(RpmOptions),
    DnfConfig(DnfConfigOptions),
    // files
    Copy(CopyOptions),
    Mkdir(MkdirOptions),
    Chmod(ChmodOptions),
    Ln(LnOptions),
    Truncate(TruncateOptions),
    // system configuration
    Users(UsersOptions),
    Groups(GroupsOptions),
    Systemd(SystemdOptions),
    Hostname(HostnameOptions),
    Locale(LocaleOptions),
    Timezone(TimezoneOptions),
    Keymap(KeymapOptions),
    Selinux(SelinuxOptions),
    Sysconfig(SysconfigOptions),
    SshdConfig(SshdConfigOptions),
    Modprobe(ModprobeOptions),
    CloudInit(CloudInitOptions),
    FirstBoot(FirstBootOptions),
    RhsmFacts(RhsmFactsOptions),
    UpdateCaTrust(UpdateCaTrustOptions),
    OscapRemediation(OscapRemediationOptions),
    Firewall(FirewallOptions),
    Chrony(ChronyOptions),
    // boot
    KernelCmdline(KernelCmdlineOptions),
    Fstab(FstabOptions),
    Grub2(Grub2Options),
    Grub2Inst(Grub2InstOptions),
    Bootupd(BootupdOptions),
    // disk
    Sfdisk(SfdiskOptions),
    Sgdisk(SgdiskOptions),
    MkfsExt4(MkfsExt4Options),
    MkfsXfs(MkfsXfsOptions),
    MkfsFat(MkfsFatOptions),
    MkfsBtrfs(MkfsBtrfsOptions),
    Mkswap(MkswapOptions),
    BtrfsSubvol(BtrfsSubvolOptions),
    Luks2Format(Luks2FormatOptions),
    Luks2RemoveKey(Luks2RemoveKeyOptions),
    ClevisLuksBind(ClevisLuksBindOptions),
    Lvm2Create(Lvm2CreateOptions),
    Lvm2Metadata(Lvm2MetadataOptions),
    WriteDevice(WriteDeviceOptions),
    // ostree
    OstreeInitFs(OstreeInitFsOptions),
    OstreeOsInit(OstreeOsInitOptions),
    OstreePull(OstreePullOptions),
    OstreeDeploy(OstreeDeployOptions),
    OstreeConfig(OstreeConfigOptions),
    OstreeFillvar(OstreeFillvarOptions),
    OstreeSelinux(OstreeSelinuxOptions),
    ContainerDeploy(ContainerDeployOptions),
    Skopeo(SkopeoOptions),
    // image assembly
    Qemu(QemuOptions),
    Tar(TarOptions),
    Xz(XzOptions),
    Squashfs(SquashfsOptions),
    Erofs(ErofsOptions),
    Xorrisofs(XorrisofsOptions),
    Ovf(OvfOptions),
    Hmac(HmacOptions),
}

/// Whether `value` serializes to nothing worth emitting.
pub(crate) fn is_empty_options(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Shared check for file names stages write into the output tree.
pub(crate) fn check_filename(
    stage: &'static str,
    field: &str,
    filename: &str,
) -> Result<(), StageError> {
    if filename.is_empty() || filename.contains('/') || filename == "." || filename == ".." {
        return Err(super::error::invalid(
            stage,
            field,
            format!("{filename:?} is not a plain file name"),
        ));
    }
    Ok(())
}

/// Shared check for absolute paths inside the tree.
pub(crate) fn check_abs_path(
    stage: &'static str,
    field: &str,
    path: &str,
) -> Result<(), StageError> {
    if !path.starts_with('/') {
        return Err(super::error::invalid(
            stage,
            field,
            format!("{path:?} must be absolute"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn type_names_are_unique_and_namespaced() {
        let unique: BTreeSet<_> = StageOptions::TYPES.iter().collect();
        assert_eq!(unique.len(), StageOptions::TYPES.len());
        assert!(StageOptions::TYPES.iter().all(|t| t.starts_with("org.osbuild.")));
    }

    #[test]
    fn from_json_dispatches_by_type() {
        let options =
            StageOptions::from_json("org.osbuild.hostname", json!({"hostname": "box"})).unwrap();
        assert_eq!(options.type_name(), "org.osbuild.hostname");
        assert_eq!(serde_json::to_value(&options).unwrap(), json!({"hostname": "box"}));
    }

    #[test]
    fn from_json_rejects_unknown_types_and_fields() {
        assert!(matches!(
            StageOptions::from_json("org.osbuild.frobnicate", json!({})),
            Err(StageError::UnknownType(_))
        ));
        assert!(matches!(
            StageOptions::from_json("org.osbuild.hostname", json!({"hostname": "a", "x": 1})),
            Err(StageError::Decode { .. })
        ));
    }

    #[test]
    fn filename_checks() {
        assert!(check_filename("org.osbuild.qemu", "filename", "disk.qcow2").is_ok());
        assert!(check_filename("org.osbuild.qemu", "filename", "a/b").is_err());
        assert!(check_filename("org.osbuild.qemu", "filename", "").is_err());
    }
}
