//! The operating system tree: packages plus every blueprint customization
//! that can be applied without booting.

use serde_json::Value;
use std::collections::BTreeMap;

use super::image::Bootloader;
use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::container;
use crate::disk::{self, Entity, PartitionTable};
use crate::osbuild::fsgen;
use crate::osbuild::stages::{
    ChmodItem, ChmodOptions, ChronyOptions, ChronyServer, CloudInitOptions, CopyOptions, CopyPath,
    FirewallOptions, FirstBootOptions, GroupOptions, GroupsOptions, Grub2Options, Grub2Uefi,
    HostnameOptions, KernelCmdlineOptions, KeymapOptions, LocaleOptions, MkdirOptions, MkdirPath,
    ModprobeOptions, OscapConfig, OscapRemediationOptions, RhsmFactsOptions, RpmOptions,
    SelinuxOptions, SkopeoOptions, SshdConfig, SshdConfigOptions, SysconfigOptions, SystemdOptions,
    TimezoneOptions, UpdateCaTrustOptions, UserOptions, UsersOptions, X11Keymap,
};
use crate::osbuild::{Input, ManifestError, Pipeline, Sources, Stage};
use crate::rpmmd::{PackageSet, PackageSetChain, RepoConfig};

const CA_ANCHORS: &str = "/etc/pki/ca-trust/source/anchors";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsUser {
    pub name: String,
    /// Stage options; any password must already be crypted.
    pub options: UserOptions,
}

/// A file embedded in the manifest as an inline source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub path: String,
    pub mode: Option<String>,
    pub data: Vec<u8>,
}

/// Everything the OS pipeline writes into the tree.
#[derive(Debug, Clone, Default)]
pub struct OsConfig {
    pub packages: PackageSetChain,
    pub containers: Vec<container::SourceSpec>,
    pub partition_table: Option<PartitionTable>,
    pub bootloader: Option<Bootloader>,
    /// Kernel arguments beyond the ones the partition table implies.
    pub kernel_options: Vec<String>,
    pub hostname: Option<String>,
    pub language: Option<String>,
    pub keyboard: Option<String>,
    pub x11_layouts: Vec<String>,
    pub timezone: Option<String>,
    pub ntp_servers: Vec<String>,
    pub groups: BTreeMap<String, GroupOptions>,
    pub users: Vec<OsUser>,
    pub firewall: Option<FirewallOptions>,
    pub enabled_services: Vec<String>,
    pub disabled_services: Vec<String>,
    pub masked_services: Vec<String>,
    pub default_target: Option<String>,
    pub sysconfig: Option<SysconfigOptions>,
    pub sshd: Option<SshdConfig>,
    pub modprobe: Vec<ModprobeOptions>,
    pub cloud_init: Vec<CloudInitOptions>,
    pub directories: Vec<MkdirPath>,
    pub files: Vec<FileData>,
    pub ca_certs: Vec<String>,
    pub firstboot: Option<FirstBootOptions>,
    pub oscap: Option<OscapConfig>,
    pub rhsm_facts: BTreeMap<String, Value>,
    pub selinux: bool,
}

impl OsConfig {
    pub fn new(base: PackageSet) -> Self {
        Self {
            packages: vec![base],
            selinux: true,
            ..Default::default()
        }
    }

    /// Append a set depsolved on top of the base set.
    pub fn add_package_set(&mut self, set: PackageSet) {
        self.packages.push(set);
    }
}

#[derive(Debug, Clone)]
pub struct OsPipeline {
    name: String,
    build: String,
    config: OsConfig,
}

impl OsPipeline {
    pub fn new(name: impl Into<String>, build: impl Into<String>, config: OsConfig) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            config,
        }
    }

    pub fn config(&self) -> &OsConfig {
        &self.config
    }

    fn kernel_args(&self, pt: &PartitionTable) -> Result<(String, String), ManifestError> {
        let root_uuid = disk::root_filesystem_uuid(pt)?;
        let opts: Vec<String> = disk::kernel_cmdline(pt)?
            .into_iter()
            .filter(|arg| !arg.starts_with("root="))
            .chain(self.config.kernel_options.iter().cloned())
            .collect();
        Ok((root_uuid, opts.join(" ")))
    }

    fn rpm_stage(&self, resolved: &Resolved<'_>) -> Result<Stage, ManifestError> {
        let options = RpmOptions {
            gpgkeys: gpgkeys(resolved.repos),
            ..Default::default()
        };
        Ok(Stage::with_inputs(
            options,
            [("packages", Input::packages(resolved.packages))],
        )?)
    }

    fn locale_stages(&self, pipeline: &mut Pipeline) -> Result<(), ManifestError> {
        let c = &self.config;
        if let Some(language) = &c.language {
            pipeline.add_stage(Stage::new(LocaleOptions {
                language: language.clone(),
            })?);
        }
        if let Some(keymap) = &c.keyboard {
            pipeline.add_stage(Stage::new(KeymapOptions {
                keymap: keymap.clone(),
                x11_keymap: (!c.x11_layouts.is_empty()).then(|| X11Keymap {
                    layouts: c.x11_layouts.clone(),
                }),
            })?);
        }
        if let Some(hostname) = &c.hostname {
            pipeline.add_stage(Stage::new(HostnameOptions {
                hostname: hostname.clone(),
            })?);
        }
        if let Some(zone) = &c.timezone {
            pipeline.add_stage(Stage::new(TimezoneOptions { zone: zone.clone() })?);
        }
        if !c.ntp_servers.is_empty() {
            let servers = c
                .ntp_servers
                .iter()
                .map(|hostname| ChronyServer {
                    hostname: hostname.clone(),
                    minpoll: None,
                    maxpoll: None,
                    iburst: Some(true),
                    prefer: None,
                })
                .collect();
            pipeline.add_stage(Stage::new(ChronyOptions {
                servers,
                leapsectz: None,
            })?);
        }
        Ok(())
    }

    fn account_stages(&self, pipeline: &mut Pipeline) -> Result<(), ManifestError> {
        let c = &self.config;
        if !c.groups.is_empty() {
            pipeline.add_stage(Stage::new(GroupsOptions {
                groups: c.groups.clone(),
            })?);
        }
        if !c.users.is_empty() {
            let users = c
                .users
                .iter()
                .map(|u| (u.name.clone(), u.options.clone()))
                .collect();
            pipeline.add_stage(Stage::new(UsersOptions { users })?);
        }
        Ok(())
    }

    fn service_stages(&self, pipeline: &mut Pipeline) -> Result<(), ManifestError> {
        let c = &self.config;
        if let Some(firewall) = &c.firewall {
            pipeline.add_stage(Stage::new(firewall.clone())?);
        }
        let systemd = SystemdOptions {
            enabled_services: c.enabled_services.clone(),
            disabled_services: c.disabled_services.clone(),
            masked_services: c.masked_services.clone(),
            default_target: c.default_target.clone(),
        };
        if systemd != SystemdOptions::default() {
            pipeline.add_stage(Stage::new(systemd)?);
        }
        if let Some(sysconfig) = &c.sysconfig {
            pipeline.add_stage(Stage::new(sysconfig.clone())?);
        }
        if let Some(config) = &c.sshd {
            pipeline.add_stage(Stage::new(SshdConfigOptions {
                config: config.clone(),
            })?);
        }
        for modprobe in &c.modprobe {
            pipeline.add_stage(Stage::new(modprobe.clone())?);
        }
        for cloud_init in &c.cloud_init {
            pipeline.add_stage(Stage::new(cloud_init.clone())?);
        }
        Ok(())
    }

    fn file_stages(
        &self,
        pipeline: &mut Pipeline,
        sources: &mut Sources,
    ) -> Result<(), ManifestError> {
        let c = &self.config;
        if !c.directories.is_empty() {
            pipeline.add_stage(Stage::new(MkdirOptions {
                paths: c.directories.clone(),
            })?);
        }
        for file in &c.files {
            pipeline.add_stage(inline_copy_stage(sources, &file.data, &file.path)?);
        }
        let modes: BTreeMap<String, ChmodItem> = c
            .files
            .iter()
            .filter_map(|f| {
                f.mode.as_ref().map(|mode| {
                    (
                        f.path.clone(),
                        ChmodItem {
                            mode: mode.clone(),
                            recursive: false,
                        },
                    )
                })
            })
            .collect();
        if !modes.is_empty() {
            pipeline.add_stage(Stage::new(ChmodOptions { items: modes })?);
        }
        if !c.ca_certs.is_empty() {
            for pem in &c.ca_certs {
                let key = imgforge_common::checksum::sha256_hex(pem.as_bytes());
                let path = format!("{CA_ANCHORS}/{}.pem", &key[..16]);
                pipeline.add_stage(inline_copy_stage(sources, pem.as_bytes(), &path)?);
            }
            pipeline.add_stage(Stage::new(UpdateCaTrustOptions {})?);
        }
        Ok(())
    }

    fn boot_stages(&self, pipeline: &mut Pipeline) -> Result<(), ManifestError> {
        let Some(pt) = &self.config.partition_table else {
            return Ok(());
        };
        pipeline.add_stage(Stage::new(fsgen::fstab_options(pt)?)?);
        let Some(bootloader) = &self.config.bootloader else {
            return Ok(());
        };
        let (root_fs_uuid, kernel_opts) = self.kernel_args(pt)?;
        let options = Grub2Options {
            root_fs_uuid,
            boot_fs_uuid: boot_fs_uuid(pt),
            kernel_opts,
            legacy: bootloader.legacy.clone(),
            uefi: bootloader.uefi_vendor.as_ref().map(|vendor| Grub2Uefi {
                vendor: vendor.clone(),
                unified: true,
                install: false,
            }),
            write_defaults: true,
            config: None,
        };
        pipeline.add_stage(Stage::new(options)?);
        Ok(())
    }
}

/// Copy `data` to `path` in the tree through an inline source.
fn inline_copy_stage(sources: &mut Sources, data: &[u8], path: &str) -> Result<Stage, ManifestError> {
    let key = sources.add_inline(data);
    let digest = key.trim_start_matches("sha256:");
    let input = format!("file-{}", &digest[..12]);
    let options = CopyOptions {
        paths: vec![CopyPath::new(
            format!("input://{input}/{key}"),
            format!("tree://{path}"),
        )],
    };
    Ok(Stage::with_inputs(
        options,
        [(input, Input::source_files([key.as_str()]))],
    )?)
}

/// Keys of repositories that check signatures, without duplicates.
fn gpgkeys(repos: &[RepoConfig]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in repos
        .iter()
        .filter(|r| r.check_gpg)
        .flat_map(|r| r.gpgkeys.iter())
    {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn boot_fs_uuid(pt: &PartitionTable) -> Option<String> {
    let path = pt.find_mountpoint("/boot")?;
    path.iter().rev().find_map(|entity| match entity {
        Entity::Filesystem(fs) => fs.uuid.clone(),
        _ => None,
    })
}

impl PipelineNode for OsPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn package_set_chain(&self) -> Option<PackageSetChain> {
        Some(self.config.packages.clone())
    }

    fn container_sources(&self) -> Vec<container::SourceSpec> {
        self.config.containers.clone()
    }

    fn serialize(
        &self,
        resolved: &Resolved<'_>,
        sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let c = &self.config;
        let mut pipeline = empty_pipeline(self);

        if let Some(pt) = &c.partition_table {
            let (root_fs_uuid, kernel_opts) = self.kernel_args(pt)?;
            pipeline.add_stage(Stage::new(KernelCmdlineOptions {
                root_fs_uuid,
                kernel_opts,
            })?);
        }
        pipeline.add_stage(self.rpm_stage(resolved)?);
        if !resolved.containers.is_empty() {
            pipeline.add_stage(Stage::with_inputs(
                SkopeoOptions::containers_storage(),
                [("images", Input::containers(resolved.containers))],
            )?);
        }
        self.locale_stages(&mut pipeline)?;
        self.account_stages(&mut pipeline)?;
        self.service_stages(&mut pipeline)?;
        self.file_stages(&mut pipeline, sources)?;
        if let Some(firstboot) = &c.firstboot {
            pipeline.add_stage(Stage::new(firstboot.clone())?);
        }
        if let Some(config) = &c.oscap {
            pipeline.add_stage(Stage::new(OscapRemediationOptions {
                data_dir: Some("/var/tmp".to_string()),
                config: config.clone(),
            })?);
        }
        if !c.rhsm_facts.is_empty() {
            pipeline.add_stage(Stage::new(RhsmFactsOptions {
                facts: c.rhsm_facts.clone(),
            })?);
        }
        self.boot_stages(&mut pipeline)?;
        if c.selinux {
            pipeline.add_stage(Stage::new(SelinuxOptions::targeted())?);
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{
        Customizations, Filesystem, FsType, Partition, PartitioningMode, Payload, TableType, plan,
        ptype,
    };
    use crate::osbuild::StageError;
    use crate::pipeline::testutil::fake_depsolve;
    use imgforge_common::datasizes::GIB;

    fn planned_table() -> PartitionTable {
        let mut template = PartitionTable::new(TableType::Gpt);
        template.partitions.push(Partition::new(
            10 * GIB,
            ptype::FILESYSTEM_DATA_GUID,
            Some(Payload::Filesystem(Filesystem::new(FsType::Xfs, "/"))),
        ));
        plan(&template, &Customizations::default(), 0, PartitioningMode::Raw, 0).unwrap()
    }

    fn serialize(node: &OsPipeline, sources: &mut Sources) -> Result<Pipeline, ManifestError> {
        let result = fake_depsolve(&node.package_set_chain().unwrap());
        let resolved = Resolved {
            packages: &result.packages,
            repos: &result.repos,
            ..Default::default()
        };
        node.serialize(&resolved, sources)
    }

    fn types(pipeline: &Pipeline) -> Vec<&'static str> {
        pipeline.stages.iter().map(|s| s.type_name()).collect()
    }

    #[test]
    fn customized_tree_stage_order() {
        let mut config = OsConfig::new(PackageSet::new(["kernel", "grub2"]));
        config.partition_table = Some(planned_table());
        config.bootloader = Some(Bootloader::hybrid("fedora"));
        config.hostname = Some("edge".into());
        config.timezone = Some("Europe/Prague".into());
        config.ntp_servers = vec!["time.example.com".into()];
        config.users.push(OsUser {
            name: "alice".into(),
            options: UserOptions {
                password: Some("$6$saltsalt$hash".into()),
                ..Default::default()
            },
        });
        config.enabled_services = vec!["sshd.service".into()];
        config.firstboot = Some(FirstBootOptions {
            commands: vec!["/usr/bin/true".into()],
            wait_for_network: false,
        });

        let pipeline = serialize(&OsPipeline::new("os", "build", config), &mut Sources::default())
            .unwrap();
        assert_eq!(
            types(&pipeline),
            [
                "org.osbuild.kernel-cmdline",
                "org.osbuild.rpm",
                "org.osbuild.hostname",
                "org.osbuild.timezone",
                "org.osbuild.chrony",
                "org.osbuild.users",
                "org.osbuild.systemd",
                "org.osbuild.first-boot",
                "org.osbuild.fstab",
                "org.osbuild.grub2",
                "org.osbuild.selinux",
            ]
        );
    }

    #[test]
    fn files_become_inline_sources() {
        let mut config = OsConfig::new(PackageSet::new(["bash"]));
        config.files.push(FileData {
            path: "/etc/motd".into(),
            mode: Some("0644".into()),
            data: b"hello\n".to_vec(),
        });
        config.ca_certs.push("-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".into());
        let mut sources = Sources::default();
        let pipeline = serialize(&OsPipeline::new("os", "build", config), &mut sources).unwrap();
        assert_eq!(
            types(&pipeline),
            [
                "org.osbuild.rpm",
                "org.osbuild.copy",
                "org.osbuild.chmod",
                "org.osbuild.copy",
                "org.osbuild.pki.update-ca-trust",
                "org.osbuild.selinux",
            ]
        );
        assert_eq!(sources.inline.items.len(), 2);
        let copy = &pipeline.stages[1];
        let (_, input) = copy.inputs.iter().next().unwrap();
        for key in input.source_refs() {
            assert!(sources.inline.items.contains_key(key));
        }
        sources.verify_inline().unwrap();
    }

    #[test]
    fn kernel_options_follow_table_arguments() {
        let mut config = OsConfig::new(PackageSet::new(["kernel"]));
        config.partition_table = Some(planned_table());
        config.kernel_options = vec!["console=ttyS0".into()];
        let pipeline = serialize(&OsPipeline::new("os", "build", config), &mut Sources::default())
            .unwrap();
        let options = serde_json::to_value(&pipeline.stages[0].options).unwrap();
        assert_eq!(options["kernel_opts"], "console=ttyS0");
        assert!(crate::disk::is_uuid(options["root_fs_uuid"].as_str().unwrap()));
    }

    #[test]
    fn plain_passwords_are_rejected() {
        let mut config = OsConfig::new(PackageSet::new(["bash"]));
        config.users.push(OsUser {
            name: "bob".into(),
            options: UserOptions {
                password: Some("hunter2".into()),
                ..Default::default()
            },
        });
        let err = serialize(&OsPipeline::new("os", "build", config), &mut Sources::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Stage(StageError::InvalidOption { .. })
        ));
    }

    #[test]
    fn signature_keys_are_collected_once() {
        let repo = RepoConfig {
            check_gpg: true,
            gpgkeys: vec!["KEY".into()],
            ..Default::default()
        };
        let unsigned = RepoConfig {
            gpgkeys: vec!["OTHER".into()],
            ..Default::default()
        };
        assert_eq!(gpgkeys(&[repo.clone(), repo, unsigned]), ["KEY"]);
    }
}
