//! An ostree sysroot with one deployment of a pulled commit.

use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::disk::{self, PartitionTable};
use crate::osbuild::fsgen;
use crate::osbuild::stages::{
    MkdirOptions, MkdirPath, OstreeConfigOptions, OstreeDeployOptions, OstreeDeployment,
    OstreeFillvarOptions, OstreeInitFsOptions, OstreeOsInitOptions, OstreePullOptions,
    OstreeRepoConfig, OstreeRootfs, OstreeSelinuxOptions, OstreeSysrootConfig,
};
use crate::osbuild::{Input, ManifestError, Mount, Pipeline, Sources, Stage};
use crate::ostree;

pub const SYSROOT_REPO: &str = "/ostree/repo";

#[derive(Debug, Clone)]
pub struct OstreeDeploymentPipeline {
    name: String,
    build: String,
    commit: ostree::SourceSpec,
    osname: String,
    remote: Option<String>,
    table: PartitionTable,
    kernel_options: Vec<String>,
}

impl OstreeDeploymentPipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        commit: ostree::SourceSpec,
        osname: impl Into<String>,
        table: PartitionTable,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            commit,
            osname: osname.into(),
            remote: None,
            table,
            kernel_options: Vec::new(),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_kernel_options(mut self, options: Vec<String>) -> Self {
        self.kernel_options = options;
        self
    }

    fn deployment(&self) -> OstreeDeployment {
        OstreeDeployment::new(&self.osname, &self.commit.reference)
    }
}

impl PipelineNode for OstreeDeploymentPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn ostree_sources(&self) -> Vec<ostree::SourceSpec> {
        vec![self.commit.clone()]
    }

    fn serialize(
        &self,
        resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let pt = &self.table;
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stage(Stage::new(OstreeInitFsOptions {})?);
        pipeline.add_stage(Stage::new(OstreeOsInitOptions {
            osname: self.osname.clone(),
        })?);
        pipeline.add_stage(Stage::new(OstreeConfigOptions {
            repo: SYSROOT_REPO.to_string(),
            config: OstreeRepoConfig {
                sysroot: Some(OstreeSysrootConfig {
                    readonly: Some(true),
                    bootloader: Some("none".to_string()),
                }),
            },
        })?);
        if pt.has_esp() {
            pipeline.add_stage(Stage::new(MkdirOptions {
                paths: vec![MkdirPath {
                    path: "/boot/efi".to_string(),
                    mode: Some(0o700),
                    parents: false,
                    exist_ok: false,
                }],
            })?);
        }
        pipeline.add_stage(Stage::with_inputs(
            OstreePullOptions {
                repo: SYSROOT_REPO.to_string(),
                remote: self.remote.clone(),
            },
            [("commits", Input::ostree(resolved.commits))],
        )?);

        let kernel_opts = disk::kernel_cmdline(pt)?
            .into_iter()
            .filter(|arg| !arg.starts_with("root="))
            .chain(self.kernel_options.iter().cloned())
            .collect();
        let mounts = ["/boot", "/boot/efi"]
            .into_iter()
            .filter(|mp| pt.contains_mountpoint(mp))
            .map(str::to_string)
            .collect();
        pipeline.add_stage(Stage::with_inputs(
            OstreeDeployOptions {
                osname: self.osname.clone(),
                reference: self.commit.reference.clone(),
                remote: self.remote.clone(),
                mounts,
                rootfs: Some(OstreeRootfs {
                    uuid: Some(disk::root_filesystem_uuid(pt)?),
                    label: None,
                }),
                kernel_opts,
            },
            [("commits", Input::ostree(resolved.commits))],
        )?);
        pipeline.add_stage(Stage::new(OstreeFillvarOptions {
            deployment: self.deployment(),
        })?);
        let deployment_mount = Mount::ostree_deployment(&self.osname, &self.commit.reference);
        pipeline.add_stage(
            Stage::new(fsgen::fstab_options(pt)?)?.with_mounts(vec![deployment_mount]),
        );
        pipeline.add_stage(Stage::new(OstreeSelinuxOptions {
            deployment: self.deployment(),
        })?);
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
    use crate::ostree::CommitSpec;
    use imgforge_common::datasizes::{GIB, MIB};

    fn table() -> PartitionTable {
        let mut pt = PartitionTable::new(TableType::Gpt);
        pt.partitions.push(Partition::new(
            500 * MIB,
            ptype::EFI_SYSTEM_GUID,
            Some(Payload::Filesystem(Filesystem::new(FsType::Vfat, "/boot/efi"))),
        ));
        pt.partitions.push(Partition::new(
            GIB,
            ptype::FILESYSTEM_DATA_GUID,
            Some(Payload::Filesystem(Filesystem::new(FsType::Ext4, "/boot"))),
        ));
        pt.partitions.push(Partition::new(
            4 * GIB,
            ptype::FILESYSTEM_DATA_GUID,
            Some(Payload::Filesystem(Filesystem::new(FsType::Xfs, "/"))),
        ));
        let cust = Customizations {
            ostree: true,
            ..Default::default()
        };
        plan(&pt, &cust, 0, PartitioningMode::Raw, 0).unwrap()
    }

    #[test]
    fn deployment_stages() {
        let commit = ostree::SourceSpec::new("https://ostree.example.com/repo", "fedora/42/x86_64/iot");
        let node = OstreeDeploymentPipeline::new("ostree-deployment", "build", commit, "fedora-iot", table())
            .with_remote("fedora-iot")
            .with_kernel_options(vec!["modprobe.blacklist=vc4".into()]);
        assert_eq!(node.ostree_sources().len(), 1);

        let commits = vec![CommitSpec {
            reference: "fedora/42/x86_64/iot".into(),
            url: "https://ostree.example.com/repo".into(),
            checksum: "a".repeat(64),
            secrets: None,
        }];
        let resolved = Resolved {
            commits: &commits,
            ..Default::default()
        };
        let pipeline = node.serialize(&resolved, &mut Sources::default()).unwrap();
        let types: Vec<_> = pipeline.stages.iter().map(|s| s.type_name()).collect();
        assert_eq!(
            types,
            [
                "org.osbuild.ostree.init-fs",
                "org.osbuild.ostree.os-init",
                "org.osbuild.ostree.config",
                "org.osbuild.mkdir",
                "org.osbuild.ostree.pull",
                "org.osbuild.ostree.deploy",
                "org.osbuild.ostree.fillvar",
                "org.osbuild.fstab",
                "org.osbuild.ostree.selinux",
            ]
        );
        let deploy = serde_json::to_value(&pipeline.stages[5].options).unwrap();
        assert_eq!(deploy["mounts"], serde_json::json!(["/boot", "/boot/efi"]));
        assert_eq!(deploy["kernel_opts"], serde_json::json!(["modprobe.blacklist=vc4"]));
        assert_eq!(pipeline.stages[5].inputs["commits"].source_refs(), ["a".repeat(64)]);
    }
}
