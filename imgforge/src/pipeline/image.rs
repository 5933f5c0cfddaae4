//! The partitioned disk image built from a tree.

use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::disk::{DiskError, Entity, PartitionTable, TableType};
use crate::osbuild::fsgen::{self, PartitionTool};
use crate::osbuild::stages::{Grub2InstCore, Grub2InstOptions, Grub2InstPrefix};
use crate::osbuild::{ManifestError, Pipeline, Sources, Stage};

pub const GRUB2_BIOS_PLATFORM: &str = "i386-pc";

/// Boot loader targets of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootloader {
    /// GRUB platform for BIOS boot.
    pub legacy: Option<String>,
    /// EFI vendor directory for UEFI boot.
    pub uefi_vendor: Option<String>,
}

impl Bootloader {
    pub fn legacy() -> Self {
        Self {
            legacy: Some(GRUB2_BIOS_PLATFORM.to_string()),
            uefi_vendor: None,
        }
    }

    pub fn uefi(vendor: impl Into<String>) -> Self {
        Self {
            legacy: None,
            uefi_vendor: Some(vendor.into()),
        }
    }

    pub fn hybrid(vendor: impl Into<String>) -> Self {
        Self {
            legacy: Some(GRUB2_BIOS_PLATFORM.to_string()),
            uefi_vendor: Some(vendor.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskImagePipeline {
    name: String,
    build: String,
    tree: String,
    filename: String,
    table: PartitionTable,
    bootloader: Option<Bootloader>,
    tool: PartitionTool,
}

impl DiskImagePipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        tree: impl Into<String>,
        filename: impl Into<String>,
        table: PartitionTable,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            tree: tree.into(),
            filename: filename.into(),
            table,
            bootloader: None,
            tool: PartitionTool::default(),
        }
    }

    pub fn with_bootloader(mut self, bootloader: Bootloader) -> Self {
        self.bootloader = Some(bootloader);
        self
    }

    pub fn with_partition_tool(mut self, tool: PartitionTool) -> Self {
        self.tool = tool;
        self
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }
}

/// Install the BIOS core image, reading grub's modules from the partition
/// that holds `/boot`.
fn grub2_inst_stage(
    pt: &PartitionTable,
    filename: &str,
    platform: &str,
) -> Result<Stage, ManifestError> {
    let boot_mountpoint = if pt.contains_mountpoint("/boot") { "/boot" } else { "/" };
    let path = pt
        .find_mountpoint(boot_mountpoint)
        .ok_or(DiskError::NoRootFilesystem)?;
    let filesystem = path
        .iter()
        .rev()
        .find_map(|entity| match entity {
            Entity::Filesystem(fs) => Some(fs.fs_type.as_str().to_string()),
            Entity::Btrfs(_) => Some("btrfs".to_string()),
            _ => None,
        })
        .ok_or_else(|| DiskError::NoSlotFor(boot_mountpoint.to_string()))?;
    let number = pt
        .partitions
        .iter()
        .position(|p| p.contains_mountpoint(boot_mountpoint))
        .ok_or_else(|| DiskError::NoSlotFor(boot_mountpoint.to_string()))?;
    let location = match pt.label {
        TableType::Dos => pt.partitions.first().map(|p| pt.bytes_to_sectors(p.start)),
        TableType::Gpt => None,
    };
    let prefix_path = if boot_mountpoint == "/boot" {
        "/grub2"
    } else {
        "/boot/grub2"
    };
    let options = Grub2InstOptions {
        filename: filename.to_string(),
        platform: platform.to_string(),
        location,
        core: Grub2InstCore {
            kind: "mbr".to_string(),
            partlabel: pt.label.as_str().to_string(),
            filesystem,
        },
        prefix: Grub2InstPrefix {
            kind: "partition".to_string(),
            partlabel: pt.label.as_str().to_string(),
            number,
            path: prefix_path.to_string(),
        },
    };
    Ok(Stage::new(options)?)
}

impl PipelineNode for DiskImagePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn export_filename(&self) -> Option<&str> {
        Some(&self.filename)
    }

    fn serialize(
        &self,
        _resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let pt = &self.table;
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stages(fsgen::prepare_stages(pt, &self.filename, self.tool)?);
        pipeline.add_stages(fsgen::write_device_stages(pt, &self.filename, &self.build)?);
        pipeline.add_stage(fsgen::copy_tree_stage(pt, &self.filename, &self.tree)?);
        if let Some(platform) = self.bootloader.as_ref().and_then(|b| b.legacy.as_deref()) {
            pipeline.add_stage(grub2_inst_stage(pt, &self.filename, platform)?);
        }
        pipeline.add_stages(fsgen::finish_stages(pt, &self.filename)?);
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{
        Customizations, Filesystem, FsType, Partition, PartitioningMode, Payload, RawPayload,
        RawSource, plan, ptype,
    };
    use imgforge_common::datasizes::{GIB, MIB};

    fn template(label: TableType) -> PartitionTable {
        let mut pt = PartitionTable::new(label);
        let data = match label {
            TableType::Gpt => ptype::FILESYSTEM_DATA_GUID,
            TableType::Dos => ptype::DOS_LINUX,
        };
        if label == TableType::Gpt {
            pt.partitions
                .push(Partition::new(MIB, ptype::BIOS_BOOT_GUID, None));
        }
        pt.partitions.push(Partition::new(
            GIB,
            data,
            Some(Payload::Filesystem(Filesystem::new(FsType::Ext4, "/boot"))),
        ));
        pt.partitions.push(Partition::new(
            4 * GIB,
            data,
            Some(Payload::Filesystem(Filesystem::new(FsType::Xfs, "/"))),
        ));
        pt
    }

    fn planned(label: TableType) -> PartitionTable {
        plan(&template(label), &Customizations::default(), 0, PartitioningMode::Raw, 0).unwrap()
    }

    fn types(pipeline: &Pipeline) -> Vec<&'static str> {
        pipeline.stages.iter().map(|s| s.type_name()).collect()
    }

    #[test]
    fn disk_stages_in_order() {
        let node = DiskImagePipeline::new("image", "build", "os", "disk.raw", planned(TableType::Gpt))
            .with_bootloader(Bootloader::hybrid("fedora"));
        let pipeline = node
            .serialize(&Resolved::default(), &mut Sources::default())
            .unwrap();
        assert_eq!(
            types(&pipeline),
            [
                "org.osbuild.truncate",
                "org.osbuild.sfdisk",
                "org.osbuild.mkfs.ext4",
                "org.osbuild.mkfs.xfs",
                "org.osbuild.copy",
                "org.osbuild.grub2.inst",
            ]
        );
        assert_eq!(node.export_filename(), Some("disk.raw"));
    }

    #[test]
    fn bios_core_reads_the_boot_partition() {
        let pt = planned(TableType::Gpt);
        let stage = grub2_inst_stage(&pt, "disk.raw", GRUB2_BIOS_PLATFORM).unwrap();
        let options = serde_json::to_value(&stage.options).unwrap();
        assert_eq!(options["prefix"]["number"], 1);
        assert_eq!(options["prefix"]["path"], "/grub2");
        assert_eq!(options["core"]["filesystem"], "ext4");
        assert!(options.get("location").is_none());
    }

    #[test]
    fn dos_tables_need_a_core_location() {
        let pt = planned(TableType::Dos);
        let stage = grub2_inst_stage(&pt, "disk.raw", GRUB2_BIOS_PLATFORM).unwrap();
        let options = serde_json::to_value(&stage.options).unwrap();
        assert_eq!(options["location"], 2048);
        assert_eq!(options["core"]["partlabel"], "dos");
        assert_eq!(options["prefix"]["number"], 0);
    }

    #[test]
    fn raw_payloads_come_from_build_root_or_pipeline() {
        for (source, expected) in [
            (
                RawSource::BuildTree {
                    path: "/usr/lib/firmware/boot.img".into(),
                },
                "build",
            ),
            (
                RawSource::Pipeline {
                    pipeline: "firmware".into(),
                    path: "/boot.img".into(),
                },
                "firmware",
            ),
        ] {
            let mut pt = template(TableType::Gpt);
            pt.partitions.insert(
                1,
                Partition::new(
                    16 * MIB,
                    ptype::FILESYSTEM_DATA_GUID,
                    Some(Payload::Raw(RawPayload { source })),
                ),
            );
            let pt = plan(&pt, &Customizations::default(), 0, PartitioningMode::Raw, 0).unwrap();
            let node = DiskImagePipeline::new("image", "build", "os", "disk.raw", pt);
            let pipeline = node
                .serialize(&Resolved::default(), &mut Sources::default())
                .unwrap();
            let write = pipeline
                .stages
                .iter()
                .find(|s| s.type_name() == "org.osbuild.write-device")
                .unwrap();
            assert_eq!(write.inputs["tree"].pipeline_refs(), [expected]);
        }
    }
}
