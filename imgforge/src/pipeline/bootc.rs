//! Bootable container images: the container unpacked into a tree, and that
//! tree installed onto a disk with bootupd.

use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::container;
use crate::disk::PartitionTable;
use crate::osbuild::fsgen::{self, PartitionTool};
use crate::osbuild::stages::{BootupdBios, BootupdOptions, ContainerDeployOptions, SelinuxOptions};
use crate::osbuild::{Device, Input, ManifestError, Pipeline, Sources, Stage};

/// Device name the boot loader installer sees the whole disk under.
const DISK_DEVICE: &str = "disk";

/// The filesystem of a container image.
#[derive(Debug, Clone)]
pub struct ContainerTreePipeline {
    name: String,
    build: String,
    image: container::SourceSpec,
    table: PartitionTable,
}

impl ContainerTreePipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        image: container::SourceSpec,
        table: PartitionTable,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            image,
            table,
        }
    }
}

impl PipelineNode for ContainerTreePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn container_sources(&self) -> Vec<container::SourceSpec> {
        vec![self.image.clone()]
    }

    fn serialize(
        &self,
        resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stage(Stage::with_inputs(
            ContainerDeployOptions::default(),
            [("images", Input::containers(resolved.containers))],
        )?);
        pipeline.add_stage(Stage::new(fsgen::fstab_options(&self.table)?)?);
        pipeline.add_stage(Stage::new(SelinuxOptions::targeted())?);
        Ok(pipeline)
    }
}

/// A disk holding a container tree, made bootable by bootupd.
#[derive(Debug, Clone)]
pub struct ContainerDiskPipeline {
    name: String,
    build: String,
    tree: String,
    filename: String,
    table: PartitionTable,
    bios: bool,
}

impl ContainerDiskPipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        tree: impl Into<String>,
        filename: impl Into<String>,
        table: PartitionTable,
    ) -> Self {
        let bios = table.has_bios_boot();
        Self {
            name: name.into(),
            build: build.into(),
            tree: tree.into(),
            filename: filename.into(),
            table,
            bios,
        }
    }
}

impl PipelineNode for ContainerDiskPipeline {
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
        pipeline.add_stages(fsgen::prepare_stages(pt, &self.filename, PartitionTool::Sgdisk)?);
        pipeline.add_stage(fsgen::copy_tree_stage(pt, &self.filename, &self.tree)?);

        let (mut devices, mounts) = fsgen::devices_and_mounts(pt, &self.filename)?;
        devices.insert(DISK_DEVICE.to_string(), Device::whole_disk(&self.filename));
        let options = BootupdOptions {
            deployment: None,
            static_configs: true,
            bios: self.bios.then(|| BootupdBios {
                device: DISK_DEVICE.to_string(),
            }),
        };
        pipeline.add_stage(Stage::new(options)?.with_devices(devices).with_mounts(mounts));
        pipeline.add_stages(fsgen::finish_stages(pt, &self.filename)?);
        Ok(pipeline)
    }
}
