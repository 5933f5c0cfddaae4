//! Pipelines that turn a disk file or a tree into the delivered artifact.

use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::osbuild::stages::{
    CopyOptions, CopyPath, OvfOptions, QemuFormat, QemuOptions, TarFormat, TarOptions,
    TarRootNode, XzOptions,
};
use crate::osbuild::{Input, ManifestError, Pipeline, Sources, Stage};

/// Convert a raw disk into another image format.
#[derive(Debug, Clone)]
pub struct QemuPipeline {
    name: String,
    build: String,
    image_pipeline: String,
    image_file: String,
    filename: String,
    format: QemuFormat,
}

impl QemuPipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        image_pipeline: impl Into<String>,
        image_file: impl Into<String>,
        filename: impl Into<String>,
        format: QemuFormat,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            image_pipeline: image_pipeline.into(),
            image_file: image_file.into(),
            filename: filename.into(),
            format,
        }
    }
}

impl PipelineNode for QemuPipeline {
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
        let mut pipeline = empty_pipeline(self);
        let options = QemuOptions {
            filename: self.filename.clone(),
            format: self.format.clone(),
        };
        pipeline.add_stage(Stage::with_inputs(
            options,
            [(
                "image",
                Input::pipeline_file(&self.image_pipeline, &self.image_file),
            )],
        )?);
        Ok(pipeline)
    }
}

/// Compress one file of another pipeline with xz.
#[derive(Debug, Clone)]
pub struct CompressPipeline {
    name: String,
    build: String,
    source_pipeline: String,
    source_file: String,
    filename: String,
}

impl CompressPipeline {
    pub fn xz(
        name: impl Into<String>,
        build: impl Into<String>,
        source_pipeline: impl Into<String>,
        source_file: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            source_pipeline: source_pipeline.into(),
            source_file: source_file.into(),
            filename: filename.into(),
        }
    }
}

impl PipelineNode for CompressPipeline {
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
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stage(Stage::with_inputs(
            XzOptions {
                filename: self.filename.clone(),
            },
            [(
                "file",
                Input::pipeline_file(&self.source_pipeline, &self.source_file),
            )],
        )?);
        Ok(pipeline)
    }
}

/// A tar archive of another pipeline's tree.
#[derive(Debug, Clone)]
pub struct ArchivePipeline {
    name: String,
    build: String,
    tree: String,
    options: TarOptions,
}

impl ArchivePipeline {
    pub fn tar(
        name: impl Into<String>,
        build: impl Into<String>,
        tree: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            tree: tree.into(),
            options: TarOptions::new(filename),
        }
    }

    /// Archive only these paths of the tree, in this order.
    pub fn with_paths(mut self, paths: &[&str]) -> Self {
        self.options.paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_format(mut self, format: TarFormat) -> Self {
        self.options.format = Some(format);
        self
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.options.compression = Some(compression.into());
        self
    }

    /// Keep the SELinux labels and extended attributes of a root tree.
    pub fn preserving_metadata(mut self) -> Self {
        self.options.root_node = Some(TarRootNode::Omit);
        self.options.selinux = Some(true);
        self.options.xattrs = Some(true);
        self
    }
}

impl PipelineNode for ArchivePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn export_filename(&self) -> Option<&str> {
        Some(&self.options.filename)
    }

    fn serialize(
        &self,
        _resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stage(Stage::with_inputs(
            self.options.clone(),
            [("tree", Input::tree(&self.tree))],
        )?);
        Ok(pipeline)
    }
}

/// The OVF descriptor tree: the vmdk copied in next to its `.ovf` and
/// `.mf` files. An archive pipeline packs it into the `.ova`.
#[derive(Debug, Clone)]
pub struct OvaPipeline {
    name: String,
    build: String,
    vmdk_pipeline: String,
    vmdk_file: String,
}

impl OvaPipeline {
    pub fn new(
        name: impl Into<String>,
        build: impl Into<String>,
        vmdk_pipeline: impl Into<String>,
        vmdk_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            build: build.into(),
            vmdk_pipeline: vmdk_pipeline.into(),
            vmdk_file: vmdk_file.into(),
        }
    }

    /// Files the descriptor tree ends up holding, in archive order.
    pub fn contents(&self) -> Vec<String> {
        let stem = self.vmdk_file.trim_end_matches(".vmdk");
        vec![
            format!("{stem}.ovf"),
            format!("{stem}.mf"),
            self.vmdk_file.clone(),
        ]
    }
}

impl PipelineNode for OvaPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self) -> BuildRef {
        BuildRef::Pipeline(self.build.clone())
    }

    fn serialize(
        &self,
        _resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let mut pipeline = empty_pipeline(self);
        let copy = CopyOptions {
            paths: vec![CopyPath::new(
                format!("input://vmdk/{}", self.vmdk_file),
                "tree:///",
            )],
        };
        pipeline.add_stage(Stage::with_inputs(
            copy,
            [(
                "vmdk",
                Input::pipeline_file(&self.vmdk_pipeline, &self.vmdk_file),
            )],
        )?);
        pipeline.add_stage(Stage::new(OvfOptions {
            vmdk: self.vmdk_file.clone(),
        })?);
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn serialize(node: &dyn PipelineNode) -> Pipeline {
        node.serialize(&Resolved::default(), &mut Sources::default())
            .unwrap()
    }

    #[test]
    fn qemu_reads_the_image_file() {
        let node = QemuPipeline::new(
            "qcow2",
            "build",
            "image",
            "disk.raw",
            "disk.qcow2",
            QemuFormat::Qcow2 {
                compat: Some("1.1".into()),
            },
        );
        let pipeline = serialize(&node);
        let stage = &pipeline.stages[0];
        assert_eq!(stage.inputs["image"].pipeline_refs(), ["image"]);
        assert_eq!(
            serde_json::to_value(&stage.options).unwrap(),
            json!({"filename": "disk.qcow2", "format": {"type": "qcow2", "compat": "1.1"}})
        );
    }

    #[test]
    fn xz_requires_suffix() {
        let node = CompressPipeline::xz("xz", "build", "image", "disk.raw", "disk.raw");
        assert!(node
            .serialize(&Resolved::default(), &mut Sources::default())
            .is_err());
        let node = CompressPipeline::xz("xz", "build", "image", "disk.raw", "disk.raw.xz");
        assert_eq!(node.export_filename(), Some("disk.raw.xz"));
        assert_eq!(serialize(&node).stages.len(), 1);
    }

    #[test]
    fn gce_style_archive() {
        let node = ArchivePipeline::tar("archive", "build", "image", "image.tar.gz")
            .with_paths(&["disk.raw"])
            .with_format(TarFormat::Oldgnu)
            .with_compression("auto");
        let options = serde_json::to_value(&serialize(&node).stages[0].options).unwrap();
        assert_eq!(
            options,
            json!({
                "filename": "image.tar.gz",
                "format": "oldgnu",
                "paths": ["disk.raw"],
                "compression": "auto"
            })
        );
    }

    #[test]
    fn ova_descriptor_tree() {
        let node = OvaPipeline::new("ovf", "build", "vmdk", "disk.vmdk");
        assert_eq!(node.contents(), ["disk.ovf", "disk.mf", "disk.vmdk"]);
        let types: Vec<_> = serialize(&node)
            .stages
            .iter()
            .map(|s| s.type_name())
            .collect();
        assert_eq!(types, ["org.osbuild.copy", "org.osbuild.ovf"]);
    }
}
