use std::collections::BTreeMap;

use super::{BuildRef, PipelineNode, Resolved, empty_pipeline};
use crate::osbuild::stages::{RpmOptions, SelinuxOptions};
use crate::osbuild::{Input, ManifestError, Pipeline, Sources, Stage};
use crate::rpmmd::{PackageSet, PackageSetChain};

pub const BUILD_PIPELINE: &str = "build";

/// Binaries that must run with the installer context inside the build root.
const INSTALL_EXEC_LABELS: &[&str] = &["/usr/bin/cp", "/usr/bin/tar"];
const INSTALL_EXEC_CONTEXT: &str = "system_u:object_r:install_exec_t:s0";

/// The build root: a minimal host the remaining pipelines run inside.
#[derive(Debug, Clone)]
pub struct BuildPipeline {
    runner: String,
    packages: PackageSet,
    selinux: bool,
}

impl BuildPipeline {
    pub fn new(runner: impl Into<String>, packages: PackageSet, selinux: bool) -> Self {
        Self {
            runner: runner.into(),
            packages,
            selinux,
        }
    }
}

impl PipelineNode for BuildPipeline {
    fn name(&self) -> &str {
        BUILD_PIPELINE
    }

    fn build(&self) -> BuildRef {
        BuildRef::Runner(self.runner.clone())
    }

    fn package_set_chain(&self) -> Option<PackageSetChain> {
        Some(vec![self.packages.clone()])
    }

    fn serialize(
        &self,
        resolved: &Resolved<'_>,
        _sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError> {
        let mut pipeline = empty_pipeline(self);
        pipeline.add_stage(Stage::with_inputs(
            RpmOptions::default(),
            [("packages", Input::packages(resolved.packages))],
        )?);
        if self.selinux {
            let mut options = SelinuxOptions::targeted();
            options.labels = INSTALL_EXEC_LABELS
                .iter()
                .map(|path| (path.to_string(), INSTALL_EXEC_CONTEXT.to_string()))
                .collect::<BTreeMap<_, _>>();
            pipeline.add_stage(Stage::new(options)?);
        }
        Ok(pipeline)
    }
}
