//! Pipeline graphs whose sources are still symbolic.
//!
//! An image type assembles a [`PreManifest`]: an ordered list of pipeline
//! nodes, each knowing which package sets, containers and commits it needs.
//! Once a resolver has pinned those to content digests, the pre-manifest is
//! serialized into an engine [`Manifest`].

mod artifact;
mod bootc;
mod build;
mod image;
mod os;
mod ostree_deploy;

pub use artifact::{ArchivePipeline, CompressPipeline, OvaPipeline, QemuPipeline};
pub use bootc::{ContainerDiskPipeline, ContainerTreePipeline};
pub use build::{BUILD_PIPELINE, BuildPipeline};
pub use image::{Bootloader, DiskImagePipeline};
pub use os::{FileData, OsConfig, OsPipeline, OsUser};
pub use ostree_deploy::OstreeDeploymentPipeline;

use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::container;
use crate::osbuild::{Manifest, ManifestError, Pipeline, RpmDownloader, Sources};
use crate::ostree::{self, CommitSpec};
use crate::rpmmd::{DepsolveResult, PackageSetChain, PackageSpec, RepoConfig};

/// Where a pipeline's build root comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRef {
    /// The host environment of the distribution, e.g. `org.osbuild.fedora42`.
    Runner(String),
    /// The tree of another pipeline.
    Pipeline(String),
}

/// Content pinned for one pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolved<'a> {
    pub packages: &'a [PackageSpec],
    pub repos: &'a [RepoConfig],
    pub containers: &'a [container::Spec],
    pub commits: &'a [CommitSpec],
}

/// One vertex of the graph.
pub trait PipelineNode: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn build(&self) -> BuildRef;

    /// Package sets to depsolve for this pipeline, in order.
    fn package_set_chain(&self) -> Option<PackageSetChain> {
        None
    }

    fn container_sources(&self) -> Vec<container::SourceSpec> {
        Vec::new()
    }

    fn ostree_sources(&self) -> Vec<ostree::SourceSpec> {
        Vec::new()
    }

    /// File this pipeline exports, when it produces one.
    fn export_filename(&self) -> Option<&str> {
        None
    }

    /// The pipeline's stages. Inline data is added to `sources`.
    fn serialize(
        &self,
        resolved: &Resolved<'_>,
        sources: &mut Sources,
    ) -> Result<Pipeline, ManifestError>;
}

/// Knobs the caller picks for the whole run rather than per image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub rpm_downloader: RpmDownloader,
}

#[derive(Debug, Default)]
pub struct PreManifest {
    pipelines: Vec<Box<dyn PipelineNode>>,
    exports: Vec<String>,
}

pub(crate) fn empty_pipeline(node: &dyn PipelineNode) -> Pipeline {
    let pipeline = Pipeline::new(node.name());
    match node.build() {
        BuildRef::Runner(runner) => pipeline.with_runner(runner),
        BuildRef::Pipeline(build) => pipeline.with_build(build),
    }
}

impl PreManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: impl PipelineNode + 'static) {
        self.pipelines.push(Box::new(node));
    }

    pub fn add_export(&mut self, name: impl Into<String>) {
        self.exports.push(name.into());
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name()).collect()
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// File produced by the pipeline `name`, if it exports one.
    pub fn export_filename(&self, name: &str) -> Option<&str> {
        self.pipelines
            .iter()
            .find(|p| p.name() == name)
            .and_then(|p| p.export_filename())
    }

    pub fn package_set_chains(&self) -> BTreeMap<String, PackageSetChain> {
        self.pipelines
            .iter()
            .filter_map(|p| p.package_set_chain().map(|c| (p.name().to_string(), c)))
            .collect()
    }

    pub fn container_source_specs(&self) -> BTreeMap<String, Vec<container::SourceSpec>> {
        self.pipelines
            .iter()
            .map(|p| (p.name().to_string(), p.container_sources()))
            .filter(|(_, specs)| !specs.is_empty())
            .collect()
    }

    pub fn ostree_source_specs(&self) -> BTreeMap<String, Vec<ostree::SourceSpec>> {
        self.pipelines
            .iter()
            .map(|p| (p.name().to_string(), p.ostree_sources()))
            .filter(|(_, specs)| !specs.is_empty())
            .collect()
    }

    /// Build the engine manifest from resolved content. Every key of the
    /// spec getters above must be present in the matching map.
    pub fn to_manifest(
        &self,
        packages: &BTreeMap<String, DepsolveResult>,
        containers: &BTreeMap<String, Vec<container::Spec>>,
        commits: &BTreeMap<String, Vec<CommitSpec>>,
        options: RuntimeOptions,
    ) -> Result<Manifest, ManifestError> {
        let mut manifest = Manifest::new();
        let mut sources = Sources::default();
        for node in &self.pipelines {
            let name = node.name();
            let mut resolved = Resolved::default();
            if node.package_set_chain().is_some() {
                let result = packages.get(name).ok_or_else(|| missing(name, "package"))?;
                sources.add_packages(&result.packages, &result.repos, options.rpm_downloader)?;
                resolved.packages = &result.packages;
                resolved.repos = &result.repos;
            }
            if !node.container_sources().is_empty() {
                let specs = containers.get(name).ok_or_else(|| missing(name, "container"))?;
                sources.add_containers(specs);
                resolved.containers = specs;
            }
            if !node.ostree_sources().is_empty() {
                let specs = commits.get(name).ok_or_else(|| missing(name, "ostree commit"))?;
                sources.add_commits(specs);
                resolved.commits = specs;
            }
            let pipeline = node.serialize(&resolved, &mut sources)?;
            debug_assert_eq!(pipeline.name, name);
            manifest.add_pipeline(pipeline);
        }
        manifest.sources = sources;
        manifest.check_graph()?;
        manifest.check_sources()?;
        debug!(
            pipelines = manifest.pipelines.len(),
            exports = ?self.exports,
            "assembled manifest"
        );
        Ok(manifest)
    }

    /// Serialize to manifest JSON bytes.
    pub fn serialize(
        &self,
        packages: &BTreeMap<String, DepsolveResult>,
        containers: &BTreeMap<String, Vec<container::Spec>>,
        commits: &BTreeMap<String, Vec<CommitSpec>>,
        options: RuntimeOptions,
    ) -> Result<Vec<u8>, ManifestError> {
        self.to_manifest(packages, containers, commits, options)?
            .serialize()
    }
}

fn missing(pipeline: &str, kind: &'static str) -> ManifestError {
    debug_assert!(false, "pipeline {pipeline}: missing {kind} resolution");
    ManifestError::MissingResolution {
        pipeline: pipeline.to_string(),
        kind,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::rpmmd::PackageSpec;
    use imgforge_common::checksum::sha256_hex;

    /// Pinned packages named after each include of the chain.
    pub fn fake_depsolve(chain: &PackageSetChain) -> DepsolveResult {
        let mut packages = Vec::new();
        let mut repos = Vec::new();
        for set in chain {
            for name in &set.include {
                packages.push(PackageSpec {
                    name: name.clone(),
                    version: "1.0".into(),
                    release: "1".into(),
                    arch: "x86_64".into(),
                    checksum: format!("sha256:{}", sha256_hex(name.as_bytes())),
                    remote_location: format!("https://example.com/{name}.rpm"),
                    path: format!("Packages/{name}.rpm"),
                    repo_id: "base".into(),
                    ..Default::default()
                });
            }
            repos.extend(set.repositories.iter().cloned());
        }
        DepsolveResult { packages, repos }
    }

    pub fn resolve_all(pm: &PreManifest) -> BTreeMap<String, DepsolveResult> {
        pm.package_set_chains()
            .iter()
            .map(|(k, chain)| (k.clone(), fake_depsolve(chain)))
            .collect()
    }
}
