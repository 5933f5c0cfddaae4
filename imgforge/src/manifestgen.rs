//! One-call manifest generation: image type, resolvers, serializer.

use imgforge_common::Arch;
use imgforge_common::seed::DEFAULT_SEED;
use tracing::{info, warn};

use crate::blueprint::Blueprint;
use crate::config::RepoRegistry;
use crate::error::Result;
use crate::imagetype::{ImageOptions, ImageType, ImageTypeError};
use crate::osbuild::{Manifest, RpmDownloader};
use crate::pipeline::{PreManifest, RuntimeOptions};
use crate::resolver::{self, CancelToken, ResolveError, Resolvers};
use crate::rpmmd::RepoConfig;

type WarningSink<'a> = Box<dyn Fn(&str) + 'a>;

/// Generates the manifest of one image type.
///
/// ```no_run
/// # use imgforge::{blueprint::Blueprint, imagetype, manifestgen::Generator};
/// let it = imagetype::get("fedora", "x86_64", "qcow2")?;
/// let manifest = Generator::new("fedora", &it, Default::default())
///     .with_seed(42)
///     .generate(&Blueprint::default())?;
/// # Ok::<(), imgforge::error::Error>(())
/// ```
pub struct Generator<'a> {
    distro: String,
    image_type: &'a dyn ImageType,
    options: ImageOptions,
    repos: Option<Vec<RepoConfig>>,
    registry: RepoRegistry,
    seed: i64,
    resolvers: Resolvers,
    runtime: RuntimeOptions,
    token: CancelToken,
    on_warning: Option<WarningSink<'a>>,
}

impl<'a> Generator<'a> {
    /// `distro` is the name the caller asked for and may be an alias.
    pub fn new(distro: &str, image_type: &'a dyn ImageType, options: ImageOptions) -> Self {
        Self {
            distro: distro.to_string(),
            image_type,
            options,
            repos: None,
            registry: RepoRegistry::builtin(),
            seed: DEFAULT_SEED,
            resolvers: Resolvers::mock(),
            runtime: RuntimeOptions::default(),
            token: CancelToken::new(),
            on_warning: None,
        }
    }

    /// Use exactly these repositories instead of the registry's.
    pub fn with_repos(mut self, repos: Vec<RepoConfig>) -> Self {
        self.repos = Some(repos);
        self
    }

    pub fn with_registry(mut self, registry: RepoRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_resolvers(mut self, resolvers: Resolvers) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_rpm_downloader(mut self, downloader: RpmDownloader) -> Self {
        self.runtime.rpm_downloader = downloader;
        self
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    /// Called once per warning, in addition to the log.
    pub fn on_warning(mut self, sink: impl Fn(&str) + 'a) -> Self {
        self.on_warning = Some(Box::new(sink));
        self
    }

    fn repos(&self) -> Vec<RepoConfig> {
        match &self.repos {
            Some(repos) => repos.clone(),
            None => self.registry.repos_for_image_type(
                self.image_type.distro(),
                self.image_type.arch(),
                self.image_type.name(),
            ),
        }
    }

    /// The pipeline graph, before any source is resolved.
    pub fn pre_manifest(&self, blueprint: &Blueprint) -> Result<PreManifest> {
        let distro = self.image_type.distro();
        if !distro.matches_name(&self.distro) {
            return Err(ImageTypeError::DistroMismatch {
                requested: self.distro.clone(),
                distro: distro.name.to_string(),
            }
            .into());
        }
        let (pm, warnings) =
            self.image_type
                .manifest(blueprint, &self.options, &self.repos(), self.seed)?;
        for warning in &warnings {
            warn!(image_type = self.image_type.name(), "{warning}");
            if let Some(sink) = &self.on_warning {
                sink(warning);
            }
        }
        Ok(pm)
    }

    /// Resolve every source of the graph and build the engine manifest.
    pub fn manifest(&self, blueprint: &Blueprint) -> Result<Manifest> {
        let pm = self.pre_manifest(blueprint)?;
        let arch = self.image_type.arch();
        let workers = self.resolvers.workers;

        let packages = resolver::depsolve_all(
            self.resolvers.depsolver.clone(),
            &pm.package_set_chains(),
            arch,
            workers,
            &self.token,
        )?;
        let containers = resolver::resolve_containers(
            self.resolvers.containers.clone(),
            &pm.container_source_specs(),
            arch,
            workers,
            &self.token,
        )?;
        check_container_arches(&containers, arch)?;
        let commits = resolver::resolve_commits(
            self.resolvers.commits.clone(),
            &pm.ostree_source_specs(),
            workers,
            &self.token,
        )?;

        let manifest = pm.to_manifest(&packages, &containers, &commits, self.runtime)?;
        info!(
            distro = self.image_type.distro().name,
            arch = %arch,
            image_type = self.image_type.name(),
            pipelines = manifest.pipelines.len(),
            "generated manifest"
        );
        Ok(manifest)
    }

    /// Manifest JSON bytes.
    pub fn generate(&self, blueprint: &Blueprint) -> Result<Vec<u8>> {
        Ok(self.manifest(blueprint)?.serialize()?)
    }
}

fn check_container_arches(
    containers: &std::collections::BTreeMap<String, Vec<crate::container::Spec>>,
    arch: Arch,
) -> Result<(), ResolveError> {
    let mismatched: Vec<ResolveError> = containers
        .values()
        .flatten()
        .filter(|spec| {
            spec.arch
                .as_deref()
                .is_some_and(|a| a.parse::<Arch>().map_or(true, |a| a != arch))
        })
        .map(|spec| ResolveError::Container {
            reference: spec.source.clone(),
            reason: format!(
                "resolved architecture {} does not match {arch}",
                spec.arch.as_deref().unwrap_or_default()
            ),
        })
        .collect();
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(ResolveError::Aggregate(mismatched))
    }
}
