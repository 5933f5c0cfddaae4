//! Pinning symbolic sources to content.
//!
//! A pre-manifest names package sets, containers and ostree refs. The
//! resolvers here turn them into digests by fanning jobs out over a
//! [`WorkerPool`]. The actual lookups are behind the [`Depsolver`],
//! [`ContainerResolver`] and [`CommitResolver`] traits; [`mock`] has
//! deterministic implementations that never touch the network.

pub mod mock;
mod pool;

pub use pool::{CancelToken, DEFAULT_WORKERS, Resolution, WorkerPool};

use imgforge_common::Arch;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::container;
use crate::ostree::{self, CommitSpec};
use crate::rpmmd::{DepsolveResult, PackageSetChain};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("depsolve {chain}: {reason}")]
    Depsolve { chain: String, reason: String },

    #[error("container {reference}: {reason}")]
    Container { reference: String, reason: String },

    #[error("ostree commit {url} {reference}: {reason}")]
    Commit {
        url: String,
        reference: String,
        reason: String,
    },

    #[error("{job}: cancelled")]
    Cancelled { job: String },

    #[error("{job}: resolver panicked")]
    Panicked { job: String },

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ResolveError>),
}

fn join_errors(errors: &[ResolveError]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} resolver job(s) failed: {}", errors.len(), parts.join("; "))
}

impl ResolveError {
    /// The individual failures, flattening aggregates.
    pub fn failures(&self) -> Vec<&ResolveError> {
        match self {
            ResolveError::Aggregate(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

/// Dependency solver for one package set chain. Sets in a chain are solved
/// cumulatively: each transaction sees the packages of the earlier ones.
pub trait Depsolver: Send + Sync {
    fn depsolve(
        &self,
        chain: &PackageSetChain,
        arch: Arch,
        token: &CancelToken,
    ) -> Result<DepsolveResult, ResolveError>;
}

pub trait ContainerResolver: Send + Sync {
    fn resolve(
        &self,
        spec: &container::SourceSpec,
        arch: Arch,
        token: &CancelToken,
    ) -> Result<container::Spec, ResolveError>;
}

pub trait CommitResolver: Send + Sync {
    fn resolve(
        &self,
        spec: &ostree::SourceSpec,
        token: &CancelToken,
    ) -> Result<CommitSpec, ResolveError>;
}

/// The collaborators one manifest generation resolves against.
#[derive(Clone)]
pub struct Resolvers {
    pub depsolver: Arc<dyn Depsolver>,
    pub containers: Arc<dyn ContainerResolver>,
    pub commits: Arc<dyn CommitResolver>,
    pub workers: usize,
}

impl Resolvers {
    /// Deterministic in-process resolvers.
    pub fn mock() -> Self {
        Self {
            depsolver: Arc::new(mock::MockDepsolver),
            containers: Arc::new(mock::MockContainerResolver),
            commits: Arc::new(mock::MockCommitResolver),
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for Resolvers {
    fn default() -> Self {
        Self::mock()
    }
}

impl std::fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolvers")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Depsolve every chain, one job per chain.
pub fn depsolve_all(
    solver: Arc<dyn Depsolver>,
    chains: &BTreeMap<String, PackageSetChain>,
    arch: Arch,
    workers: usize,
    token: &CancelToken,
) -> Result<BTreeMap<String, DepsolveResult>, ResolveError> {
    let mut pool = WorkerPool::new(workers.min(chains.len()), token.clone());
    for (name, chain) in chains {
        let solver = solver.clone();
        let name = name.clone();
        let chain = chain.clone();
        pool.submit(format!("depsolve {name}"), move |token| {
            let result = solver.depsolve(&chain, arch, token)?;
            debug!(pipeline = %name, packages = result.packages.len(), "depsolved");
            Ok((name, result))
        });
    }
    let resolved = pool.finish().into_result()?;
    Ok(resolved.into_iter().collect())
}

/// Resolve container specs in parallel. Successes come back sorted by
/// manifest digest; every failure is listed in `errors`.
pub fn resolve_container_specs(
    resolver: Arc<dyn ContainerResolver>,
    specs: &[container::SourceSpec],
    arch: Arch,
    workers: usize,
    token: &CancelToken,
) -> Resolution<container::Spec> {
    let mut pool = WorkerPool::new(workers.min(specs.len()), token.clone());
    for spec in specs {
        let resolver = resolver.clone();
        let spec = spec.clone();
        pool.submit(format!("container {}", spec.source), move |token| {
            resolver.resolve(&spec, arch, token)
        });
    }
    let mut resolution = pool.finish();
    resolution.resolved.sort_by(|a, b| a.digest.cmp(&b.digest));
    resolution
}

/// Resolve the container specs of every pipeline.
pub fn resolve_containers(
    resolver: Arc<dyn ContainerResolver>,
    specs: &BTreeMap<String, Vec<container::SourceSpec>>,
    arch: Arch,
    workers: usize,
    token: &CancelToken,
) -> Result<BTreeMap<String, Vec<container::Spec>>, ResolveError> {
    let mut resolved = BTreeMap::new();
    let mut errors = Vec::new();
    for (pipeline, specs) in specs {
        let resolution = resolve_container_specs(resolver.clone(), specs, arch, workers, token);
        info!(
            pipeline = %pipeline,
            resolved = resolution.resolved.len(),
            failed = resolution.errors.len(),
            "resolved containers"
        );
        errors.extend(resolution.errors);
        resolved.insert(pipeline.clone(), resolution.resolved);
    }
    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(ResolveError::Aggregate(errors))
    }
}

/// Resolve ostree refs in parallel, keeping each pipeline's order.
pub fn resolve_commits(
    resolver: Arc<dyn CommitResolver>,
    specs: &BTreeMap<String, Vec<ostree::SourceSpec>>,
    workers: usize,
    token: &CancelToken,
) -> Result<BTreeMap<String, Vec<CommitSpec>>, ResolveError> {
    let total = specs.values().map(Vec::len).sum::<usize>();
    let mut pool = WorkerPool::new(workers.min(total), token.clone());
    for (pipeline, specs) in specs {
        for spec in specs {
            let resolver = resolver.clone();
            let pipeline = pipeline.clone();
            let spec = spec.clone();
            pool.submit(format!("ostree {}", spec.reference), move |token| {
                Ok((pipeline, resolver.resolve(&spec, token)?))
            });
        }
    }
    let mut resolved: BTreeMap<String, Vec<CommitSpec>> = BTreeMap::new();
    for (pipeline, commit) in pool.finish().into_result()? {
        resolved.entry(pipeline).or_default().push(commit);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::rpmmd::PackageSet;
    use std::thread;
    use std::time::Duration;

    fn specs(references: &[&str]) -> Vec<container::SourceSpec> {
        references
            .iter()
            .map(|r| container::SourceSpec::new(*r))
            .collect()
    }

    #[test]
    fn container_failures_are_collected_with_successes_sorted() {
        let mut refs: Vec<String> = (0..8)
            .map(|i| format!("registry.example.com/app{i}:latest"))
            .collect();
        refs.insert(3, "registry.example.com//broken".into());
        refs.insert(7, "Registry.Example.com/UPPER".into());
        let refs: Vec<&str> = refs.iter().map(String::as_str).collect();

        let resolution = resolve_container_specs(
            Arc::new(MockContainerResolver),
            &specs(&refs),
            Arch::X86_64,
            4,
            &CancelToken::new(),
        );
        assert_eq!(resolution.resolved.len(), 8);
        let digests: Vec<_> = resolution.resolved.iter().map(|s| &s.digest).collect();
        let mut sorted = digests.clone();
        sorted.sort();
        assert_eq!(digests, sorted);

        let text = resolution.into_result().unwrap_err().to_string();
        assert!(text.starts_with("2 resolver job(s) failed"), "{text}");
        assert!(text.contains("registry.example.com//broken"), "{text}");
        assert!(text.contains("Registry.Example.com/UPPER"), "{text}");
    }

    #[test]
    fn completion_order_does_not_change_results() {
        struct Slow;
        impl ContainerResolver for Slow {
            fn resolve(
                &self,
                spec: &container::SourceSpec,
                arch: Arch,
                token: &CancelToken,
            ) -> Result<container::Spec, ResolveError> {
                let delay = spec.source.len() as u64 % 7;
                thread::sleep(Duration::from_millis(delay * 3));
                MockContainerResolver.resolve(spec, arch, token)
            }
        }
        let refs = specs(&["a.io/x", "b.io/yy", "c.io/zzz", "d.io/w", "e.io/vvvvv"]);
        let one = resolve_container_specs(Arc::new(Slow), &refs, Arch::Aarch64, 1, &CancelToken::new());
        let many = resolve_container_specs(Arc::new(Slow), &refs, Arch::Aarch64, 5, &CancelToken::new());
        assert_eq!(one.resolved, many.resolved);
    }

    #[test]
    fn chains_are_solved_per_pipeline() {
        let mut chains = BTreeMap::new();
        chains.insert("build".to_string(), vec![PackageSet::new(["rpm"])]);
        chains.insert(
            "os".to_string(),
            vec![PackageSet::new(["kernel"]), PackageSet::new(["vim"])],
        );
        let solved = depsolve_all(
            Arc::new(MockDepsolver),
            &chains,
            Arch::X86_64,
            DEFAULT_WORKERS,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(solved.keys().collect::<Vec<_>>(), ["build", "os"]);
        let names: Vec<_> = solved["os"].packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["kernel", "vim"]);
    }

    #[test]
    fn commit_errors_are_aggregated() {
        let mut map = BTreeMap::new();
        map.insert(
            "ostree-deployment".to_string(),
            vec![
                ostree::SourceSpec::new("https://ostree.example.com/repo", "fedora/x86_64/iot"),
                ostree::SourceSpec::new("https://ostree.example.com/repo", "bad ref"),
            ],
        );
        let err = resolve_commits(Arc::new(MockCommitResolver), &map, 2, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert!(err.to_string().contains("bad ref"));

        map.get_mut("ostree-deployment").unwrap().pop();
        let ok = resolve_commits(Arc::new(MockCommitResolver), &map, 2, &CancelToken::new())
            .unwrap();
        assert_eq!(ok["ostree-deployment"].len(), 1);
    }

    #[test]
    fn cancelled_token_fails_every_job() {
        let token = CancelToken::new();
        token.cancel();
        let err = resolve_containers(
            Arc::new(MockContainerResolver),
            &BTreeMap::from([("os".to_string(), specs(&["a.io/x", "b.io/y"]))]),
            Arch::X86_64,
            2,
            &token,
        )
        .unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert!(
            failures
                .iter()
                .all(|e| matches!(e, ResolveError::Cancelled { .. }))
        );
    }
}
