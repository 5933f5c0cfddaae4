//! Resolvers that derive every digest from their input.
//!
//! The same input always gives the same output, so manifests generated
//! against these are reproducible and can be compared byte for byte.

use imgforge_common::Arch;
use imgforge_common::checksum::{is_sha256_hex, sha256_concat};
use std::collections::BTreeSet;

use super::{CancelToken, CommitResolver, ContainerResolver, Depsolver, ResolveError};
use crate::container;
use crate::ostree::{self, CommitSpec, RHSM_CONSUMER_SECRET};
use crate::rpmmd::{DepsolveResult, PackageSetChain, PackageSpec, RepoConfig};

const MOCK_REPO_ID: &str = "mock";
const MOCK_BASEURL: &str = "https://mirror.example.com/mock";

#[derive(Debug, Clone, Copy, Default)]
pub struct MockDepsolver;

fn mock_repo() -> RepoConfig {
    RepoConfig {
        id: MOCK_REPO_ID.to_string(),
        name: MOCK_REPO_ID.to_string(),
        baseurl: vec![MOCK_BASEURL.to_string()],
        ..Default::default()
    }
}

impl Depsolver for MockDepsolver {
    fn depsolve(
        &self,
        chain: &PackageSetChain,
        arch: Arch,
        _token: &CancelToken,
    ) -> Result<DepsolveResult, ResolveError> {
        let chain_name = chain
            .iter()
            .flat_map(|set| set.include.iter())
            .next()
            .cloned()
            .unwrap_or_default();
        let mut seen = BTreeSet::new();
        let mut packages = Vec::new();
        let mut repos: Vec<RepoConfig> = Vec::new();

        for (trans, set) in chain.iter().enumerate() {
            let repo = set.repositories.first().cloned().unwrap_or_else(mock_repo);
            let baseurl = repo
                .baseurl
                .first()
                .map(String::as_str)
                .unwrap_or(MOCK_BASEURL)
                .trim_end_matches('/')
                .to_string();

            let mut names: Vec<&str> = set
                .include
                .iter()
                .map(|name| name.trim_start_matches('@'))
                .filter(|name| !set.exclude.iter().any(|ex| ex == name))
                .collect();
            names.sort_unstable();
            names.dedup();
            let pkgset = names.join(",");

            for name in names.iter().copied() {
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return Err(ResolveError::Depsolve {
                        chain: chain_name,
                        reason: format!("no package matches {name:?}"),
                    });
                }
                if !seen.insert(name.to_string()) {
                    continue;
                }
                let hex = sha256_concat([
                    "pkgset:",
                    pkgset.as_str(),
                    "_trans:",
                    trans.to_string().as_str(),
                    "_include:",
                    name,
                ]);
                let path = format!("Packages/{name}.rpm");
                packages.push(PackageSpec {
                    name: name.to_string(),
                    epoch: 0,
                    version: "0".into(),
                    release: "0".into(),
                    arch: arch.as_str().to_string(),
                    remote_location: format!("{baseurl}/{path}"),
                    checksum: format!("sha256:{hex}"),
                    secrets: repo.secrets().map(str::to_string),
                    check_gpg: repo.check_gpg,
                    ignore_ssl: repo.ignore_ssl,
                    path,
                    repo_id: repo.id.clone(),
                });
            }

            let used = if set.repositories.is_empty() {
                vec![repo]
            } else {
                set.repositories.clone()
            };
            for repo in used {
                if !repos.iter().any(|r| r.id == repo.id) {
                    repos.push(repo);
                }
            }
        }
        Ok(DepsolveResult { packages, repos })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockContainerResolver;

/// Lowercase registry path components without empty segments.
fn reference_problem(reference: &str) -> Option<&'static str> {
    if reference.is_empty() {
        Some("empty reference")
    } else if reference.contains(char::is_whitespace) {
        Some("reference contains whitespace")
    } else if reference.contains("//") {
        Some("empty path component")
    } else if reference
        .split([':', '@'])
        .next()
        .is_some_and(|repo| repo.chars().any(|c| c.is_ascii_uppercase()))
    {
        Some("repository name must be lowercase")
    } else {
        None
    }
}

impl ContainerResolver for MockContainerResolver {
    fn resolve(
        &self,
        spec: &container::SourceSpec,
        arch: Arch,
        _token: &CancelToken,
    ) -> Result<container::Spec, ResolveError> {
        if let Some(reason) = reference_problem(&spec.source) {
            return Err(ResolveError::Container {
                reference: spec.source.clone(),
                reason: reason.to_string(),
            });
        }
        let name = spec.local_name();
        let hash = |suffix: &str| {
            format!(
                "sha256:{}",
                sha256_concat([name, spec.source.as_str(), suffix])
            )
        };
        Ok(container::Spec {
            source: spec.source.clone(),
            digest: spec.digest.clone().unwrap_or_else(|| hash("digest")),
            image_id: hash("imageid"),
            list_digest: Some(hash("list-digest")),
            local_name: name.to_string(),
            tls_verify: spec.tls_verify,
            local: spec.local,
            arch: Some(
                spec.arch
                    .clone()
                    .unwrap_or_else(|| arch.oci_name().to_string()),
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockCommitResolver;

impl CommitResolver for MockCommitResolver {
    fn resolve(
        &self,
        spec: &ostree::SourceSpec,
        _token: &CancelToken,
    ) -> Result<CommitSpec, ResolveError> {
        if !ostree::is_valid_ref(&spec.reference) {
            return Err(ResolveError::Commit {
                url: spec.url.clone(),
                reference: spec.reference.clone(),
                reason: "invalid ref".into(),
            });
        }
        if spec.url.is_empty() {
            return Err(ResolveError::Commit {
                url: spec.url.clone(),
                reference: spec.reference.clone(),
                reason: "no remote url".into(),
            });
        }
        let checksum = match spec.parent.as_deref() {
            Some(parent) if is_sha256_hex(parent) => parent.to_string(),
            _ => sha256_concat([spec.url.as_str(), spec.reference.as_str()]),
        };
        Ok(CommitSpec {
            reference: spec.reference.clone(),
            url: spec.url.clone(),
            checksum,
            secrets: spec.rhsm.then(|| RHSM_CONSUMER_SECRET.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpmmd::PackageSet;
    use imgforge_common::checksum::sha256_hex;

    #[test]
    fn container_digests_follow_the_documented_recipe() {
        let spec = container::SourceSpec::new("quay.io/fedora/fedora:42");
        let resolved = MockContainerResolver
            .resolve(&spec, Arch::Aarch64, &CancelToken::new())
            .unwrap();
        let expected = sha256_hex(b"quay.io/fedora/fedora:42quay.io/fedora/fedora:42digest");
        assert_eq!(resolved.digest, format!("sha256:{expected}"));
        assert_eq!(resolved.arch.as_deref(), Some("arm64"));
        assert!(resolved.is_well_formed());
    }

    #[test]
    fn pinned_container_digest_is_kept() {
        let mut spec = container::SourceSpec::new("quay.io/app");
        spec.digest = Some(format!("sha256:{}", "b".repeat(64)));
        spec.name = Some("localhost/app".into());
        let resolved = MockContainerResolver
            .resolve(&spec, Arch::X86_64, &CancelToken::new())
            .unwrap();
        assert_eq!(resolved.digest, spec.digest.unwrap());
        assert_eq!(resolved.local_name, "localhost/app");
    }

    #[test]
    fn malformed_references_are_rejected() {
        for bad in ["", "quay.io//x", "Quay.io/x", "quay.io/x y"] {
            let spec = container::SourceSpec::new(bad);
            assert!(
                MockContainerResolver
                    .resolve(&spec, Arch::X86_64, &CancelToken::new())
                    .is_err(),
                "{bad:?}"
            );
        }
        // uppercase tags are fine
        let spec = container::SourceSpec::new("quay.io/x:Latest");
        assert!(
            MockContainerResolver
                .resolve(&spec, Arch::X86_64, &CancelToken::new())
                .is_ok()
        );
    }

    #[test]
    fn commit_checksum_and_secrets() {
        let mut spec = ostree::SourceSpec::new("https://ostree.example.com/repo", "fedora/iot");
        let commit = MockCommitResolver.resolve(&spec, &CancelToken::new()).unwrap();
        assert_eq!(
            commit.checksum,
            sha256_hex(b"https://ostree.example.com/repofedora/iot")
        );
        assert_eq!(commit.secrets, None);

        spec.rhsm = true;
        spec.parent = Some("c".repeat(64));
        let commit = MockCommitResolver.resolve(&spec, &CancelToken::new()).unwrap();
        assert_eq!(commit.checksum, "c".repeat(64));
        assert_eq!(commit.secrets.as_deref(), Some(RHSM_CONSUMER_SECRET));
    }

    #[test]
    fn depsolve_is_cumulative_and_honours_excludes() {
        let repo = RepoConfig {
            id: "baseos".into(),
            baseurl: vec!["https://repo.example.com/baseos/".into()],
            check_gpg: true,
            ..Default::default()
        };
        let mut first = PackageSet::new(["@core", "kernel", "dracut-config-rescue"])
            .with_repositories(vec![repo.clone()]);
        first.exclude = vec!["dracut-config-rescue".into()];
        let second = PackageSet::new(["kernel", "vim"]).with_repositories(vec![repo]);
        let chain = vec![first, second];

        let result = MockDepsolver
            .depsolve(&chain, Arch::X86_64, &CancelToken::new())
            .unwrap();
        let names: Vec<_> = result.packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["core", "kernel", "vim"]);
        assert_eq!(result.repos.len(), 1);

        let kernel = &result.packages[1];
        assert_eq!(
            kernel.remote_location,
            "https://repo.example.com/baseos/Packages/kernel.rpm"
        );
        assert!(kernel.check_gpg);
        let expected = sha256_hex(b"pkgset:core,kernel_trans:0_include:kernel");
        assert_eq!(kernel.checksum, format!("sha256:{expected}"));

        let again = MockDepsolver
            .depsolve(&chain, Arch::X86_64, &CancelToken::new())
            .unwrap();
        assert_eq!(result, again);
    }

    #[test]
    fn sets_without_repositories_use_the_mock_repo() {
        let chain = vec![PackageSet::new(["bash"])];
        let result = MockDepsolver
            .depsolve(&chain, Arch::Aarch64, &CancelToken::new())
            .unwrap();
        assert_eq!(result.repos[0].id, MOCK_REPO_ID);
        assert_eq!(result.packages[0].repo_id, MOCK_REPO_ID);
        assert_eq!(result.packages[0].arch, "aarch64");
    }
}
