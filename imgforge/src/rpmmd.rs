//! RPM repository and package data shared by the depsolver, the pipelines
//! and the sources section.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A package repository as listed in the repository registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepoConfig {
    /// Unique id; derived from the name when the registry omits it.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub baseurl: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metalink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrorlist: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpgkeys: Vec<String>,
    #[serde(default)]
    pub check_gpg: bool,
    #[serde(default)]
    pub check_repo_gpg: bool,
    #[serde(default)]
    pub ignore_ssl: bool,
    /// Content is protected by subscription certificates.
    #[serde(default)]
    pub rhsm: bool,
    /// Restrict this repository to the named image types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_type_tags: Vec<String>,
    /// Restrict this repository to the named package sets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_sets: Vec<String>,
}

impl RepoConfig {
    /// Whether the repository applies to `image_type`.
    pub fn matches_image_type(&self, image_type: &str) -> bool {
        self.image_type_tags.is_empty() || self.image_type_tags.iter().any(|t| t == image_type)
    }

    /// Whether the repository applies to the package set `name`.
    pub fn matches_package_set(&self, name: &str) -> bool {
        self.package_sets.is_empty() || self.package_sets.iter().any(|s| s == name)
    }

    /// The first location a mirror descriptor can be built from.
    pub fn mirror(&self) -> Option<(&str, &'static str)> {
        if let Some(url) = &self.metalink {
            return Some((url, "metalink"));
        }
        if let Some(url) = &self.mirrorlist {
            return Some((url, "mirrorlist"));
        }
        self.baseurl.first().map(|url| (url.as_str(), "baseurl"))
    }

    /// Secret the build engine needs to fetch from this repository.
    pub fn secrets(&self) -> Option<&'static str> {
        self.rhsm.then_some(RHSM_SECRET)
    }
}

pub const RHSM_SECRET: &str = "org.osbuild.rhsm";

/// One unit of a package-set chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Packages needed to build the image but kept out of installer payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_from_installer: Vec<String>,
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_modules: Vec<String>,
    #[serde(default)]
    pub install_weak_deps: bool,
}

impl PackageSet {
    pub fn new<I, S>(include: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Merge `other` into this set, keeping the repositories of `self`.
    pub fn append(mut self, other: PackageSet) -> Self {
        self.include.extend(other.include);
        self.exclude.extend(other.exclude);
        self.exclude_from_installer
            .extend(other.exclude_from_installer);
        self.enabled_modules.extend(other.enabled_modules);
        self
    }

    pub fn with_repositories(mut self, repos: Vec<RepoConfig>) -> Self {
        self.repositories = repos;
        self
    }
}

/// Ordered list of package sets whose resolutions accumulate.
pub type PackageSetChain = Vec<PackageSet>;

/// A fully resolved package, addressed by its checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default)]
    pub epoch: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_location: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<String>,
    #[serde(default)]
    pub check_gpg: bool,
    #[serde(default)]
    pub ignore_ssl: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_id: String,
}

impl PackageSpec {
    pub fn evra(&self) -> String {
        if self.epoch == 0 {
            format!("{}-{}.{}", self.version, self.release, self.arch)
        } else {
            format!("{}:{}-{}.{}", self.epoch, self.version, self.release, self.arch)
        }
    }

    pub fn nevra(&self) -> String {
        format!("{}-{}", self.name, self.evra())
    }
}

/// Look up a package by name in a resolved set.
pub fn find_package<'a>(packages: &'a [PackageSpec], name: &str) -> Option<&'a PackageSpec> {
    packages.iter().find(|p| p.name == name)
}

/// Result of depsolving one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepsolveResult {
    pub packages: Vec<PackageSpec>,
    pub repos: Vec<RepoConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(epoch: u32) -> PackageSpec {
        PackageSpec {
            name: "kernel".into(),
            epoch,
            version: "6.8.5".into(),
            release: "301.fc42".into(),
            arch: "x86_64".into(),
            checksum: "sha256:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn nevra_includes_epoch_only_when_set() {
        assert_eq!(spec(0).nevra(), "kernel-6.8.5-301.fc42.x86_64");
        assert_eq!(spec(2).nevra(), "kernel-2:6.8.5-301.fc42.x86_64");
    }

    #[test]
    fn mirror_prefers_metalink() {
        let mut repo = RepoConfig {
            baseurl: vec!["https://example.com/base".into()],
            ..Default::default()
        };
        assert_eq!(repo.mirror(), Some(("https://example.com/base", "baseurl")));
        repo.metalink = Some("https://example.com/metalink".into());
        assert_eq!(repo.mirror().map(|m| m.1), Some("metalink"));
        assert_eq!(RepoConfig::default().mirror(), None);
    }

    #[test]
    fn tag_filters() {
        let repo = RepoConfig {
            image_type_tags: vec!["qcow2".into()],
            ..Default::default()
        };
        assert!(repo.matches_image_type("qcow2"));
        assert!(!repo.matches_image_type("raw"));
        assert!(repo.matches_package_set("os"));
    }

    #[test]
    fn append_merges_lists() {
        let a = PackageSet::new(["bash"]);
        let mut b = PackageSet::new(["vim"]);
        b.exclude.push("nano".into());
        let merged = a.append(b);
        assert_eq!(merged.include, vec!["bash", "vim"]);
        assert_eq!(merged.exclude, vec!["nano"]);
    }
}
