//! Repository registry: a directory of `<distro>.json` files, each mapping
//! an architecture to its repositories.

use imgforge_common::Arch;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::{ConfigError, read};
use crate::imagetype::Distro;
use crate::rpmmd::RepoConfig;

type ArchRepos = BTreeMap<String, Vec<RepoConfig>>;

const BUILTIN: &[(&str, &str)] = &[
    (
        "fedora-42",
        include_str!("../../data/repositories/fedora-42.json"),
    ),
    (
        "rhel-9.6",
        include_str!("../../data/repositories/rhel-9.6.json"),
    ),
];

#[derive(Debug, Clone, Default)]
pub struct RepoRegistry {
    distros: BTreeMap<String, ArchRepos>,
}

/// Repository id derived from its name: lowercase, anything outside
/// `[a-z0-9_.-]` becomes `-`.
pub fn repo_id(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn parse(path: &Path, text: &str) -> Result<ArchRepos, ConfigError> {
    let mut repos: ArchRepos = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for (arch, list) in &mut repos {
        arch.parse::<Arch>().map_err(|e| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        for (i, repo) in list.iter_mut().enumerate() {
            if repo.baseurl.is_empty() && repo.metalink.is_none() && repo.mirrorlist.is_none() {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("{arch}[{i}]: repository needs a baseurl, metalink or mirrorlist"),
                });
            }
            if repo.id.is_empty() {
                let source = if repo.name.is_empty() {
                    format!("{arch}-{i}")
                } else {
                    repo.name.clone()
                };
                repo.id = repo_id(&source);
            }
        }
    }
    Ok(repos)
}

impl RepoRegistry {
    /// The registry shipped with the tool.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for (distro, text) in BUILTIN {
            // Embedded data is checked by the tests below.
            if let Ok(repos) = parse(Path::new(distro), text) {
                registry.distros.insert((*distro).to_string(), repos);
            }
        }
        registry
    }

    /// Load every `*.json` file of `dir`. The file stem is the distribution
    /// name.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut registry = Self::default();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let repos = parse(&path, &read(&path)?)?;
            debug!(path = %path.display(), arches = repos.len(), "loaded repositories");
            registry.distros.insert(stem.to_string(), repos);
        }
        if registry.distros.is_empty() {
            return Err(ConfigError::NoRepositories(dir.to_path_buf()));
        }
        info!(dir = %dir.display(), distros = registry.distros.len(), "repository registry loaded");
        Ok(registry)
    }

    pub fn distros(&self) -> Vec<&str> {
        self.distros.keys().map(String::as_str).collect()
    }

    /// Repositories of `distro` on `arch`, looked up by name then alias.
    pub fn repos_for(&self, distro: &Distro, arch: Arch) -> Vec<RepoConfig> {
        std::iter::once(distro.name)
            .chain(distro.aliases.iter().copied())
            .find_map(|name| self.distros.get(name))
            .and_then(|arches| arches.get(arch.as_str()))
            .cloned()
            .unwrap_or_default()
    }

    /// Repositories `image_type` may use, honouring image type tags.
    pub fn repos_for_image_type(&self, distro: &Distro, arch: Arch, image_type: &str) -> Vec<RepoConfig> {
        self.repos_for(distro, arch)
            .into_iter()
            .filter(|r| r.matches_image_type(image_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagetype::DISTROS;
    use assert_fs::prelude::*;

    #[test]
    fn builtin_registry_covers_every_distro_and_arch() {
        for (name, text) in BUILTIN {
            parse(Path::new(name), text).unwrap();
        }
        let registry = RepoRegistry::builtin();
        for distro in DISTROS {
            for &arch in distro.arches {
                let repos = registry.repos_for(distro, arch);
                assert!(!repos.is_empty(), "{} {arch}", distro.name);
                assert!(repos.iter().all(|r| !r.id.is_empty()));
            }
        }
    }

    #[test]
    fn ids_derive_from_names() {
        assert_eq!(repo_id("AppStream (RHEL 9)"), "appstream--rhel-9-");
        assert_eq!(repo_id("baseos"), "baseos");
    }

    #[test]
    fn load_dir_reads_json_files() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("fedora-42.json")
            .write_str(
                r#"{"x86_64": [{"name": "Local Mirror", "baseurl": ["http://mirror.local/f42"],
                    "image_type_tags": ["qcow2"]}]}"#,
            )
            .unwrap();
        dir.child("README").write_str("ignored").unwrap();

        let registry = RepoRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.distros(), ["fedora-42"]);
        let fedora = crate::imagetype::DISTROS
            .iter()
            .find(|d| d.name == "fedora-42")
            .unwrap();
        let repos = registry.repos_for(fedora, Arch::X86_64);
        assert_eq!(repos[0].id, "local-mirror");
        assert_eq!(registry.repos_for_image_type(fedora, Arch::X86_64, "qcow2").len(), 1);
        assert!(registry.repos_for_image_type(fedora, Arch::X86_64, "raw").is_empty());
        assert!(registry.repos_for(fedora, Arch::Aarch64).is_empty());
    }

    #[test]
    fn alias_files_are_found() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("rhel-9.json")
            .write_str(r#"{"aarch64": [{"name": "baseos", "baseurl": ["http://x/baseos"]}]}"#)
            .unwrap();
        let registry = RepoRegistry::load_dir(dir.path()).unwrap();
        let rhel = crate::imagetype::DISTROS
            .iter()
            .find(|d| d.name == "rhel-9.6")
            .unwrap();
        assert_eq!(registry.repos_for(rhel, Arch::Aarch64).len(), 1);
    }

    #[test]
    fn bad_registries_are_rejected() {
        let dir = assert_fs::TempDir::new().unwrap();
        assert!(matches!(
            RepoRegistry::load_dir(dir.path()),
            Err(ConfigError::NoRepositories(_))
        ));

        dir.child("fedora-42.json")
            .write_str(r#"{"sparc": [{"name": "x", "baseurl": ["http://x"]}]}"#)
            .unwrap();
        let err = RepoRegistry::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("sparc"), "{err}");

        dir.child("fedora-42.json")
            .write_str(r#"{"x86_64": [{"name": "nowhere"}]}"#)
            .unwrap();
        let err = RepoRegistry::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("needs a baseurl"), "{err}");
    }
}
