//! The `sources` section: everything the engine fetches before building.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use imgforge_common::checksum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::ManifestError;
use crate::container;
use crate::ostree::CommitSpec;
use crate::rpmmd::{PackageSpec, RepoConfig};

/// How RPMs are downloaded; chosen by the caller for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpmDownloader {
    #[default]
    Curl,
    Librepo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    Curl,
    Librepo,
    Skopeo,
    SkopeoIndex,
    ContainersStorage,
    Ostree,
    Inline,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Curl,
        SourceKind::Librepo,
        SourceKind::Skopeo,
        SourceKind::SkopeoIndex,
        SourceKind::ContainersStorage,
        SourceKind::Ostree,
        SourceKind::Inline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Curl => "org.osbuild.curl",
            SourceKind::Librepo => "org.osbuild.librepo",
            SourceKind::Skopeo => "org.osbuild.skopeo",
            SourceKind::SkopeoIndex => "org.osbuild.skopeo-index",
            SourceKind::ContainersStorage => "org.osbuild.containers-storage",
            SourceKind::Ostree => "org.osbuild.ostree",
            SourceKind::Inline => "org.osbuild.inline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurlItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Secrets>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrepoItem {
    pub path: String,
    pub mirror: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrepoMirror {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Secrets>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrepoOptions {
    #[serde(default)]
    pub mirrors: BTreeMap<String, LibrepoMirror>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkopeoImage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(
        rename = "tls-verify",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tls_verify: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkopeoItem {
    pub image: SkopeoImage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstreeRemote {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Secrets>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OstreeItem {
    pub remote: OstreeRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineItem {
    pub encoding: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Items<T> {
    pub items: BTreeMap<String, T>,
}

impl<T> Default for Items<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T> Items<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrepoSource {
    pub items: BTreeMap<String, LibrepoItem>,
    #[serde(default)]
    pub options: LibrepoOptions,
}

impl LibrepoSource {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Resolved sources grouped by kind, keyed by content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sources {
    #[serde(rename = "org.osbuild.curl", default, skip_serializing_if = "Items::is_empty")]
    pub curl: Items<CurlItem>,
    #[serde(
        rename = "org.osbuild.librepo",
        default,
        skip_serializing_if = "LibrepoSource::is_empty"
    )]
    pub librepo: LibrepoSource,
    #[serde(rename = "org.osbuild.skopeo", default, skip_serializing_if = "Items::is_empty")]
    pub skopeo: Items<SkopeoItem>,
    #[serde(
        rename = "org.osbuild.skopeo-index",
        default,
        skip_serializing_if = "Items::is_empty"
    )]
    pub skopeo_index: Items<SkopeoItem>,
    #[serde(
        rename = "org.osbuild.containers-storage",
        default,
        skip_serializing_if = "Items::is_empty"
    )]
    pub containers_storage: Items<Empty>,
    #[serde(rename = "org.osbuild.ostree", default, skip_serializing_if = "Items::is_empty")]
    pub ostree: Items<OstreeItem>,
    #[serde(rename = "org.osbuild.inline", default, skip_serializing_if = "Items::is_empty")]
    pub inline: Items<InlineItem>,
}

fn secrets(name: Option<&str>) -> Option<Secrets> {
    name.map(|name| Secrets {
        name: name.to_string(),
    })
}

impl Sources {
    pub fn is_empty(&self) -> bool {
        SourceKind::ALL.iter().all(|k| self.keys(*k).is_empty())
    }

    pub fn keys(&self, kind: SourceKind) -> Vec<&str> {
        fn ks<T>(map: &BTreeMap<String, T>) -> Vec<&str> {
            map.keys().map(String::as_str).collect()
        }
        match kind {
            SourceKind::Curl => ks(&self.curl.items),
            SourceKind::Librepo => ks(&self.librepo.items),
            SourceKind::Skopeo => ks(&self.skopeo.items),
            SourceKind::SkopeoIndex => ks(&self.skopeo_index.items),
            SourceKind::ContainersStorage => ks(&self.containers_storage.items),
            SourceKind::Ostree => ks(&self.ostree.items),
            SourceKind::Inline => ks(&self.inline.items),
        }
    }

    pub fn contains(&self, kind: SourceKind, key: &str) -> bool {
        match kind {
            SourceKind::Curl => self.curl.items.contains_key(key),
            SourceKind::Librepo => self.librepo.items.contains_key(key),
            SourceKind::Skopeo => self.skopeo.items.contains_key(key),
            SourceKind::SkopeoIndex => self.skopeo_index.items.contains_key(key),
            SourceKind::ContainersStorage => self.containers_storage.items.contains_key(key),
            SourceKind::Ostree => self.ostree.items.contains_key(key),
            SourceKind::Inline => self.inline.items.contains_key(key),
        }
    }

    /// Add RPMs. Duplicate checksums collapse into one entry.
    pub fn add_packages(
        &mut self,
        packages: &[PackageSpec],
        repos: &[RepoConfig],
        downloader: RpmDownloader,
    ) -> Result<(), ManifestError> {
        for pkg in packages {
            checksum::split_digest(&pkg.checksum)
                .or_else(|_| {
                    pkg.checksum
                        .split_once(':')
                        .filter(|(algo, hex)| {
                            matches!(*algo, "sha384" | "sha512") && !hex.is_empty()
                        })
                        .map(|(_, hex)| hex)
                        .ok_or(())
                })
                .map_err(|_| ManifestError::InvalidPackage {
                    package: pkg.name.clone(),
                    reason: format!("invalid checksum {:?}", pkg.checksum),
                })?;
            match downloader {
                RpmDownloader::Curl => self.add_curl_package(pkg)?,
                RpmDownloader::Librepo => self.add_librepo_package(pkg, repos)?,
            }
        }
        Ok(())
    }

    fn add_curl_package(&mut self, pkg: &PackageSpec) -> Result<(), ManifestError> {
        if pkg.remote_location.is_empty() {
            return Err(ManifestError::InvalidPackage {
                package: pkg.name.clone(),
                reason: "no remote location".to_string(),
            });
        }
        self.curl.items.insert(
            pkg.checksum.clone(),
            CurlItem {
                url: pkg.remote_location.clone(),
                secrets: secrets(pkg.secrets.as_deref()),
                insecure: pkg.ignore_ssl,
            },
        );
        Ok(())
    }

    fn add_librepo_package(
        &mut self,
        pkg: &PackageSpec,
        repos: &[RepoConfig],
    ) -> Result<(), ManifestError> {
        let repo = repos
            .iter()
            .find(|r| r.id == pkg.repo_id)
            .ok_or_else(|| ManifestError::InvalidPackage {
                package: pkg.name.clone(),
                reason: format!("unknown repository id {:?}", pkg.repo_id),
            })?;
        let (url, kind) = repo.mirror().ok_or_else(|| ManifestError::InvalidPackage {
            package: pkg.name.clone(),
            reason: format!("repository {} has no baseurl, metalink or mirrorlist", repo.id),
        })?;
        let mirror = self
            .librepo
            .options
            .mirrors
            .entry(repo.id.clone())
            .or_insert_with(|| LibrepoMirror {
                url: url.to_string(),
                kind: kind.to_string(),
                insecure: false,
                secrets: None,
            });
        if pkg.ignore_ssl {
            mirror.insecure = true;
        }
        if let Some(name) = &pkg.secrets {
            mirror.secrets = secrets(Some(name));
        }
        self.librepo.items.insert(
            pkg.checksum.clone(),
            LibrepoItem {
                path: pkg.path.clone(),
                mirror: repo.id.clone(),
            },
        );
        Ok(())
    }

    /// Add containers: registry images by image id, manifest lists by list
    /// digest, local images by image id.
    pub fn add_containers(&mut self, specs: &[container::Spec]) {
        for spec in specs {
            if spec.local {
                self.containers_storage
                    .items
                    .insert(spec.image_id.clone(), Empty {});
                continue;
            }
            self.skopeo.items.insert(
                spec.image_id.clone(),
                SkopeoItem {
                    image: SkopeoImage {
                        name: spec.source.clone(),
                        digest: Some(spec.digest.clone()),
                        tls_verify: spec.tls_verify,
                    },
                },
            );
            if let Some(list) = &spec.list_digest {
                self.skopeo_index.items.insert(
                    list.clone(),
                    SkopeoItem {
                        image: SkopeoImage {
                            name: spec.source.clone(),
                            digest: None,
                            tls_verify: spec.tls_verify,
                        },
                    },
                );
            }
        }
    }

    pub fn add_commits(&mut self, commits: &[CommitSpec]) {
        for commit in commits {
            self.ostree.items.insert(
                commit.checksum.clone(),
                OstreeItem {
                    remote: OstreeRemote {
                        url: commit.url.clone(),
                        secrets: secrets(commit.secrets.as_deref()),
                    },
                },
            );
        }
    }

    /// Embed `data` and return its `sha256:` key.
    pub fn add_inline(&mut self, data: &[u8]) -> String {
        let key = checksum::sha256_digest(data);
        self.inline.items.insert(
            key.clone(),
            InlineItem {
                encoding: "base64".to_string(),
                data: STANDARD.encode(data),
            },
        );
        key
    }

    /// Check every inline entry decodes to content matching its key.
    pub fn verify_inline(&self) -> Result<(), ManifestError> {
        for (key, item) in &self.inline.items {
            let mismatch = |reason: String| ManifestError::InlineMismatch {
                key: key.clone(),
                reason,
            };
            if item.encoding != "base64" {
                return Err(mismatch(format!("unsupported encoding {}", item.encoding)));
            }
            let data = STANDARD
                .decode(&item.data)
                .map_err(|err| mismatch(err.to_string()))?;
            checksum::verify_sha256(&data, key).map_err(|err| mismatch(err.to_string()))?;
        }
        Ok(())
    }

    /// Merge `other` into `self`; equal keys keep the first entry.
    pub fn merge(&mut self, other: Sources) {
        fn absorb<T>(into: &mut BTreeMap<String, T>, from: BTreeMap<String, T>) {
            for (k, v) in from {
                into.entry(k).or_insert(v);
            }
        }
        absorb(&mut self.curl.items, other.curl.items);
        absorb(&mut self.librepo.items, other.librepo.items);
        absorb(&mut self.librepo.options.mirrors, other.librepo.options.mirrors);
        absorb(&mut self.skopeo.items, other.skopeo.items);
        absorb(&mut self.skopeo_index.items, other.skopeo_index.items);
        absorb(&mut self.containers_storage.items, other.containers_storage.items);
        absorb(&mut self.ostree.items, other.ostree.items);
        absorb(&mut self.inline.items, other.inline.items);
    }
}
