//! Stage inputs: references to pipelines or to entries of the sources
//! section.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::container;
use crate::ostree::CommitSpec;
use crate::rpmmd::PackageSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InputKind {
    #[serde(rename = "org.osbuild.tree")]
    Tree,
    #[serde(rename = "org.osbuild.files")]
    Files,
    #[serde(rename = "org.osbuild.containers")]
    Containers,
    #[serde(rename = "org.osbuild.ostree")]
    Ostree,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Tree => "org.osbuild.tree",
            InputKind::Files => "org.osbuild.files",
            InputKind::Containers => "org.osbuild.containers",
            InputKind::Ostree => "org.osbuild.ostree",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "org.osbuild.pipeline")]
    Pipeline,
    #[serde(rename = "org.osbuild.source")]
    Source,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum References {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl References {
    pub fn keys(&self) -> Vec<&str> {
        match self {
            References::List(list) => list.iter().map(String::as_str).collect(),
            References::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

pub const PIPELINE_PREFIX: &str = "name:";

pub fn pipeline_ref(name: &str) -> String {
    format!("{PIPELINE_PREFIX}{name}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub origin: Origin,
    pub references: References,
}

impl Input {
    /// The tree produced by `pipeline`.
    pub fn tree(pipeline: &str) -> Self {
        Self {
            kind: InputKind::Tree,
            origin: Origin::Pipeline,
            references: References::List(vec![pipeline_ref(pipeline)]),
        }
    }

    /// One file out of the tree of `pipeline`.
    pub fn pipeline_file(pipeline: &str, file: &str) -> Self {
        let mut refs = BTreeMap::new();
        refs.insert(pipeline_ref(pipeline), json!({ "file": file }));
        Self {
            kind: InputKind::Files,
            origin: Origin::Pipeline,
            references: References::Map(refs),
        }
    }

    /// RPM files, with per-package signature checking metadata.
    pub fn packages(packages: &[PackageSpec]) -> Self {
        let refs = packages
            .iter()
            .map(|p| {
                let value = if p.check_gpg {
                    json!({ "metadata": { "rpm.check_gpg": true } })
                } else {
                    Value::Object(Map::new())
                };
                (p.checksum.clone(), value)
            })
            .collect();
        Self {
            kind: InputKind::Files,
            origin: Origin::Source,
            references: References::Map(refs),
        }
    }

    /// Files from the inline or curl sources, by digest.
    pub fn source_files<'a>(digests: impl IntoIterator<Item = &'a str>) -> Self {
        let refs = digests
            .into_iter()
            .map(|d| (d.to_string(), Value::Object(Map::new())))
            .collect();
        Self {
            kind: InputKind::Files,
            origin: Origin::Source,
            references: References::Map(refs),
        }
    }

    pub fn containers(specs: &[container::Spec]) -> Self {
        let refs = specs
            .iter()
            .map(|s| (s.image_id.clone(), json!({ "name": s.local_name })))
            .collect();
        Self {
            kind: InputKind::Containers,
            origin: Origin::Source,
            references: References::Map(refs),
        }
    }

    pub fn ostree(commits: &[CommitSpec]) -> Self {
        let refs = commits
            .iter()
            .map(|c| (c.checksum.clone(), json!({ "ref": c.reference })))
            .collect();
        Self {
            kind: InputKind::Ostree,
            origin: Origin::Source,
            references: References::Map(refs),
        }
    }

    /// Names of the pipelines this input reads from.
    pub fn pipeline_refs(&self) -> Vec<&str> {
        if self.origin != Origin::Pipeline {
            return Vec::new();
        }
        self.references
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(PIPELINE_PREFIX))
            .collect()
    }

    /// Source keys this input reads.
    pub fn source_refs(&self) -> Vec<&str> {
        if self.origin != Origin::Source {
            return Vec::new();
        }
        self.references.keys()
    }

    /// JSON of this input with `name:` references replaced by the ids
    /// of the referenced pipelines.
    pub(crate) fn canonical(&self, pipeline_ids: &BTreeMap<String, String>) -> Value {
        let swap = |key: &str| -> String {
            key.strip_prefix(PIPELINE_PREFIX)
                .and_then(|name| pipeline_ids.get(name))
                .cloned()
                .unwrap_or_else(|| key.to_string())
        };
        let references = match &self.references {
            References::List(list) if self.origin == Origin::Pipeline => {
                Value::Array(list.iter().map(|k| Value::String(swap(k))).collect())
            }
            References::Map(map) if self.origin == Origin::Pipeline => Value::Object(
                map.iter().map(|(k, v)| (swap(k), v.clone())).collect(),
            ),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        };
        json!({
            "type": self.kind.as_str(),
            "origin": self.origin,
            "references": references,
        })
    }
}
