//! The engine manifest: pipelines of stages plus the sources they read.
//!
//! Serialization is deterministic. Every stage gets an id that hashes the
//! compact canonical JSON of its content together with the id of the stage
//! before it and the id of the build pipeline, so equal pipelines get equal
//! ids regardless of how the output is formatted.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::devices::Device;
use super::error::ManifestError;
use super::inputs::{Input, InputKind, Origin, pipeline_ref};
use super::mounts::Mount;
use super::sources::{SourceKind, Sources};
use super::stage::Stage;
use super::stages::{StageOptions, is_empty_options};

pub const MANIFEST_VERSION: &str = "2";

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    /// Host environment id; only the root of the build chain sets it.
    pub runner: Option<String>,
    /// Name of the pipeline whose tree is the build root.
    pub build: Option<String>,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runner: None,
            build: None,
            stages: Vec::new(),
        }
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn add_stages(&mut self, stages: impl IntoIterator<Item = Stage>) {
        self.stages.extend(stages);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub pipelines: Vec<Pipeline>,
    pub sources: Sources,
}

fn hash_value(value: &Value) -> Result<String, ManifestError> {
    let mut hasher = Sha256::new();
    serde_json::to_writer(HashWriter(&mut hasher), value)?;
    Ok(hex::encode(hasher.finalize()))
}

struct HashWriter<'a>(&'a mut Sha256);

impl std::io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn options_value(options: &StageOptions) -> Result<Value, ManifestError> {
    Ok(serde_json::to_value(options)?)
}

/// Which source kinds may satisfy a reference from an input of `kind`.
fn source_kinds_for(kind: InputKind) -> &'static [SourceKind] {
    match kind {
        InputKind::Files => &[SourceKind::Curl, SourceKind::Librepo, SourceKind::Inline],
        InputKind::Containers => &[SourceKind::Skopeo, SourceKind::ContainersStorage],
        InputKind::Ostree => &[SourceKind::Ostree],
        InputKind::Tree => &[],
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pipeline(&mut self, pipeline: Pipeline) {
        self.pipelines.push(pipeline);
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name.as_str()).collect()
    }

    /// Check that names are unique and every reference points to an
    /// earlier pipeline.
    pub fn check_graph(&self) -> Result<(), ManifestError> {
        let mut seen = BTreeSet::new();
        for pipeline in &self.pipelines {
            let known = |name: &str| -> Result<(), ManifestError> {
                if seen.contains(name) {
                    Ok(())
                } else {
                    Err(ManifestError::UnknownPipeline {
                        pipeline: pipeline.name.clone(),
                        reference: name.to_string(),
                    })
                }
            };
            if let Some(build) = &pipeline.build {
                known(build)?;
            }
            for stage in &pipeline.stages {
                for input in stage.inputs.values() {
                    for reference in input.pipeline_refs() {
                        known(reference)?;
                    }
                }
            }
            if !seen.insert(pipeline.name.as_str()) {
                return Err(ManifestError::DuplicatePipeline(pipeline.name.clone()));
            }
        }
        Ok(())
    }

    /// Every `(input kind, source key)` pair referenced by a stage input.
    pub fn sources_referenced(&self) -> BTreeSet<(InputKind, String)> {
        self.pipelines
            .iter()
            .flat_map(|p| &p.stages)
            .flat_map(|s| s.inputs.values())
            .filter(|i| i.origin == Origin::Source)
            .flat_map(|i| i.source_refs().into_iter().map(|k| (i.kind, k.to_string())))
            .collect()
    }

    /// Check every source reference resolves in the sources section under
    /// a kind compatible with the referencing input.
    pub fn check_sources(&self) -> Result<(), ManifestError> {
        for pipeline in &self.pipelines {
            for stage in &pipeline.stages {
                for input in stage.inputs.values() {
                    for key in input.source_refs() {
                        let kinds = source_kinds_for(input.kind);
                        if !kinds.iter().any(|k| self.sources.contains(*k, key)) {
                            return Err(ManifestError::MissingSource {
                                stage: stage.type_name().to_string(),
                                kind: input.kind.as_str(),
                                key: key.to_string(),
                            });
                        }
                    }
                }
            }
        }
        self.sources.verify_inline()
    }

    /// Id of the last stage of every pipeline, keyed by pipeline name.
    pub fn pipeline_ids(&self) -> Result<BTreeMap<String, String>, ManifestError> {
        Ok(self.stage_ids()?.0)
    }

    fn stage_ids(&self) -> Result<(BTreeMap<String, String>, Vec<Vec<String>>), ManifestError> {
        self.check_graph()?;
        let mut pipeline_ids: BTreeMap<String, String> = BTreeMap::new();
        let mut all = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            let build_id = pipeline
                .build
                .as_ref()
                .and_then(|b| pipeline_ids.get(b))
                .cloned();
            let mut base: Option<String> = None;
            let mut ids = Vec::with_capacity(pipeline.stages.len());
            for stage in &pipeline.stages {
                let inputs: Map<String, Value> = stage
                    .inputs
                    .iter()
                    .map(|(name, input)| (name.clone(), input.canonical(&pipeline_ids)))
                    .collect();
                let canonical = json!({
                    "type": stage.type_name(),
                    "options": options_value(&stage.options)?,
                    "inputs": inputs,
                    "devices": stage.devices,
                    "mounts": stage.mounts,
                    "base": base,
                    "build": build_id,
                });
                let id = hash_value(&canonical)?;
                ids.push(id.clone());
                base = Some(id);
            }
            if let Some(id) = base {
                pipeline_ids.insert(pipeline.name.clone(), id);
            }
            all.push(ids);
        }
        debug_assert_eq!(all.len(), self.pipelines.len());
        Ok((pipeline_ids, all))
    }

    /// The manifest as a JSON value with object keys sorted.
    pub fn to_value(&self) -> Result<Value, ManifestError> {
        let (_, ids) = self.stage_ids()?;
        self.check_sources()?;
        let pipelines = self
            .pipelines
            .iter()
            .zip(ids)
            .map(|(pipeline, ids)| pipeline_value(pipeline, &ids))
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Map::new();
        out.insert("version".into(), json!(MANIFEST_VERSION));
        out.insert("pipelines".into(), Value::Array(pipelines));
        out.insert("sources".into(), serde_json::to_value(&self.sources)?);
        Ok(Value::Object(out))
    }

    /// Pretty printed manifest bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, ManifestError> {
        let value = self.to_value()?;
        let mut bytes = serde_json::to_vec_pretty(&value)?;
        bytes.push(b'\n');
        debug!(
            pipelines = self.pipelines.len(),
            bytes = bytes.len(),
            "serialized manifest"
        );
        Ok(bytes)
    }

    /// Parse a manifest, validating every stage against the catalog.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;
        if raw.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion(raw.version));
        }
        let mut manifest = Manifest {
            pipelines: Vec::with_capacity(raw.pipelines.len()),
            sources: raw.sources,
        };
        for raw_pipeline in raw.pipelines {
            let build = match raw_pipeline.build {
                Some(build) => Some(
                    build
                        .strip_prefix(super::inputs::PIPELINE_PREFIX)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            ManifestError::Malformed(format!(
                                "pipeline {}: build reference {build:?} lacks the name: prefix",
                                raw_pipeline.name
                            ))
                        })?,
                ),
                None => None,
            };
            let mut pipeline = Pipeline {
                name: raw_pipeline.name,
                runner: raw_pipeline.runner,
                build,
                stages: Vec::with_capacity(raw_pipeline.stages.len()),
            };
            for raw_stage in raw_pipeline.stages {
                let options = match raw_stage.options {
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                };
                let options = StageOptions::from_json(&raw_stage.kind, options)?;
                let stage = Stage::with_inputs(options, raw_stage.inputs)?
                    .with_devices(raw_stage.devices)
                    .with_mounts(raw_stage.mounts);
                pipeline.add_stage(stage);
            }
            manifest.add_pipeline(pipeline);
        }
        manifest.check_graph()?;
        Ok(manifest)
    }
}

fn pipeline_value(pipeline: &Pipeline, ids: &[String]) -> Result<Value, ManifestError> {
    let mut out = Map::new();
    out.insert("name".into(), json!(pipeline.name));
    if let Some(runner) = &pipeline.runner {
        out.insert("runner".into(), json!(runner));
    }
    if let Some(build) = &pipeline.build {
        out.insert("build".into(), json!(pipeline_ref(build)));
    }
    let stages = pipeline
        .stages
        .iter()
        .zip(ids)
        .map(|(stage, id)| stage_value(stage, id))
        .collect::<Result<Vec<_>, _>>()?;
    out.insert("stages".into(), Value::Array(stages));
    Ok(Value::Object(out))
}

fn stage_value(stage: &Stage, id: &str) -> Result<Value, ManifestError> {
    let mut out = Map::new();
    out.insert("type".into(), json!(stage.type_name()));
    out.insert("id".into(), json!(id));
    if !stage.inputs.is_empty() {
        out.insert("inputs".into(), serde_json::to_value(&stage.inputs)?);
    }
    let options = options_value(&stage.options)?;
    if !is_empty_options(&options) {
        out.insert("options".into(), options);
    }
    if !stage.devices.is_empty() {
        out.insert("devices".into(), serde_json::to_value(&stage.devices)?);
    }
    if !stage.mounts.is_empty() {
        out.insert("mounts".into(), serde_json::to_value(&stage.mounts)?);
    }
    Ok(Value::Object(out))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    version: String,
    #[serde(default)]
    pipelines: Vec<RawPipeline>,
    #[serde(default)]
    sources: Sources,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    runner: Option<String>,
    #[serde(default)]
    build: Option<String>,
    #[serde(default)]
    stages: Vec<RawStage>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "id")]
    _id: Option<String>,
    #[serde(default)]
    options: Value,
    #[serde(default)]
    inputs: BTreeMap<String, Input>,
    #[serde(default)]
    devices: BTreeMap<String, Device>,
    #[serde(default)]
    mounts: Vec<Mount>,
}
