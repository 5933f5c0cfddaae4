//! Errors raised while building and serializing engine manifests.

use thiserror::Error;

use crate::disk::DiskError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {stage}: {field}: {reason}")]
    InvalidOption {
        stage: &'static str,
        field: String,
        reason: String,
    },
    #[error("stage {stage}: missing required input {input:?} of type {kind}")]
    MissingInput {
        stage: &'static str,
        input: &'static str,
        kind: &'static str,
    },
    #[error("stage {stage}: input {input:?} has type {actual}, expected {expected}")]
    InputKindMismatch {
        stage: &'static str,
        input: String,
        actual: &'static str,
        expected: &'static str,
    },
    #[error("unknown stage type: {0}")]
    UnknownType(String),
    #[error("stage {stage}: cannot decode options: {source}")]
    Decode {
        stage: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shorthand for [`StageError::InvalidOption`].
pub(crate) fn invalid(
    stage: &'static str,
    field: impl Into<String>,
    reason: impl Into<String>,
) -> StageError {
    StageError::InvalidOption {
        stage,
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("pipeline {pipeline}: no resolved {kind} content was provided")]
    MissingResolution { pipeline: String, kind: &'static str },
    #[error("pipeline {pipeline}: references pipeline {reference} which is not defined before it")]
    UnknownPipeline { pipeline: String, reference: String },
    #[error("pipeline {0} is defined more than once")]
    DuplicatePipeline(String),
    #[error("stage {stage} references {kind} source {key} which is missing from the sources section")]
    MissingSource {
        stage: String,
        kind: &'static str,
        key: String,
    },
    #[error("package {package}: {reason}")]
    InvalidPackage { package: String, reason: String },
    #[error("unsupported manifest version {0:?}")]
    UnsupportedVersion(String),
    #[error("malformed manifest: {0}")]
    Malformed(String),
    #[error("inline source {key}: {reason}")]
    InlineMismatch { key: String, reason: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
