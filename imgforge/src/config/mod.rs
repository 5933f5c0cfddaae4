//! On-disk configuration: repository registries and build configs.

mod buildconfig;
mod repos;

pub use buildconfig::{BuildConfig, BuildConfigs, BuildDependency, ConfigFilters, ConfigItem};
pub use repos::{RepoRegistry, repo_id};

use std::path::PathBuf;
use thiserror::Error;

use crate::blueprint::BlueprintError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("no repositories loaded from {0}")]
    NoRepositories(PathBuf),

    #[error("config {config} depends on unknown config {depends}")]
    UnknownDependency { config: String, depends: String },

    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
}

pub(crate) fn read(path: &std::path::Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
