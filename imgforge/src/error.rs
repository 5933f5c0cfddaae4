//! Error type for callers that drive the whole library.

use imgforge_common::{CommonError, SizeError};
use thiserror::Error;

use crate::blueprint::BlueprintError;
use crate::config::ConfigError;
use crate::disk::DiskError;
use crate::imagetype::{FilterError, ImageTypeError};
use crate::osbuild::engine::EngineError;
use crate::osbuild::{ManifestError, StageError};
use crate::resolver::ResolveError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Size(#[from] SizeError),

    #[error(transparent)]
    Blueprint(#[from] BlueprintError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    ImageType(#[from] ImageTypeError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
