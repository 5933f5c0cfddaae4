//! The build engine's manifest format: stages, pipelines, sources, and the
//! tooling to run the engine and follow its progress.

pub mod devices;
pub mod engine;
pub mod error;
pub mod fsgen;
pub mod inputs;
pub mod manifest;
pub mod monitor;
pub mod mounts;
pub mod sources;
pub mod stage;
pub mod stages;

pub use devices::Device;
pub use error::{ManifestError, StageError};
pub use inputs::{Input, InputKind};
pub use manifest::{MANIFEST_VERSION, Manifest, Pipeline};
pub use mounts::Mount;
pub use sources::{RpmDownloader, SourceKind, Sources};
pub use stage::{Stage, StageKind};
pub use stages::StageOptions;
