//! imgforge - plan OS image build manifests
//!
//! Turns a blueprint and an image type into a manifest for the build
//! engine: the image type assembles a graph of pipelines, resolvers pin
//! every package, container and ostree commit it asks for, and the
//! serializer writes the result with content-addressed stage ids.
//!
//! # Layers
//!
//! - [`imagetype`]: the catalog of distributions and image recipes
//! - [`pipeline`]: pipeline graphs before sources are resolved
//! - [`disk`]: partition table planning
//! - [`osbuild`]: stages, sources and the manifest format
//! - [`resolver`]: the worker pool and resolver traits
//! - [`manifestgen`]: all of the above behind one call

pub mod blueprint;
pub mod cli;
pub mod commands;
pub mod config;
pub mod container;
pub mod crypt;
pub mod disk;
pub mod error;
pub mod imagetype;
pub mod manifestgen;
pub mod osbuild;
pub mod ostree;
pub mod output;
pub mod pipeline;
pub mod resolver;
pub mod rpmmd;

pub use cli::{Cli, Commands};
pub use error::{Error, Result};
