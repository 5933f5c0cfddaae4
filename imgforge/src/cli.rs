//! CLI argument definitions for imgforge.
//!
//! The clap-derived `Cli` and `Commands` types live here so that shell
//! completion generation can reference them.

use clap::{Parser, Subcommand};

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "imgforge")]
#[command(about = "Plan OS image build manifests")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate the manifest of one image type
    Manifest(commands::manifest::ManifestArgs),

    /// List the image types of the catalog
    ///
    /// Terms are globs matched against distro, arch, image type and boot
    /// mode; prefix a term with `distro:`, `arch:`, `type:` or `bootmode:`
    /// to match a single field.
    #[command(alias = "ls")]
    ListImages(commands::list_images::ListImagesArgs),

    /// Plan a partition table from a JSON request
    GenPartitionTable(commands::gen_partition_table::GenPartitionTableArgs),

    /// Filesystem stages for a planned partition table
    GenPartitionStages(commands::gen_partition_stages::GenPartitionStagesArgs),

    /// Summarize a manifest
    Inspect(commands::inspect::InspectArgs),

    /// Build a manifest with the build engine
    ///
    /// The engine binary is taken from $IMGFORGE_ENGINE, else `osbuild`
    /// on the PATH.
    Build(commands::build::BuildArgs),

    /// Print JSON schemas of the input files
    Schema(commands::schema::SchemaArgs),

    /// Generate shell completions
    Completions(commands::completions::CompletionsArgs),
}
