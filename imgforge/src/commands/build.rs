//! Build a manifest with the engine, following its progress.

use anyhow::{Context, Result, bail};
use clap::Args;
use imgforge_common::Size;
use std::path::PathBuf;

use crate::osbuild::Manifest;
use crate::osbuild::engine::{self, BuildOptions};
use crate::output::Output;

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Manifest file
    pub manifest: PathBuf,

    /// Engine object store
    #[arg(long)]
    pub store: PathBuf,

    /// Directory exported pipelines are written to
    #[arg(long)]
    pub output_directory: PathBuf,

    /// Pipeline to export (repeatable)
    #[arg(long = "export", value_name = "PIPELINE")]
    pub exports: Vec<String>,

    /// Pipeline to keep in the store (repeatable)
    #[arg(long = "checkpoint", value_name = "PIPELINE")]
    pub checkpoints: Vec<String>,

    /// Upper bound for the store cache (e.g. "20 GiB")
    #[arg(long)]
    pub cache_max_size: Option<String>,
}

pub fn run(args: BuildArgs) -> Result<()> {
    let bytes = std::fs::read(&args.manifest)
        .with_context(|| format!("Failed to read {}", args.manifest.display()))?;
    let manifest = Manifest::from_json(&bytes)
        .with_context(|| format!("Invalid manifest {}", args.manifest.display()))?;
    let names = manifest.pipeline_names();
    for export in args.exports.iter().chain(&args.checkpoints) {
        if !names.contains(&export.as_str()) {
            bail!("manifest has no pipeline {export:?} (have: {})", names.join(", "));
        }
    }

    let cache_max_size = args
        .cache_max_size
        .as_deref()
        .map(|s| s.parse::<Size>().map(Size::bytes))
        .transpose()
        .context("Invalid --cache-max-size")?;
    let options = BuildOptions {
        store: args.store,
        output_directory: args.output_directory,
        exports: args.exports,
        checkpoints: args.checkpoints,
        cache_max_size,
    };

    let program = engine::engine_program();
    Output::info(format!("Building {} with {program}", args.manifest.display()));
    let mut progress = Output::build_progress();
    let result = engine::run_build(&program, &bytes, &options, |status| {
        progress.update(status);
    });
    let result = match result {
        Ok(result) => result,
        Err(err) => {
            progress.finish_error("build failed");
            return Err(err.into());
        }
    };

    match result {
        Some(result) if !result.success => {
            progress.finish_error("build failed");
            for error in &result.errors {
                Output::error(&error.message);
            }
            bail!("build failed: {}", result.title);
        }
        _ => {
            progress.finish_success("build finished");
            Output::success(format!(
                "Artifacts are in {}",
                options.output_directory.display()
            ));
        }
    }
    Ok(())
}
