//! Summarize a manifest: pipelines, their stages and the sources.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use crate::osbuild::{MANIFEST_VERSION, Manifest, SourceKind};
use crate::output::Output;

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Manifest file
    pub manifest: PathBuf,

    /// List every stage of every pipeline
    #[arg(short, long)]
    pub stages: bool,
}

fn load(path: &Path) -> Result<Manifest> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Manifest::from_json(&bytes).with_context(|| format!("Invalid manifest {}", path.display()))
}

pub fn run(args: InspectArgs) -> Result<()> {
    let manifest = load(&args.manifest)?;
    manifest.check_sources()?;
    let ids = manifest.pipeline_ids()?;

    Output::header(format!("Manifest {}", args.manifest.display()));
    Output::kv("Version", MANIFEST_VERSION);
    Output::kv("Pipelines", manifest.pipeline_names().join(", "));

    for pipeline in &manifest.pipelines {
        println!();
        Output::subheader(&pipeline.name);
        if let Some(runner) = &pipeline.runner {
            Output::kv("Runner", runner);
        }
        if let Some(build) = &pipeline.build {
            Output::kv("Build", build);
        }
        Output::kv("Stages", pipeline.stages.len().to_string());
        if let Some(id) = ids.get(&pipeline.name) {
            Output::kv("Id", id);
        }
        if args.stages {
            for stage in &pipeline.stages {
                Output::list_item(stage.type_name());
            }
        }
    }

    println!();
    Output::subheader("Sources");
    for kind in SourceKind::ALL {
        let count = manifest.sources.keys(kind).len();
        if count > 0 {
            Output::kv(kind.as_str().trim_start_matches("org.osbuild."), count.to_string());
        }
    }
    Ok(())
}
