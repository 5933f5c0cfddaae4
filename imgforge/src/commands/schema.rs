//! JSON schemas for the files users write by hand.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use schemars::schema_for;
use std::fs;
use std::path::PathBuf;

use crate::blueprint::Blueprint;
use crate::rpmmd::RepoConfig;

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[command(subcommand)]
    pub action: Option<SchemaAction>,
}

#[derive(Debug, Subcommand)]
pub enum SchemaAction {
    /// Generate JSON schemas for every input type
    Generate {
        /// Output directory (if not specified, prints to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available schema types
    List,
}

struct SchemaInfo {
    name: &'static str,
    filename: &'static str,
    description: &'static str,
}

const SCHEMAS: &[SchemaInfo] = &[
    SchemaInfo {
        name: "Blueprint",
        filename: "blueprint.schema.json",
        description: "An image blueprint: packages, containers and customizations",
    },
    SchemaInfo {
        name: "RepoConfig",
        filename: "repository.schema.json",
        description: "One repository entry of a <distro>.json repository file",
    },
];

fn generate_all_schemas() -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        (
            "blueprint.schema.json",
            serde_json::to_string_pretty(&schema_for!(Blueprint))?,
        ),
        (
            "repository.schema.json",
            serde_json::to_string_pretty(&schema_for!(RepoConfig))?,
        ),
    ])
}

fn print_blueprint_schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&schema_for!(Blueprint))?);
    Ok(())
}

pub fn run(args: SchemaArgs) -> Result<()> {
    match args.action {
        None => print_blueprint_schema()?,
        Some(SchemaAction::Generate { output }) => {
            let schemas = generate_all_schemas()?;
            match output {
                Some(dir) => {
                    fs::create_dir_all(&dir)
                        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
                    for (filename, json) in schemas {
                        let path = dir.join(filename);
                        fs::write(&path, &json)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("Wrote {}", path.display());
                    }
                }
                None => {
                    let mut combined = serde_json::Map::new();
                    for (filename, json) in schemas {
                        let value: serde_json::Value = serde_json::from_str(&json)?;
                        let name = filename.strip_suffix(".schema.json").unwrap_or(filename);
                        combined.insert(name.to_string(), value);
                    }
                    println!("{}", serde_json::to_string_pretty(&combined)?);
                }
            }
        }
        Some(SchemaAction::List) => {
            println!("Available schema types:\n");
            for info in SCHEMAS {
                println!("  {} ({})", info.name, info.filename);
                println!("    {}\n", info.description);
            }
        }
    }
    Ok(())
}
