//! Filesystem stages for a table planned by `gen-partition-table`.

use anyhow::{Context, Result, anyhow};
use clap::{Args, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::gen_partition_table::{Response, read_input};
use crate::osbuild::fsgen::{self, PartitionTool};
use crate::osbuild::stages::FstabOptions;
use crate::osbuild::{Device, Manifest, Mount, Pipeline};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum Tool {
    #[default]
    Sfdisk,
    Sgdisk,
}

impl From<Tool> for PartitionTool {
    fn from(tool: Tool) -> Self {
        match tool {
            Tool::Sfdisk => PartitionTool::Sfdisk,
            Tool::Sgdisk => PartitionTool::Sgdisk,
        }
    }
}

#[derive(Debug, Args)]
pub struct GenPartitionStagesArgs {
    /// Output of gen-partition-table (`-` for stdin)
    #[arg(short, long, default_value = "-")]
    pub input: PathBuf,

    /// Tool that writes the partition table
    #[arg(long, value_enum, default_value_t = Tool::Sfdisk)]
    pub tool: Tool,
}

#[derive(Debug, Serialize)]
pub struct PartitionStages {
    pub prepare: Vec<Value>,
    pub finish: Vec<Value>,
    pub devices: BTreeMap<String, Device>,
    pub mounts: Vec<Mount>,
    pub fstab: FstabOptions,
}

/// Stage JSON as it appears in a manifest, ids included.
fn stage_values(stages: Vec<crate::osbuild::Stage>) -> Result<Vec<Value>> {
    let mut pipeline = Pipeline::new("image");
    pipeline.add_stages(stages);
    let mut manifest = Manifest::new();
    manifest.add_pipeline(pipeline);
    let mut value = manifest.to_value()?;
    let stages = value
        .pointer_mut("/pipelines/0/stages")
        .map(Value::take)
        .ok_or_else(|| anyhow!("serialized manifest has no stages"))?;
    match stages {
        Value::Array(stages) => Ok(stages),
        _ => Ok(Vec::new()),
    }
}

pub fn generate(response: &Response, tool: PartitionTool) -> Result<PartitionStages> {
    let pt = &response.constants.internal.partition_table;
    let filename = response.constants.filename.as_str();

    let prepare = fsgen::prepare_stages(pt, filename, tool)?;
    let finish = fsgen::finish_stages(pt, filename)?;
    let (devices, mounts) = fsgen::devices_and_mounts(pt, filename)?;
    Ok(PartitionStages {
        prepare: stage_values(prepare)?,
        finish: stage_values(finish)?,
        devices,
        mounts,
        fstab: fsgen::fstab_options(pt)?,
    })
}

pub fn run(args: GenPartitionStagesArgs) -> Result<()> {
    let text = read_input(&args.input)?;
    let response: Response = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse planned table {}", args.input.display()))?;
    let stages = generate(&response, args.tool.into())?;
    println!("{}", serde_json::to_string_pretty(&stages)?);
    Ok(())
}
