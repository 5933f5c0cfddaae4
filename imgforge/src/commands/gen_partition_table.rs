//! Plan a partition table from a JSON request.

use anyhow::{Context, Result, bail};
use clap::Args;
use imgforge_common::Size;
use imgforge_common::seed::seed_from_env;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::disk::{
    self, Customizations, FilesystemRequest, Filesystem, FsType, Partition, PartitionTable,
    PartitioningMode, Payload, TableType, ptype,
};
use crate::imagetype::{ESP_SIZE, bios_boot_partition, esp_partition};

pub const DEFAULT_FILENAME: &str = "disk.img";

#[derive(Debug, Args)]
pub struct GenPartitionTableArgs {
    /// Request file (`-` for stdin)
    #[arg(short, long, default_value = "-")]
    pub input: PathBuf,

    /// Seed for generated identifiers (defaults to $IMGFORGE_RNG_SEED)
    #[arg(long, allow_hyphen_values = true)]
    pub seed: Option<i64>,

    /// Print the planned table as a tree instead of JSON
    #[arg(long)]
    pub text: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePartitions {
    #[serde(default, alias = "bios")]
    pub bios_boot: bool,
    #[serde(default)]
    pub esp: bool,
    #[serde(default)]
    pub esp_size: Option<Size>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Properties {
    #[serde(rename = "type")]
    pub table_type: TableType,
    #[serde(default)]
    pub default_size: Size,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub start_offset: Size,
    #[serde(default)]
    pub sector_size: u64,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub create: CreatePartitions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestPartition {
    pub mountpoint: String,
    pub size: Size,
    #[serde(rename = "type")]
    pub fs_type: FsType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub fs_mntops: Option<String>,
    #[serde(default)]
    pub fs_freq: u64,
    #[serde(default)]
    pub fs_passno: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Modifications {
    #[serde(default)]
    pub partition_mode: PartitioningMode,
    #[serde(default)]
    pub min_disk_size: Size,
    #[serde(default)]
    pub filesystems: Vec<FilesystemRequest>,
}

/// A partition table request: the fixed layout plus user modifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub properties: Properties,
    #[serde(default)]
    pub partitions: Vec<RequestPartition>,
    #[serde(default)]
    pub modifications: Modifications,
}

/// Identifiers other tools may reference by a stable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedPartition {
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    #[serde(rename = "type")]
    pub table_type: TableType,
    #[serde(default)]
    pub uuid: Option<String>,
    pub size: u64,
    pub sector_size: u64,
}

/// Data meant for the stage generator only; its shape may change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Internal {
    #[serde(rename = "partition-table")]
    pub partition_table: PartitionTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Const {
    pub partition_table: TableSummary,
    pub kernel_opts_list: Vec<String>,
    pub partition_map: BTreeMap<String, MappedPartition>,
    pub internal: Internal,
    pub filename: String,
}

/// The planned table as consumed by `gen-partition-stages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "const")]
    pub constants: Const,
}

pub(crate) fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn template(request: &Request) -> Result<PartitionTable> {
    let props = &request.properties;
    let mut pt = PartitionTable::new(props.table_type);
    pt.uuid = props.uuid.clone();
    pt.start_offset = props.start_offset.bytes();
    if props.sector_size != 0 {
        pt.sector_size = props.sector_size;
    }

    if props.create.bios_boot {
        if props.table_type != TableType::Gpt {
            bail!("a BIOS boot partition needs a gpt table");
        }
        pt.partitions.push(bios_boot_partition());
    }
    if props.create.esp {
        let size = props.create.esp_size.map_or(ESP_SIZE, Size::bytes);
        let mut esp = esp_partition(size);
        if props.table_type == TableType::Dos {
            esp.part_type = Some(ptype::DOS_ESP.to_string());
            esp.uuid = None;
            esp.bootable = true;
        }
        pt.partitions.push(esp);
    }

    let data_type = match props.table_type {
        TableType::Gpt => ptype::FILESYSTEM_DATA_GUID,
        TableType::Dos => ptype::DOS_LINUX,
    };
    for part in &request.partitions {
        let mut fs = Filesystem::new(part.fs_type, &part.mountpoint);
        fs.label = part.label.clone();
        fs.uuid = part.uuid.clone();
        if let Some(options) = &part.fs_mntops {
            fs.mount_options = options.clone();
        }
        fs.freq = part.fs_freq;
        fs.passno = part.fs_passno;
        let mut partition = Partition::new(part.size.bytes(), data_type, Some(Payload::Filesystem(fs)));
        partition.name = part.name.clone();
        pt.partitions.push(partition);
    }
    Ok(pt)
}

fn partition_map(pt: &PartitionTable) -> BTreeMap<String, MappedPartition> {
    let mut map = BTreeMap::new();
    for part in &pt.partitions {
        let Some(Payload::Filesystem(fs)) = &part.payload else {
            continue;
        };
        let key = match fs.mountpoint.as_str() {
            "/" => "root",
            "/boot" => "boot",
            _ => continue,
        };
        if let Some(uuid) = &fs.uuid {
            map.insert(key.to_string(), MappedPartition { uuid: uuid.clone() });
        }
    }
    map
}

/// Plan the table a request describes.
pub fn generate(request: &Request, seed: i64) -> Result<Response> {
    let base = template(request)?;
    let modifications = &request.modifications;
    let customizations = Customizations {
        filesystems: modifications.filesystems.clone(),
        min_disk_size: modifications.min_disk_size,
        ..Default::default()
    };
    let default_size = request.properties.default_size.bytes();
    debug!(
        partitions = base.partitions.len(),
        default_size,
        mode = %modifications.partition_mode,
        "planning partition table"
    );
    let pt = disk::plan(
        &base,
        &customizations,
        default_size,
        modifications.partition_mode,
        seed,
    )
    .context("Cannot generate partition table")?;
    let kernel_opts_list = disk::kernel_cmdline(&pt)?;

    Ok(Response {
        constants: Const {
            partition_table: TableSummary {
                table_type: pt.label,
                uuid: pt.uuid.clone(),
                size: pt.size,
                sector_size: pt.sector_size,
            },
            kernel_opts_list,
            partition_map: partition_map(&pt),
            filename: request
                .properties
                .filename
                .clone()
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
            internal: Internal { partition_table: pt },
        },
    })
}

pub fn run(args: GenPartitionTableArgs) -> Result<()> {
    let text = read_input(&args.input)?;
    let request: Request = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse request {}", args.input.display()))?;
    let seed = match args.seed {
        Some(seed) => seed,
        None => seed_from_env()?,
    };
    let response = generate(&request, seed)?;

    if args.text {
        print!("{}", response.constants.internal.partition_table.describe_tree());
    } else {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgforge_common::datasizes::{GIB, MIB};

    fn request(json: &str) -> Request {
        serde_json::from_str(json).unwrap()
    }

    const BASIC: &str = r#"{
        "properties": {"type": "gpt", "default_size": "10 GiB", "create": {"bios_boot": true, "esp": true}},
        "partitions": [
            {"mountpoint": "/boot", "size": "1 GiB", "type": "ext4", "label": "boot"},
            {"mountpoint": "/", "size": "2 GiB", "type": "xfs", "label": "root"}
        ]
    }"#;

    #[test]
    fn plans_the_requested_layout() {
        let response = generate(&request(BASIC), 0).unwrap();
        let c = &response.constants;
        let pt = &c.internal.partition_table;
        assert_eq!(pt.partitions.len(), 4);
        assert!(pt.has_bios_boot());
        assert!(pt.has_esp());
        assert!(pt.size >= 10 * GIB);
        assert_eq!(c.partition_table.size, pt.size);
        assert_eq!(c.filename, DEFAULT_FILENAME);
        assert!(c.partition_map.contains_key("root"));
        assert!(c.partition_map.contains_key("boot"));
        let root_uuid = &c.partition_map["root"].uuid;
        assert!(c.kernel_opts_list.contains(&format!("root=UUID={root_uuid}")));
        pt.validate().unwrap();
    }

    #[test]
    fn seed_drives_identifiers() {
        let a = generate(&request(BASIC), 1).unwrap();
        let b = generate(&request(BASIC), 1).unwrap();
        let c = generate(&request(BASIC), 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.constants.partition_map, c.constants.partition_map);
    }

    #[test]
    fn modifications_grow_the_disk() {
        let json = r#"{
            "properties": {"type": "gpt", "default_size": "2 GiB", "create": {"esp": true, "esp_size": "100 MiB"}},
            "partitions": [{"mountpoint": "/", "size": "1 GiB", "type": "ext4"}],
            "modifications": {"partition_mode": "raw", "min_disk_size": "20 GiB",
                              "filesystems": [{"mountpoint": "/var", "minsize": "5 GiB"}]}
        }"#;
        let response = generate(&request(json), 0).unwrap();
        let pt = &response.constants.internal.partition_table;
        assert!(pt.size >= 20 * GIB);
        assert_eq!(pt.partitions[0].size, 100 * MIB);
        assert!(pt.contains_mountpoint("/var"));
        assert!(!pt.has_lvm());
    }

    #[test]
    fn dos_tables_reject_bios_boot() {
        let json = r#"{"properties": {"type": "dos", "create": {"bios_boot": true}}}"#;
        let err = generate(&request(json), 0).unwrap_err();
        assert!(err.to_string().contains("gpt"), "{err}");
    }

    #[test]
    fn bios_is_accepted_for_bios_boot() {
        let req = request(r#"{"properties": {"type": "gpt", "create": {"bios": true}}}"#);
        assert!(req.properties.create.bios_boot);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<Request>(r#"{"properties": {"type": "gpt", "bios": true}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn response_round_trips_through_json() {
        let response = generate(&request(BASIC), 0).unwrap();
        let text = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(back, response);
        assert!(text.contains("\"partition-table\""));
    }
}
