//! Payload entities that live inside partitions.
//!
//! The tree is strictly owned: a partition holds at most one [`Payload`],
//! containers (LUKS, LVM, Btrfs) hold their children by value. Traversal
//! goes through [`Entity`] views so that every variant is matched
//! exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::DiskError;
use super::table::{Partition, PartitionTable};

/// Filesystem types the planner knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext4,
    Xfs,
    Vfat,
    Btrfs,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Vfat => "vfat",
            FsType::Btrfs => "btrfs",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            "vfat" | "fat" => Ok(FsType::Vfat),
            "btrfs" => Ok(FsType::Btrfs),
            other => Err(DiskError::UnknownFsType(other.to_string())),
        }
    }
}

fn default_mount_options() -> String {
    "defaults".to_string()
}

fn is_default_mount_options(options: &str) -> bool {
    options == "defaults"
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    #[serde(rename = "fs_type")]
    pub fs_type: FsType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub mountpoint: String,
    #[serde(
        default = "default_mount_options",
        skip_serializing_if = "is_default_mount_options"
    )]
    pub mount_options: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub freq: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub passno: u64,
}

impl Filesystem {
    pub fn new(fs_type: FsType, mountpoint: impl Into<String>) -> Self {
        Self {
            fs_type,
            uuid: None,
            label: None,
            mountpoint: mountpoint.into(),
            mount_options: default_mount_options(),
            freq: 0,
            passno: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_fstab(mut self, options: impl Into<String>, freq: u64, passno: u64) -> Self {
        self.mount_options = options.into();
        self.freq = freq;
        self.passno = passno;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Swap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2id {
    pub iterations: u64,
    /// Memory cost in KiB.
    pub memory: u64,
    pub parallelism: u64,
}

impl Default for Argon2id {
    fn default() -> Self {
        Self {
            iterations: 4,
            memory: 32,
            parallelism: 1,
        }
    }
}

/// Network-bound unlocking for a LUKS container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClevisBind {
    pub pin: String,
    pub policy: String,
    #[serde(default)]
    pub remove_passphrase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuksContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub passphrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u64>,
    #[serde(default)]
    pub pbkdf: Argon2id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clevis: Option<ClevisBind>,
    pub payload: Box<Payload>,
}

impl LuksContainer {
    pub fn wrapping(payload: Payload, passphrase: impl Into<String>) -> Self {
        Self {
            uuid: None,
            label: None,
            passphrase: passphrase.into(),
            cipher: None,
            subsystem: None,
            sector_size: None,
            pbkdf: Argon2id::default(),
            clevis: None,
            payload: Box::new(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub size: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub logical_volumes: Vec<LogicalVolume>,
}

impl VolumeGroup {
    /// Sum of all LV sizes plus the volume group metadata area.
    pub fn required_size(&self) -> u64 {
        self.logical_volumes
            .iter()
            .fold(super::LVM_METADATA_SIZE, |total, lv| total.saturating_add(lv.size))
    }

    pub fn contains_lv(&self, name: &str) -> bool {
        self.logical_volumes.iter().any(|lv| lv.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subvolume {
    pub name: String,
    pub mountpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<String>,
    /// Space this subvolume contributes to the volume's minimum size.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Btrfs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub subvolumes: Vec<Subvolume>,
}

impl Btrfs {
    pub fn required_size(&self) -> u64 {
        self.subvolumes
            .iter()
            .fold(0, |total: u64, sv| total.saturating_add(sv.size))
    }
}

/// Where the bytes of a raw partition come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "kebab-case")]
pub enum RawSource {
    /// A file inside the tree of the build root pipeline.
    BuildTree { path: String },
    /// A file produced by an earlier pipeline of the same manifest.
    Pipeline { pipeline: String, path: String },
}

impl RawSource {
    pub fn path(&self) -> &str {
        match self {
            RawSource::BuildTree { path } | RawSource::Pipeline { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source: RawSource,
}

/// Everything a partition (or LV, or LUKS container) can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Filesystem(Filesystem),
    Swap(Swap),
    Luks(LuksContainer),
    Lvm(VolumeGroup),
    Btrfs(Btrfs),
    Raw(RawPayload),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Filesystem(_) => "filesystem",
            Payload::Swap(_) => "swap",
            Payload::Luks(_) => "luks",
            Payload::Lvm(_) => "lvm",
            Payload::Btrfs(_) => "btrfs",
            Payload::Raw(_) => "raw",
        }
    }

    /// Minimum bytes this payload needs, excluding anything it does not
    /// contain itself (plain filesystems report zero).
    pub fn required_size(&self) -> u64 {
        match self {
            Payload::Luks(luks) => luks
                .payload
                .required_size()
                .saturating_add(super::LUKS_METADATA_SIZE),
            Payload::Lvm(vg) => vg.required_size(),
            Payload::Btrfs(btrfs) => btrfs.required_size(),
            Payload::Filesystem(_) | Payload::Swap(_) | Payload::Raw(_) => 0,
        }
    }

    /// Whether any mountpoint inside this payload equals `mountpoint`.
    pub fn contains_mountpoint(&self, mountpoint: &str) -> bool {
        let mut found = false;
        walk_payload(self, &mut Vec::new(), &mut |path| {
            if path.last().and_then(Entity::mountpoint) == Some(mountpoint) {
                found = true;
            }
        });
        found
    }

    pub fn mountpoints(&self) -> Vec<String> {
        let mut out = Vec::new();
        walk_payload(self, &mut Vec::new(), &mut |path| {
            if let Some(mp) = path.last().and_then(Entity::mountpoint) {
                out.push(mp.to_string());
            }
        });
        out
    }
}

/// A borrowed view of one node in the partition-table tree.
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    Table(&'a PartitionTable),
    Partition(&'a Partition),
    Filesystem(&'a Filesystem),
    Swap(&'a Swap),
    Luks(&'a LuksContainer),
    VolumeGroup(&'a VolumeGroup),
    LogicalVolume(&'a LogicalVolume),
    Btrfs(&'a Btrfs),
    Subvolume(&'a Subvolume),
    Raw(&'a RawPayload),
}

impl<'a> Entity<'a> {
    pub fn mountpoint(&self) -> Option<&'a str> {
        match self {
            Entity::Filesystem(fs) => Some(fs.mountpoint.as_str()),
            Entity::Subvolume(sv) => Some(sv.mountpoint.as_str()),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<&'a str> {
        match self {
            Entity::Table(pt) => pt.uuid.as_deref(),
            Entity::Partition(p) => p.uuid.as_deref(),
            Entity::Filesystem(fs) => fs.uuid.as_deref(),
            Entity::Swap(swap) => swap.uuid.as_deref(),
            Entity::Luks(luks) => luks.uuid.as_deref(),
            Entity::Btrfs(btrfs) => btrfs.uuid.as_deref(),
            Entity::VolumeGroup(_)
            | Entity::LogicalVolume(_)
            | Entity::Subvolume(_)
            | Entity::Raw(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Entity::Table(pt) => format!("partition table ({})", pt.label),
            Entity::Partition(p) => match &p.payload {
                Some(payload) => format!("partition at {} ({})", p.start, payload.kind()),
                None => format!("partition at {}", p.start),
            },
            Entity::Filesystem(fs) => format!("{} filesystem {}", fs.fs_type, fs.mountpoint),
            Entity::Swap(_) => "swap area".to_string(),
            Entity::Luks(luks) => match &luks.uuid {
                Some(uuid) => format!("luks container {uuid}"),
                None => "luks container".to_string(),
            },
            Entity::VolumeGroup(vg) => format!("volume group {}", vg.name),
            Entity::LogicalVolume(lv) => format!("logical volume {}", lv.name),
            Entity::Btrfs(_) => "btrfs volume".to_string(),
            Entity::Subvolume(sv) => format!("btrfs subvolume {}", sv.name),
            Entity::Raw(raw) => format!("raw payload {}", raw.source.path()),
        }
    }
}

/// Visit `payload` and its children depth first. `path` holds the
/// ancestors; the slice passed to `visit` ends with the current entity.
pub(crate) fn walk_payload<'a>(
    payload: &'a Payload,
    path: &mut Vec<Entity<'a>>,
    visit: &mut dyn FnMut(&[Entity<'a>]),
) {
    match payload {
        Payload::Filesystem(fs) => {
            path.push(Entity::Filesystem(fs));
            visit(path);
            path.pop();
        }
        Payload::Swap(swap) => {
            path.push(Entity::Swap(swap));
            visit(path);
            path.pop();
        }
        Payload::Raw(raw) => {
            path.push(Entity::Raw(raw));
            visit(path);
            path.pop();
        }
        Payload::Luks(luks) => {
            path.push(Entity::Luks(luks));
            visit(path);
            walk_payload(&luks.payload, path, visit);
            path.pop();
        }
        Payload::Lvm(vg) => {
            path.push(Entity::VolumeGroup(vg));
            visit(path);
            for lv in &vg.logical_volumes {
                path.push(Entity::LogicalVolume(lv));
                visit(path);
                walk_payload(&lv.payload, path, visit);
                path.pop();
            }
            path.pop();
        }
        Payload::Btrfs(btrfs) => {
            path.push(Entity::Btrfs(btrfs));
            visit(path);
            for sv in &btrfs.subvolumes {
                path.push(Entity::Subvolume(sv));
                visit(path);
                path.pop();
            }
            path.pop();
        }
    }
}

/// Mutable counterpart of [`walk_payload`] restricted to leaf data the
/// planner fills in (uuids, labels).
pub(crate) fn walk_payload_mut(payload: &mut Payload, visit: &mut dyn FnMut(EntityMut<'_>)) {
    match payload {
        Payload::Filesystem(fs) => visit(EntityMut::Filesystem(fs)),
        Payload::Swap(swap) => visit(EntityMut::Swap(swap)),
        Payload::Raw(_) => {}
        Payload::Luks(luks) => {
            visit(EntityMut::Luks(luks));
            walk_payload_mut(&mut luks.payload, visit);
        }
        Payload::Lvm(vg) => {
            for lv in &mut vg.logical_volumes {
                walk_payload_mut(&mut lv.payload, visit);
            }
        }
        Payload::Btrfs(btrfs) => visit(EntityMut::Btrfs(btrfs)),
    }
}

pub(crate) enum EntityMut<'a> {
    Filesystem(&'a mut Filesystem),
    Swap(&'a mut Swap),
    Luks(&'a mut LuksContainer),
    Btrfs(&'a mut Btrfs),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvm_root() -> Payload {
        Payload::Lvm(VolumeGroup {
            name: "rootvg".into(),
            description: None,
            logical_volumes: vec![
                LogicalVolume {
                    name: "rootlv".into(),
                    size: 2 << 30,
                    payload: Payload::Filesystem(Filesystem::new(FsType::Xfs, "/")),
                },
                LogicalVolume {
                    name: "swaplv".into(),
                    size: 1 << 30,
                    payload: Payload::Swap(Swap::default()),
                },
            ],
        })
    }

    #[test]
    fn walk_visits_every_entity_with_ancestors() {
        let payload = Payload::Luks(LuksContainer::wrapping(lvm_root(), "secret"));
        let mut seen = Vec::new();
        walk_payload(&payload, &mut Vec::new(), &mut |path| {
            seen.push((path.len(), path.last().unwrap().describe()));
        });
        assert_eq!(
            seen,
            vec![
                (1, "luks container".to_string()),
                (2, "volume group rootvg".to_string()),
                (3, "logical volume rootlv".to_string()),
                (4, "xfs filesystem /".to_string()),
                (3, "logical volume swaplv".to_string()),
                (4, "swap area".to_string()),
            ]
        );
    }

    #[test]
    fn required_size_includes_container_overhead() {
        let vg = lvm_root();
        assert_eq!(vg.required_size(), (3 << 30) + super::super::LVM_METADATA_SIZE);
        let luks = Payload::Luks(LuksContainer::wrapping(vg.clone(), "x"));
        assert_eq!(
            luks.required_size(),
            vg.required_size() + super::super::LUKS_METADATA_SIZE
        );
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let fs = Payload::Filesystem(Filesystem::new(FsType::Ext4, "/boot"));
        let json = serde_json::to_value(&fs).unwrap();
        assert_eq!(json["type"], "filesystem");
        assert_eq!(json["fs_type"], "ext4");
        assert!(json.get("mount_options").is_none());
        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, fs);
    }

    #[test]
    fn raw_source_forms_deserialize() {
        let build: RawSource =
            serde_json::from_str(r#"{"from":"build-tree","path":"/usr/lib/fw.bin"}"#).unwrap();
        assert_eq!(build.path(), "/usr/lib/fw.bin");
        let pipeline: RawSource = serde_json::from_str(
            r#"{"from":"pipeline","pipeline":"firmware","path":"/fw.bin"}"#,
        )
        .unwrap();
        assert!(matches!(pipeline, RawSource::Pipeline { .. }));
    }
}
