//! Partition tables and their layout rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::{Entity, FsType, Payload, walk_payload};
use super::{
    DEFAULT_GRAIN, DEFAULT_SECTOR_SIZE, DiskError, GPT_ENTRY_ARRAY_SIZE, GPT_FOOTER_SIZE,
    MAX_DOS_PRIMARY_PARTITIONS, MAX_GPT_PARTITIONS, align_up, checked_align_up, is_dos_disk_id,
    is_uuid, is_vfat_id, ptype, size_overflow,
};
use imgforge_common::datasizes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Gpt,
    Dos,
}

impl TableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::Gpt => "gpt",
            TableType::Dos => "dos",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt" => Ok(TableType::Gpt),
            "dos" | "mbr" => Ok(TableType::Dos),
            other => Err(DiskError::UnknownTableType(other.to_string())),
        }
    }
}

fn default_sector_size() -> u64 {
    DEFAULT_SECTOR_SIZE
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub size: u64,
    /// GPT type GUID or DOS type id.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bootable: bool,
    /// GPT partition UUID; DOS partitions have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// GPT partition name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Partition {
    pub fn new(size: u64, part_type: impl Into<String>, payload: Option<Payload>) -> Self {
        Self {
            start: 0,
            size,
            part_type: Some(part_type.into()),
            bootable: false,
            uuid: None,
            name: None,
            payload,
        }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.part_type.as_deref(), Some("05" | "5" | "0f" | "85"))
    }

    pub fn is_bios_boot(&self) -> bool {
        self.part_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(ptype::BIOS_BOOT_GUID))
    }

    pub fn is_esp(&self) -> bool {
        self.part_type.as_deref().is_some_and(|t| {
            t.eq_ignore_ascii_case(ptype::EFI_SYSTEM_GUID) || t.eq_ignore_ascii_case(ptype::DOS_ESP)
        }) || self.contains_mountpoint("/boot/efi")
    }

    pub fn contains_mountpoint(&self, mountpoint: &str) -> bool {
        self.payload
            .as_ref()
            .is_some_and(|p| p.contains_mountpoint(mountpoint))
    }

    /// Partitions that only serve the bootloader keep their size when
    /// free space is distributed.
    pub fn is_boot_related(&self) -> bool {
        if self.is_bios_boot() || self.is_esp() {
            return true;
        }
        self.payload.as_ref().is_some_and(|p| {
            p.mountpoints()
                .iter()
                .any(|mp| mp == "/boot" || mp.starts_with("/boot/"))
        })
    }

    fn describe(&self, index: usize) -> String {
        format!("partition {} at offset {}", index + 1, self.start)
    }
}

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabEntry {
    pub uuid: String,
    pub vfs_type: String,
    pub path: String,
    pub options: String,
    pub freq: u64,
    pub passno: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    #[serde(rename = "type")]
    pub label: TableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "default_sector_size")]
    pub sector_size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start_offset: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub extra_padding: u64,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(label: TableType) -> Self {
        Self {
            label,
            uuid: None,
            size: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
            start_offset: 0,
            extra_padding: 0,
            partitions: Vec::new(),
        }
    }

    /// Bytes taken by the label before the first usable sector.
    pub fn header_size(&self) -> u64 {
        match self.label {
            TableType::Gpt => self.sector_size * 2 + GPT_ENTRY_ARRAY_SIZE,
            TableType::Dos => self.sector_size,
        }
    }

    pub fn footer_size(&self) -> u64 {
        match self.label {
            TableType::Gpt => GPT_FOOTER_SIZE,
            TableType::Dos => 0,
        }
    }

    pub fn first_usable(&self) -> u64 {
        align_up(self.header_size().saturating_add(self.start_offset), DEFAULT_GRAIN)
    }

    pub fn bytes_to_sectors(&self, bytes: u64) -> u64 {
        bytes / self.sector_size
    }

    pub fn extended_index(&self) -> Option<usize> {
        if self.label != TableType::Dos {
            return None;
        }
        self.partitions.iter().position(Partition::is_extended)
    }

    /// Whether the partition at `index` is a logical partition inside a
    /// DOS extended partition.
    pub fn is_logical(&self, index: usize) -> bool {
        self.extended_index().is_some_and(|ext| index > ext)
    }

    pub fn primary_count(&self) -> usize {
        match self.extended_index() {
            Some(ext) => ext + 1,
            None => self.partitions.len(),
        }
    }

    /// Visit every entity depth first; the slice ends with the visited
    /// entity and starts with the table itself.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&[Entity<'a>])) {
        let mut path = vec![Entity::Table(self)];
        visit(&path);
        for partition in &self.partitions {
            path.push(Entity::Partition(partition));
            visit(&path);
            if let Some(payload) = &partition.payload {
                walk_payload(payload, &mut path, visit);
            }
            path.pop();
        }
    }

    /// Ancestor chain of the entity mounted at `mountpoint`.
    pub fn find_mountpoint(&self, mountpoint: &str) -> Option<Vec<Entity<'_>>> {
        let mut found = None;
        self.walk(&mut |path| {
            if found.is_none() && path.last().and_then(Entity::mountpoint) == Some(mountpoint) {
                found = Some(path.to_vec());
            }
        });
        found
    }

    pub fn contains_mountpoint(&self, mountpoint: &str) -> bool {
        self.partitions
            .iter()
            .any(|p| p.contains_mountpoint(mountpoint))
    }

    pub fn mountpoints(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |path| {
            if let Some(mp) = path.last().and_then(Entity::mountpoint) {
                out.push(mp.to_string());
            }
        });
        out
    }

    pub fn root_partition_index(&self) -> Option<usize> {
        self.partitions.iter().position(|p| p.contains_mountpoint("/"))
    }

    pub fn has_esp(&self) -> bool {
        self.partitions.iter().any(Partition::is_esp)
    }

    pub fn has_bios_boot(&self) -> bool {
        self.partitions.iter().any(Partition::is_bios_boot)
    }

    /// Whether any LVM volume group exists anywhere in the tree.
    pub fn has_lvm(&self) -> bool {
        self.has_entity(|e| matches!(e, Entity::VolumeGroup(_)))
    }

    pub fn has_luks(&self) -> bool {
        self.has_entity(|e| matches!(e, Entity::Luks(_)))
    }

    pub fn has_btrfs(&self) -> bool {
        self.has_entity(|e| matches!(e, Entity::Btrfs(_)))
    }

    fn has_entity(&self, pred: impl Fn(&Entity<'_>) -> bool) -> bool {
        let mut found = false;
        self.walk(&mut |path| {
            if let Some(entity) = path.last() {
                found |= pred(entity);
            }
        });
        found
    }

    /// Lay out partitions from the first usable byte and size the table.
    ///
    /// Partitions keep their relative order except that the one holding
    /// `/` moves to the end of its group, then the last partition grows to
    /// consume whatever `min_size` leaves over.
    pub fn relayout(&mut self, min_size: u64) -> Result<(), DiskError> {
        let grain = DEFAULT_GRAIN;
        let ext = self.extended_index();
        let mut partitions = std::mem::take(&mut self.partitions);

        let (mut primaries, mut logicals) = match ext {
            Some(idx) => {
                let logicals = partitions.split_off(idx + 1);
                (partitions, logicals)
            }
            None => (partitions, Vec::new()),
        };
        let extended = ext.and_then(|_| primaries.pop());

        if extended.is_none() {
            move_root_last(&mut primaries);
        }
        move_root_last(&mut logicals);

        let mut cursor = self.first_usable();
        for (i, p) in primaries.iter_mut().enumerate() {
            p.start = cursor;
            cursor = place(p, grain).ok_or_else(|| size_overflow(p.describe(i), self.size))?;
        }

        let mut extended = extended;
        if let Some(ext) = extended.as_mut() {
            ext.start = cursor;
            let first_logical = primaries.len() + 1;
            for (i, l) in logicals.iter_mut().enumerate() {
                // room for the extended boot record in front of each one
                l.start = cursor
                    .checked_add(grain)
                    .ok_or_else(|| size_overflow(l.describe(first_logical + i), self.size))?;
                cursor = place(l, grain)
                    .ok_or_else(|| size_overflow(l.describe(first_logical + i), self.size))?;
            }
            ext.size = cursor - ext.start;
        }

        let needed = cursor
            .checked_add(self.extra_padding)
            .and_then(|n| n.checked_add(self.footer_size()))
            .and_then(|n| checked_align_up(n, grain))
            .ok_or_else(|| size_overflow("partition table", self.size))?;
        let requested = checked_align_up(min_size.max(self.size), grain)
            .ok_or_else(|| size_overflow("partition table", min_size))?;
        self.size = requested.max(needed);

        let usable_end = self.size - self.footer_size() - self.extra_padding;
        let last = match extended.as_mut() {
            Some(_) if !logicals.is_empty() => logicals.last_mut(),
            Some(_) => None,
            None => primaries.last_mut(),
        };
        if let Some(last) = last {
            if !last.is_boot_related() && last.payload.is_some() {
                let grown = super::align_down(usable_end, grain);
                if grown > last.end() {
                    last.size = grown - last.start;
                }
            }
        }
        if let (Some(ext), Some(last)) = (extended.as_mut(), logicals.last()) {
            ext.size = last.end() - ext.start;
        }

        self.partitions = primaries;
        self.partitions.extend(extended);
        self.partitions.extend(logicals);
        self.check_partition_count()
    }

    fn check_partition_count(&self) -> Result<(), DiskError> {
        match self.label {
            TableType::Gpt if self.partitions.len() > MAX_GPT_PARTITIONS => {
                Err(DiskError::TooManyPartitions {
                    entity: format!("partition table with {} partitions", self.partitions.len()),
                    label: "gpt",
                    limit: MAX_GPT_PARTITIONS,
                })
            }
            TableType::Dos => {
                if let Some(ext) = self.extended_index() {
                    if ext >= MAX_DOS_PRIMARY_PARTITIONS {
                        return Err(DiskError::MisplacedExtended {
                            entity: self.partitions[ext].describe(ext),
                        });
                    }
                    return Ok(());
                }
                if self.partitions.len() > MAX_DOS_PRIMARY_PARTITIONS {
                    return Err(DiskError::TooManyPartitions {
                        entity: format!(
                            "partition table with {} partitions",
                            self.partitions.len()
                        ),
                        label: "dos",
                        limit: MAX_DOS_PRIMARY_PARTITIONS,
                    });
                }
                Ok(())
            }
            TableType::Gpt => Ok(()),
        }
    }

    /// Check every structural invariant of a laid out table.
    pub fn validate(&self) -> Result<(), DiskError> {
        if !self.sector_size.is_power_of_two() || !(512..=4096).contains(&self.sector_size) {
            return Err(DiskError::InvalidSectorSize(self.sector_size));
        }
        self.check_partition_count()?;

        let grain = DEFAULT_GRAIN;
        let first = self.header_size().saturating_add(self.start_offset);
        let mut prev: Option<(usize, &Partition)> = None;
        let ext = self.extended_index();
        for (i, p) in self.partitions.iter().enumerate() {
            for (value, alignment) in [(p.start, grain), (p.size, grain)] {
                if value % alignment != 0 || value % self.sector_size != 0 {
                    return Err(DiskError::Misaligned {
                        entity: p.describe(i),
                        value,
                        alignment,
                    });
                }
            }
            if p.start < first {
                return Err(DiskError::Overlap {
                    first: p.describe(i),
                    second: format!("{} label header", self.label),
                });
            }
            if let Some((j, q)) = prev {
                // logical partitions nest inside the extended one
                let nested = ext == Some(j) && self.is_logical(i);
                if !nested && p.start < q.end() {
                    return Err(DiskError::Overlap {
                        first: q.describe(j),
                        second: p.describe(i),
                    });
                }
            }
            if let Some(e) = ext.filter(|_| self.is_logical(i)) {
                let extended = &self.partitions[e];
                if p.start < extended.start || p.end() > extended.end() {
                    return Err(DiskError::Overlap {
                        first: p.describe(i),
                        second: format!("{} boundaries", extended.describe(e)),
                    });
                }
            }
            prev = Some((i, p));
            if let Some(payload) = &p.payload {
                check_nesting(payload, &p.describe(i))?;
            }
        }

        let end = self.partitions.iter().map(Partition::end).max().unwrap_or(0);
        let required = end
            .saturating_add(self.extra_padding)
            .saturating_add(self.footer_size());
        if self.size < required {
            return Err(DiskError::Unsatisfiable {
                entity: "partition table".to_string(),
                budget: self.size,
                required,
            });
        }
        self.check_uuids()
    }

    fn check_uuids(&self) -> Result<(), DiskError> {
        let mut result = Ok(());
        let label = self.label;
        self.walk(&mut |path| {
            if result.is_err() {
                return;
            }
            let Some(entity) = path.last() else {
                return;
            };
            let Some(uuid) = entity.uuid() else {
                return;
            };
            let valid = match entity {
                Entity::Table(_) if label == TableType::Dos => is_dos_disk_id(uuid),
                Entity::Filesystem(fs) if fs.fs_type == FsType::Vfat => is_vfat_id(uuid),
                _ => is_uuid(uuid),
            };
            if !valid {
                result = Err(DiskError::InvalidUuid {
                    entity: entity.describe(),
                    uuid: uuid.to_string(),
                });
            }
        });
        result
    }

    /// fstab lines for every mountable and swap area, sorted by path.
    pub fn fstab_entries(&self) -> Result<Vec<FstabEntry>, DiskError> {
        let mut entries = Vec::new();
        let mut missing = None;
        self.walk(&mut |path| {
            let entry = match path.last() {
                Some(Entity::Filesystem(fs)) => fs.uuid.as_ref().map(|uuid| FstabEntry {
                    uuid: uuid.clone(),
                    vfs_type: fs.fs_type.to_string(),
                    path: fs.mountpoint.clone(),
                    options: fs.mount_options.clone(),
                    freq: fs.freq,
                    passno: fs.passno,
                }),
                Some(Entity::Swap(swap)) => swap.uuid.as_ref().map(|uuid| FstabEntry {
                    uuid: uuid.clone(),
                    vfs_type: "swap".to_string(),
                    path: "none".to_string(),
                    options: "defaults".to_string(),
                    freq: 0,
                    passno: 0,
                }),
                Some(Entity::Subvolume(sv)) => {
                    let volume = path.iter().rev().find_map(|e| match e {
                        Entity::Btrfs(b) => Some(*b),
                        _ => None,
                    });
                    volume.and_then(|b| b.uuid.as_ref()).map(|uuid| {
                        let mut options = format!("subvol={}", sv.name);
                        if let Some(compress) = &sv.compress {
                            options.push_str(&format!(",compress={compress}"));
                        }
                        if sv.read_only {
                            options.push_str(",ro");
                        }
                        FstabEntry {
                            uuid: uuid.clone(),
                            vfs_type: "btrfs".to_string(),
                            path: sv.mountpoint.clone(),
                            options,
                            freq: 0,
                            passno: 0,
                        }
                    })
                }
                _ => return,
            };
            match entry {
                Some(entry) => entries.push(entry),
                None => {
                    if missing.is_none() {
                        missing = path.last().map(Entity::describe);
                    }
                }
            }
        });
        if let Some(entity) = missing {
            return Err(DiskError::MissingUuid(entity));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Human readable tree of the table.
    pub fn describe_tree(&self) -> String {
        let mut out = String::new();
        self.walk(&mut |path| {
            let depth = path.len() - 1;
            let indent = "  ".repeat(depth);
            let line = match path.last() {
                Some(Entity::Table(pt)) => format!(
                    "{} table {} size {} (sector {})",
                    pt.label,
                    pt.uuid.as_deref().unwrap_or("-"),
                    datasizes::format(pt.size),
                    pt.sector_size
                ),
                Some(Entity::Partition(p)) => format!(
                    "start {} size {} type {}{}",
                    datasizes::format(p.start),
                    datasizes::format(p.size),
                    p.part_type.as_deref().unwrap_or("-"),
                    if p.bootable { " bootable" } else { "" }
                ),
                Some(Entity::LogicalVolume(lv)) => {
                    format!("lv {} size {}", lv.name, datasizes::format(lv.size))
                }
                Some(other) => match (other.mountpoint(), other.uuid()) {
                    (Some(mp), Some(uuid)) => format!("{} at {} ({uuid})", other.describe(), mp),
                    (Some(mp), None) => format!("{} at {}", other.describe(), mp),
                    (None, Some(uuid)) => format!("{} ({uuid})", other.describe()),
                    (None, None) => other.describe(),
                },
                None => return,
            };
            out.push_str(&indent);
            out.push_str(&line);
            out.push('\n');
        });
        out
    }
}

fn payload_size(p: &Partition) -> u64 {
    p.payload.as_ref().map(Payload::required_size).unwrap_or(0)
}

/// Size `p` for its payload and return its end, or `None` when the
/// result does not fit in 64 bits.
fn place(p: &mut Partition, grain: u64) -> Option<u64> {
    p.size = checked_align_up(p.size.max(payload_size(p)), grain)?;
    p.start.checked_add(p.size)
}

fn move_root_last(partitions: &mut Vec<Partition>) {
    if let Some(idx) = partitions.iter().position(|p| p.contains_mountpoint("/")) {
        let root = partitions.remove(idx);
        partitions.push(root);
    }
}

/// Reject payload combinations that cannot be assembled.
pub(crate) fn check_nesting(payload: &Payload, entity: &str) -> Result<(), DiskError> {
    match payload {
        Payload::Luks(luks) => match luks.payload.as_ref() {
            Payload::Luks(_) => Err(DiskError::IncompatibleNesting {
                entity: entity.to_string(),
                reason: "luks container inside luks container".to_string(),
            }),
            Payload::Swap(_) | Payload::Raw(_) => Err(DiskError::IncompatibleNesting {
                entity: entity.to_string(),
                reason: format!("luks container cannot hold {}", luks.payload.kind()),
            }),
            inner => check_nesting(inner, entity),
        },
        Payload::Lvm(vg) => {
            for lv in &vg.logical_volumes {
                if !matches!(lv.payload, Payload::Filesystem(_) | Payload::Swap(_)) {
                    return Err(DiskError::IncompatibleNesting {
                        entity: format!("logical volume {}", lv.name),
                        reason: format!("logical volumes cannot hold {}", lv.payload.kind()),
                    });
                }
            }
            Ok(())
        }
        Payload::Filesystem(_) | Payload::Swap(_) | Payload::Btrfs(_) | Payload::Raw(_) => Ok(()),
    }
}
