//! Materialize a concrete partition table from a template.
//!
//! The planner works in two passes over the user's filesystem requests.
//! Requests for mountpoints the template already has only enlarge the
//! existing container; the rest are created after the partitioning mode
//! decided whether they become partitions, logical volumes or subvolumes.
//! Sizes are then reconciled, the table is laid out and every missing
//! identifier is drawn from the caller's random stream.

use imgforge_common::Size;
use imgforge_common::datasizes::GIB;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::entity::{
    Btrfs, ClevisBind, EntityMut, Filesystem, FsType, LogicalVolume, LuksContainer, Payload,
    Subvolume, Swap, VolumeGroup, walk_payload_mut,
};
use super::names::{lv_name, subvolume_name, unique_name};
use super::table::{Partition, PartitionTable, TableType, check_nesting};
use super::{
    DEFAULT_BOOT_SIZE, DEFAULT_BTRFS_COMPRESSION, DEFAULT_SECTOR_SIZE, DEFAULT_VOLUME_GROUP,
    DiskError, EFI_FILESYSTEM_LABEL, LUKS_METADATA_SIZE, LVM_DEFAULT_EXTENT_SIZE,
    MAX_DOS_PRIMARY_PARTITIONS, MAX_GPT_PARTITIONS, MIN_BOOT_SIZE, MIN_FILESYSTEM_SIZE,
    VOLUME_GROUP_DESCRIPTION, align_up, ptype, random_uuid, random_vfat_id, size_overflow,
};

/// How extra mountpoints are accommodated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitioningMode {
    /// Plain partitions only; containers in the template are kept.
    Raw,
    /// Switch to LVM as soon as a mountpoint beyond the template is needed.
    #[default]
    AutoLvm,
    /// Always put non-boot mountpoints into a volume group.
    Lvm,
    /// Non-boot mountpoints become subvolumes of one Btrfs volume.
    Btrfs,
}

impl PartitioningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitioningMode::Raw => "raw",
            PartitioningMode::AutoLvm => "auto-lvm",
            PartitioningMode::Lvm => "lvm",
            PartitioningMode::Btrfs => "btrfs",
        }
    }
}

impl fmt::Display for PartitioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitioningMode {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(PartitioningMode::Raw),
            "" | "auto-lvm" => Ok(PartitioningMode::AutoLvm),
            "lvm" => Ok(PartitioningMode::Lvm),
            "btrfs" => Ok(PartitioningMode::Btrfs),
            other => Err(DiskError::UnknownMode(other.to_string())),
        }
    }
}

/// A mountpoint the user wants, with optional overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRequest {
    pub mountpoint: String,
    #[serde(default, alias = "minsize")]
    pub min_size: Size,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<FsType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl FilesystemRequest {
    pub fn new(mountpoint: impl Into<String>, min_size: u64) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            min_size: Size(min_size),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRequest {
    pub passphrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clevis: Option<ClevisBind>,
}

/// Everything the user can ask of the disk layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customizations {
    #[serde(default)]
    pub filesystems: Vec<FilesystemRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group: Option<String>,
    #[serde(default)]
    pub min_disk_size: Size,
    /// Minimum space per directory; defaults to [`DEFAULT_DIRECTORY_SIZES`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_sizes: Option<BTreeMap<String, Size>>,
    /// The image is an ostree deployment, which owns `/sysroot`.
    #[serde(default)]
    pub ostree: bool,
}

pub const DEFAULT_DIRECTORY_SIZES: &[(&str, u64)] = &[("/", 2 * GIB)];

/// Plan with a fresh random stream seeded from `seed`.
pub fn plan(
    template: &PartitionTable,
    customizations: &Customizations,
    default_size: u64,
    mode: PartitioningMode,
    seed: i64,
) -> Result<PartitionTable, DiskError> {
    let mut rng = StdRng::seed_from_u64(seed as u64);
    plan_with_rng(template, customizations, default_size, mode, &mut rng)
}

/// Plan drawing identifiers from a stream shared with the caller.
pub fn plan_with_rng(
    template: &PartitionTable,
    customizations: &Customizations,
    default_size: u64,
    mode: PartitioningMode,
    rng: &mut dyn RngCore,
) -> Result<PartitionTable, DiskError> {
    let mut pt = template.clone();
    if pt.sector_size == 0 {
        pt.sector_size = DEFAULT_SECTOR_SIZE;
    }
    if !pt.sector_size.is_power_of_two() || !(512..=4096).contains(&pt.sector_size) {
        return Err(DiskError::InvalidSectorSize(pt.sector_size));
    }
    for (i, p) in pt.partitions.iter().enumerate() {
        if let Some(payload) = &p.payload {
            check_nesting(payload, &format!("template partition {}", i + 1))?;
        }
    }

    if let Some(vg) = &customizations.volume_group {
        match mode {
            PartitioningMode::Raw => {
                return Err(DiskError::RawModeRequiresLvm {
                    entity: format!("volume group {vg}"),
                });
            }
            PartitioningMode::Btrfs => {
                return Err(DiskError::IncompatibleNesting {
                    entity: format!("volume group {vg}"),
                    reason: "btrfs partitioning mode has no volume group".to_string(),
                });
            }
            PartitioningMode::AutoLvm | PartitioningMode::Lvm => {}
        }
    }

    validate_requests(&pt, customizations)?;
    apply_overrides(&mut pt, customizations);
    if let Some(size) = customizations.swap_size.filter(|s| !s.is_zero()) {
        ensure_swap(&mut pt, size.bytes());
    }

    let (existing, new): (Vec<&FilesystemRequest>, Vec<&FilesystemRequest>) = customizations
        .filesystems
        .iter()
        .partition(|req| pt.contains_mountpoint(&req.mountpoint));

    let use_lvm = match mode {
        PartitioningMode::Lvm => true,
        PartitioningMode::AutoLvm => !new.is_empty() || customizations.volume_group.is_some(),
        PartitioningMode::Raw | PartitioningMode::Btrfs => false,
    };
    debug!(%mode, use_lvm, new = new.len(), "planning partition table");

    if use_lvm {
        let name = customizations
            .volume_group
            .as_deref()
            .unwrap_or(DEFAULT_VOLUME_GROUP);
        ensure_lvm(&mut pt, name)?;
    } else if mode == PartitioningMode::Btrfs {
        ensure_btrfs(&mut pt)?;
    }

    for req in existing {
        grow_mountpoint(&mut pt, &req.mountpoint, clamp_size(req))?;
    }
    for req in new {
        // Moving / into a container may have added a default /boot.
        if pt.contains_mountpoint(&req.mountpoint) {
            grow_mountpoint(&mut pt, &req.mountpoint, clamp_size(req))?;
        } else {
            create_mountpoint(&mut pt, req, use_lvm, mode)?;
        }
    }

    if let Some(enc) = &customizations.encryption {
        encrypt_root(&mut pt, enc)?;
    }

    let floors: Vec<(String, u64)> = match &customizations.directory_sizes {
        Some(sizes) => sizes.iter().map(|(k, v)| (k.clone(), v.bytes())).collect(),
        None => DEFAULT_DIRECTORY_SIZES
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    };
    ensure_directory_sizes(&mut pt, &floors)?;

    let budget = default_size.max(customizations.min_disk_size.bytes());
    pt.relayout(budget)?;
    fill_identifiers(&mut pt, rng);
    pt.validate()?;
    debug!(size = pt.size, partitions = pt.partitions.len(), "planned partition table");
    Ok(pt)
}

fn is_normalized(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/')
        && !path.ends_with('/')
        && path[1..]
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
}

fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor != path
        && (ancestor == "/" || path.strip_prefix(ancestor).is_some_and(|r| r.starts_with('/')))
}

fn is_boot_path(mountpoint: &str) -> bool {
    mountpoint == "/boot" || mountpoint.starts_with("/boot/")
}

fn validate_requests(pt: &PartitionTable, cust: &Customizations) -> Result<(), DiskError> {
    let existing = pt.mountpoints();
    let mut seen = BTreeSet::new();
    for req in &cust.filesystems {
        let mp = req.mountpoint.as_str();
        if !is_normalized(mp) {
            return Err(DiskError::InvalidMountpoint(mp.to_string()));
        }
        if !seen.insert(mp) {
            return Err(DiskError::DuplicateMountpoint(mp.to_string()));
        }
        if mp == "/boot/efi" && pt.has_esp() {
            return Err(DiskError::ReservedMountpoint(
                mp.to_string(),
                "the EFI system partition is mounted there",
            ));
        }
        if cust.ostree && (mp == "/sysroot" || mp.starts_with("/sysroot/")) {
            return Err(DiskError::ReservedMountpoint(
                mp.to_string(),
                "owned by the ostree deployment",
            ));
        }
    }
    for req in &cust.filesystems {
        let mp = req.mountpoint.as_str();
        if mp == "/" {
            continue;
        }
        let covered = existing
            .iter()
            .map(String::as_str)
            .chain(cust.filesystems.iter().map(|r| r.mountpoint.as_str()))
            .any(|other| is_ancestor(other, mp));
        if !covered {
            return Err(DiskError::UncoveredMountpoint(mp.to_string()));
        }
    }
    Ok(())
}

fn apply_overrides(pt: &mut PartitionTable, cust: &Customizations) {
    for req in &cust.filesystems {
        if req.fs_type.is_none() && req.label.is_none() && req.uuid.is_none() {
            continue;
        }
        for partition in &mut pt.partitions {
            if let Some(payload) = partition.payload.as_mut() {
                override_filesystem(payload, req);
            }
        }
    }
}

fn override_filesystem(payload: &mut Payload, req: &FilesystemRequest) {
    match payload {
        Payload::Filesystem(fs) if fs.mountpoint == req.mountpoint => {
            if let Some(fs_type) = req.fs_type {
                fs.fs_type = fs_type;
            }
            if req.label.is_some() {
                fs.label = req.label.clone();
            }
            if req.uuid.is_some() {
                fs.uuid = req.uuid.clone();
            }
        }
        Payload::Luks(luks) => override_filesystem(&mut luks.payload, req),
        Payload::Lvm(vg) => {
            for lv in &mut vg.logical_volumes {
                override_filesystem(&mut lv.payload, req);
            }
        }
        _ => {}
    }
}

fn new_partition_type(label: TableType, kind: &str) -> &'static str {
    match (label, kind) {
        (TableType::Gpt, "boot") => ptype::XBOOTLDR_GUID,
        (TableType::Gpt, "swap") => ptype::SWAP_GUID,
        (TableType::Gpt, "lvm") => ptype::LVM_GUID,
        (TableType::Gpt, _) => ptype::FILESYSTEM_DATA_GUID,
        (TableType::Dos, "swap") => ptype::DOS_SWAP,
        (TableType::Dos, "lvm") => ptype::DOS_LVM,
        (TableType::Dos, _) => ptype::DOS_LINUX,
    }
}

fn ensure_swap(pt: &mut PartitionTable, size: u64) {
    for partition in &mut pt.partitions {
        match partition.payload.as_mut() {
            Some(Payload::Swap(_)) => {
                partition.size = partition.size.max(size);
                return;
            }
            Some(Payload::Lvm(vg)) => {
                if let Some(lv) = vg
                    .logical_volumes
                    .iter_mut()
                    .find(|lv| matches!(lv.payload, Payload::Swap(_)))
                {
                    lv.size = align_up(lv.size.max(size), LVM_DEFAULT_EXTENT_SIZE);
                    return;
                }
            }
            _ => {}
        }
    }
    let part_type = new_partition_type(pt.label, "swap");
    pt.partitions.push(Partition::new(
        align_up(size, super::DEFAULT_GRAIN),
        part_type,
        Some(Payload::Swap(Swap::default())),
    ));
}

fn inner_payload(partition: &Partition) -> Option<&Payload> {
    match partition.payload.as_ref()? {
        Payload::Luks(luks) => Some(luks.payload.as_ref()),
        other => Some(other),
    }
}

fn inner_payload_mut(partition: &mut Partition) -> Option<&mut Payload> {
    match partition.payload.as_mut()? {
        Payload::Luks(luks) => Some(luks.payload.as_mut()),
        other => Some(other),
    }
}

fn is_luks(partition: &Partition) -> bool {
    matches!(partition.payload, Some(Payload::Luks(_)))
}

fn root_index(pt: &PartitionTable, wanted: &str) -> Result<usize, DiskError> {
    pt.root_partition_index()
        .ok_or_else(|| DiskError::NoSlotFor(wanted.to_string()))
}

/// Non-boot plain filesystem partitions other than the root one, removed
/// from the table in order.
fn take_foldable(pt: &mut PartitionTable) -> Vec<(u64, Filesystem)> {
    let mut folded = Vec::new();
    let mut kept = Vec::with_capacity(pt.partitions.len());
    for partition in std::mem::take(&mut pt.partitions) {
        match partition.payload {
            Some(Payload::Filesystem(fs))
                if fs.mountpoint != "/" && !is_boot_path(&fs.mountpoint) =>
            {
                folded.push((partition.size, fs));
            }
            payload => kept.push(Partition {
                payload,
                ..partition
            }),
        }
    }
    pt.partitions = kept;
    folded
}

/// Give the table a plain `/boot` when the root moved into a container
/// the bootloader cannot read.
fn ensure_boot_partition(pt: &mut PartitionTable) {
    if pt.contains_mountpoint("/boot") {
        return;
    }
    let fs = Filesystem::new(FsType::Ext4, "/boot").with_fstab("defaults", 0, 0);
    let boot = Partition::new(
        DEFAULT_BOOT_SIZE,
        new_partition_type(pt.label, "boot"),
        Some(Payload::Filesystem(fs)),
    );
    let at = pt.root_partition_index().unwrap_or(pt.partitions.len());
    pt.partitions.insert(at, boot);
}

fn ensure_lvm(pt: &mut PartitionTable, vg_name: &str) -> Result<(), DiskError> {
    let idx = root_index(pt, "volume group")?;
    let label = pt.label;
    let luks = is_luks(&pt.partitions[idx]);
    let partition = &mut pt.partitions[idx];
    let size = partition.size;
    let Some(inner) = inner_payload_mut(partition) else {
        return Err(DiskError::NoSlotFor("volume group".to_string()));
    };
    match inner {
        Payload::Lvm(vg) => {
            vg.name = vg_name.to_string();
        }
        Payload::Filesystem(fs) => {
            let lv = LogicalVolume {
                name: lv_name(&fs.mountpoint),
                size: align_up(size, LVM_DEFAULT_EXTENT_SIZE),
                payload: Payload::Filesystem(fs.clone()),
            };
            *inner = Payload::Lvm(VolumeGroup {
                name: vg_name.to_string(),
                description: Some(VOLUME_GROUP_DESCRIPTION.to_string()),
                logical_volumes: vec![lv],
            });
            if !luks {
                partition.part_type = Some(new_partition_type(label, "lvm").to_string());
            }
        }
        other => {
            return Err(DiskError::IncompatibleNesting {
                entity: format!("partition holding / ({})", other.kind()),
                reason: "cannot place a volume group here".to_string(),
            });
        }
    }

    let folded = take_foldable(pt);
    let idx = root_index(pt, "volume group")?;
    if let Some(Payload::Lvm(vg)) = inner_payload_mut(&mut pt.partitions[idx]) {
        for (size, fs) in folded {
            let name = unique_name(&lv_name(&fs.mountpoint), |n| vg.contains_lv(n));
            debug!(lv = %name, mountpoint = %fs.mountpoint, "moving filesystem into volume group");
            vg.logical_volumes.push(LogicalVolume {
                name,
                size: align_up(size, LVM_DEFAULT_EXTENT_SIZE),
                payload: Payload::Filesystem(fs),
            });
        }
    }
    ensure_boot_partition(pt);
    Ok(())
}

fn ensure_btrfs(pt: &mut PartitionTable) -> Result<(), DiskError> {
    let idx = root_index(pt, "btrfs volume")?;
    let label = pt.label;
    let luks = is_luks(&pt.partitions[idx]);
    let partition = &mut pt.partitions[idx];
    let size = partition.size;
    let Some(inner) = inner_payload_mut(partition) else {
        return Err(DiskError::NoSlotFor("btrfs volume".to_string()));
    };
    match inner {
        Payload::Btrfs(_) => {}
        Payload::Filesystem(fs) => {
            let uuid = if fs.fs_type == FsType::Btrfs {
                fs.uuid.clone()
            } else {
                None
            };
            *inner = Payload::Btrfs(Btrfs {
                uuid,
                label: fs.label.clone(),
                subvolumes: vec![Subvolume {
                    name: subvolume_name("/"),
                    mountpoint: "/".to_string(),
                    compress: Some(DEFAULT_BTRFS_COMPRESSION.to_string()),
                    size,
                    read_only: false,
                }],
            });
            if !luks {
                partition.part_type = Some(new_partition_type(label, "data").to_string());
            }
        }
        other => {
            return Err(DiskError::IncompatibleNesting {
                entity: format!("partition holding / ({})", other.kind()),
                reason: "cannot place a btrfs volume here".to_string(),
            });
        }
    }

    let folded = take_foldable(pt);
    let idx = root_index(pt, "btrfs volume")?;
    if let Some(Payload::Btrfs(volume)) = inner_payload_mut(&mut pt.partitions[idx]) {
        for (size, fs) in folded {
            debug!(mountpoint = %fs.mountpoint, "moving filesystem into btrfs subvolume");
            volume.subvolumes.push(Subvolume {
                name: subvolume_name(&fs.mountpoint),
                mountpoint: fs.mountpoint,
                compress: Some(DEFAULT_BTRFS_COMPRESSION.to_string()),
                size,
                read_only: false,
            });
        }
    }
    ensure_boot_partition(pt);
    Ok(())
}

fn clamp_size(req: &FilesystemRequest) -> u64 {
    let floor = if req.mountpoint == "/boot" {
        MIN_BOOT_SIZE
    } else {
        MIN_FILESYSTEM_SIZE
    };
    req.min_size.bytes().max(floor)
}

/// Where the space for a mountpoint is accounted.
enum SizeSlot {
    Partition(usize),
    LogicalVolume(usize, usize),
    Subvolume(usize, usize),
}

fn size_slot(pt: &PartitionTable, mountpoint: &str) -> Option<SizeSlot> {
    let idx = pt
        .partitions
        .iter()
        .position(|p| p.contains_mountpoint(mountpoint))?;
    match inner_payload(&pt.partitions[idx])? {
        Payload::Lvm(vg) => vg
            .logical_volumes
            .iter()
            .position(|lv| lv.payload.contains_mountpoint(mountpoint))
            .map(|lv| SizeSlot::LogicalVolume(idx, lv)),
        Payload::Btrfs(volume) => volume
            .subvolumes
            .iter()
            .position(|sv| sv.mountpoint == mountpoint)
            .map(|sv| SizeSlot::Subvolume(idx, sv)),
        _ => Some(SizeSlot::Partition(idx)),
    }
}

fn grow_mountpoint(pt: &mut PartitionTable, mountpoint: &str, size: u64) -> Result<(), DiskError> {
    let slot = size_slot(pt, mountpoint).ok_or_else(|| DiskError::NoSlotFor(mountpoint.to_string()))?;
    match slot {
        SizeSlot::Partition(idx) => {
            let partition = &mut pt.partitions[idx];
            let overhead = if is_luks(partition) { LUKS_METADATA_SIZE } else { 0 };
            let needed = size
                .checked_add(overhead)
                .ok_or_else(|| size_overflow(mountpoint, partition.size))?;
            partition.size = partition.size.max(needed);
        }
        SizeSlot::LogicalVolume(idx, lv) => {
            if let Some(Payload::Lvm(vg)) = inner_payload_mut(&mut pt.partitions[idx]) {
                let lv = &mut vg.logical_volumes[lv];
                lv.size = align_up(lv.size.max(size), LVM_DEFAULT_EXTENT_SIZE);
            }
        }
        SizeSlot::Subvolume(idx, sv) => {
            if let Some(Payload::Btrfs(volume)) = inner_payload_mut(&mut pt.partitions[idx]) {
                let sv = &mut volume.subvolumes[sv];
                sv.size = sv.size.max(size);
            }
        }
    }
    Ok(())
}

fn create_mountpoint(
    pt: &mut PartitionTable,
    req: &FilesystemRequest,
    use_lvm: bool,
    mode: PartitioningMode,
) -> Result<(), DiskError> {
    let size = clamp_size(req);
    let mut fs = Filesystem::new(req.fs_type.unwrap_or(FsType::Xfs), &req.mountpoint);
    fs.label = req.label.clone();
    fs.uuid = req.uuid.clone();
    let boot = is_boot_path(&req.mountpoint);

    if use_lvm && !boot {
        let idx = root_index(pt, &req.mountpoint)?;
        let Some(Payload::Lvm(vg)) = inner_payload_mut(&mut pt.partitions[idx]) else {
            return Err(DiskError::NoSlotFor(req.mountpoint.clone()));
        };
        let name = unique_name(&lv_name(&req.mountpoint), |n| vg.contains_lv(n));
        debug!(lv = %name, size, "creating logical volume");
        vg.logical_volumes.push(LogicalVolume {
            name,
            size: align_up(size, LVM_DEFAULT_EXTENT_SIZE),
            payload: Payload::Filesystem(fs),
        });
        return Ok(());
    }

    if mode == PartitioningMode::Btrfs && !boot {
        if let Some(fs_type) = req.fs_type.filter(|t| *t != FsType::Btrfs) {
            return Err(DiskError::IncompatibleNesting {
                entity: format!("mountpoint {}", req.mountpoint),
                reason: format!("btrfs partitioning cannot create a {fs_type} filesystem"),
            });
        }
        let idx = root_index(pt, &req.mountpoint)?;
        let Some(Payload::Btrfs(volume)) = inner_payload_mut(&mut pt.partitions[idx]) else {
            return Err(DiskError::NoSlotFor(req.mountpoint.clone()));
        };
        debug!(mountpoint = %req.mountpoint, size, "creating btrfs subvolume");
        volume.subvolumes.push(Subvolume {
            name: subvolume_name(&req.mountpoint),
            mountpoint: req.mountpoint.clone(),
            compress: Some(DEFAULT_BTRFS_COMPRESSION.to_string()),
            size,
            read_only: false,
        });
        return Ok(());
    }

    let (label, limit) = match pt.label {
        TableType::Gpt => ("gpt", MAX_GPT_PARTITIONS),
        TableType::Dos => ("dos", MAX_DOS_PRIMARY_PARTITIONS),
    };
    let full = match pt.label {
        TableType::Gpt => pt.partitions.len() >= limit,
        TableType::Dos => pt.extended_index().is_none() && pt.partitions.len() >= limit,
    };
    if full {
        return Err(DiskError::TooManyPartitions {
            entity: format!("mountpoint {}", req.mountpoint),
            label,
            limit,
        });
    }
    let kind = if req.mountpoint == "/boot" { "boot" } else { "data" };
    debug!(mountpoint = %req.mountpoint, size, "creating partition");
    pt.partitions.push(Partition::new(
        size,
        new_partition_type(pt.label, kind),
        Some(Payload::Filesystem(fs)),
    ));
    Ok(())
}

fn encrypt_root(pt: &mut PartitionTable, enc: &EncryptionRequest) -> Result<(), DiskError> {
    let idx = root_index(pt, "encrypted root")?;
    let label = pt.label;
    let partition = &mut pt.partitions[idx];
    let Some(payload) = partition.payload.take() else {
        return Err(DiskError::NoSlotFor("encrypted root".to_string()));
    };
    if !matches!(
        payload,
        Payload::Filesystem(_) | Payload::Lvm(_) | Payload::Btrfs(_)
    ) {
        return Err(DiskError::IncompatibleNesting {
            entity: "luks container around /".to_string(),
            reason: format!("{} inside luks container", payload.kind()),
        });
    }
    let mut luks = LuksContainer::wrapping(payload, enc.passphrase.clone());
    luks.cipher = enc.cipher.clone();
    luks.clevis = enc.clevis.clone();
    partition.payload = Some(Payload::Luks(luks));
    partition.size = partition
        .size
        .checked_add(LUKS_METADATA_SIZE)
        .ok_or_else(|| size_overflow("luks container around /", partition.size))?;
    partition.part_type = Some(new_partition_type(label, "data").to_string());
    ensure_boot_partition(pt);
    Ok(())
}

/// Longest mountpoint that contains `dir`.
fn owning_mountpoint<'a>(mountpoints: &'a [String], dir: &str) -> Option<&'a str> {
    mountpoints
        .iter()
        .filter(|mp| mp.as_str() == dir || is_ancestor(mp, dir))
        .max_by_key(|mp| mp.len())
        .map(String::as_str)
}

fn ensure_directory_sizes(pt: &mut PartitionTable, floors: &[(String, u64)]) -> Result<(), DiskError> {
    let mountpoints = pt.mountpoints();
    let mut required: BTreeMap<String, u64> = BTreeMap::new();
    for (dir, size) in floors {
        if let Some(mp) = owning_mountpoint(&mountpoints, dir) {
            let total = required.entry(mp.to_string()).or_default();
            *total = total.saturating_add(*size);
        }
    }
    for (mp, size) in required {
        grow_mountpoint(pt, &mp, size)?;
    }
    Ok(())
}

/// Fill missing identifiers and well-known labels.
fn fill_identifiers(pt: &mut PartitionTable, rng: &mut dyn RngCore) {
    if pt.uuid.is_none() {
        pt.uuid = Some(match pt.label {
            TableType::Gpt => random_uuid(rng),
            TableType::Dos => format!("0x{:08x}", rng.next_u32()),
        });
    }
    let gpt = pt.label == TableType::Gpt;
    for partition in &mut pt.partitions {
        if gpt && partition.uuid.is_none() {
            partition.uuid = Some(random_uuid(rng));
        }
        let Some(payload) = partition.payload.as_mut() else {
            continue;
        };
        walk_payload_mut(payload, &mut |entity| match entity {
            EntityMut::Filesystem(fs) => {
                if fs.uuid.is_none() {
                    fs.uuid = Some(match fs.fs_type {
                        FsType::Vfat => random_vfat_id(rng),
                        _ => random_uuid(rng),
                    });
                }
                if fs.label.is_none() {
                    fs.label = match fs.mountpoint.as_str() {
                        "/" => Some("root".to_string()),
                        "/boot" => Some("boot".to_string()),
                        "/boot/efi" => Some(EFI_FILESYSTEM_LABEL.to_string()),
                        _ => None,
                    };
                }
            }
            EntityMut::Swap(swap) => {
                if swap.uuid.is_none() {
                    swap.uuid = Some(random_uuid(rng));
                }
            }
            EntityMut::Luks(luks) => {
                if luks.uuid.is_none() {
                    luks.uuid = Some(random_uuid(rng));
                }
            }
            EntityMut::Btrfs(volume) => {
                if volume.uuid.is_none() {
                    volume.uuid = Some(random_uuid(rng));
                }
            }
        });
    }
}
