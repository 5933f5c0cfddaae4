//! Disk layout model and partition-table planner.
//!
//! A [`PartitionTable`] is a tree: partitions own payloads, container
//! payloads (LUKS, LVM, Btrfs) own further payloads. The [`planner`] turns a
//! template table plus user customizations into a concrete, fully laid out
//! table with every UUID filled in from a seeded stream.

pub mod entity;
pub mod kernel;
pub mod names;
pub mod planner;
pub mod table;

pub use entity::{
    Argon2id, Btrfs, ClevisBind, Entity, Filesystem, FsType, LogicalVolume, LuksContainer,
    Payload, RawPayload, RawSource, Subvolume, Swap, VolumeGroup,
};
pub use kernel::{kernel_cmdline, root_filesystem_uuid};
pub use planner::{
    Customizations, EncryptionRequest, FilesystemRequest, PartitioningMode, plan, plan_with_rng,
};
pub use table::{FstabEntry, Partition, PartitionTable, TableType};

use imgforge_common::datasizes::{GIB, MIB};
use rand::RngCore;
use thiserror::Error;

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Alignment applied to every partition start and size.
pub const DEFAULT_GRAIN: u64 = MIB;

/// Space reserved after the last partition of a GPT disk for the backup
/// header.
pub const GPT_FOOTER_SIZE: u64 = MIB;

/// Partition entry array of a GPT header (128 entries of 128 bytes).
pub const GPT_ENTRY_ARRAY_SIZE: u64 = 128 * 128;

pub const MAX_GPT_PARTITIONS: usize = 128;
pub const MAX_DOS_PRIMARY_PARTITIONS: usize = 4;

pub const LVM_DEFAULT_EXTENT_SIZE: u64 = 4 * MIB;
pub const LVM_METADATA_SIZE: u64 = MIB;
pub const LUKS_METADATA_SIZE: u64 = 16 * MIB;

pub const DEFAULT_VOLUME_GROUP: &str = "rootvg";
pub const VOLUME_GROUP_DESCRIPTION: &str = "created via lvm2 and osbuild";
pub const DEFAULT_BTRFS_COMPRESSION: &str = "zstd:1";

/// Smallest size given to a newly created filesystem.
pub const MIN_FILESYSTEM_SIZE: u64 = GIB;
pub const MIN_BOOT_SIZE: u64 = 500 * MIB;
pub const DEFAULT_BOOT_SIZE: u64 = GIB;

pub const BIOS_BOOT_PARTITION_UUID: &str = "FAC7F1FB-3E8D-4137-A512-961DE09A5549";
pub const EFI_SYSTEM_PARTITION_UUID: &str = "68B2905B-DF3E-4FB3-80FA-49D1E773AA33";
pub const EFI_FILESYSTEM_UUID: &str = "7B77-95E7";
pub const EFI_FILESYSTEM_LABEL: &str = "EFI-SYSTEM";
pub const EFI_MOUNT_OPTIONS: &str = "defaults,uid=0,gid=0,umask=077,shortname=winnt";

/// Partition type identifiers, GPT GUIDs and DOS ids.
pub mod ptype {
    pub const BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
    pub const EFI_SYSTEM_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const XBOOTLDR_GUID: &str = "BC13C2FF-59E6-4262-A352-B275FD6F7172";
    pub const FILESYSTEM_DATA_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
    pub const LVM_GUID: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
    pub const SWAP_GUID: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
    pub const PREP_GUID: &str = "9E1A2D38-C612-4316-AA26-8B49521E5A8B";

    pub const DOS_LINUX: &str = "83";
    pub const DOS_SWAP: &str = "82";
    pub const DOS_LVM: &str = "8e";
    pub const DOS_ESP: &str = "ef";
    pub const DOS_PREP: &str = "41";
    pub const DOS_EXTENDED: &str = "05";
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("mountpoint {0:?} must be an absolute, normalized path")]
    InvalidMountpoint(String),
    #[error("mountpoint {0:?} requested more than once")]
    DuplicateMountpoint(String),
    #[error("mountpoint {0:?} is reserved: {1}")]
    ReservedMountpoint(String, &'static str),
    #[error("mountpoint {0:?} has no parent mountpoint to attach to")]
    UncoveredMountpoint(String),
    #[error("unknown filesystem type: {0}")]
    UnknownFsType(String),
    #[error("unknown partition table type: {0}")]
    UnknownTableType(String),
    #[error("unknown partitioning mode: {0}")]
    UnknownMode(String),
    #[error("{entity}: incompatible nesting: {reason}")]
    IncompatibleNesting { entity: String, reason: String },
    #[error("{entity}: requires LVM but partitioning mode is raw")]
    RawModeRequiresLvm { entity: String },
    #[error("{entity}: too many partitions for a {label} table (limit {limit})")]
    TooManyPartitions {
        entity: String,
        label: &'static str,
        limit: usize,
    },
    #[error("{entity}: extended partition must be one of the first four partitions")]
    MisplacedExtended { entity: String },
    #[error("{entity}: size budget of {budget} bytes cannot hold {required} bytes")]
    Unsatisfiable {
        entity: String,
        budget: u64,
        required: u64,
    },
    #[error("{entity}: {value} is not aligned to {alignment} bytes")]
    Misaligned {
        entity: String,
        value: u64,
        alignment: u64,
    },
    #[error("{first} overlaps {second}")]
    Overlap { first: String, second: String },
    #[error("invalid sector size {0}: must be a power of two between 512 and 4096")]
    InvalidSectorSize(u64),
    #[error("{entity}: invalid uuid {uuid:?}")]
    InvalidUuid { entity: String, uuid: String },
    #[error("root filesystem must be defined for kernel-cmdline stage")]
    NoRootFilesystem,
    #[error("no partition can hold {0}")]
    NoSlotFor(String),
    #[error("{0}: uuid has not been generated")]
    MissingUuid(String),
}

/// Round `value` up to `alignment`, saturating at the largest aligned
/// value. Layout uses [`checked_align_up`] and rejects saturated sizes.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    checked_align_up(value, alignment).unwrap_or_else(|| align_down(u64::MAX, alignment))
}

pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

/// A size sum that does not fit in 64 bits.
pub(crate) fn size_overflow(entity: impl Into<String>, budget: u64) -> DiskError {
    DiskError::Unsatisfiable {
        entity: entity.into(),
        budget,
        required: u64::MAX,
    }
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

/// A random version 4 UUID drawn from the planner's stream.
pub fn random_uuid(rng: &mut dyn RngCore) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

/// FAT volume ids are 32 bit serials written as `XXXX-XXXX`.
pub fn random_vfat_id(rng: &mut dyn RngCore) -> String {
    let serial = rng.next_u32();
    format!("{:04X}-{:04X}", serial >> 16, serial & 0xffff)
}

pub fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok() && value.len() == 36
}

pub fn is_vfat_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 9
        && bytes[4] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_hexdigit())
}

/// DOS disk identifiers are written as `0x` and eight hex digits.
pub fn is_dos_disk_id(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 8 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, MIB), 0);
        assert_eq!(align_up(1, MIB), MIB);
        assert_eq!(align_up(MIB, MIB), MIB);
        assert_eq!(align_down(MIB + 1, MIB), MIB);
        assert_eq!(align_up(17, 0), 17);
    }

    #[test]
    fn random_ids_are_well_formed_and_reproducible() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let uuid = random_uuid(&mut a);
        assert_eq!(uuid, random_uuid(&mut b));
        assert!(is_uuid(&uuid));
        assert_eq!(&uuid[14..15], "4");
        let vfat = random_vfat_id(&mut a);
        assert!(is_vfat_id(&vfat), "{vfat}");
        assert!(is_vfat_id(EFI_FILESYSTEM_UUID));
        assert!(!is_vfat_id("7B77_95E7"));
    }

    #[test]
    fn dos_disk_ids() {
        assert!(is_dos_disk_id("0x14fc63d2"));
        assert!(!is_dos_disk_id("14fc63d2"));
        assert!(!is_dos_disk_id("0x14fc63"));
    }
}
