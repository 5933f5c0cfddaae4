//! Kernel command line derived from a planned table.

use super::entity::Entity;
use super::table::PartitionTable;
use super::DiskError;

/// UUID of the filesystem that holds `/`.
///
/// For a Btrfs root this is the volume UUID, since subvolumes have none.
pub fn root_filesystem_uuid(pt: &PartitionTable) -> Result<String, DiskError> {
    let path = pt.find_mountpoint("/").ok_or(DiskError::NoRootFilesystem)?;
    let uuid = path.iter().rev().find_map(|entity| match entity {
        Entity::Filesystem(fs) => Some(fs.uuid.clone()),
        Entity::Btrfs(btrfs) => Some(btrfs.uuid.clone()),
        _ => None,
    });
    uuid.flatten()
        .ok_or_else(|| DiskError::MissingUuid("root filesystem".to_string()))
}

/// Ordered kernel arguments needed to find and mount the root filesystem.
///
/// `root=UUID=` always comes first, followed by Btrfs subvolume flags,
/// LUKS ancestors (outermost first) and LVM activation.
pub fn kernel_cmdline(pt: &PartitionTable) -> Result<Vec<String>, DiskError> {
    let path = pt.find_mountpoint("/").ok_or(DiskError::NoRootFilesystem)?;
    let mut args = vec![format!("root=UUID={}", root_filesystem_uuid(pt)?)];

    if let Some(Entity::Subvolume(sv)) = path.last() {
        args.push(format!("rootflags=subvol={}", sv.name));
    }

    for entity in &path {
        if let Entity::Luks(luks) = entity {
            let uuid = luks
                .uuid
                .as_deref()
                .ok_or_else(|| DiskError::MissingUuid(entity.describe()))?;
            args.push(format!("luks.uuid={uuid}"));
        }
    }

    let vg = path.iter().find_map(|e| match e {
        Entity::VolumeGroup(vg) => Some(vg.name.as_str()),
        _ => None,
    });
    let lv = path.iter().find_map(|e| match e {
        Entity::LogicalVolume(lv) => Some(lv.name.as_str()),
        _ => None,
    });
    if let (Some(vg), Some(lv)) = (vg, lv) {
        args.push(format!("rd.lvm.lv={vg}/{lv}"));
    }

    Ok(args)
}
