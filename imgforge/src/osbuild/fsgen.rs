//! Turn a planned partition table into the stages that build it inside an
//! image file.
//!
//! Every block device a stage needs is a chain: one loopback per partition,
//! then one device per LUKS container or logical volume on the way down.
//! A device is named after the payload it carries (`-` for the root
//! filesystem, `boot-efi`, `luks-6264`, `rootvg`, `rootvg-rootlv`). Stages
//! that format a device see the innermost one under the name `device`.

use std::collections::BTreeMap;

use super::devices::Device;
use super::error::ManifestError;
use super::inputs::Input;
use super::mounts::{Mount, MountKind};
use super::stage::Stage;
use super::stages::{
    BtrfsSubvolOptions, BtrfsSubvolume, ClevisLuksBindOptions, CopyOptions, CopyPath,
    FstabOptions, Luks2FormatOptions, Luks2RemoveKeyOptions, Lvm2CreateOptions,
    Lvm2MetadataOptions, Lvm2Volume, MkfsBtrfsOptions, MkfsExt4Options, MkfsFatOptions,
    MkfsXfsOptions, MkswapOptions, Pbkdf, SfdiskOptions, SfdiskPartition, SgdiskOptions,
    TruncateOptions, WriteDeviceOptions,
};
use crate::disk::names::{path_escape, short_uuid};
use crate::disk::{
    Btrfs, DiskError, Entity, FsType, Payload, PartitionTable, RawSource, TableType,
    VOLUME_GROUP_DESCRIPTION,
};

/// Name of the device a formatting stage operates on.
pub const TARGET_DEVICE: &str = "device";

/// Which tool writes the partition table. DOS tables always use sfdisk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartitionTool {
    #[default]
    Sfdisk,
    Sgdisk,
}

fn require_uuid<'a>(uuid: Option<&'a str>, entity: &Entity<'_>) -> Result<&'a str, DiskError> {
    uuid.ok_or_else(|| DiskError::MissingUuid(entity.describe()))
}

/// Name of the device that carries `payload`.
pub fn payload_device_name(payload: &Payload) -> Result<String, DiskError> {
    let short = |uuid: &Option<String>, what: &str| {
        uuid.as_deref()
            .map(|u| format!("{what}-{}", short_uuid(u)))
            .ok_or_else(|| DiskError::MissingUuid(what.to_string()))
    };
    match payload {
        Payload::Filesystem(fs) => Ok(path_escape(&fs.mountpoint)),
        Payload::Swap(swap) => short(&swap.uuid, "swap"),
        Payload::Luks(luks) => short(&luks.uuid, "luks"),
        Payload::Lvm(vg) => Ok(vg.name.clone()),
        Payload::Btrfs(btrfs) => short(&btrfs.uuid, "btrfs"),
        Payload::Raw(raw) => Ok(format!("raw-{}", path_escape(raw.source.path()))),
    }
}

/// Devices needed to reach the block device the last entity of `path`
/// lives on, outermost first.
fn device_chain(
    path: &[Entity<'_>],
    filename: &str,
    sector_size: u64,
) -> Result<Vec<(String, Device)>, DiskError> {
    let mut chain: Vec<(String, Device)> = Vec::new();
    let ancestors = path.split_last().map(|(_, rest)| rest).unwrap_or_default();
    let mut vg_name: Option<&str> = None;
    for entity in ancestors {
        match entity {
            Entity::Partition(p) => {
                let Some(payload) = &p.payload else {
                    continue;
                };
                let name = payload_device_name(payload)?;
                let device = Device::loopback(filename, p.start / sector_size, p.size / sector_size);
                chain.push((name, device));
            }
            Entity::Luks(luks) => {
                let parent = chain
                    .last()
                    .map(|(n, _)| n.clone())
                    .ok_or_else(|| DiskError::MissingUuid(entity.describe()))?;
                let name = payload_device_name(&luks.payload)?;
                chain.push((name, Device::luks2(&parent, &luks.passphrase)));
            }
            Entity::VolumeGroup(vg) => vg_name = Some(vg.name.as_str()),
            Entity::LogicalVolume(lv) => {
                let vg = vg_name.unwrap_or_default();
                let parent = chain
                    .last()
                    .map(|(n, _)| n.clone())
                    .ok_or_else(|| DiskError::MissingUuid(entity.describe()))?;
                chain.push((format!("{vg}-{}", lv.name), Device::lvm2_lv(&parent, &lv.name)));
            }
            Entity::Table(_)
            | Entity::Filesystem(_)
            | Entity::Swap(_)
            | Entity::Btrfs(_)
            | Entity::Subvolume(_)
            | Entity::Raw(_) => {}
        }
    }
    Ok(chain)
}

/// Devices for a formatting stage: the innermost one is renamed `device`.
fn target_devices(
    path: &[Entity<'_>],
    filename: &str,
    sector_size: u64,
) -> Result<BTreeMap<String, Device>, DiskError> {
    let mut chain = device_chain(path, filename, sector_size)?;
    let last = chain
        .pop()
        .ok_or_else(|| DiskError::MissingUuid(describe_last(path)))?;
    let mut devices: BTreeMap<String, Device> = chain.into_iter().collect();
    devices.insert(TARGET_DEVICE.to_string(), last.1);
    Ok(devices)
}

fn describe_last(path: &[Entity<'_>]) -> String {
    path.last().map(Entity::describe).unwrap_or_default()
}

fn walk_paths<'a>(pt: &'a PartitionTable) -> Vec<Vec<Entity<'a>>> {
    let mut paths = Vec::new();
    pt.walk(&mut |path| paths.push(path.to_vec()));
    paths
}

fn partition_stage(
    pt: &PartitionTable,
    filename: &str,
    tool: PartitionTool,
) -> Result<Stage, ManifestError> {
    let uuid = pt
        .uuid
        .clone()
        .ok_or_else(|| DiskError::MissingUuid(Entity::Table(pt).describe()))?;
    let partitions: Vec<SfdiskPartition> = pt
        .partitions
        .iter()
        .map(|p| SfdiskPartition {
            bootable: p.bootable,
            name: p.name.clone(),
            size: pt.bytes_to_sectors(p.size),
            start: pt.bytes_to_sectors(p.start),
            part_type: p.part_type.clone(),
            uuid: p.uuid.clone(),
        })
        .collect();
    let devices = BTreeMap::from([(TARGET_DEVICE.to_string(), Device::whole_disk(filename))]);
    let stage = match (pt.label, tool) {
        (TableType::Gpt, PartitionTool::Sgdisk) => {
            Stage::new(SgdiskOptions { uuid, partitions })?
        }
        _ => Stage::new(SfdiskOptions {
            label: pt.label.as_str().to_string(),
            uuid,
            partitions,
        })?,
    };
    Ok(stage.with_devices(devices))
}

fn mkfs_stage(
    path: &[Entity<'_>],
    pt: &PartitionTable,
    filename: &str,
) -> Result<Option<Stage>, ManifestError> {
    let Some(entity) = path.last() else {
        return Ok(None);
    };
    let stage = match entity {
        Entity::Filesystem(fs) => {
            let uuid = require_uuid(fs.uuid.as_deref(), entity)?.to_string();
            let label = fs.label.clone();
            match fs.fs_type {
                FsType::Ext4 => Stage::new(MkfsExt4Options { uuid, label })?,
                FsType::Xfs => Stage::new(MkfsXfsOptions { uuid, label })?,
                FsType::Vfat => Stage::new(MkfsFatOptions::from_fs_uuid(&uuid, label.as_deref()))?,
                FsType::Btrfs => Stage::new(MkfsBtrfsOptions { uuid, label })?,
            }
        }
        Entity::Swap(swap) => Stage::new(MkswapOptions {
            uuid: require_uuid(swap.uuid.as_deref(), entity)?.to_string(),
            label: swap.label.clone(),
        })?,
        Entity::Btrfs(btrfs) => Stage::new(MkfsBtrfsOptions {
            uuid: require_uuid(btrfs.uuid.as_deref(), entity)?.to_string(),
            label: btrfs.label.clone(),
        })?,
        _ => return Ok(None),
    };
    let devices = target_devices(path, filename, pt.sector_size)?;
    Ok(Some(stage.with_devices(devices)))
}

/// Stages that create the image file and everything inside it, in
/// dependency order: truncate, partition, then for every partition its
/// containers from the outside in and finally its filesystems.
pub fn prepare_stages(
    pt: &PartitionTable,
    filename: &str,
    tool: PartitionTool,
) -> Result<Vec<Stage>, ManifestError> {
    let mut stages = vec![
        Stage::new(TruncateOptions::new(filename, pt.size))?,
        partition_stage(pt, filename, tool)?,
    ];
    for path in walk_paths(pt) {
        let Some(entity) = path.last() else {
            continue;
        };
        match entity {
            Entity::Luks(luks) => {
                let devices = target_devices(&path, filename, pt.sector_size)?;
                let uuid = require_uuid(luks.uuid.as_deref(), entity)?;
                let format = Stage::new(Luks2FormatOptions {
                    uuid: uuid.to_string(),
                    passphrase: luks.passphrase.clone(),
                    label: luks.label.clone(),
                    cipher: luks.cipher.clone(),
                    subsystem: luks.subsystem.clone(),
                    sector_size: luks.sector_size,
                    pbkdf: Pbkdf::from(&luks.pbkdf),
                })?;
                stages.push(format.with_devices(devices.clone()));
                if let Some(clevis) = &luks.clevis {
                    let bind = Stage::new(ClevisLuksBindOptions {
                        passphrase: luks.passphrase.clone(),
                        pin: clevis.pin.clone(),
                        policy: clevis.policy.clone(),
                    })?;
                    stages.push(bind.with_devices(devices));
                }
            }
            Entity::VolumeGroup(vg) => {
                let volumes = vg
                    .logical_volumes
                    .iter()
                    .map(|lv| Lvm2Volume::new(&lv.name, lv.size))
                    .collect();
                let devices = target_devices(&path, filename, pt.sector_size)?;
                stages.push(Stage::new(Lvm2CreateOptions { volumes })?.with_devices(devices));
            }
            _ => {
                if let Some(stage) = mkfs_stage(&path, pt, filename)? {
                    stages.push(stage);
                }
                if let Entity::Btrfs(btrfs) = entity {
                    stages.push(subvolume_stage(&path, btrfs, pt, filename)?);
                }
            }
        }
    }
    Ok(stages)
}

fn subvolume_stage(
    path: &[Entity<'_>],
    btrfs: &Btrfs,
    pt: &PartitionTable,
    filename: &str,
) -> Result<Stage, ManifestError> {
    let subvolumes = btrfs
        .subvolumes
        .iter()
        .map(|sv| BtrfsSubvolume {
            name: format!("/{}", sv.name),
        })
        .collect();
    let devices = target_devices(path, filename, pt.sector_size)?;
    let mount = Mount {
        name: "volume".to_string(),
        kind: MountKind::Btrfs,
        source: Some(TARGET_DEVICE.to_string()),
        target: "/".to_string(),
        options: None,
    };
    Ok(Stage::new(BtrfsSubvolOptions { subvolumes })?
        .with_devices(devices)
        .with_mounts(vec![mount]))
}

/// Stages that run after the tree has been copied in: LVM metadata is
/// rewritten and temporary LUKS passphrases dropped, innermost first.
pub fn finish_stages(pt: &PartitionTable, filename: &str) -> Result<Vec<Stage>, ManifestError> {
    let mut stages = Vec::new();
    for path in walk_paths(pt) {
        match path.last() {
            Some(Entity::Luks(luks)) => {
                if luks.clevis.as_ref().is_some_and(|c| c.remove_passphrase) {
                    let devices = target_devices(&path, filename, pt.sector_size)?;
                    let stage = Stage::new(Luks2RemoveKeyOptions {
                        passphrase: luks.passphrase.clone(),
                    })?;
                    stages.push(stage.with_devices(devices));
                }
            }
            Some(Entity::VolumeGroup(vg)) => {
                let devices = target_devices(&path, filename, pt.sector_size)?;
                let stage = Stage::new(Lvm2MetadataOptions {
                    vg_name: vg.name.clone(),
                    creation_host: "osbuild".to_string(),
                    description: vg
                        .description
                        .clone()
                        .unwrap_or_else(|| VOLUME_GROUP_DESCRIPTION.to_string()),
                })?;
                stages.push(stage.with_devices(devices));
            }
            _ => {}
        }
    }
    stages.reverse();
    Ok(stages)
}

/// Devices and mounts that expose every filesystem of the table at its
/// mountpoint, parents before children.
pub fn devices_and_mounts(
    pt: &PartitionTable,
    filename: &str,
) -> Result<(BTreeMap<String, Device>, Vec<Mount>), ManifestError> {
    let mut devices = BTreeMap::new();
    let mut mounts = Vec::new();
    for path in walk_paths(pt) {
        let Some(entity) = path.last() else {
            continue;
        };
        let Some(mountpoint) = entity.mountpoint() else {
            continue;
        };
        let chain = device_chain(&path, filename, pt.sector_size)?;
        let source = chain
            .last()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| DiskError::MissingUuid(entity.describe()))?;
        devices.extend(chain);
        let name = path_escape(mountpoint);
        let mount = match entity {
            Entity::Subvolume(sv) => Mount::btrfs_subvolume(
                &name,
                &source,
                mountpoint,
                &sv.name,
                sv.compress.as_deref(),
            ),
            Entity::Filesystem(fs) => Mount::filesystem(&name, fs.fs_type, &source, mountpoint),
            _ => continue,
        };
        mounts.push(mount);
    }
    mounts.sort_by(|a, b| a.target.cmp(&b.target));
    Ok((devices, mounts))
}

/// Copy the tree of `tree_pipeline` onto the mounted filesystems.
pub fn copy_tree_stage(
    pt: &PartitionTable,
    filename: &str,
    tree_pipeline: &str,
) -> Result<Stage, ManifestError> {
    let (devices, mounts) = devices_and_mounts(pt, filename)?;
    let root = mounts
        .iter()
        .find(|m| m.target == "/")
        .map(|m| m.name.clone())
        .ok_or(DiskError::NoRootFilesystem)?;
    let options = CopyOptions {
        paths: vec![CopyPath::new("input://root-tree/", format!("mount://{root}/"))],
    };
    Ok(
        Stage::with_inputs(options, [("root-tree", Input::tree(tree_pipeline))])?
            .with_devices(devices)
            .with_mounts(mounts),
    )
}

/// Fstab entries of the table as stage options.
pub fn fstab_options(pt: &PartitionTable) -> Result<FstabOptions, ManifestError> {
    Ok(FstabOptions::from_entries(&pt.fstab_entries()?))
}

/// Write every raw payload onto its device. Files from the build root are
/// read from `build_pipeline`.
pub fn write_device_stages(
    pt: &PartitionTable,
    filename: &str,
    build_pipeline: &str,
) -> Result<Vec<Stage>, ManifestError> {
    let mut stages = Vec::new();
    for path in walk_paths(pt) {
        let Some(Entity::Raw(raw)) = path.last() else {
            continue;
        };
        let (pipeline, file) = match &raw.source {
            RawSource::BuildTree { path } => (build_pipeline, path.as_str()),
            RawSource::Pipeline { pipeline, path } => (pipeline.as_str(), path.as_str()),
        };
        let options = WriteDeviceOptions {
            from: format!("input://tree/{}", file.trim_start_matches('/')),
        };
        let devices = target_devices(&path, filename, pt.sector_size)?;
        stages.push(
            Stage::with_inputs(options, [("tree", Input::tree(pipeline))])?.with_devices(devices),
        );
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{
        ClevisBind, Customizations, EncryptionRequest, FilesystemRequest, Filesystem, Partition,
        PartitioningMode, RawPayload, plan, ptype,
    };
    use crate::osbuild::devices::DeviceKind;
    use imgforge_common::datasizes::{GIB, MIB};

    fn template(label: TableType) -> PartitionTable {
        let mut pt = PartitionTable::new(label);
        let (boot_type, root_type) = match label {
            TableType::Gpt => (ptype::XBOOTLDR_GUID, ptype::FILESYSTEM_DATA_GUID),
            TableType::Dos => (ptype::DOS_LINUX, ptype::DOS_LINUX),
        };
        pt.partitions.push(Partition::new(
            GIB,
            boot_type,
            Some(Payload::Filesystem(Filesystem::new(FsType::Ext4, "/boot"))),
        ));
        pt.partitions.push(Partition::new(
            2 * GIB,
            root_type,
            Some(Payload::Filesystem(Filesystem::new(FsType::Xfs, "/"))),
        ));
        pt
    }

    fn types(stages: &[Stage]) -> Vec<&'static str> {
        stages.iter().map(Stage::type_name).collect()
    }

    #[test]
    fn plain_table_stages() {
        let pt = plan(
            &template(TableType::Gpt),
            &Customizations::default(),
            10 * GIB,
            PartitioningMode::Raw,
            0,
        )
        .unwrap();
        let stages = prepare_stages(&pt, "disk.img", PartitionTool::Sgdisk).unwrap();
        assert_eq!(
            types(&stages),
            [
                "org.osbuild.truncate",
                "org.osbuild.sgdisk",
                "org.osbuild.mkfs.ext4",
                "org.osbuild.mkfs.xfs"
            ]
        );
        let mkfs_root = &stages[3];
        let DeviceKind::Loopback(lo) = &mkfs_root.devices[TARGET_DEVICE].kind else {
            panic!("root device is not a loopback");
        };
        let root = &pt.partitions[pt.root_partition_index().unwrap()];
        assert_eq!(lo.start, root.start / 512);
        assert_eq!(lo.size, root.size / 512);
        assert!(finish_stages(&pt, "disk.img").unwrap().is_empty());
    }

    #[test]
    fn dos_tables_always_use_sfdisk() {
        let pt = plan(
            &template(TableType::Dos),
            &Customizations::default(),
            10 * GIB,
            PartitioningMode::Raw,
            0,
        )
        .unwrap();
        let stages = prepare_stages(&pt, "disk.img", PartitionTool::Sgdisk).unwrap();
        assert_eq!(stages[1].type_name(), "org.osbuild.sfdisk");
    }

    #[test]
    fn luks_before_lvm_and_finish_reversed() {
        let cust = Customizations {
            filesystems: vec![FilesystemRequest::new("/var/log", 3 * GIB)],
            encryption: Some(EncryptionRequest {
                passphrase: "osbuild".into(),
                cipher: None,
                clevis: Some(ClevisBind {
                    pin: "tpm2".into(),
                    policy: "{}".into(),
                    remove_passphrase: true,
                }),
            }),
            ..Default::default()
        };
        let pt = plan(
            &template(TableType::Gpt),
            &cust,
            10 * GIB,
            PartitioningMode::AutoLvm,
            0,
        )
        .unwrap();
        let stages = prepare_stages(&pt, "disk.img", PartitionTool::Sfdisk).unwrap();
        let names = types(&stages);
        let luks = names.iter().position(|t| *t == "org.osbuild.luks2.format").unwrap();
        let bind = names.iter().position(|t| *t == "org.osbuild.clevis.luks-bind").unwrap();
        let lvm = names.iter().position(|t| *t == "org.osbuild.lvm2.create").unwrap();
        assert!(luks < bind && bind < lvm);
        assert!(names[lvm + 1..].iter().all(|t| t.starts_with("org.osbuild.mkfs")));

        let finish = finish_stages(&pt, "disk.img").unwrap();
        assert_eq!(
            types(&finish),
            ["org.osbuild.lvm2.metadata", "org.osbuild.luks2.remove-key"]
        );

        let lv_stage = stages
            .iter()
            .find(|s| {
                s.type_name() == "org.osbuild.mkfs.xfs"
                    && matches!(s.devices[TARGET_DEVICE].kind, DeviceKind::Lvm2Lv(_))
            })
            .unwrap();
        assert_eq!(lv_stage.devices[TARGET_DEVICE].parent.as_deref(), Some("rootvg"));
        assert!(matches!(lv_stage.devices["rootvg"].kind, DeviceKind::Luks2(_)));
    }

    #[test]
    fn btrfs_gets_subvolume_stage_and_mounts() {
        let mut tmpl = template(TableType::Gpt);
        tmpl.partitions[1].payload =
            Some(Payload::Filesystem(Filesystem::new(FsType::Btrfs, "/")));
        let cust = Customizations {
            filesystems: vec![FilesystemRequest::new("/var", GIB)],
            ..Default::default()
        };
        let pt = plan(&tmpl, &cust, 10 * GIB, PartitioningMode::Btrfs, 0).unwrap();
        let stages = prepare_stages(&pt, "disk.img", PartitionTool::Sfdisk).unwrap();
        let subvol = stages
            .iter()
            .find(|s| s.type_name() == "org.osbuild.btrfs.subvol")
            .unwrap();
        let json = serde_json::to_value(&subvol.options).unwrap();
        assert_eq!(json["subvolumes"][0]["name"], "/root");
        assert_eq!(subvol.mounts[0].source.as_deref(), Some(TARGET_DEVICE));

        let (devices, mounts) = devices_and_mounts(&pt, "disk.img").unwrap();
        let targets: Vec<_> = mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, ["/", "/boot", "/var"]);
        assert_eq!(mounts[0].name, "-");
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn copy_stage_targets_root_mount() {
        let pt = plan(
            &template(TableType::Gpt),
            &Customizations::default(),
            10 * GIB,
            PartitioningMode::Raw,
            0,
        )
        .unwrap();
        let stage = copy_tree_stage(&pt, "disk.img", "os").unwrap();
        let json = serde_json::to_value(&stage.options).unwrap();
        assert_eq!(json["paths"][0]["to"], "mount://-/");
        assert_eq!(stage.inputs["root-tree"].pipeline_refs(), vec!["os"]);
        assert_eq!(stage.mounts.len(), 2);
        assert_eq!(fstab_options(&pt).unwrap().filesystems.len(), 2);
    }

    #[test]
    fn raw_payloads_from_build_root_and_pipeline() {
        let mut pt = plan(
            &template(TableType::Gpt),
            &Customizations::default(),
            10 * GIB,
            PartitioningMode::Raw,
            0,
        )
        .unwrap();
        let end = pt.partitions.iter().map(Partition::end).max().unwrap();
        for (i, source) in [
            RawSource::BuildTree {
                path: "/usr/share/uboot/rpi/u-boot.bin".into(),
            },
            RawSource::Pipeline {
                pipeline: "firmware".into(),
                path: "/fw.img".into(),
            },
        ]
        .into_iter()
        .enumerate()
        {
            let mut part = Partition::new(
                MIB,
                ptype::FILESYSTEM_DATA_GUID,
                Some(Payload::Raw(RawPayload { source })),
            );
            part.start = end + i as u64 * MIB;
            pt.partitions.push(part);
        }
        let stages = write_device_stages(&pt, "disk.img", "build").unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].inputs["tree"].pipeline_refs(), vec!["build"]);
        assert_eq!(
            serde_json::to_value(&stages[0].options).unwrap()["from"],
            "input://tree/usr/share/uboot/rpi/u-boot.bin"
        );
        assert_eq!(stages[1].inputs["tree"].pipeline_refs(), vec!["firmware"]);
        assert!(stages[1].devices.contains_key(TARGET_DEVICE));
    }
}
