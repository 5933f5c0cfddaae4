//! Partition table templates the planner specializes per image.

use imgforge_common::Arch;
use imgforge_common::datasizes::{GIB, MIB};

use super::BootMode;
use super::distro::Distro;
use crate::disk::{
    BIOS_BOOT_PARTITION_UUID, DEFAULT_BOOT_SIZE, EFI_FILESYSTEM_LABEL, EFI_FILESYSTEM_UUID,
    EFI_MOUNT_OPTIONS, EFI_SYSTEM_PARTITION_UUID, Filesystem, FsType, Partition, PartitionTable,
    Payload, TableType, ptype,
};

const BIOS_BOOT_SIZE: u64 = MIB;
pub const ESP_SIZE: u64 = 200 * MIB;
/// Ostree systems keep several boot loader generations on the ESP.
const OSTREE_ESP_SIZE: u64 = 501 * MIB;
const ROOT_SIZE: u64 = 2 * GIB;

/// Flavour of the layout, beyond the boot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `/boot` and `/` as separate partitions.
    Standard,
    /// Like [`Layout::Standard`] with a larger ESP and an ext4 `/boot`.
    Ostree,
}

/// The 1 MiB BIOS boot partition GRUB embeds its core image in.
pub fn bios_boot_partition() -> Partition {
    let mut part = Partition::new(BIOS_BOOT_SIZE, ptype::BIOS_BOOT_GUID, None);
    part.uuid = Some(BIOS_BOOT_PARTITION_UUID.to_string());
    part
}

/// A vfat EFI system partition mounted at `/boot/efi`.
pub fn esp_partition(size: u64) -> Partition {
    let fs = Filesystem::new(FsType::Vfat, "/boot/efi")
        .with_uuid(EFI_FILESYSTEM_UUID)
        .with_label(EFI_FILESYSTEM_LABEL)
        .with_fstab(EFI_MOUNT_OPTIONS, 0, 2);
    let mut part = Partition::new(size, ptype::EFI_SYSTEM_GUID, Some(Payload::Filesystem(fs)));
    part.uuid = Some(EFI_SYSTEM_PARTITION_UUID.to_string());
    part
}

fn data(size: u64, fs_type: FsType, mountpoint: &str, label: &str) -> Partition {
    let fs = Filesystem::new(fs_type, mountpoint).with_label(label);
    Partition::new(size, ptype::FILESYSTEM_DATA_GUID, Some(Payload::Filesystem(fs)))
}

/// The GPT template of a disk image. BIOS boot partitions only exist on
/// x86_64.
pub fn disk_template(distro: &Distro, arch: Arch, mode: BootMode, layout: Layout) -> PartitionTable {
    let mut pt = PartitionTable::new(TableType::Gpt);
    if mode.has_legacy() && arch == Arch::X86_64 {
        pt.partitions.push(bios_boot_partition());
    }
    if mode.has_uefi() {
        let size = match layout {
            Layout::Standard => ESP_SIZE,
            Layout::Ostree => OSTREE_ESP_SIZE,
        };
        pt.partitions.push(esp_partition(size));
    }
    let boot_fs = match layout {
        Layout::Standard => distro.boot_fs,
        Layout::Ostree => FsType::Ext4,
    };
    pt.partitions
        .push(data(DEFAULT_BOOT_SIZE, boot_fs, "/boot", "boot"));
    pt.partitions
        .push(data(ROOT_SIZE, distro.root_fs, "/", "root"));
    pt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagetype::distro;

    fn fedora() -> &'static Distro {
        distro::find("fedora-42").unwrap()
    }

    #[test]
    fn hybrid_x86_has_bios_and_esp() {
        let pt = disk_template(fedora(), Arch::X86_64, BootMode::Hybrid, Layout::Standard);
        let types: Vec<_> = pt
            .partitions
            .iter()
            .map(|p| p.part_type.as_deref().unwrap())
            .collect();
        assert_eq!(
            types,
            [
                ptype::BIOS_BOOT_GUID,
                ptype::EFI_SYSTEM_GUID,
                ptype::FILESYSTEM_DATA_GUID,
                ptype::FILESYSTEM_DATA_GUID
            ]
        );
        assert!(pt.contains_mountpoint("/boot/efi"));
    }

    #[test]
    fn aarch64_never_gets_bios_boot() {
        let pt = disk_template(fedora(), Arch::Aarch64, BootMode::Hybrid, Layout::Standard);
        assert!(!pt.has_bios_boot());
        assert!(pt.has_esp());
    }

    #[test]
    fn ostree_layout_uses_ext4_boot() {
        let rhel = distro::find("rhel-9.6").unwrap();
        let pt = disk_template(rhel, Arch::X86_64, BootMode::Uefi, Layout::Ostree);
        assert_eq!(pt.partitions.len(), 3);
        assert_eq!(pt.partitions[0].size, OSTREE_ESP_SIZE);
        let Some(Payload::Filesystem(boot)) = &pt.partitions[1].payload else {
            panic!("expected a /boot filesystem");
        };
        assert_eq!(boot.fs_type, FsType::Ext4);
    }
}
