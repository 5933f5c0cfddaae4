//! Distributions the catalog knows, as plain data.

use imgforge_common::Arch;

use crate::disk::FsType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Fedora,
    Rhel,
}

/// Defaults for ostree-based images of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OstreeDefaults {
    pub url: &'static str,
    /// Ref with `{arch}` standing for the architecture.
    pub reference: &'static str,
    pub osname: &'static str,
}

impl OstreeDefaults {
    pub fn reference_for(&self, arch: Arch) -> String {
        self.reference.replace("{arch}", arch.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distro {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub family: Family,
    pub product: &'static str,
    pub os_version: &'static str,
    /// Host environment the build pipeline runs in.
    pub runner: &'static str,
    /// Directory under `/boot/efi/EFI` holding the boot loader.
    pub efi_vendor: &'static str,
    pub arches: &'static [Arch],
    pub boot_fs: FsType,
    pub root_fs: FsType,
    pub language: &'static str,
    pub timezone: &'static str,
    pub oscap_datastream: &'static str,
    pub bootc_image: &'static str,
    pub ostree: Option<OstreeDefaults>,
}

impl Distro {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }

    pub fn supports(&self, arch: Arch) -> bool {
        self.arches.contains(&arch)
    }

    pub fn is_rhel(&self) -> bool {
        self.family == Family::Rhel
    }
}

pub static DISTROS: &[Distro] = &[
    Distro {
        name: "fedora-42",
        aliases: &["fedora"],
        family: Family::Fedora,
        product: "Fedora",
        os_version: "42",
        runner: "org.osbuild.fedora42",
        efi_vendor: "fedora",
        arches: &[Arch::X86_64, Arch::Aarch64],
        boot_fs: FsType::Ext4,
        root_fs: FsType::Ext4,
        language: "C.UTF-8",
        timezone: "UTC",
        oscap_datastream: "/usr/share/xml/scap/ssg/content/ssg-fedora-ds.xml",
        bootc_image: "quay.io/fedora/fedora-bootc:42",
        ostree: Some(OstreeDefaults {
            url: "https://ostree.fedoraproject.org/iot",
            reference: "fedora/stable/{arch}/iot",
            osname: "fedora-iot",
        }),
    },
    Distro {
        name: "rhel-9.6",
        aliases: &["rhel-9"],
        family: Family::Rhel,
        product: "Red Hat Enterprise Linux",
        os_version: "9.6",
        runner: "org.osbuild.rhel96",
        efi_vendor: "redhat",
        arches: &[Arch::X86_64, Arch::Aarch64],
        boot_fs: FsType::Xfs,
        root_fs: FsType::Xfs,
        language: "en_US.UTF-8",
        timezone: "America/New_York",
        oscap_datastream: "/usr/share/xml/scap/ssg/content/ssg-rhel9-ds.xml",
        bootc_image: "registry.redhat.io/rhel9/rhel-bootc:9.6",
        ostree: None,
    },
];

/// Look a distribution up by name or alias.
pub fn find(name: &str) -> Option<&'static Distro> {
    DISTROS.iter().find(|d| d.matches_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(find("fedora").map(|d| d.name), Some("fedora-42"));
        assert_eq!(find("rhel-9").map(|d| d.name), Some("rhel-9.6"));
        assert!(find("rhel-8").is_none());
    }

    #[test]
    fn ostree_refs_carry_the_arch() {
        let ostree = find("fedora-42").and_then(|d| d.ostree).unwrap();
        assert_eq!(ostree.reference_for(Arch::Aarch64), "fedora/stable/aarch64/iot");
    }
}
