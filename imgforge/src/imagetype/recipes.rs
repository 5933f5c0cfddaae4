//! Image recipes: catalog data plus a blueprint in, a pipeline graph out.

use imgforge_common::Arch;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use tracing::debug;

use super::distro::Distro;
use super::templates::{Layout, disk_template};
use super::{ImageOptions, ImageTypeDef, ImageTypeError, Kind};
use crate::blueprint::{Blueprint, Customizations};
use crate::crypt;
use crate::disk::{self, PartitionTable};
use crate::osbuild::stages::{
    CloudInitOptions, FirewallOptions, FirstBootOptions, GroupOptions, MkdirPath,
    ModprobeCommand, ModprobeOptions, OscapConfig, QemuFormat, SshdConfig, SysconfigKernel,
    SysconfigNetwork, SysconfigOptions, TarFormat, UserOptions,
};
use crate::ostree;
use crate::pipeline::{
    ArchivePipeline, BUILD_PIPELINE, Bootloader, BuildPipeline, CompressPipeline,
    ContainerDiskPipeline, ContainerTreePipeline, DiskImagePipeline, FileData, OsConfig,
    OsPipeline, OsUser, OstreeDeploymentPipeline, OvaPipeline, PreManifest, QemuPipeline,
};
use crate::rpmmd::{PackageSet, RepoConfig};

const OS_PIPELINE: &str = "os";
const IMAGE_PIPELINE: &str = "image";
const IMAGE_FILE: &str = "disk.raw";

const BUILD_PACKAGES: &[&str] = &[
    "coreutils",
    "dnf",
    "dosfstools",
    "e2fsprogs",
    "glibc",
    "policycoreutils",
    "python3",
    "qemu-img",
    "rpm",
    "selinux-policy-targeted",
    "systemd",
    "tar",
    "xfsprogs",
    "xz",
];

const CONTAINER_PACKAGES: &[&str] = &[
    "bash",
    "coreutils",
    "dnf",
    "glibc-minimal-langpack",
    "rootfiles",
    "rpm",
    "sudo",
];

const CONTAINER_EXCLUDES: &[&str] = &["grubby", "kernel", "firewalld"];

pub(super) fn assemble(
    distro: &'static Distro,
    arch: Arch,
    def: &'static ImageTypeDef,
    blueprint: &Blueprint,
    options: &ImageOptions,
    repos: &[RepoConfig],
    seed: i64,
) -> Result<(PreManifest, Vec<String>), ImageTypeError> {
    if let Some(requested) = blueprint.distro.as_deref() {
        if !distro.matches_name(requested) {
            return Err(ImageTypeError::DistroMismatch {
                requested: requested.to_string(),
                distro: distro.name.to_string(),
            });
        }
    }
    blueprint.validate()?;
    let allowed: Vec<&str> = def
        .customizations
        .iter()
        .copied()
        .filter(|field| *field != "subscription" || distro.is_rhel())
        .collect();
    blueprint.check_supported(def.name, &allowed)?;

    let mut recipe = Recipe {
        distro,
        arch,
        def,
        blueprint,
        customizations: blueprint.customizations(),
        repos,
        rng: StdRng::seed_from_u64(seed as u64),
        warnings: Vec::new(),
    };
    if recipe.repos_for("os").is_empty() {
        recipe.warn(format!(
            "no repositories configured for {} {} {}",
            distro.name, arch, def.name
        ));
    }
    let pm = match def.kind {
        Kind::ContainerTar => recipe.container_tar()?,
        Kind::IotRaw => recipe.iot_raw(options)?,
        Kind::BootcDisk => recipe.bootc_disk(options)?,
        Kind::Qcow2
        | Kind::Raw
        | Kind::Vhd
        | Kind::Vmdk
        | Kind::Ova
        | Kind::Gce
        | Kind::MinimalRawXz => recipe.os_disk(options)?,
    };
    debug!(
        distro = distro.name,
        arch = %arch,
        image_type = def.name,
        pipelines = ?pm.pipeline_names(),
        "assembled pre-manifest"
    );
    Ok((pm, recipe.warnings))
}

struct Recipe<'a> {
    distro: &'static Distro,
    arch: Arch,
    def: &'static ImageTypeDef,
    blueprint: &'a Blueprint,
    customizations: Customizations,
    repos: &'a [RepoConfig],
    rng: StdRng,
    warnings: Vec<String>,
}

impl Recipe<'_> {
    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    fn repos_for(&self, package_set: &str) -> Vec<RepoConfig> {
        self.repos
            .iter()
            .filter(|r| r.matches_image_type(self.def.name) && r.matches_package_set(package_set))
            .cloned()
            .collect()
    }

    fn uefi_suffix(&self) -> &'static str {
        match self.arch {
            Arch::Aarch64 => "aa64",
            _ => "x64",
        }
    }

    fn build_pipeline(&self, extra: &[&str]) -> BuildPipeline {
        let mut names: Vec<String> = BUILD_PACKAGES.iter().map(|p| p.to_string()).collect();
        if self.arch == Arch::X86_64 && self.def.boot_mode(self.arch).has_legacy() {
            names.push("grub2-pc".to_string());
        }
        if !self.blueprint.containers.is_empty() {
            names.push("skopeo".to_string());
        }
        names.extend(extra.iter().map(|p| p.to_string()));
        let packages = PackageSet::new(names).with_repositories(self.repos_for("build"));
        BuildPipeline::new(self.distro.runner, packages, true)
    }

    fn bootloader(&self) -> Bootloader {
        let mode = self.def.boot_mode(self.arch);
        let vendor = self.distro.efi_vendor;
        match (mode.has_legacy() && self.arch == Arch::X86_64, mode.has_uefi()) {
            (true, true) => Bootloader::hybrid(vendor),
            (true, false) => Bootloader::legacy(),
            _ => Bootloader::uefi(vendor),
        }
    }

    fn plan_disk(
        &mut self,
        options: &ImageOptions,
        layout: Layout,
    ) -> Result<PartitionTable, ImageTypeError> {
        let mode = self.def.boot_mode(self.arch);
        let template = disk_template(self.distro, self.arch, mode, layout);
        let mut request = self.blueprint.disk_customizations();
        if layout == Layout::Ostree {
            request.ostree = true;
        }
        if self.def.kind == Kind::BootcDisk && request.swap_size.take().is_some() {
            self.warn(format!(
                "swap requested but no swap partition will be created for {}",
                self.def.name
            ));
        }
        let requested = options.size.map_or(self.def.default_size, |s| s.bytes());
        let partitioning = self.blueprint.partitioning_mode()?;
        let pt = disk::plan_with_rng(&template, &request, requested, partitioning, &mut self.rng)?;
        if options.size.is_some() && pt.size > requested {
            self.warn(format!(
                "requested size {} is too small; the image will be {}",
                imgforge_common::datasizes::format(requested),
                imgforge_common::datasizes::format(pt.size)
            ));
        }
        debug!(size = pt.size, partitions = pt.partitions.len(), mode = %partitioning, "planned disk");
        Ok(pt)
    }

    fn kernel_options(&self) -> Vec<String> {
        let mut opts: Vec<String> = match (self.def.kind, self.arch) {
            (Kind::Gce, _) => vec![
                "net.ifnames=0",
                "biosdevname=0",
                "scsi_mod.use_blk_mq=Y",
                "console=ttyS0,38400n8d",
            ],
            (Kind::Vhd, _) => vec![
                "rootdelay=300",
                "console=ttyS0",
                "earlyprintk=ttyS0",
                "net.ifnames=0",
            ],
            (Kind::Vmdk | Kind::Ova, _) => vec!["ro", "net.ifnames=0"],
            (Kind::IotRaw | Kind::BootcDisk | Kind::ContainerTar, _) => vec![],
            (_, Arch::Aarch64) => vec!["console=ttyAMA0", "console=tty0"],
            _ => vec!["console=tty0", "console=ttyS0,115200n8", "no_timer_check"],
        }
        .into_iter()
        .map(str::to_string)
        .collect();
        if let Some(kernel) = &self.customizations.kernel {
            opts.extend(kernel.append.split_whitespace().map(str::to_string));
        }
        if self.customizations.fips == Some(true) {
            opts.push("fips=1".to_string());
        }
        opts
    }

    fn base_packages(&self) -> Vec<String> {
        let efi = self.uefi_suffix();
        let grub_efi = format!("grub2-efi-{efi}");
        let shim = format!("shim-{efi}");
        let mode = self.def.boot_mode(self.arch);
        let mut names: Vec<&str> = vec!["@core", "kernel", "chrony", "dracut-config-generic"];
        if mode.has_uefi() {
            names.extend([grub_efi.as_str(), shim.as_str(), "efibootmgr"]);
        }
        if mode.has_legacy() && self.arch == Arch::X86_64 {
            names.push("grub2-pc");
        }
        match self.def.kind {
            Kind::Qcow2 => names.extend(["cloud-init", "qemu-guest-agent"]),
            Kind::Vhd => names.extend(["WALinuxAgent", "hyperv-daemons", "cloud-init"]),
            Kind::Vmdk | Kind::Ova => names.push("open-vm-tools"),
            Kind::Gce => names.push("google-guest-agent"),
            Kind::MinimalRawXz => names.push("NetworkManager"),
            _ => {}
        }
        if self.distro.is_rhel() {
            names.extend(["subscription-manager", "insights-client"]);
        } else {
            names.push("langpacks-en");
        }
        let c = &self.customizations;
        if c.firewall.is_some() {
            names.push("firewalld");
        }
        if c.openscap.is_some() {
            names.extend(["openscap-scanner", "scap-security-guide"]);
        }
        if c.fips == Some(true) {
            names.push("dracut-fips");
        }
        if c.subscription.as_ref().is_some_and(|s| s.rhc) {
            names.push("rhc");
        }
        names.into_iter().map(str::to_string).collect()
    }

    fn default_services(&self) -> Vec<String> {
        let services: &[&str] = match self.def.kind {
            Kind::Qcow2 => &[
                "cloud-init.service",
                "cloud-config.service",
                "cloud-final.service",
                "cloud-init-local.service",
            ],
            Kind::Vhd => &["waagent.service", "cloud-init.service"],
            Kind::Vmdk | Kind::Ova => &["vmtoolsd.service"],
            Kind::Gce => &["google-guest-agent.service", "sshd.service"],
            Kind::MinimalRawXz => &["NetworkManager.service"],
            _ => &[],
        };
        let mut out: Vec<String> = services.iter().map(|s| s.to_string()).collect();
        if self.distro.is_rhel() && self.def.kind != Kind::ContainerTar {
            out.push("rhsmcertd.service".to_string());
        }
        out
    }

    /// The blueprint's customizations, applied on top of image defaults.
    fn os_config(
        &mut self,
        base: PackageSet,
        table: Option<PartitionTable>,
    ) -> OsConfig {
        let mut config = OsConfig::new(base.with_repositories(self.repos_for("os")));
        let user_set = self.blueprint.package_set();
        if !user_set.include.is_empty() {
            config.add_package_set(user_set.with_repositories(self.repos_for("blueprint")));
        }
        config.containers = self.blueprint.container_specs();
        for spec in &mut config.containers {
            spec.arch.get_or_insert_with(|| self.arch.oci_name().to_string());
        }
        let bootable = table.is_some();
        if bootable {
            config.bootloader = Some(self.bootloader());
            config.default_target = Some("multi-user.target".to_string());
        }
        config.partition_table = table;
        config.kernel_options = self.kernel_options();
        config.enabled_services = self.default_services();

        let c = self.customizations.clone();
        config.hostname = c.hostname.clone();
        config.language = Some(self.distro.language.to_string());
        if let Some(locale) = &c.locale {
            if let Some(language) = locale.languages.first() {
                config.language = Some(language.clone());
            }
            config.keyboard = locale.keyboard.clone();
        }
        config.timezone = Some(self.distro.timezone.to_string());
        if let Some(tz) = &c.timezone {
            if let Some(zone) = &tz.timezone {
                config.timezone = Some(zone.clone());
            }
            config.ntp_servers = tz.ntpservers.clone();
        }
        config.groups = c
            .group
            .iter()
            .map(|g| (g.name.clone(), GroupOptions { gid: g.gid }))
            .collect();
        for user in &c.user {
            let password = user
                .password
                .as_deref()
                .map(|pw| crypt::ensure_crypted(pw, &mut self.rng));
            config.users.push(OsUser {
                name: user.name.clone(),
                options: UserOptions {
                    uid: user.uid,
                    gid: user.gid,
                    groups: user.groups.clone(),
                    description: user.description.clone(),
                    home: user.home.clone(),
                    shell: user.shell.clone(),
                    password,
                    key: user.key.clone(),
                    expiredate: user.expiredate,
                    force_password_reset: user.force_password_reset,
                },
            });
        }
        if let Some(fw) = &c.firewall {
            let services = fw.services.clone().unwrap_or_default();
            config.firewall = Some(FirewallOptions {
                ports: fw.ports.clone(),
                enabled_services: services.enabled,
                disabled_services: services.disabled,
                default_zone: fw.default_zone.clone(),
            });
        }
        if let Some(services) = &c.services {
            config.enabled_services.extend(services.enabled.iter().cloned());
            config.disabled_services = services.disabled.clone();
            config.masked_services = services.masked.clone();
        }
        config.directories = c
            .directories
            .iter()
            .map(|d| MkdirPath {
                path: d.path.clone(),
                mode: d.mode.as_deref().and_then(|m| u32::from_str_radix(m, 8).ok()),
                parents: d.ensure_parents,
                exist_ok: true,
            })
            .collect();
        config.files = c
            .files
            .iter()
            .map(|f| FileData {
                path: f.path.clone(),
                mode: f.mode.clone(),
                data: f.data.as_bytes().to_vec(),
            })
            .collect();
        if let Some(ca) = &c.cacerts {
            config.ca_certs = ca.pem_certs.clone();
        }
        if let Some(fb) = &c.firstboot {
            if !fb.scripts.is_empty() {
                config.firstboot = Some(FirstBootOptions {
                    commands: fb.scripts.clone(),
                    wait_for_network: fb.wait_for_network,
                });
            }
        }
        if let Some(scap) = &c.openscap {
            if scap.tailoring.is_some() {
                self.warn(format!(
                    "openscap tailoring is not applied; remediating with profile {}",
                    scap.profile_id
                ));
            }
            config.oscap = Some(OscapConfig {
                datastream: scap
                    .datastream
                    .clone()
                    .unwrap_or_else(|| self.distro.oscap_datastream.to_string()),
                profile_id: scap.profile_id.clone(),
                tailoring: None,
                compress_results: false,
            });
        }
        if self.distro.is_rhel() && bootable {
            config.sysconfig = Some(SysconfigOptions {
                kernel: Some(SysconfigKernel {
                    update_default: true,
                    default_kernel: "kernel".to_string(),
                }),
                network: Some(SysconfigNetwork {
                    networking: true,
                    no_zero_conf: true,
                }),
            });
            config
                .rhsm_facts
                .insert("imgforge.image-type".to_string(), json!(self.def.name));
            if let Some(sub) = &c.subscription {
                config.rhsm_facts.insert(
                    "imgforge.subscription.organization".to_string(),
                    json!(sub.organization),
                );
                if sub.insights {
                    config.enabled_services.push("insights-client.timer".to_string());
                }
            }
        }
        match self.def.kind {
            Kind::Vhd => {
                config.cloud_init.push(CloudInitOptions {
                    filename: "10-azure-kvp.cfg".to_string(),
                    config: json!({
                        "reporting": {
                            "logging": {"type": "log"},
                            "telemetry": {"type": "hyperv"}
                        }
                    }),
                });
                config.modprobe.push(ModprobeOptions {
                    filename: "blacklist-nouveau.conf".to_string(),
                    commands: vec![ModprobeCommand {
                        command: "blacklist".to_string(),
                        modulename: "nouveau".to_string(),
                        cmdline: None,
                    }],
                });
                config.sshd = Some(SshdConfig {
                    client_alive_interval: Some(180),
                    ..Default::default()
                });
            }
            Kind::Gce => {
                config.sshd = Some(SshdConfig {
                    password_authentication: Some(false),
                    client_alive_interval: Some(420),
                    permit_root_login: Some("no".to_string()),
                    ..Default::default()
                });
            }
            _ => {}
        }
        config
    }

    /// A package-based OS installed onto a partitioned disk, converted to
    /// the delivered format.
    fn os_disk(&mut self, options: &ImageOptions) -> Result<PreManifest, ImageTypeError> {
        let mut pm = PreManifest::new();
        pm.add(self.build_pipeline(&[]));
        let pt = self.plan_disk(options, Layout::Standard)?;
        let base = PackageSet::new(self.base_packages());
        let config = self.os_config(base, Some(pt.clone()));
        pm.add(OsPipeline::new(OS_PIPELINE, BUILD_PIPELINE, config));
        pm.add(
            DiskImagePipeline::new(IMAGE_PIPELINE, BUILD_PIPELINE, OS_PIPELINE, IMAGE_FILE, pt)
                .with_bootloader(self.bootloader()),
        );

        let filename = self.def.filename;
        match self.def.kind {
            Kind::Qcow2 => pm.add(QemuPipeline::new(
                "qcow2",
                BUILD_PIPELINE,
                IMAGE_PIPELINE,
                IMAGE_FILE,
                filename,
                QemuFormat::Qcow2 {
                    compat: Some("1.1".to_string()),
                },
            )),
            Kind::Vhd => pm.add(QemuPipeline::new(
                "vpc",
                BUILD_PIPELINE,
                IMAGE_PIPELINE,
                IMAGE_FILE,
                filename,
                QemuFormat::Vpc {
                    force_size: Some(true),
                    subformat: Some("fixed".to_string()),
                },
            )),
            Kind::Vmdk => pm.add(vmdk_pipeline(filename)),
            Kind::Ova => {
                let vmdk_file = "disk.vmdk";
                pm.add(vmdk_pipeline(vmdk_file));
                let ovf = OvaPipeline::new("ovf", BUILD_PIPELINE, "vmdk", vmdk_file);
                let contents = ovf.contents();
                let paths: Vec<&str> = contents.iter().map(String::as_str).collect();
                pm.add(ovf);
                pm.add(
                    ArchivePipeline::tar("archive", BUILD_PIPELINE, "ovf", filename)
                        .with_paths(&paths)
                        .with_format(TarFormat::Ustar),
                );
            }
            Kind::Gce => pm.add(
                ArchivePipeline::tar("archive", BUILD_PIPELINE, IMAGE_PIPELINE, filename)
                    .with_paths(&[IMAGE_FILE])
                    .with_format(TarFormat::Oldgnu)
                    .with_compression("auto"),
            ),
            Kind::MinimalRawXz => pm.add(CompressPipeline::xz(
                "xz",
                BUILD_PIPELINE,
                IMAGE_PIPELINE,
                IMAGE_FILE,
                filename,
            )),
            Kind::Raw | Kind::ContainerTar | Kind::IotRaw | Kind::BootcDisk => {}
        }
        pm.add_export(self.def.export);
        Ok(pm)
    }

    /// An OS tree without kernel or boot loader, archived as-is.
    fn container_tar(&mut self) -> Result<PreManifest, ImageTypeError> {
        let mut pm = PreManifest::new();
        pm.add(self.build_pipeline(&[]));
        let mut base = PackageSet::new(CONTAINER_PACKAGES.iter().copied());
        base.exclude = CONTAINER_EXCLUDES.iter().map(|p| p.to_string()).collect();
        base.install_weak_deps = false;
        let config = self.os_config(base, None);
        pm.add(OsPipeline::new(OS_PIPELINE, BUILD_PIPELINE, config));
        pm.add(
            ArchivePipeline::tar("container", BUILD_PIPELINE, OS_PIPELINE, self.def.filename)
                .preserving_metadata(),
        );
        pm.add_export(self.def.export);
        Ok(pm)
    }

    /// A deployed ostree commit on a compressed raw disk.
    fn iot_raw(&mut self, options: &ImageOptions) -> Result<PreManifest, ImageTypeError> {
        let defaults = self.distro.ostree.ok_or_else(|| ImageTypeError::InvalidOption {
            image_type: self.def.name.to_string(),
            option: "ostree",
            reason: format!("{} has no ostree defaults", self.distro.name),
        })?;
        let requested = options.ostree.clone().unwrap_or_default();
        let reference = requested
            .reference
            .unwrap_or_else(|| defaults.reference_for(self.arch));
        if !ostree::is_valid_ref(&reference) {
            return Err(ImageTypeError::InvalidOption {
                image_type: self.def.name.to_string(),
                option: "ostree.ref",
                reason: format!("{reference:?} is not a valid ref"),
            });
        }
        let mut commit = ostree::SourceSpec::new(
            requested.url.unwrap_or_else(|| defaults.url.to_string()),
            reference,
        );
        commit.parent = requested.parent;
        commit.rhsm = requested.rhsm;

        let mut pm = PreManifest::new();
        pm.add(self.build_pipeline(&["ostree", "rpm-ostree"]));
        let pt = self.plan_disk(options, Layout::Ostree)?;
        let deployment = "ostree-deployment";
        pm.add(
            OstreeDeploymentPipeline::new(deployment, BUILD_PIPELINE, commit, defaults.osname, pt.clone())
                .with_remote(defaults.osname)
                .with_kernel_options(self.kernel_options()),
        );
        pm.add(
            DiskImagePipeline::new(IMAGE_PIPELINE, BUILD_PIPELINE, deployment, "image.raw", pt)
                .with_bootloader(self.bootloader()),
        );
        pm.add(CompressPipeline::xz(
            "xz",
            BUILD_PIPELINE,
            IMAGE_PIPELINE,
            "image.raw",
            self.def.filename,
        ));
        pm.add_export(self.def.export);
        Ok(pm)
    }

    /// A bootable container unpacked onto a disk and made bootable with
    /// bootupd.
    fn bootc_disk(&mut self, options: &ImageOptions) -> Result<PreManifest, ImageTypeError> {
        let source = options
            .bootc_ref
            .clone()
            .unwrap_or_else(|| self.distro.bootc_image.to_string());
        let mut image = crate::container::SourceSpec::new(source);
        image.arch = Some(self.arch.oci_name().to_string());

        let mut pm = PreManifest::new();
        pm.add(self.build_pipeline(&["bootupd", "skopeo"]));
        let pt = self.plan_disk(options, Layout::Standard)?;
        pm.add(ContainerTreePipeline::new("tree", BUILD_PIPELINE, image, pt.clone()));
        pm.add(ContainerDiskPipeline::new(
            IMAGE_PIPELINE,
            BUILD_PIPELINE,
            "tree",
            self.def.filename,
            pt,
        ));
        pm.add_export(self.def.export);
        Ok(pm)
    }
}

fn vmdk_pipeline(filename: &str) -> QemuPipeline {
    QemuPipeline::new(
        "vmdk",
        BUILD_PIPELINE,
        IMAGE_PIPELINE,
        IMAGE_FILE,
        filename,
        QemuFormat::Vmdk {
            subformat: Some("streamOptimized".to_string()),
            adapter_type: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use crate::blueprint::Blueprint;
    use crate::imagetype::{self, ImageOptions, ImageType, ImageTypeError, OstreeImageOptions};
    use crate::pipeline::RuntimeOptions;
    use crate::pipeline::testutil::resolve_all;
    use crate::rpmmd::RepoConfig;
    use std::collections::BTreeMap;

    fn repos() -> Vec<RepoConfig> {
        vec![RepoConfig {
            id: "baseos".into(),
            name: "baseos".into(),
            baseurl: vec!["https://repo.example.com/baseos".into()],
            check_gpg: true,
            gpgkeys: vec!["-----BEGIN PGP PUBLIC KEY BLOCK-----".into()],
            ..Default::default()
        }]
    }

    fn pipelines(distro: &str, arch: &str, name: &str, bp: &Blueprint) -> Vec<String> {
        let it = imagetype::get(distro, arch, name).unwrap();
        let (pm, _) = it.manifest(bp, &ImageOptions::default(), &repos(), 0).unwrap();
        pm.pipeline_names().into_iter().map(str::to_string).collect()
    }

    #[test]
    fn qcow2_graph() {
        let names = pipelines("fedora-42", "x86_64", "qcow2", &Blueprint::default());
        assert_eq!(names, ["build", "os", "image", "qcow2"]);
    }

    #[test]
    fn ova_packs_the_descriptor_tree() {
        let names = pipelines("rhel-9.6", "x86_64", "ova", &Blueprint::default());
        assert_eq!(names, ["build", "os", "image", "vmdk", "ovf", "archive"]);
    }

    #[test]
    fn export_matches_last_pipeline() {
        for it in imagetype::all() {
            let (pm, _) = it
                .manifest(&Blueprint::default(), &ImageOptions::default(), &repos(), 0)
                .unwrap();
            let last = *pm.pipeline_names().last().unwrap();
            assert_eq!(it.exports(), [last], "{}", it.name());
            assert_eq!(pm.export_filename(last), Some(it.filename()), "{}", it.name());
        }
    }

    #[test]
    fn blueprint_packages_form_a_second_set() {
        let bp = Blueprint::from_json(r#"{"packages": [{"name": "tmux"}]}"#).unwrap();
        let it = imagetype::get("fedora", "aarch64", "raw").unwrap();
        let (pm, _) = it.manifest(&bp, &ImageOptions::default(), &repos(), 0).unwrap();
        let chains = pm.package_set_chains();
        assert_eq!(chains["os"].len(), 2);
        assert_eq!(chains["os"][1].include, ["tmux"]);
        assert_eq!(chains["build"].len(), 1);
        assert!(chains["os"][0].include.contains(&"shim-aa64".to_string()));
    }

    #[test]
    fn unsupported_customization_is_rejected() {
        let bp = Blueprint::from_json(r#"{"customizations": {"hostname": "box"}}"#).unwrap();
        let it = imagetype::get("fedora", "x86_64", "iot-raw").unwrap();
        let err = it
            .manifest(&bp, &ImageOptions::default(), &repos(), 0)
            .unwrap_err();
        assert!(matches!(err, ImageTypeError::Blueprint(_)));
        assert!(err.to_string().contains("hostname"), "{err}");
    }

    #[test]
    fn subscription_is_rhel_only() {
        let bp = Blueprint::from_json(
            r#"{"customizations": {"subscription": {"organization": "42", "activation_key": "k"}}}"#,
        )
        .unwrap();
        let fedora = imagetype::get("fedora", "x86_64", "qcow2").unwrap();
        assert!(fedora.manifest(&bp, &ImageOptions::default(), &repos(), 0).is_err());
        let rhel = imagetype::get("rhel-9", "x86_64", "qcow2").unwrap();
        assert!(rhel.manifest(&bp, &ImageOptions::default(), &repos(), 0).is_ok());
    }

    #[test]
    fn blueprint_distro_must_match() {
        let bp = Blueprint::from_json(r#"{"distro": "rhel-9.6"}"#).unwrap();
        let it = imagetype::get("fedora", "x86_64", "raw").unwrap();
        let err = it
            .manifest(&bp, &ImageOptions::default(), &repos(), 0)
            .unwrap_err();
        assert!(matches!(err, ImageTypeError::DistroMismatch { .. }));
    }

    #[test]
    fn iot_raw_requests_the_commit() {
        let it = imagetype::get("fedora", "x86_64", "iot-raw").unwrap();
        let options = ImageOptions {
            ostree: Some(OstreeImageOptions {
                reference: Some("fedora/42/x86_64/iot".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (pm, _) = it.manifest(&Blueprint::default(), &options, &repos(), 0).unwrap();
        let specs = pm.ostree_source_specs();
        assert_eq!(specs.keys().collect::<Vec<_>>(), ["ostree-deployment"]);
        assert_eq!(specs["ostree-deployment"][0].reference, "fedora/42/x86_64/iot");
        assert_eq!(specs["ostree-deployment"][0].url, "https://ostree.fedoraproject.org/iot");

        let bad = ImageOptions {
            ostree: Some(OstreeImageOptions {
                reference: Some("not a ref".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            it.manifest(&Blueprint::default(), &bad, &repos(), 0),
            Err(ImageTypeError::InvalidOption { option: "ostree.ref", .. })
        ));
    }

    #[test]
    fn bootc_disk_drops_swap_with_a_warning() {
        let bp = Blueprint::from_json(r#"{"customizations": {"disk": {"swap": "1 GiB"}}}"#).unwrap();
        let it = imagetype::get("rhel-9", "aarch64", "bootc-disk").unwrap();
        let (pm, warnings) = it.manifest(&bp, &ImageOptions::default(), &repos(), 0).unwrap();
        assert!(warnings.iter().any(|w| w.contains("swap")), "{warnings:?}");
        let specs = pm.container_source_specs();
        assert_eq!(specs["tree"][0].arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn small_size_request_warns() {
        let it = imagetype::get("fedora", "x86_64", "raw").unwrap();
        let options: ImageOptions = serde_json::from_str(r#"{"size": "1 MiB"}"#).unwrap();
        let (_, warnings) = it.manifest(&Blueprint::default(), &options, &repos(), 0).unwrap();
        assert!(warnings.iter().any(|w| w.contains("too small")), "{warnings:?}");
    }

    #[test]
    fn same_seed_same_manifest() {
        let bp = Blueprint::from_json(
            r#"{"customizations": {"user": [{"name": "admin", "password": "secret"}]}}"#,
        )
        .unwrap();
        let it = imagetype::get("rhel-9.6", "x86_64", "qcow2").unwrap();
        let render = |seed| {
            let (pm, _) = it.manifest(&bp, &ImageOptions::default(), &repos(), seed).unwrap();
            pm.serialize(&resolve_all(&pm), &BTreeMap::new(), &BTreeMap::new(), RuntimeOptions::default())
                .unwrap()
        };
        assert_eq!(render(7), render(7));
        assert_ne!(render(7), render(8));
        let text = String::from_utf8(render(7)).unwrap();
        assert!(!text.contains("\"secret\""));
    }
}
