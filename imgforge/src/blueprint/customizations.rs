//! The `customizations` section of a blueprint.

use imgforge_common::Size;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KernelCustomization {
    /// Kernel package to install instead of the image type's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extra arguments appended to the kernel command line.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub append: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UserCustomization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plain text or already crypted; plain text is hashed before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SSH public key installed for the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Account expiry in days since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiredate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_password_reset: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GroupCustomization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimezoneCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ntpservers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocaleCustomization {
    /// The first language becomes the system locale.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FirewallServices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FirewallCustomization {
    /// `port:protocol` or `service:protocol` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<FirewallServices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServicesCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FilesystemCustomization {
    pub mountpoint: String,
    /// Minimum size, as bytes or a size string such as `"2 GiB"`.
    #[serde(default)]
    pub minsize: Size,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClevisCustomization {
    pub pin: String,
    /// Pin policy as a JSON document.
    pub policy: String,
    #[serde(default)]
    pub remove_passphrase: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EncryptionCustomization {
    pub passphrase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clevis: Option<ClevisCustomization>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiskCustomization {
    /// Smallest disk the image may be laid out on.
    #[serde(default, skip_serializing_if = "Size::is_zero")]
    pub minsize: Size,
    /// Size of a swap area; no swap when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<Size>,
    /// Encrypt the root filesystem with LUKS2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionCustomization>,
    /// Name of the volume group created in LVM modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OpenScapTailoring {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unselected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OpenScapCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastream: Option<String>,
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailoring: Option<OpenScapTailoring>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubscriptionCustomization {
    pub organization: String,
    pub activation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub insights: bool,
    #[serde(default)]
    pub rhc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CaCustomization {
    /// PEM encoded CA certificates to trust.
    #[serde(default)]
    pub pem_certs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FirstbootCustomization {
    /// Shell commands run once on first boot, in order.
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub wait_for_network: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IgnitionFirstboot {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IgnitionCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstboot: Option<IgnitionFirstboot>,
    /// Base64 encoded ignition config embedded in the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KickstartCustomization {
    pub contents: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DirectoryCustomization {
    pub path: String,
    /// Octal mode such as `"0755"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub ensure_parents: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileCustomization {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub data: String,
}

/// Everything a blueprint may change about the image. Absent fields keep
/// the image type's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Customizations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user: Vec<UserCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<GroupCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<TimezoneCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<LocaleCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystem: Vec<FilesystemCustomization>,
    /// One of `raw`, `lvm`, `auto-lvm`, `btrfs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openscap: Option<OpenScapCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacerts: Option<CaCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstboot: Option<FirstbootCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition: Option<IgnitionCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickstart: Option<KickstartCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<DirectoryCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fips: Option<bool>,
}

impl Customizations {
    /// Names of the top-level fields that are set.
    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let mut check = |name: &'static str, set: bool| {
            if set {
                fields.push(name);
            }
        };
        check("hostname", self.hostname.is_some());
        check("kernel", self.kernel.is_some());
        check("user", !self.user.is_empty());
        check("group", !self.group.is_empty());
        check("timezone", self.timezone.is_some());
        check("locale", self.locale.is_some());
        check("firewall", self.firewall.is_some());
        check("services", self.services.is_some());
        check("filesystem", !self.filesystem.is_empty());
        check("partitioning_mode", self.partitioning_mode.is_some());
        check("disk", self.disk.is_some());
        check("openscap", self.openscap.is_some());
        check("subscription", self.subscription.is_some());
        check("cacerts", self.cacerts.is_some());
        check("firstboot", self.firstboot.is_some());
        check("ignition", self.ignition.is_some());
        check("kickstart", self.kickstart.is_some());
        check("directories", !self.directories.is_empty());
        check("files", !self.files.is_empty());
        check("fips", self.fips.is_some());
        fields
    }
}
