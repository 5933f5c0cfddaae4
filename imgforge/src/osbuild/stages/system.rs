//! Stages that configure the installed operating system.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::stage::StageKind;

fn is_account_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'))
}

fn check_unit_names(
    stage: &'static str,
    field: &str,
    units: &[String],
) -> Result<(), StageError> {
    for unit in units {
        if unit.is_empty() || unit.contains('/') || unit.chars().any(char::is_whitespace) {
            return Err(invalid(stage, field, format!("invalid unit name {unit:?}")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Crypted password; plain text never reaches the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiredate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_password_reset: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsersOptions {
    pub users: BTreeMap<String, UserOptions>,
}

impl StageKind for UsersOptions {
    const TYPE: &'static str = "org.osbuild.users";
    const PATHS_CHANGED: &'static [&'static str] =
        &["/etc/passwd", "/etc/shadow", "/etc/group", "/etc/gshadow", "/home"];

    fn validate(&self) -> Result<(), StageError> {
        for (name, user) in &self.users {
            if !is_account_name(name) {
                return Err(invalid(Self::TYPE, "users", format!("invalid user name {name:?}")));
            }
            if let Some(pw) = &user.password {
                if !crate::crypt::is_crypted(pw) {
                    return Err(invalid(
                        Self::TYPE,
                        format!("users.{name}.password"),
                        "password must be crypted",
                    ));
                }
            }
            if let Some(home) = &user.home {
                super::check_abs_path(Self::TYPE, &format!("users.{name}.home"), home)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupsOptions {
    pub groups: BTreeMap<String, GroupOptions>,
}

impl StageKind for GroupsOptions {
    const TYPE: &'static str = "org.osbuild.groups";
    const PATHS_CHANGED: &'static [&'static str] =
        &["/etc/group", "/etc/gshadow", "/etc/group-", "/etc/gshadow-"];

    fn validate(&self) -> Result<(), StageError> {
        match self.groups.keys().find(|n| !is_account_name(n)) {
            Some(name) => Err(invalid(Self::TYPE, "groups", format!("invalid group name {name:?}"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemdOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<String>,
}

impl StageKind for SystemdOptions {
    const TYPE: &'static str = "org.osbuild.systemd";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/systemd/system"];

    fn validate(&self) -> Result<(), StageError> {
        check_unit_names(Self::TYPE, "enabled_services", &self.enabled_services)?;
        check_unit_names(Self::TYPE, "disabled_services", &self.disabled_services)?;
        check_unit_names(Self::TYPE, "masked_services", &self.masked_services)?;
        if let Some(target) = &self.default_target {
            if !target.ends_with(".target") {
                return Err(invalid(
                    Self::TYPE,
                    "default_target",
                    format!("{target:?} is not a target unit"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostnameOptions {
    pub hostname: String,
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl StageKind for HostnameOptions {
    const TYPE: &'static str = "org.osbuild.hostname";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/hostname"];

    fn validate(&self) -> Result<(), StageError> {
        if !is_hostname(&self.hostname) {
            return Err(invalid(
                Self::TYPE,
                "hostname",
                format!("{:?} is not a valid host name", self.hostname),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocaleOptions {
    pub language: String,
}

impl StageKind for LocaleOptions {
    const TYPE: &'static str = "org.osbuild.locale";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/locale.conf"];

    fn validate(&self) -> Result<(), StageError> {
        if self.language.is_empty() || self.language.chars().any(char::is_whitespace) {
            return Err(invalid(
                Self::TYPE,
                "language",
                format!("invalid locale {:?}", self.language),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimezoneOptions {
    pub zone: String,
}

impl StageKind for TimezoneOptions {
    const TYPE: &'static str = "org.osbuild.timezone";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/localtime"];

    fn validate(&self) -> Result<(), StageError> {
        let valid = !self.zone.is_empty()
            && !self.zone.starts_with('/')
            && !self.zone.split('/').any(|part| part == "..")
            && !self.zone.chars().any(char::is_whitespace);
        if !valid {
            return Err(invalid(Self::TYPE, "zone", format!("invalid zone {:?}", self.zone)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X11Keymap {
    pub layouts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeymapOptions {
    pub keymap: String,
    #[serde(rename = "x11-keymap", default, skip_serializing_if = "Option::is_none")]
    pub x11_keymap: Option<X11Keymap>,
}

impl StageKind for KeymapOptions {
    const TYPE: &'static str = "org.osbuild.keymap";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/vconsole.conf"];

    fn validate(&self) -> Result<(), StageError> {
        if self.keymap.is_empty() {
            return Err(invalid(Self::TYPE, "keymap", "empty"));
        }
        if self.x11_keymap.as_ref().is_some_and(|x| x.layouts.is_empty()) {
            return Err(invalid(Self::TYPE, "x11-keymap.layouts", "at least one layout is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelinuxOptions {
    pub file_contexts: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_autorelabel: bool,
}

impl SelinuxOptions {
    pub fn targeted() -> Self {
        Self {
            file_contexts: "etc/selinux/targeted/contexts/files/file_contexts".to_string(),
            labels: BTreeMap::new(),
            force_autorelabel: false,
        }
    }
}

impl StageKind for SelinuxOptions {
    const TYPE: &'static str = "org.osbuild.selinux";
    const PATHS_CHANGED: &'static [&'static str] = &["/"];

    fn validate(&self) -> Result<(), StageError> {
        if self.file_contexts.is_empty() || self.file_contexts.starts_with('/') {
            return Err(invalid(
                Self::TYPE,
                "file_contexts",
                "must be a path relative to the tree root",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SysconfigKernel {
    pub update_default: bool,
    pub default_kernel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SysconfigNetwork {
    pub networking: bool,
    pub no_zero_conf: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SysconfigOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<SysconfigKernel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<SysconfigNetwork>,
}

impl StageKind for SysconfigOptions {
    const TYPE: &'static str = "org.osbuild.sysconfig";
    const PATHS_CHANGED: &'static [&'static str] =
        &["/etc/sysconfig/kernel", "/etc/sysconfig/network"];

    fn validate(&self) -> Result<(), StageError> {
        if self.kernel.is_none() && self.network.is_none() {
            return Err(invalid(Self::TYPE, "kernel", "nothing to configure"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SshdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_authentication: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_response_authentication: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_alive_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_root_login: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshdConfigOptions {
    pub config: SshdConfig,
}

impl StageKind for SshdConfigOptions {
    const TYPE: &'static str = "org.osbuild.sshd.config";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/ssh/sshd_config"];

    fn validate(&self) -> Result<(), StageError> {
        if let Some(value) = &self.config.permit_root_login {
            if !matches!(
                value.as_str(),
                "yes" | "no" | "prohibit-password" | "forced-commands-only"
            ) {
                return Err(invalid(
                    Self::TYPE,
                    "config.PermitRootLogin",
                    format!("unsupported value {value:?}"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModprobeCommand {
    /// Only `blacklist` and `install` are understood.
    pub command: String,
    pub modulename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModprobeOptions {
    pub filename: String,
    pub commands: Vec<ModprobeCommand>,
}

impl StageKind for ModprobeOptions {
    const TYPE: &'static str = "org.osbuild.modprobe";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/modprobe.d"];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if !self.filename.ends_with(".conf") {
            return Err(invalid(Self::TYPE, "filename", "must end in .conf"));
        }
        for (i, cmd) in self.commands.iter().enumerate() {
            match cmd.command.as_str() {
                "blacklist" if cmd.cmdline.is_none() => {}
                "install" if cmd.cmdline.is_some() => {}
                _ => {
                    return Err(invalid(
                        Self::TYPE,
                        format!("commands[{i}]"),
                        format!("invalid command {:?}", cmd.command),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitOptions {
    pub filename: String,
    pub config: Value,
}

impl StageKind for CloudInitOptions {
    const TYPE: &'static str = "org.osbuild.cloud-init";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/cloud/cloud.cfg.d"];

    fn validate(&self) -> Result<(), StageError> {
        super::check_filename(Self::TYPE, "filename", &self.filename)?;
        if !self.filename.ends_with(".cfg") {
            return Err(invalid(Self::TYPE, "filename", "must end in .cfg"));
        }
        if !self.config.is_object() {
            return Err(invalid(Self::TYPE, "config", "must be an object"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirstBootOptions {
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_for_network: bool,
}

impl StageKind for FirstBootOptions {
    const TYPE: &'static str = "org.osbuild.first-boot";
    const PATHS_CHANGED: &'static [&'static str] =
        &["/etc/osbuild-first-boot", "/etc/systemd/system"];

    fn validate(&self) -> Result<(), StageError> {
        if self.commands.is_empty() {
            return Err(invalid(Self::TYPE, "commands", "at least one command is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RhsmFactsOptions {
    pub facts: BTreeMap<String, Value>,
}

impl StageKind for RhsmFactsOptions {
    const TYPE: &'static str = "org.osbuild.rhsm.facts";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/rhsm/facts"];

    fn validate(&self) -> Result<(), StageError> {
        if self.facts.is_empty() {
            return Err(invalid(Self::TYPE, "facts", "at least one fact is required"));
        }
        Ok(())
    }
}

/// Regenerate the trust store from the anchors present in the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCaTrustOptions {}

impl StageKind for UpdateCaTrustOptions {
    const TYPE: &'static str = "org.osbuild.pki.update-ca-trust";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/pki/ca-trust/extracted"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OscapConfig {
    pub datastream: String,
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailoring: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compress_results: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OscapRemediationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    pub config: OscapConfig,
}

impl StageKind for OscapRemediationOptions {
    const TYPE: &'static str = "org.osbuild.oscap.remediation";
    const PATHS_CHANGED: &'static [&'static str] = &["/"];

    fn validate(&self) -> Result<(), StageError> {
        super::check_abs_path(Self::TYPE, "config.datastream", &self.config.datastream)?;
        if self.config.profile_id.is_empty() {
            return Err(invalid(Self::TYPE, "config.profile_id", "empty"));
        }
        if let Some(dir) = &self.data_dir {
            super::check_abs_path(Self::TYPE, "data_dir", dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_zone: Option<String>,
}

fn is_port_spec(spec: &str) -> bool {
    let Some((ports, proto)) = spec.split_once(':') else {
        return false;
    };
    let ports_ok = ports
        .split('-')
        .all(|p| p.parse::<u16>().is_ok_and(|n| n > 0));
    ports_ok && matches!(proto, "tcp" | "udp" | "sctp" | "dccp")
}

impl StageKind for FirewallOptions {
    const TYPE: &'static str = "org.osbuild.firewall";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/firewalld"];

    fn validate(&self) -> Result<(), StageError> {
        if let Some(port) = self.ports.iter().find(|p| !is_port_spec(p)) {
            return Err(invalid(
                Self::TYPE,
                "ports",
                format!("{port:?} is not of the form port[-port]:protocol"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChronyServer {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minpoll: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxpoll: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iburst: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChronyOptions {
    pub servers: Vec<ChronyServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leapsectz: Option<String>,
}

impl StageKind for ChronyOptions {
    const TYPE: &'static str = "org.osbuild.chrony";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/chrony.conf"];

    fn validate(&self) -> Result<(), StageError> {
        for (i, server) in self.servers.iter().enumerate() {
            if server.hostname.is_empty() {
                return Err(invalid(Self::TYPE, format!("servers[{i}].hostname"), "empty"));
            }
            if let (Some(min), Some(max)) = (server.minpoll, server.maxpoll) {
                if min > max {
                    return Err(invalid(
                        Self::TYPE,
                        format!("servers[{i}]"),
                        "minpoll is larger than maxpoll",
                    ));
                }
            }
        }
        Ok(())
    }
}
