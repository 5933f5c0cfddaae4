use serde::{Deserialize, Serialize};

use crate::osbuild::error::{StageError, invalid};
use crate::osbuild::inputs::InputKind;
use crate::osbuild::stage::StageKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpmExclude {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub docs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpmOptions {
    /// Armored public keys imported before installing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpgkeys: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_dracut: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<RpmExclude>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_langs: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ostree_booted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbpath: Option<String>,
}

impl StageKind for RpmOptions {
    const TYPE: &'static str = "org.osbuild.rpm";
    const INPUTS: &'static [(&'static str, InputKind)] = &[("packages", InputKind::Files)];
    const PATHS_CHANGED: &'static [&'static str] = &["/"];

    fn validate(&self) -> Result<(), StageError> {
        if self.gpgkeys.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid(Self::TYPE, "gpgkeys", "empty key"));
        }
        if let Some(dbpath) = &self.dbpath {
            super::check_abs_path(Self::TYPE, "dbpath", dbpath)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnfVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnfMainConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_resolve: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnfConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<DnfMainConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnfConfigOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<DnfVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DnfConfig>,
}

impl StageKind for DnfConfigOptions {
    const TYPE: &'static str = "org.osbuild.dnf.config";
    const PATHS_CHANGED: &'static [&'static str] = &["/etc/dnf/dnf.conf", "/etc/dnf/vars"];

    fn validate(&self) -> Result<(), StageError> {
        for var in &self.variables {
            if var.name.is_empty()
                || !var
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(invalid(
                    Self::TYPE,
                    "variables",
                    format!("invalid variable name {:?}", var.name),
                ));
            }
        }
        if let Some(ip) = self
            .config
            .as_ref()
            .and_then(|c| c.main.as_ref())
            .and_then(|m| m.ip_resolve.as_deref())
        {
            if !matches!(ip, "4" | "6" | "IPv4" | "IPv6" | "ipv4" | "ipv6") {
                return Err(invalid(
                    Self::TYPE,
                    "config.main.ip_resolve",
                    format!("unsupported value {ip:?}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osbuild::inputs::Input;
    use crate::osbuild::stage::Stage;
    use crate::rpmmd::PackageSpec;

    #[test]
    fn rpm_stage_needs_packages_input() {
        assert!(Stage::new(RpmOptions::default()).is_err());
        let pkgs = [PackageSpec {
            name: "bash".into(),
            checksum: "sha256:aa".into(),
            ..Default::default()
        }];
        let stage =
            Stage::with_inputs(RpmOptions::default(), [("packages", Input::packages(&pkgs))])
                .unwrap();
        assert_eq!(stage.type_name(), "org.osbuild.rpm");
    }

    #[test]
    fn dnf_variable_names_are_checked() {
        let options = DnfConfigOptions {
            variables: vec![DnfVariable {
                name: "release ver".into(),
                value: "9".into(),
            }],
            config: None,
        };
        assert!(options.validate().is_err());
    }
}
