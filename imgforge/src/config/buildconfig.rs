//! Build configs: a named blueprint plus image options, and the config
//! list that maps them onto distro/arch/image-type globs.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ConfigError, read};
use crate::blueprint::Blueprint;
use crate::imagetype::ImageOptions;

/// Another config whose artifact this one builds on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BuildDependency {
    pub config: String,
    pub image_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Blueprint>,
    #[serde(default)]
    pub options: ImageOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<BuildDependency>,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(path, &read(path)?)
    }

    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let config: BuildConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.name.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: "name must not be empty".into(),
            });
        }
        if let Some(bp) = &config.blueprint {
            bp.validate()?;
        }
        Ok(config)
    }

    pub fn blueprint(&self) -> Blueprint {
        self.blueprint.clone().unwrap_or_default()
    }
}

/// Globs selecting the image types a config applies to. An empty list
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigFilters {
    #[serde(default)]
    pub distros: Vec<String>,
    #[serde(default)]
    pub arches: Vec<String>,
    #[serde(default)]
    pub image_types: Vec<String>,
}

/// One entry of a config list. Relative paths are resolved against the
/// list's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigItem {
    pub path: PathBuf,
    #[serde(default)]
    pub filters: ConfigFilters,
}

#[derive(Debug, Clone)]
struct Entry {
    config: BuildConfig,
    distros: Vec<Pattern>,
    arches: Vec<Pattern>,
    image_types: Vec<Pattern>,
}

fn patterns(path: &Path, globs: &[String]) -> Result<Vec<Pattern>, ConfigError> {
    globs
        .iter()
        .map(|g| {
            Pattern::new(g).map_err(|e| ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!("bad glob {g:?}: {e}"),
            })
        })
        .collect()
}

fn any_match(patterns: &[Pattern], value: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.matches(value))
}

/// Build configs with the image types they apply to.
#[derive(Debug, Clone, Default)]
pub struct BuildConfigs {
    entries: Vec<Entry>,
}

impl BuildConfigs {
    /// A single config applied to every image type.
    pub fn single(config: BuildConfig) -> Self {
        Self {
            entries: vec![Entry {
                config,
                distros: Vec::new(),
                arches: Vec::new(),
                image_types: Vec::new(),
            }],
        }
    }

    /// Load a config list file: a JSON array of [`ConfigItem`]s.
    pub fn load_list(path: &Path) -> Result<Self, ConfigError> {
        let items: Vec<ConfigItem> =
            serde_json::from_str(&read(path)?).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or(Path::new("."));
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let config_path = if item.path.is_absolute() {
                item.path.clone()
            } else {
                base.join(&item.path)
            };
            let config = BuildConfig::load(&config_path)?;
            debug!(config = %config.name, path = %config_path.display(), "loaded build config");
            entries.push(Entry {
                config,
                distros: patterns(path, &item.filters.distros)?,
                arches: patterns(path, &item.filters.arches)?,
                image_types: patterns(path, &item.filters.image_types)?,
            });
        }
        let configs = Self { entries };
        configs.check_dependencies()?;
        Ok(configs)
    }

    /// Load every `*.json` file of `dir` except the config list itself,
    /// applying each to every image type. A `config-list.json` in `dir`
    /// takes precedence.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let list = dir.join("config-list.json");
        if list.is_file() {
            return Self::load_list(&list);
        }
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        let mut configs = Self::default();
        for path in paths {
            configs.entries.extend(Self::single(BuildConfig::load(&path)?).entries);
        }
        configs.check_dependencies()?;
        Ok(configs)
    }

    fn check_dependencies(&self) -> Result<(), ConfigError> {
        let names: BTreeSet<&str> = self.entries.iter().map(|e| e.config.name.as_str()).collect();
        for entry in &self.entries {
            if let Some(dep) = &entry.config.depends {
                if !names.contains(dep.config.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        config: entry.config.name.clone(),
                        depends: dep.config.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Configs that apply to one image type, in list order.
    pub fn get(&self, distro: &str, arch: &str, image_type: &str) -> Vec<&BuildConfig> {
        self.entries
            .iter()
            .filter(|e| {
                any_match(&e.distros, distro)
                    && any_match(&e.arches, arch)
                    && any_match(&e.image_types, image_type)
            })
            .map(|e| &e.config)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use imgforge_common::Size;

    #[test]
    fn parses_name_blueprint_and_options() {
        let config = BuildConfig::parse(
            Path::new("c.json"),
            r#"{"name": "test-image", "blueprint": {"name": "bp"}, "options": {"size": 1234}}"#,
        )
        .unwrap();
        assert_eq!(config.name, "test-image");
        assert_eq!(config.blueprint().name, "bp");
        assert_eq!(config.options.size, Some(Size(1234)));
    }

    #[test]
    fn rejects_unknown_fields_and_trailing_data() {
        let err = BuildConfig::parse(Path::new("c.json"), r#"{"name": "x", "unknown": 42}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");

        let err = BuildConfig::parse(Path::new("c.json"), r#"{"name": "x"} {"name": "y"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("trailing characters"), "{err}");

        let err = BuildConfig::parse(Path::new("c.json"), "{invalid json}").unwrap_err();
        assert!(err.to_string().starts_with("cannot decode c.json"), "{err}");
    }

    #[test]
    fn config_list_filters_by_glob() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("empty.json").write_str(r#"{"name": "empty"}"#).unwrap();
        dir.child("iot.json")
            .write_str(
                r#"{"name": "iot", "options": {"ostree": {"ref": "test/iot"}},
                    "depends": {"config": "empty", "image-type": "qcow2"}}"#,
            )
            .unwrap();
        dir.child("config-list.json")
            .write_str(
                r#"[{"path": "empty.json"},
                    {"path": "iot.json", "filters": {"distros": ["fedora*"], "image-types": ["iot-*"]}}]"#,
            )
            .unwrap();

        let configs = BuildConfigs::load_dir(dir.path()).unwrap();
        assert_eq!(configs.len(), 2);
        let names = |d, a, t| {
            configs
                .get(d, a, t)
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names("fedora-42", "x86_64", "iot-raw"), ["empty", "iot"]);
        assert_eq!(names("rhel-9.6", "x86_64", "iot-raw"), ["empty"]);
        assert_eq!(names("fedora-42", "aarch64", "qcow2"), ["empty"]);
    }

    #[test]
    fn shipped_configs_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("data/configs");
        let configs = BuildConfigs::load_dir(&dir).unwrap();
        assert_eq!(configs.len(), 3);
        let names = |d, a, t| {
            configs
                .get(d, a, t)
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names("rhel-9.6", "x86_64", "qcow2"), ["empty", "server"]);
        assert_eq!(names("fedora-42", "aarch64", "iot-raw"), ["empty", "iot"]);
        assert_eq!(names("fedora-42", "x86_64", "container-tar"), ["empty"]);
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("a.json")
            .write_str(r#"{"name": "a", "depends": {"config": "missing", "image-type": "raw"}}"#)
            .unwrap();
        let err = BuildConfigs::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }), "{err}");
    }

    #[test]
    fn invalid_blueprints_are_rejected() {
        let err = BuildConfig::parse(
            Path::new("c.json"),
            r#"{"name": "x", "blueprint": {"customizations": {"hostname": "-bad-"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Blueprint(_)), "{err}");
    }
}
