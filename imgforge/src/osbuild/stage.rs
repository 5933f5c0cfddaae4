//! Stages: one typed build action with its inputs, devices and mounts.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

use super::devices::Device;
use super::error::StageError;
use super::inputs::{Input, InputKind};
use super::mounts::Mount;
use super::stages::StageOptions;

/// Static facts about one stage type. Implemented by every options struct
/// in the catalog.
pub trait StageKind: Serialize + DeserializeOwned + Into<StageOptions> {
    const TYPE: &'static str;

    /// Named inputs this stage cannot run without.
    const INPUTS: &'static [(&'static str, InputKind)] = &[];

    /// Paths of the tree this stage writes, where known.
    const PATHS_CHANGED: &'static [&'static str] = &[];

    fn validate(&self) -> Result<(), StageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub options: StageOptions,
    pub inputs: BTreeMap<String, Input>,
    pub devices: BTreeMap<String, Device>,
    pub mounts: Vec<Mount>,
}

impl Stage {
    /// Build a stage that takes no inputs.
    pub fn new(options: impl Into<StageOptions>) -> Result<Self, StageError> {
        Self::with_inputs(options, Vec::<(String, Input)>::new())
    }

    /// Build a stage, checking its options and that every required input
    /// is present with the right kind.
    pub fn with_inputs<K: Into<String>>(
        options: impl Into<StageOptions>,
        inputs: impl IntoIterator<Item = (K, Input)>,
    ) -> Result<Self, StageError> {
        let options = options.into();
        options.validate()?;
        let inputs: BTreeMap<String, Input> =
            inputs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let stage = options.type_name();
        for &(name, kind) in options.required_inputs() {
            match inputs.get(name) {
                None => {
                    return Err(StageError::MissingInput {
                        stage,
                        input: name,
                        kind: kind.as_str(),
                    });
                }
                Some(input) if input.kind != kind => {
                    return Err(StageError::InputKindMismatch {
                        stage,
                        input: name.to_string(),
                        actual: input.kind.as_str(),
                        expected: kind.as_str(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            options,
            inputs,
            devices: BTreeMap::new(),
            mounts: Vec::new(),
        })
    }

    pub fn with_devices(mut self, devices: BTreeMap<String, Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.options.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osbuild::stages::{HostnameOptions, TarOptions};

    #[test]
    fn stage_without_required_input_fails() {
        let err = Stage::new(TarOptions::new("root.tar")).unwrap_err();
        assert!(matches!(err, StageError::MissingInput { input: "tree", .. }));
    }

    #[test]
    fn wrong_input_kind_is_reported() {
        let err = Stage::with_inputs(
            TarOptions::new("root.tar"),
            [("tree", Input::source_files(["sha256:aa"]))],
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage org.osbuild.tar: input \"tree\" has type org.osbuild.files, expected org.osbuild.tree"
        );
    }

    #[test]
    fn devices_and_mounts_are_attached() {
        let stage = Stage::new(HostnameOptions {
            hostname: "box".into(),
        })
        .unwrap()
        .with_mounts(vec![crate::osbuild::mounts::Mount::ostree_deployment("fedora", "x")]);
        assert_eq!(stage.mounts.len(), 1);
        assert!(stage.devices.is_empty());
        assert!(stage.options.paths_changed().contains(&"/etc/hostname"));
    }

    #[test]
    fn options_are_validated_at_construction() {
        let err = Stage::new(HostnameOptions {
            hostname: "bad host".into(),
        })
        .unwrap_err();
        assert!(err.to_string().starts_with("stage org.osbuild.hostname: hostname:"));
    }
}
