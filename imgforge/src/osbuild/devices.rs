//! Block devices a stage opens before it runs.

use serde::{Deserialize, Serialize};

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackOptions {
    pub filename: String,
    /// Offset in sectors.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start: u64,
    /// Length in sectors; zero means the whole file.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Luks2DeviceOptions {
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lvm2LvOptions {
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options")]
pub enum DeviceKind {
    #[serde(rename = "org.osbuild.loopback")]
    Loopback(LoopbackOptions),
    #[serde(rename = "org.osbuild.luks2")]
    Luks2(Luks2DeviceOptions),
    #[serde(rename = "org.osbuild.lvm2.lv")]
    Lvm2Lv(Lvm2LvOptions),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(flatten)]
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Device {
    pub fn loopback(filename: &str, start: u64, size: u64) -> Self {
        Self {
            kind: DeviceKind::Loopback(LoopbackOptions {
                filename: filename.to_string(),
                start,
                size,
                sector_size: None,
                lock: false,
            }),
            parent: None,
        }
    }

    /// Whole-image loopback that holds a lock while partitioning.
    pub fn whole_disk(filename: &str) -> Self {
        Self {
            kind: DeviceKind::Loopback(LoopbackOptions {
                filename: filename.to_string(),
                start: 0,
                size: 0,
                sector_size: None,
                lock: true,
            }),
            parent: None,
        }
    }

    pub fn luks2(parent: &str, passphrase: &str) -> Self {
        Self {
            kind: DeviceKind::Luks2(Luks2DeviceOptions {
                passphrase: passphrase.to_string(),
            }),
            parent: Some(parent.to_string()),
        }
    }

    pub fn lvm2_lv(parent: &str, volume: &str) -> Self {
        Self {
            kind: DeviceKind::Lvm2Lv(Lvm2LvOptions {
                volume: volume.to_string(),
            }),
            parent: Some(parent.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_json_shapes() {
        let loop_dev = serde_json::to_value(Device::loopback("disk.img", 2048, 4096)).unwrap();
        assert_eq!(
            loop_dev,
            json!({
                "type": "org.osbuild.loopback",
                "options": {"filename": "disk.img", "start": 2048, "size": 4096}
            })
        );
        let lv = serde_json::to_value(Device::lvm2_lv("rootvg", "rootlv")).unwrap();
        assert_eq!(
            lv,
            json!({
                "type": "org.osbuild.lvm2.lv",
                "parent": "rootvg",
                "options": {"volume": "rootlv"}
            })
        );
        let back: Device = serde_json::from_value(lv).unwrap();
        assert_eq!(back, Device::lvm2_lv("rootvg", "rootlv"));
    }
}
