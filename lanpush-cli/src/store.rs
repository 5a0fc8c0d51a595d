use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use lanpush_core::device::Device;

/// JSON file holding the known devices with their policies and passwords.
#[derive(Clone, Debug)]
pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the device list. A missing file is an empty list.
    pub fn load(&self) -> anyhow::Result<Vec<Device>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No device file yet");
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read devices from {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse devices in {}", self.path.display()))
    }

    /// Replaces the file contents with `devices`.
    pub fn save(&self, devices: &[Device]) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(devices).context("failed to encode devices")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = devices.len(), "Devices saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use lanpush_core::device::{DeviceClass, MacAddress, ReceivePolicy};

    use super::*;

    #[test]
    fn given_missing_file_when_loading_then_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path().join("devices.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn given_saved_devices_when_loading_then_policies_and_passwords_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::new(dir.path().join("devices.json"));
        let mut alice = Device::new(
            MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            "Alice",
            Ipv4Addr::new(192, 168, 1, 10),
            DeviceClass::Phone,
        );
        alice.policy = ReceivePolicy::AskEachTime;
        alice.password = Some("hunter2".into());

        store.save(std::slice::from_ref(&alice)).unwrap();
        assert_eq!(store.load().unwrap(), [alice]);
        assert!(!dir.path().join("devices.json.tmp").exists());
    }

    #[test]
    fn given_corrupt_file_when_loading_then_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "not json").unwrap();
        let err = DeviceStore::new(&path).load().unwrap_err();
        assert!(format!("{err:#}").contains("devices.json"));
    }
}
