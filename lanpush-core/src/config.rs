use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceClass, MacAddress, truncate_name};
use crate::protocol::broadcast_address;

/// Tunables consumed by the presence service and the transfer engine.
///
/// Every field has a default, so a config file only needs the values it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name announced to peers (at most 20 characters).
    pub device_name: String,
    pub device_class: DeviceClass,
    /// Directory where received files and folders are created.
    pub save_dir: PathBuf,
    pub presence_port: u16,
    pub transfer_port: u16,
    pub presence_send_period_ms: u64,
    pub presence_timeout_check_period_ms: u64,
    /// Delay before the first periodic Present broadcast.
    pub presence_first_send_delay_ms: u64,
    /// Budget for every network round trip; also the time-password skew bound.
    pub max_ping_ms: u64,
    pub max_permission_ask_wait_ms: u64,
    /// Largest plaintext chunk streamed per write.
    pub max_buffer_size: usize,
    /// MAC of the interface to announce on, when one was chosen.
    pub interface_mac: Option<MacAddress>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: "lanpush".into(),
            device_class: DeviceClass::Computer,
            save_dir: std::env::temp_dir().join("lanpush"),
            presence_port: 11500,
            transfer_port: 11501,
            presence_send_period_ms: 10_000,
            presence_timeout_check_period_ms: 3_000,
            presence_first_send_delay_ms: 2_000,
            max_ping_ms: 5_000,
            max_permission_ask_wait_ms: 5_000,
            max_buffer_size: 1024,
            interface_mac: None,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings in {}", path.display()))?;
        settings.device_name = truncate_name(&settings.device_name);
        Ok(settings)
    }

    pub fn max_ping(&self) -> Duration {
        Duration::from_millis(self.max_ping_ms)
    }

    pub fn max_permission_ask_wait(&self) -> Duration {
        Duration::from_millis(self.max_permission_ask_wait_ms)
    }

    pub fn presence_send_period(&self) -> Duration {
        Duration::from_millis(self.presence_send_period_ms)
    }

    pub fn presence_timeout_check_period(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_check_period_ms)
    }

    pub fn presence_first_send_delay(&self) -> Duration {
        Duration::from_millis(self.presence_first_send_delay_ms)
    }

    /// A device silent for longer than this is considered offline.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_send_period_ms + self.max_ping_ms)
    }

    /// Chunk size, never zero.
    pub fn chunk_size(&self) -> usize {
        self.max_buffer_size.max(1)
    }
}

/// The local interface presence runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl NetworkIdentity {
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast_address(self.ip, self.netmask)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn given_no_file_when_loading_then_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.liveness_timeout(), Duration::from_millis(15_000));
    }

    #[test]
    fn given_partial_file_when_loading_then_missing_fields_defaulted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"device_name":"a-name-that-is-far-too-long","max_ping_ms":250,"interface_mac":"02:00:00:00:00:09"}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.device_name, "a-name-that-is-far-t");
        assert_eq!(settings.max_ping(), Duration::from_millis(250));
        assert_eq!(settings.transfer_port, 11501);
        assert_eq!(
            settings.interface_mac,
            Some(MacAddress::new([2, 0, 0, 0, 0, 9]))
        );
    }

    #[test]
    fn given_garbage_file_when_loading_then_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn given_identity_then_broadcast_derived_from_mask() {
        let id = NetworkIdentity {
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
            ip: Ipv4Addr::new(172, 16, 5, 4),
            netmask: Ipv4Addr::new(255, 255, 0, 0),
        };
        assert_eq!(id.broadcast(), Ipv4Addr::new(172, 16, 255, 255));
    }

    #[test]
    fn given_zero_buffer_size_then_chunk_size_is_one() {
        let settings = Settings {
            max_buffer_size: 0,
            ..Settings::default()
        };
        assert_eq!(settings.chunk_size(), 1);
    }
}
