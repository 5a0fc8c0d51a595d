use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};

use crate::device::{Device, DeviceClass, MacAddress, ReceivePolicy, truncate_name};

/// Outcome of [`DeviceDirectory::add_or_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    Added,
    Updated {
        /// Previous name, when the name changed.
        old_name: Option<String>,
        /// Previous address, when the address changed.
        old_ip: Option<Ipv4Addr>,
    },
    Unchanged,
}

/// The device list shared by presence, handshake and the UI.
///
/// Implementations must be safe for concurrent reads and upserts. The
/// engine never persists devices itself; it only goes through this trait.
pub trait DeviceDirectory: Send + Sync + 'static {
    fn device_by_mac(&self, mac: MacAddress) -> Option<Device>;

    fn device_by_ip(&self, ip: Ipv4Addr) -> Option<Device>;

    /// Inserts a newly seen device or refreshes the name/address/class of a
    /// known one. Receive policy and password are never touched here.
    fn add_or_update(
        &self,
        mac: MacAddress,
        name: &str,
        ip: Ipv4Addr,
        class: DeviceClass,
    ) -> DirectoryChange;

    /// Returns the removed device, if it existed.
    fn remove(&self, mac: MacAddress) -> Option<Device>;

    /// Returns `false` when no device has this MAC.
    fn set_receive_policy(&self, mac: MacAddress, policy: ReceivePolicy) -> bool;

    /// `None` clears the password. Returns `false` when no device has this MAC.
    fn set_encryption_password(&self, mac: MacAddress, password: Option<String>) -> bool;

    /// Snapshot of every known device, sorted by name.
    fn devices(&self) -> Vec<Device>;
}

/// In-process [`DeviceDirectory`] backed by a read/write-locked map.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    devices: RwLock<HashMap<MacAddress, Device>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the directory, e.g. from a saved device list.
    #[must_use]
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let map = devices.into_iter().map(|d| (d.mac, d)).collect();
        Self {
            devices: RwLock::new(map),
        }
    }

    fn update<R>(&self, mac: MacAddress, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.get_mut(&mac).map(f)
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn device_by_mac(&self, mac: MacAddress) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(&mac).cloned()
    }

    fn device_by_ip(&self, ip: Ipv4Addr) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.values().find(|d| d.ip == ip).cloned()
    }

    fn add_or_update(
        &self,
        mac: MacAddress,
        name: &str,
        ip: Ipv4Addr,
        class: DeviceClass,
    ) -> DirectoryChange {
        let name = truncate_name(name);
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);

        let Some(device) = devices.get_mut(&mac) else {
            devices.insert(mac, Device::new(mac, name, ip, class));
            return DirectoryChange::Added;
        };

        let old_name = (device.name != name).then(|| std::mem::replace(&mut device.name, name));
        let old_ip = (device.ip != ip).then(|| std::mem::replace(&mut device.ip, ip));
        device.class = class;

        if old_name.is_none() && old_ip.is_none() {
            DirectoryChange::Unchanged
        } else {
            DirectoryChange::Updated { old_name, old_ip }
        }
    }

    fn remove(&self, mac: MacAddress) -> Option<Device> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.remove(&mac)
    }

    fn set_receive_policy(&self, mac: MacAddress, policy: ReceivePolicy) -> bool {
        self.update(mac, |d| d.policy = policy).is_some()
    }

    fn set_encryption_password(&self, mac: MacAddress, password: Option<String>) -> bool {
        let password = password.filter(|p| !p.is_empty());
        self.update(mac, |d| d.password = password).is_some()
    }

    fn devices(&self) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<Device> = devices.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.mac.cmp(&b.mac)));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 1]);
    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);

    #[test]
    fn given_unknown_mac_when_upserted_then_added_with_deny_policy() {
        let dir = MemoryDirectory::new();
        let change = dir.add_or_update(MAC, "Alice", IP, DeviceClass::Computer);
        assert_eq!(change, DirectoryChange::Added);

        let device = dir.device_by_mac(MAC).unwrap();
        assert_eq!(device.name, "Alice");
        assert_eq!(device.policy, ReceivePolicy::Deny);
        assert_eq!(dir.device_by_ip(IP).unwrap().mac, MAC);
    }

    #[test]
    fn given_known_mac_when_name_and_ip_change_then_reports_old_values() {
        let dir = MemoryDirectory::new();
        dir.add_or_update(MAC, "Alice", IP, DeviceClass::Computer);
        dir.set_receive_policy(MAC, ReceivePolicy::AllowAlways);

        let new_ip = Ipv4Addr::new(192, 168, 0, 11);
        let change = dir.add_or_update(MAC, "Alice2", new_ip, DeviceClass::Computer);
        assert_eq!(
            change,
            DirectoryChange::Updated {
                old_name: Some("Alice".into()),
                old_ip: Some(IP),
            }
        );

        let device = dir.device_by_mac(MAC).unwrap();
        assert_eq!(device.ip, new_ip);
        assert_eq!(device.policy, ReceivePolicy::AllowAlways);
        assert!(dir.device_by_ip(IP).is_none());
    }

    #[test]
    fn given_identical_announcement_when_upserted_then_unchanged() {
        let dir = MemoryDirectory::new();
        dir.add_or_update(MAC, "Alice", IP, DeviceClass::Computer);
        assert_eq!(
            dir.add_or_update(MAC, "Alice", IP, DeviceClass::Computer),
            DirectoryChange::Unchanged
        );
    }

    #[test]
    fn given_password_when_set_and_cleared_then_encryption_toggles() {
        let dir = MemoryDirectory::new();
        assert!(!dir.set_encryption_password(MAC, Some("pw".into())));

        dir.add_or_update(MAC, "Alice", IP, DeviceClass::Phone);
        assert!(dir.set_encryption_password(MAC, Some("pw".into())));
        assert!(dir.device_by_mac(MAC).unwrap().encryption_enabled());

        assert!(dir.set_encryption_password(MAC, Some(String::new())));
        assert!(!dir.device_by_mac(MAC).unwrap().encryption_enabled());
    }

    #[test]
    fn given_devices_when_removed_then_gone_from_listing() {
        let other = MacAddress::new([2, 0, 0, 0, 0, 2]);
        let dir = MemoryDirectory::new();
        dir.add_or_update(MAC, "Zed", IP, DeviceClass::Computer);
        dir.add_or_update(other, "Amy", Ipv4Addr::new(10, 0, 0, 1), DeviceClass::Phone);

        let names: Vec<String> = dir.devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["Amy", "Zed"]);

        assert_eq!(dir.remove(MAC).unwrap().name, "Zed");
        assert!(dir.remove(MAC).is_none());
        assert_eq!(dir.devices().len(), 1);
    }
}
