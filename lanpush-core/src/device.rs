use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Longest device name kept by the directory and announced on the wire.
pub const MAX_NAME_LEN: usize = 20;

/// A 6-byte hardware address, the stable key of every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or twelve bare hex digits.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 12 || !hex.is_ascii() {
            bail!("invalid MAC address: {s:?}");
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .with_context(|| format!("invalid MAC address: {s:?}"))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of hardware a peer announces itself as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceClass {
    #[default]
    Unknown = 0,
    Computer = 1,
    Phone = 2,
}

/// Per-peer rule deciding what happens to an inbound transfer request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivePolicy {
    #[default]
    Deny,
    AskEachTime,
    AllowAlways,
}

impl fmt::Display for ReceivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deny => "deny",
            Self::AskEachTime => "ask",
            Self::AllowAlways => "allow",
        })
    }
}

/// Identity record of a peer, as kept by the device directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub mac: MacAddress,
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub class: DeviceClass,
    #[serde(default)]
    pub policy: ReceivePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Device {
    /// A freshly discovered device: receives nothing until the user allows it.
    pub fn new(mac: MacAddress, name: impl Into<String>, ip: Ipv4Addr, class: DeviceClass) -> Self {
        Self {
            mac,
            name: truncate_name(&name.into()),
            ip,
            class,
            policy: ReceivePolicy::Deny,
            password: None,
        }
    }

    /// True when an encryption password is configured for this peer.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Cuts `name` down to [`MAX_NAME_LEN`] characters.
#[must_use]
pub fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}
