use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::device::{DeviceClass, MacAddress};
use crate::error::ProtocolError;

/// MAC (6) + opcode (1).
pub const PRESENCE_HEADER_LEN: usize = 7;
/// Opcode (1) + item count (4) + total size (8).
pub const TRANSFER_INFO_LEN: usize = 13;
/// Fixed width of the zero-padded relative path field of an item packet.
pub const PATH_FIELD_LEN: usize = 1024;
/// Opcode (1) + size (8) + path field.
pub const ITEM_INFO_LEN: usize = 1 + 8 + PATH_FIELD_LEN;

/// Instruction codes shared by the UDP presence and TCP transfer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Empty = 0,

    Hello = 10,
    Present = 11,
    Bye = 12,

    RefuseBusy = 20,
    RefuseDeny = 21,
    AskPass = 22,
    SendPass = 23,
    RefusePass = 24,
    AcceptPass = 25,
    Accept = 26,

    TransferInfo = 30,
    FileInfo = 31,
    FolderInfo = 32,
}

impl Opcode {
    /// True for the three UDP discovery instructions.
    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, Self::Hello | Self::Present | Self::Bye)
    }

    /// True for the single-byte connection control instructions.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::RefuseBusy
                | Self::RefuseDeny
                | Self::AskPass
                | Self::RefusePass
                | Self::AcceptPass
                | Self::Accept
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Empty,
            10 => Self::Hello,
            11 => Self::Present,
            12 => Self::Bye,
            20 => Self::RefuseBusy,
            21 => Self::RefuseDeny,
            22 => Self::AskPass,
            23 => Self::SendPass,
            24 => Self::RefusePass,
            25 => Self::AcceptPass,
            26 => Self::Accept,
            30 => Self::TransferInfo,
            31 => Self::FileInfo,
            32 => Self::FolderInfo,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for DeviceClass {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Computer),
            2 => Ok(Self::Phone),
            other => Err(ProtocolError::UnknownDeviceClass(other)),
        }
    }
}

// ── UDP presence family ─────────────────────────────────────────────

/// What a presence datagram says about its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// "I just joined, everyone please announce yourselves."
    Hello { class: DeviceClass, name: String },
    /// Periodic "I am still here".
    Present { class: DeviceClass, name: String },
    /// "I am leaving, mark me offline now."
    Bye,
}

impl Presence {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Hello { .. } => Opcode::Hello,
            Self::Present { .. } => Opcode::Present,
            Self::Bye => Opcode::Bye,
        }
    }
}

/// `[6 bytes MAC][opcode]` followed, for Hello/Present, by
/// `[device class][UTF-8 name, rest of the datagram]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePacket {
    pub mac: MacAddress,
    pub presence: Presence,
}

impl PresencePacket {
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PRESENCE_HEADER_LEN + 1 + 32);
        buf.put_slice(&self.mac.octets());
        buf.put_u8(self.presence.opcode().into());
        match &self.presence {
            Presence::Hello { class, name } | Presence::Present { class, name } => {
                buf.put_u8(*class as u8);
                buf.put_slice(name.as_bytes());
            }
            Presence::Bye => {}
        }
        buf
    }

    /// Decodes one datagram.
    ///
    /// # Errors
    ///
    /// Fails on datagrams shorter than the opcode requires, on opcodes
    /// outside the presence family, on unknown device classes and on
    /// names that are not valid UTF-8.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < PRESENCE_HEADER_LEN {
            return Err(ProtocolError::TooShort {
                needed: PRESENCE_HEADER_LEN,
                got: buf.len(),
            });
        }

        let mut mac = [0u8; 6];
        buf.copy_to_slice(&mut mac);
        let mac = MacAddress::new(mac);

        let raw = buf.get_u8();
        let opcode = Opcode::try_from(raw)?;
        if !opcode.is_presence() {
            return Err(ProtocolError::UnexpectedOpcode(raw));
        }

        if opcode == Opcode::Bye {
            return Ok(Self {
                mac,
                presence: Presence::Bye,
            });
        }

        if buf.is_empty() {
            return Err(ProtocolError::TooShort {
                needed: PRESENCE_HEADER_LEN + 1,
                got: PRESENCE_HEADER_LEN,
            });
        }
        let class = DeviceClass::try_from(buf.get_u8())?;
        let name = std::str::from_utf8(buf)
            .map_err(|_| ProtocolError::InvalidUtf8("device name"))?
            .to_string();

        let presence = if opcode == Opcode::Hello {
            Presence::Hello { class, name }
        } else {
            Presence::Present { class, name }
        };
        Ok(Self { mac, presence })
    }
}

/// Subnet broadcast address of an interface: `ip | !mask`.
#[must_use]
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

// ── TCP connection / transfer family ────────────────────────────────

/// Whether an item packet announces a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

/// One packet on the TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Single-byte handshake instruction (Accept, RefuseBusy, AskPass, …).
    Control(Opcode),
    /// `[SendPass][len u8][ciphertext]`: an encrypted time password.
    SendPass(Vec<u8>),
    /// `[TransferInfo][item count u32 LE][total size u64 LE]`.
    TransferInfo { item_count: u32, total_size: u64 },
    /// `[FileInfo|FolderInfo][size u64 LE][1024-byte zero-padded path]`.
    ItemInfo {
        kind: ItemKind,
        size: u64,
        path: String,
    },
}

impl Packet {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Control(op) => *op,
            Self::SendPass(_) => Opcode::SendPass,
            Self::TransferInfo { .. } => Opcode::TransferInfo,
            Self::ItemInfo {
                kind: ItemKind::File,
                ..
            } => Opcode::FileInfo,
            Self::ItemInfo {
                kind: ItemKind::Folder,
                ..
            } => Opcode::FolderInfo,
        }
    }

    /// Serializes the packet.
    ///
    /// # Errors
    ///
    /// Fails when an item path does not fit the fixed path field or a
    /// password proof does not fit its one-byte length prefix.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.opcode().into());
        match self {
            Self::Control(_) => {}
            Self::SendPass(proof) => {
                let len =
                    u8::try_from(proof.len()).map_err(|_| ProtocolError::ProofTooLong(proof.len()))?;
                buf.put_u8(len);
                buf.put_slice(proof);
            }
            Self::TransferInfo {
                item_count,
                total_size,
            } => {
                buf.put_u32_le(*item_count);
                buf.put_u64_le(*total_size);
            }
            Self::ItemInfo { size, path, .. } => {
                let bytes = path.as_bytes();
                if bytes.len() > PATH_FIELD_LEN {
                    return Err(ProtocolError::PathTooLong {
                        len: bytes.len(),
                        max: PATH_FIELD_LEN,
                    });
                }
                buf.reserve(ITEM_INFO_LEN - 1);
                buf.put_u64_le(*size);
                buf.put_slice(bytes);
                buf.put_bytes(0, PATH_FIELD_LEN - bytes.len());
            }
        }
        Ok(buf)
    }

    /// Decodes one complete packet.
    ///
    /// # Errors
    ///
    /// Fails on an empty buffer, an unknown or non-TCP opcode, a buffer
    /// shorter than the opcode's fixed layout, or a non-UTF-8 path.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::TooShort { needed: 1, got: 0 });
        }
        let total = buf.len();
        let raw = buf.get_u8();
        let opcode = Opcode::try_from(raw)?;

        let needed = min_len(opcode).ok_or(ProtocolError::UnexpectedOpcode(raw))?;
        if total < needed {
            return Err(ProtocolError::TooShort { needed, got: total });
        }

        match opcode {
            Opcode::SendPass => {
                let len = usize::from(buf.get_u8());
                if buf.len() < len {
                    return Err(ProtocolError::TooShort {
                        needed: 2 + len,
                        got: total,
                    });
                }
                Ok(Self::SendPass(buf[..len].to_vec()))
            }
            Opcode::TransferInfo => Ok(Self::TransferInfo {
                item_count: buf.get_u32_le(),
                total_size: buf.get_u64_le(),
            }),
            Opcode::FileInfo | Opcode::FolderInfo => {
                let size = buf.get_u64_le();
                let field = &buf[..PATH_FIELD_LEN];
                let end = field.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                let path = std::str::from_utf8(&field[..end])
                    .map_err(|_| ProtocolError::InvalidUtf8("item path"))?
                    .to_string();
                let kind = if opcode == Opcode::FileInfo {
                    ItemKind::File
                } else {
                    ItemKind::Folder
                };
                Ok(Self::ItemInfo { kind, size, path })
            }
            _ => Ok(Self::Control(opcode)),
        }
    }
}

/// Minimum encoded length of a TCP packet starting with `opcode`, or
/// `None` when the opcode never appears on the TCP connection.
#[must_use]
pub fn min_len(opcode: Opcode) -> Option<usize> {
    match opcode {
        op if op.is_control() => Some(1),
        Opcode::SendPass => Some(2),
        Opcode::TransferInfo => Some(TRANSFER_INFO_LEN),
        Opcode::FileInfo | Opcode::FolderInfo => Some(ITEM_INFO_LEN),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    #[test]
    fn given_hello_from_alice_when_round_tripped_then_tuple_matches() {
        let packet = PresencePacket {
            mac: MAC,
            presence: Presence::Hello {
                class: DeviceClass::Computer,
                name: "Alice".into(),
            },
        };
        let bytes = packet.encode();
        assert_eq!(
            &bytes[..],
            &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 10, 1, b'A', b'l', b'i', b'c', b'e']
        );
        assert_eq!(PresencePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn given_bye_when_encoded_then_carries_no_payload() {
        let packet = PresencePacket {
            mac: MAC,
            presence: Presence::Bye,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), PRESENCE_HEADER_LEN);
        assert_eq!(PresencePacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn given_short_datagram_when_decoded_then_too_short() {
        let err = PresencePacket::decode(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, ProtocolError::TooShort { needed: 7, got: 3 });
    }

    #[test]
    fn given_present_without_class_byte_when_decoded_then_too_short() {
        let err = PresencePacket::decode(&[1, 2, 3, 4, 5, 6, 11]).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn given_transfer_opcode_in_datagram_when_decoded_then_unexpected() {
        let err = PresencePacket::decode(&[1, 2, 3, 4, 5, 6, 26]).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedOpcode(26));
    }

    #[test]
    fn given_unknown_class_or_opcode_when_decoded_then_error() {
        assert_eq!(
            PresencePacket::decode(&[1, 2, 3, 4, 5, 6, 11, 9]).unwrap_err(),
            ProtocolError::UnknownDeviceClass(9)
        );
        assert_eq!(
            PresencePacket::decode(&[1, 2, 3, 4, 5, 6, 99]).unwrap_err(),
            ProtocolError::UnknownOpcode(99)
        );
    }

    #[test]
    fn given_invalid_utf8_name_when_decoded_then_error() {
        let err = PresencePacket::decode(&[1, 2, 3, 4, 5, 6, 11, 1, 0xFF, 0xFE]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8("device name"));
    }

    #[test]
    fn given_interface_when_computing_broadcast_then_host_bits_set() {
        assert_eq!(
            broadcast_address(
                Ipv4Addr::new(192, 168, 1, 42),
                Ipv4Addr::new(255, 255, 255, 0)
            ),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 240, 0)),
            Ipv4Addr::new(10, 1, 15, 255)
        );
    }

    #[test]
    fn given_transfer_info_when_encoded_then_little_endian_layout() {
        let bytes = Packet::TransferInfo {
            item_count: 3,
            total_size: 150,
        }
        .encode()
        .unwrap();
        assert_eq!(bytes.len(), TRANSFER_INFO_LEN);
        assert_eq!(&bytes[..5], &[30, 3, 0, 0, 0]);
        assert_eq!(&bytes[5..], &150u64.to_le_bytes());
    }

    #[test]
    fn given_item_info_when_round_tripped_then_path_trimmed_of_padding() {
        let packet = Packet::ItemInfo {
            kind: ItemKind::File,
            size: 100,
            path: "root/a.txt".into(),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), ITEM_INFO_LEN);
        assert_eq!(bytes[0], 31);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn given_folder_info_when_decoded_then_kind_is_folder() {
        let packet = Packet::ItemInfo {
            kind: ItemKind::Folder,
            size: 0,
            path: "root/sub".into(),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.opcode(), Opcode::FolderInfo);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn given_oversized_path_when_encoded_then_path_too_long() {
        let packet = Packet::ItemInfo {
            kind: ItemKind::File,
            size: 1,
            path: "x".repeat(PATH_FIELD_LEN + 1),
        };
        assert_eq!(
            packet.encode().unwrap_err(),
            ProtocolError::PathTooLong {
                len: PATH_FIELD_LEN + 1,
                max: PATH_FIELD_LEN
            }
        );
    }

    #[test]
    fn given_truncated_item_info_when_decoded_then_too_short() {
        let mut bytes = Packet::ItemInfo {
            kind: ItemKind::File,
            size: 1,
            path: "a".into(),
        }
        .encode()
        .unwrap();
        bytes.truncate(100);
        assert_eq!(
            Packet::decode(&bytes).unwrap_err(),
            ProtocolError::TooShort {
                needed: ITEM_INFO_LEN,
                got: 100
            }
        );
    }

    #[test]
    fn given_send_pass_when_round_tripped_then_proof_preserved() {
        let packet = Packet::SendPass(vec![7; 32]);
        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[..2], &[23, 32]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn given_send_pass_with_missing_proof_bytes_when_decoded_then_too_short() {
        let err = Packet::decode(&[23, 32, 1, 2, 3]).unwrap_err();
        assert_eq!(err, ProtocolError::TooShort { needed: 34, got: 5 });
    }

    #[test]
    fn given_presence_or_empty_opcode_on_tcp_when_decoded_then_unexpected() {
        assert_eq!(
            Packet::decode(&[11]).unwrap_err(),
            ProtocolError::UnexpectedOpcode(11)
        );
        assert_eq!(
            Packet::decode(&[0]).unwrap_err(),
            ProtocolError::UnexpectedOpcode(0)
        );
        assert_eq!(
            Packet::decode(&[]).unwrap_err(),
            ProtocolError::TooShort { needed: 1, got: 0 }
        );
    }

    #[test]
    fn given_every_opcode_when_converted_to_u8_and_back_then_match() {
        let codes = [0u8, 10, 11, 12, 20, 21, 22, 23, 24, 25, 26, 30, 31, 32];
        for code in codes {
            let op = Opcode::try_from(code).unwrap();
            assert_eq!(u8::from(op), code);
        }
        assert!(Opcode::try_from(13).is_err());
    }
}
