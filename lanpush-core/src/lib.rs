//! # lanpush-core
//!
//! Shared building blocks for the lanpush LAN file push protocol.
//!
//! This crate provides the foundational types used by [`lanpush-engine`]
//! and the `lanpush` binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: opcodes, the UDP presence datagram and the
//!   TCP handshake / transfer packets, with strict decoding.
//!
//! - **Encryption**: the password-derived AES-256-CBC context used for the
//!   password proof and for encrypted transfers.
//!
//! - **Device model**: MAC-keyed device records, receive policies and the
//!   [`directory::DeviceDirectory`] collaborator interface.
//!
//! - **Configuration and errors**: [`config::Settings`] and the typed
//!   failure taxonomy shared by handshake and transfer.
//!
//! - **Transport traits**: connection / listener / connector abstractions.

pub mod config;
pub mod crypto;
pub mod device;
pub mod directory;
pub mod error;
pub mod listener;
pub mod protocol;
