//! # lanpush-engine
//!
//! Runtime logic for lanpush, embedded into the CLI.
//!
//! This crate provides:
//! - **Presence service**: UDP `Hello`/`Present`/`Bye` announcements, the
//!   receive loop feeding the device directory, and the online registry
//!   with its liveness sweep
//! - **Connection handshake**: busy, receive-policy and password
//!   negotiation on both ends of a transfer connection
//! - **Transfer engine**: recursive file/folder streaming with optional
//!   encryption and progress reporting
//! - **Transport implementations**: TCP and an in-memory pipe
//! - **Event bus**: recordable log messages, device and progress events
//!   consumed by the CLI

pub mod engine;
pub mod events;
pub mod handshake;
pub mod link;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod session;
pub mod tcp;
pub mod transfer;
