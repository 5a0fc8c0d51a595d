use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while decoding or encoding a wire packet.
///
/// A malformed packet is always reported through this type; decoding never
/// panics on attacker-controlled input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("opcode {0} is not valid in this packet family")]
    UnexpectedOpcode(u8),

    #[error("unknown device class: {0}")]
    UnknownDeviceClass(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("relative path is {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("password proof is {0} bytes (max 255)")]
    ProofTooLong(usize),
}

/// Failures of the symmetric encryption layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Wrong key, truncated ciphertext or tampered padding.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Why a connection attempt was refused or abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The remote end already has a transfer in progress.
    Busy,
    /// The receive policy refused the transfer (or the prompt timed out).
    Denied,
    /// Both sides use encryption but the passwords do not match.
    PasswordMismatch,
    /// Exactly one side has a password configured.
    PolicyMismatch,
    /// The peer stopped answering during the handshake.
    Timeout,
    /// The TCP connection could not be opened.
    Unreachable,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Busy => "it is busy right now",
            Self::Denied => "it is not allowed to send files",
            Self::PasswordMismatch => "the password is not correct",
            Self::PolicyMismatch => "only one side has an encryption password set",
            Self::Timeout => "the peer did not answer in time",
            Self::Unreachable => "the peer could not be reached",
        };
        f.write_str(reason)
    }
}

/// Every way a handshake or a transfer can fail.
///
/// None of these are retried. Any of them tears the connection down and
/// releases the session slot, except [`TransferError::PathTooLong`] which
/// only skips the affected file.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("connection with {device} failed because {reason}")]
    Connect {
        device: String,
        reason: ConnectFailure,
    },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("destination path is too long: {}", .0.display())]
    PathTooLong(PathBuf),

    #[error("could not create directory {}: {source}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn connect(device: impl Into<String>, reason: ConnectFailure) -> Self {
        Self::Connect {
            device: device.into(),
            reason,
        }
    }

    /// Returns the handshake failure reason, if this is a connect failure.
    #[must_use]
    pub fn connect_failure(&self) -> Option<ConnectFailure> {
        match self {
            Self::Connect { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<ProtocolError> for TransferError {
    fn from(e: ProtocolError) -> Self {
        Self::Receive(format!("invalid packet: {e}"))
    }
}

impl From<CryptoError> for TransferError {
    fn from(e: CryptoError) -> Self {
        Self::Receive(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_connect_failure_when_displayed_then_names_device_and_reason() {
        let err = TransferError::connect("Bobs-phone", ConnectFailure::Busy);
        assert_eq!(
            err.to_string(),
            "connection with Bobs-phone failed because it is busy right now"
        );
        assert_eq!(err.connect_failure(), Some(ConnectFailure::Busy));
    }

    #[test]
    fn given_protocol_error_when_converted_then_becomes_receive_failure() {
        let err: TransferError = ProtocolError::UnknownOpcode(99).into();
        assert!(matches!(err, TransferError::Receive(_)));
        assert!(err.to_string().contains("unknown opcode: 99"));
        assert_eq!(err.connect_failure(), None);
    }
}
