//! Connection establishment on the transfer port.
//!
//! Both sides run a short, half-duplex negotiation before any transfer
//! packet is exchanged. The server checks the busy flag, the receive
//! policy of the peer and, when a password is configured for the peer,
//! runs a mutual time-password exchange. The client mirrors it and always
//! sends the final `Accept`.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info};

use lanpush_core::config::Settings;
use lanpush_core::crypto::EncryptionContext;
use lanpush_core::device::{Device, ReceivePolicy};
use lanpush_core::error::{ConnectFailure, TransferError};
use lanpush_core::listener::Connection;
use lanpush_core::protocol::{Opcode, Packet};

use crate::events::Direction;
use crate::link::{Link, LinkError};
use crate::session::{SessionClaim, SessionInfo, SessionSlot};

const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NAME_PREFIX_CHARS: usize = 4;

/// Asks the local user whether a device may send files right now.
pub trait PermissionPrompt: Send + Sync {
    fn ask<'a>(&'a self, device: &'a Device) -> impl Future<Output = bool> + Send + 'a;
}

/// Deadlines used during the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    pub max_ping: Duration,
    pub ask_wait: Duration,
}

impl From<&Settings> for HandshakeTimeouts {
    fn from(settings: &Settings) -> Self {
        Self {
            max_ping: settings.max_ping(),
            ask_wait: settings.max_permission_ask_wait(),
        }
    }
}

/// Result of a successful server-side negotiation.
#[derive(Debug)]
pub struct Established {
    pub cipher: Option<EncryptionContext>,
    pub claim: SessionClaim,
}

// ── Time password ───────────────────────────────────────────────────

fn name_prefix(name: &str) -> String {
    name.chars().take(NAME_PREFIX_CHARS).collect()
}

/// `first 4 chars of name` followed by the UTC time at second precision.
#[must_use]
pub fn time_password(name: &str, now: DateTime<Utc>) -> String {
    format!("{}{}", name_prefix(name), now.format(STAMP_FORMAT))
}

/// Checks a decrypted time password sent by `peer_name`.
///
/// The name prefix must match the stored name of the peer and the stamp
/// must lie strictly within `max_skew` of `now`, in either direction.
#[must_use]
pub fn validate_time_password(
    plain: &str,
    peer_name: &str,
    now: DateTime<Utc>,
    max_skew: Duration,
) -> bool {
    let Some(stamp) = plain.strip_prefix(name_prefix(peer_name).as_str()) else {
        return false;
    };
    let Ok(stamp) = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) else {
        return false;
    };
    let skew = u128::from((now - stamp.and_utc()).num_milliseconds().unsigned_abs());
    skew < max_skew.as_millis()
}

fn seal_proof(cipher: &EncryptionContext, name: &str) -> Packet {
    let plain = time_password(name, Utc::now());
    Packet::SendPass(cipher.encrypt(plain.as_bytes()))
}

/// Decrypts a proof; any failure yields `None`.
fn open_proof(cipher: &EncryptionContext, proof: &[u8]) -> Option<String> {
    let plain = cipher.decrypt(proof).ok()?;
    String::from_utf8(plain).ok()
}

fn link_failure(device: &str, e: LinkError) -> TransferError {
    if e.is_timeout() {
        TransferError::connect(device, ConnectFailure::Timeout)
    } else {
        e.into()
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Runs the server side of the negotiation with `peer`, the directory
/// record matching the remote address.
///
/// On success the session slot is claimed and handed back with the
/// negotiated cipher. Every refusal is sent to the peer before returning.
///
/// # Errors
///
/// Returns [`TransferError::Connect`] when the connection is refused or
/// the peer stops answering, and a send/receive failure on broken I/O.
pub async fn accept_inbound<C, P>(
    conn: &mut C,
    peer: &Device,
    local_name: &str,
    timeouts: HandshakeTimeouts,
    slot: &SessionSlot,
    prompt: &P,
) -> Result<Established, TransferError>
where
    C: Connection,
    P: PermissionPrompt,
{
    let mut link = Link::new(conn, timeouts.max_ping);
    let device = peer.name.as_str();
    let fail = |e: LinkError| link_failure(device, e);

    if slot.is_busy() {
        debug!(peer = %device, "Refusing connection: busy");
        link.send_control(Opcode::RefuseBusy).await.map_err(fail)?;
        return Err(TransferError::connect(device, ConnectFailure::Busy));
    }

    let allowed = match peer.policy {
        ReceivePolicy::Deny => false,
        ReceivePolicy::AllowAlways => true,
        ReceivePolicy::AskEachTime => {
            debug!(peer = %device, "Waiting for user permission");
            tokio::time::timeout(timeouts.ask_wait, prompt.ask(peer))
                .await
                .unwrap_or(false)
        }
    };
    if !allowed {
        debug!(peer = %device, policy = %peer.policy, "Refusing connection: not allowed");
        link.send_control(Opcode::RefuseDeny).await.map_err(fail)?;
        return Err(TransferError::connect(device, ConnectFailure::Denied));
    }

    let cipher = match peer.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            let cipher = EncryptionContext::from_password(password);
            link.send_control(Opcode::AskPass).await.map_err(fail)?;

            let proof = match link.recv(timeouts.max_ping).await.map_err(fail)? {
                Packet::SendPass(proof) => proof,
                other => {
                    debug!(peer = %device, opcode = ?other.opcode(), "Peer did not send a password");
                    return Err(TransferError::connect(device, ConnectFailure::PolicyMismatch));
                }
            };
            let valid = open_proof(&cipher, &proof).is_some_and(|plain| {
                validate_time_password(&plain, &peer.name, Utc::now(), timeouts.max_ping)
            });
            if !valid {
                debug!(peer = %device, "Refusing connection: password proof rejected");
                link.send_control(Opcode::RefusePass).await.map_err(fail)?;
                return Err(TransferError::connect(device, ConnectFailure::PasswordMismatch));
            }

            link.send_control(Opcode::AcceptPass).await.map_err(fail)?;
            let own_proof = seal_proof(&cipher, local_name);
            link.send(&own_proof).await.map_err(fail)?;
            Some(cipher)
        }
        None => {
            link.send_control(Opcode::Accept).await.map_err(fail)?;
            None
        }
    };

    match link.recv(timeouts.max_ping).await.map_err(fail)? {
        Packet::Control(Opcode::Accept) => {}
        other => {
            if slot.is_busy() {
                link.send_control(Opcode::RefuseBusy).await.map_err(fail)?;
            }
            let reason = match other {
                Packet::Control(Opcode::RefusePass) => ConnectFailure::PasswordMismatch,
                _ => ConnectFailure::PolicyMismatch,
            };
            debug!(peer = %device, opcode = ?other.opcode(), "Peer did not accept");
            return Err(TransferError::connect(device, reason));
        }
    }

    let info = SessionInfo::new(peer.mac, peer.name.clone(), Direction::Receiving);
    let Some(claim) = slot.try_claim(info) else {
        link.send_control(Opcode::RefuseBusy).await.map_err(fail)?;
        return Err(TransferError::connect(device, ConnectFailure::Busy));
    };

    info!(peer = %device, encrypted = cipher.is_some(), "Inbound connection established");
    Ok(Established { cipher, claim })
}

// ── Client ──────────────────────────────────────────────────────────

/// Runs the client side of the negotiation with `peer`, the directory
/// record of the device being connected to.
///
/// Returns the negotiated cipher (`None` when neither side uses a
/// password). The caller owns the session slot for the whole attempt.
///
/// # Errors
///
/// Returns [`TransferError::Connect`] when the server refuses, the
/// password settings disagree, or the server stops answering.
pub async fn connect_outbound<C: Connection>(
    conn: &mut C,
    peer: &Device,
    local_name: &str,
    timeouts: HandshakeTimeouts,
) -> Result<Option<EncryptionContext>, TransferError> {
    let mut link = Link::new(conn, timeouts.max_ping);
    let device = peer.name.as_str();
    let fail = |e: LinkError| link_failure(device, e);

    // The server may be waiting on its user before answering.
    let first = link
        .recv(timeouts.max_ping + timeouts.ask_wait)
        .await
        .map_err(fail)?;
    match first {
        Packet::Control(Opcode::RefuseBusy) => {
            return Err(TransferError::connect(device, ConnectFailure::Busy));
        }
        Packet::Control(Opcode::RefuseDeny) => {
            return Err(TransferError::connect(device, ConnectFailure::Denied));
        }
        _ => {}
    }

    let cipher = match peer.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            if first != Packet::Control(Opcode::AskPass) {
                debug!(peer = %device, "Server did not ask for a password");
                link.send_control(Opcode::RefusePass).await.map_err(fail)?;
                return Err(TransferError::connect(device, ConnectFailure::PolicyMismatch));
            }
            let cipher = EncryptionContext::from_password(password);
            let own_proof = seal_proof(&cipher, local_name);
            link.send(&own_proof).await.map_err(fail)?;

            match link.recv(timeouts.max_ping).await.map_err(fail)? {
                Packet::Control(Opcode::AcceptPass) => {}
                Packet::Control(Opcode::RefusePass) => {
                    return Err(TransferError::connect(device, ConnectFailure::PasswordMismatch));
                }
                _ => {
                    return Err(TransferError::connect(device, ConnectFailure::PolicyMismatch));
                }
            }

            let valid = match link.recv(timeouts.max_ping).await.map_err(fail)? {
                Packet::SendPass(proof) => open_proof(&cipher, &proof).is_some_and(|plain| {
                    validate_time_password(&plain, &peer.name, Utc::now(), timeouts.max_ping)
                }),
                _ => false,
            };
            if !valid {
                debug!(peer = %device, "Server password proof rejected");
                link.send_control(Opcode::RefusePass).await.map_err(fail)?;
                return Err(TransferError::connect(device, ConnectFailure::PasswordMismatch));
            }
            Some(cipher)
        }
        None => {
            if first != Packet::Control(Opcode::Accept) {
                debug!(peer = %device, opcode = ?first.opcode(), "Server expects a password");
                link.send_control(Opcode::RefuseDeny).await.map_err(fail)?;
                return Err(TransferError::connect(device, ConnectFailure::PolicyMismatch));
            }
            None
        }
    };

    link.send_control(Opcode::Accept).await.map_err(fail)?;
    info!(peer = %device, encrypted = cipher.is_some(), "Outbound connection established");
    Ok(cipher)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::TimeDelta;
    use lanpush_core::device::{DeviceClass, MacAddress};

    use super::*;
    use crate::memory::MemoryConnection;

    const TIMEOUTS: HandshakeTimeouts = HandshakeTimeouts {
        max_ping: Duration::from_secs(2),
        ask_wait: Duration::from_millis(100),
    };

    struct Answer(bool);

    impl PermissionPrompt for Answer {
        fn ask<'a>(&'a self, _device: &'a Device) -> impl Future<Output = bool> + Send + 'a {
            async move { self.0 }
        }
    }

    struct NeverAnswers;

    impl PermissionPrompt for NeverAnswers {
        fn ask<'a>(&'a self, _device: &'a Device) -> impl Future<Output = bool> + Send + 'a {
            std::future::pending()
        }
    }

    /// The server's record of the client.
    fn client_record(policy: ReceivePolicy, password: Option<&str>) -> Device {
        let mut device = Device::new(
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            "Alice-laptop",
            Ipv4Addr::new(192, 168, 1, 10),
            DeviceClass::Computer,
        );
        device.policy = policy;
        device.password = password.map(str::to_string);
        device
    }

    /// The client's record of the server.
    fn server_record(password: Option<&str>) -> Device {
        let mut device = Device::new(
            MacAddress::new([2, 0, 0, 0, 0, 2]),
            "Bob-desktop",
            Ipv4Addr::new(192, 168, 1, 20),
            DeviceClass::Computer,
        );
        device.password = password.map(str::to_string);
        device
    }

    async fn negotiate<P: PermissionPrompt>(
        server_pw: Option<&str>,
        client_pw: Option<&str>,
        policy: ReceivePolicy,
        slot: &SessionSlot,
        prompt: &P,
    ) -> (
        Result<Established, TransferError>,
        Result<Option<EncryptionContext>, TransferError>,
    ) {
        let (mut server_conn, mut client_conn) = MemoryConnection::pair();
        let client = client_record(policy, server_pw);
        let server = server_record(client_pw);
        tokio::join!(
            accept_inbound(&mut server_conn, &client, &server.name, TIMEOUTS, slot, prompt),
            connect_outbound(&mut client_conn, &server, &client.name, TIMEOUTS),
        )
    }

    // ── Scenario table ──────────────────────────────────────────────

    #[tokio::test]
    async fn given_no_passwords_when_negotiating_then_established_without_cipher() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::AllowAlways, &slot, &Answer(true)).await;

        let established = server.unwrap();
        assert!(established.cipher.is_none());
        assert!(client.unwrap().is_none());
        assert!(slot.is_busy());
        drop(established);
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn given_only_server_has_password_when_negotiating_then_refused() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(Some("secret"), None, ReceivePolicy::AllowAlways, &slot, &Answer(true)).await;

        assert_eq!(
            client.unwrap_err().connect_failure(),
            Some(ConnectFailure::PolicyMismatch)
        );
        assert_eq!(
            server.unwrap_err().connect_failure(),
            Some(ConnectFailure::PolicyMismatch)
        );
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn given_matching_passwords_when_negotiating_then_established_with_same_cipher() {
        let slot = SessionSlot::new();
        let (server, client) = negotiate(
            Some("hunter2"),
            Some("hunter2"),
            ReceivePolicy::AllowAlways,
            &slot,
            &Answer(true),
        )
        .await;

        let server_cipher = server.unwrap().cipher.unwrap();
        let client_cipher = client.unwrap().unwrap();
        let sealed = client_cipher.encrypt(b"payload");
        assert_eq!(server_cipher.decrypt(&sealed).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn given_names_with_same_prefix_and_matching_passwords_when_negotiating_then_established() {
        let mut client = client_record(ReceivePolicy::AllowAlways, Some("hunter2"));
        client.name = "Laptop-Alice".into();
        let mut server = server_record(Some("hunter2"));
        server.name = "Laptop-Bob".into();

        for _ in 0..5 {
            let slot = SessionSlot::new();
            let (mut server_conn, mut client_conn) = MemoryConnection::pair();
            let (accepted, connected) = tokio::join!(
                accept_inbound(&mut server_conn, &client, &server.name, TIMEOUTS, &slot, &Answer(true)),
                connect_outbound(&mut client_conn, &server, &client.name, TIMEOUTS),
            );
            assert!(accepted.unwrap().cipher.is_some());
            assert!(connected.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn given_different_passwords_when_negotiating_then_refused_with_password_mismatch() {
        let slot = SessionSlot::new();
        let (server, client) = negotiate(
            Some("hunter2"),
            Some("letmein"),
            ReceivePolicy::AllowAlways,
            &slot,
            &Answer(true),
        )
        .await;

        assert_eq!(
            server.unwrap_err().connect_failure(),
            Some(ConnectFailure::PasswordMismatch)
        );
        assert_eq!(
            client.unwrap_err().connect_failure(),
            Some(ConnectFailure::PasswordMismatch)
        );
        assert!(!slot.is_busy());
    }

    // ── Busy and policy ─────────────────────────────────────────────

    #[tokio::test]
    async fn given_busy_server_when_negotiating_then_refused_busy_without_touching_session() {
        let slot = SessionSlot::new();
        let _active = slot
            .try_claim(SessionInfo::new(
                MacAddress::new([2, 0, 0, 0, 0, 9]),
                "Carol",
                Direction::Sending,
            ))
            .unwrap();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::AllowAlways, &slot, &Answer(true)).await;

        assert_eq!(server.unwrap_err().connect_failure(), Some(ConnectFailure::Busy));
        assert_eq!(client.unwrap_err().connect_failure(), Some(ConnectFailure::Busy));
        assert_eq!(slot.current().unwrap().peer_name, "Carol");
    }

    #[tokio::test]
    async fn given_deny_policy_when_negotiating_then_refused_denied() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::Deny, &slot, &Answer(true)).await;

        assert_eq!(server.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
        assert_eq!(client.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
    }

    #[tokio::test]
    async fn given_ask_policy_when_user_allows_then_established() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::AskEachTime, &slot, &Answer(true)).await;
        assert!(server.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn given_ask_policy_when_user_refuses_then_denied() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::AskEachTime, &slot, &Answer(false)).await;
        assert_eq!(server.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
        assert_eq!(client.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
    }

    #[tokio::test]
    async fn given_ask_policy_when_user_never_answers_then_denied_after_wait() {
        let slot = SessionSlot::new();
        let (server, client) =
            negotiate(None, None, ReceivePolicy::AskEachTime, &slot, &NeverAnswers).await;
        assert_eq!(server.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
        assert_eq!(client.unwrap_err().connect_failure(), Some(ConnectFailure::Denied));
    }

    #[tokio::test]
    async fn given_silent_server_when_connecting_then_timeout() {
        let (_server_conn, mut client_conn) = MemoryConnection::pair();
        let timeouts = HandshakeTimeouts {
            max_ping: Duration::from_millis(20),
            ask_wait: Duration::from_millis(20),
        };
        let err = connect_outbound(&mut client_conn, &server_record(None), "Alice", timeouts)
            .await
            .unwrap_err();
        assert_eq!(err.connect_failure(), Some(ConnectFailure::Timeout));
    }

    // ── Time password ───────────────────────────────────────────────

    #[test]
    fn given_fresh_time_password_then_valid_for_same_peer() {
        let now = Utc::now();
        let plain = time_password("Alice-laptop", now);
        assert!(plain.starts_with("Alic"));
        assert!(validate_time_password(&plain, "Alice-laptop", now, Duration::from_secs(5)));
    }

    #[test]
    fn given_wrong_prefix_then_invalid() {
        let now = Utc::now();
        let plain = time_password("Mallory", now);
        assert!(!validate_time_password(&plain, "Alice-laptop", now, Duration::from_secs(5)));
    }

    #[test]
    fn given_stale_or_future_stamp_then_invalid() {
        let now = Utc::now();
        let skew = Duration::from_secs(5);
        let stale = time_password("Alice", now - TimeDelta::seconds(10));
        let future = time_password("Alice", now + TimeDelta::seconds(10));
        assert!(!validate_time_password(&stale, "Alice", now, skew));
        assert!(!validate_time_password(&future, "Alice", now, skew));
    }

    #[test]
    fn given_short_name_then_whole_name_is_prefix() {
        let now = Utc::now();
        let plain = time_password("Al", now);
        assert!(validate_time_password(&plain, "Al", now, Duration::from_secs(5)));
    }

    #[test]
    fn given_garbage_then_invalid() {
        assert!(!validate_time_password("Alicnot-a-date", "Alice", Utc::now(), Duration::from_secs(5)));
    }
}
