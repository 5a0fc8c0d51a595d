use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use lanpush_core::config::Settings;
use lanpush_core::device::{Device, MacAddress};
use lanpush_core::directory::DeviceDirectory;
use lanpush_core::error::{ConnectFailure, TransferError};
use lanpush_core::listener::{Connection, Connector, Listener, ListenerFactory};

use crate::events::{Direction, EngineEvent, EventBus};
use crate::handshake::{
    Established, HandshakeTimeouts, PermissionPrompt, accept_inbound, connect_outbound,
};
use crate::link::Link;
use crate::session::{SessionClaim, SessionInfo, SessionSlot};
use crate::transfer::{ProgressTracker, TransferPlan, receive_items, send_plan, send_summary};

// ── Engine commands (UI → engine) ───────────────────────────────────

/// Commands sent by the CLI / UI to control the engine.
#[derive(Clone, Debug)]
pub enum EngineCmd {
    /// Bind the transfer listener on `addr` and start accepting connections.
    StartAccepting { addr: String },
    /// Stop accepting new connections (drop the listener).
    StopAccepting,
    /// Send files and folders to a known device. Ignored while a transfer
    /// is in progress or when the device is unknown.
    StartTransfer {
        device: MacAddress,
        items: Vec<PathBuf>,
    },
    /// Answer a pending [`EngineEvent::PermissionRequested`].
    AnswerPermission { request_id: u64, allow: bool },
    /// Stop the command loop. Transfers already running finish on their own.
    ShutDown,
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`]. Lets the caller send commands,
/// subscribe to events and observe the busy flag.
#[derive(Clone)]
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub events: EventBus,
    pub session: SessionSlot,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_busy()
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// State shared by the engine loop and every connection task.
pub struct EngineContext {
    pub settings: Settings,
    pub directory: Arc<dyn DeviceDirectory>,
    pub events: EventBus,
    pub session: SessionSlot,
}

struct Shared {
    settings: Settings,
    directory: Arc<dyn DeviceDirectory>,
    events: EventBus,
    session: SessionSlot,
    prompt: EventPrompt,
}

impl Shared {
    fn timeouts(&self) -> HandshakeTimeouts {
        HandshakeTimeouts::from(&self.settings)
    }
}

/// The transfer engine.
///
/// Accepts inbound connections on the transfer port and opens outbound
/// ones on [`EngineCmd::StartTransfer`]. Every connection runs on its own
/// task, but at most one of them gets past the handshake at a time: the
/// [`SessionSlot`] is the busy flag.
///
/// The engine is generic over:
/// - `F: ListenerFactory`: creates the transfer listener
/// - `K: Connector`: opens outbound connections
pub struct Engine;

impl Engine {
    /// Spawn the engine event loop and return a handle to control it.
    ///
    /// The engine starts idle: no listener is active until
    /// [`EngineCmd::StartAccepting`] is received.
    pub fn start<F, K>(self, factory: F, connector: K, context: EngineContext) -> EngineHandle
    where
        F: ListenerFactory,
        K: Connector,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(32);
        let handle = EngineHandle {
            cmd_tx,
            events: context.events.clone(),
            session: context.session.clone(),
        };

        let shared = Arc::new(Shared {
            prompt: EventPrompt::new(context.events.clone()),
            settings: context.settings,
            directory: context.directory,
            events: context.events,
            session: context.session,
        });

        info!("Spawning engine event loop");
        tokio::spawn(run_engine_loop(factory, Arc::new(connector), shared, cmd_rx));
        handle
    }
}

/// The main engine event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Engine` itself.
async fn run_engine_loop<F, K>(
    factory: F,
    connector: Arc<K>,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
) where
    F: ListenerFactory,
    K: Connector,
{
    debug!("Engine event loop running");
    let mut listener: Option<F::L> = None;

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCmd::StartAccepting { addr }) => {
                        info!(addr = %addr, "Received StartAccepting command");
                        match factory.bind(&addr).await {
                            Ok(l) => {
                                let bound_addr = l.local_addr();
                                listener = Some(l);
                                shared.events.publish(EngineEvent::Accepting { addr: bound_addr });
                            }
                            Err(e) => {
                                shared.events.error(format!("Failed to listen on {addr}: {e:#}"));
                            }
                        }
                    }

                    Some(EngineCmd::StopAccepting) => {
                        info!("Received StopAccepting command");
                        listener = None;
                        shared.events.publish(EngineEvent::AcceptingStopped);
                    }

                    Some(EngineCmd::StartTransfer { device, items }) => {
                        start_transfer(&connector, &shared, device, items);
                    }

                    Some(EngineCmd::AnswerPermission { request_id, allow }) => {
                        if !shared.prompt.answer(request_id, allow) {
                            debug!(request_id, "Permission request already expired");
                        }
                    }

                    Some(EngineCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }

                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Accept inbound connections ───────────────────────
            result = async {
                if let Some(l) = listener.as_mut() {
                    l.accept().await
                } else {
                    std::future::pending().await
                }
            }, if listener.is_some() => {
                match result {
                    Ok(conn) => {
                        info!(peer = %conn.peer(), "Connection accepted");
                        tokio::spawn(serve_inbound(conn, shared.clone()));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                }
            }
        }
    }

    info!("Engine event loop stopped");
}

// ── Outbound ────────────────────────────────────────────────────────

fn start_transfer<K: Connector>(
    connector: &Arc<K>,
    shared: &Arc<Shared>,
    mac: MacAddress,
    items: Vec<PathBuf>,
) {
    let Some(device) = shared.directory.device_by_mac(mac) else {
        warn!(mac = %mac, "Ignoring transfer to unknown device");
        return;
    };
    let info = SessionInfo::new(mac, device.name.clone(), Direction::Sending);
    let Some(claim) = shared.session.try_claim(info) else {
        shared
            .events
            .warning("A transfer is already in progress, wait for it to finish.");
        return;
    };

    info!(peer = %device.name, items = items.len(), "Starting transfer");
    tokio::spawn(run_outbound(connector.clone(), shared.clone(), device, items, claim));
}

async fn run_outbound<K: Connector>(
    connector: Arc<K>,
    shared: Arc<Shared>,
    device: Device,
    items: Vec<PathBuf>,
    claim: SessionClaim,
) {
    let mut progress = ProgressTracker::new(shared.events.clone(), Direction::Sending);
    let result = send_to(&*connector, &shared, &device, items, &mut progress).await;
    progress.finish();

    let success = match result {
        Ok(summary) => {
            shared.events.info(summary);
            true
        }
        Err(e) => {
            report_failure(&shared.events, &e);
            false
        }
    };
    drop(claim);
    shared.events.publish(EngineEvent::SessionEnded {
        peer: device.name,
        direction: Direction::Sending,
        success,
    });
}

async fn send_to<K: Connector>(
    connector: &K,
    shared: &Shared,
    device: &Device,
    items: Vec<PathBuf>,
    progress: &mut ProgressTracker,
) -> Result<String, TransferError> {
    let plan = tokio::task::spawn_blocking(move || TransferPlan::build(&items))
        .await
        .map_err(|e| TransferError::Send(format!("walking items failed: {e}")))??;

    let addr = SocketAddr::from((device.ip, shared.settings.transfer_port));
    let mut conn = connector.connect(addr).await.map_err(|e| {
        warn!(peer = %device.name, addr = %addr, error = %e, "Connect failed");
        TransferError::connect(device.name.clone(), ConnectFailure::Unreachable)
    })?;

    let cipher = connect_outbound(
        &mut conn,
        device,
        &shared.settings.device_name,
        shared.timeouts(),
    )
    .await?;

    let started = Instant::now();
    let mut link = Link::new(&mut conn, shared.settings.max_ping());
    let sent = send_plan(
        &mut link,
        &plan,
        cipher.as_ref(),
        shared.settings.chunk_size(),
        progress,
    )
    .await;
    link.shutdown().await;
    sent?;

    Ok(send_summary(
        plan.item_count(),
        plan.total_size(),
        started.elapsed(),
    ))
}

// ── Inbound ─────────────────────────────────────────────────────────

async fn serve_inbound<C: Connection>(mut conn: C, shared: Arc<Shared>) {
    let peer_addr = conn.peer_addr();
    let IpAddr::V4(ip) = peer_addr.ip() else {
        debug!(peer = %peer_addr, "Dropping non-IPv4 connection");
        return;
    };
    let Some(peer) = shared.directory.device_by_ip(ip) else {
        debug!(peer = %peer_addr, "Dropping connection from unknown device");
        return;
    };

    let established = accept_inbound(
        &mut conn,
        &peer,
        &shared.settings.device_name,
        shared.timeouts(),
        &shared.session,
        &shared.prompt,
    )
    .await;
    let Established { cipher, claim } = match established {
        Ok(established) => established,
        Err(e) => {
            report_failure(&shared.events, &e);
            Link::new(&mut conn, shared.settings.max_ping()).shutdown().await;
            return;
        }
    };

    let mut progress = ProgressTracker::new(shared.events.clone(), Direction::Receiving);
    let mut link = Link::new(&mut conn, shared.settings.max_ping());
    let received = receive_items(
        &mut link,
        &shared.settings.save_dir,
        cipher.as_ref(),
        shared.settings.chunk_size(),
        &mut progress,
        &shared.events,
    )
    .await;
    progress.finish();
    link.shutdown().await;

    let success = match received {
        Ok(report) => {
            debug!(
                peer = %peer.name,
                items = report.item_count,
                bytes = report.total_size,
                skipped = report.skipped.len(),
                "Receive finished"
            );
            shared.events.info("Received successfully.");
            true
        }
        Err(e) => {
            shared
                .events
                .error(format!("Receiving from {} failed: {e}", peer.name));
            false
        }
    };
    drop(claim);
    shared.events.publish(EngineEvent::SessionEnded {
        peer: peer.name,
        direction: Direction::Receiving,
        success,
    });
}

fn report_failure(events: &EventBus, e: &TransferError) {
    match e.connect_failure() {
        Some(_) => events.warning(e.to_string()),
        None => events.error(e.to_string()),
    }
}

// ── Permission prompt ───────────────────────────────────────────────

/// Forwards permission questions to the UI as
/// [`EngineEvent::PermissionRequested`] and waits for the matching
/// [`EngineCmd::AnswerPermission`].
struct EventPrompt {
    events: EventBus,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
}

impl EventPrompt {
    fn new(events: EventBus) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `false` if nobody is waiting for `request_id` any more.
    fn answer(&self, request_id: u64, allow: bool) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id)
            .is_some_and(|tx| tx.send(allow).is_ok())
    }
}

/// Removes an unanswered request when the handshake stops waiting.
struct PendingRequest<'a> {
    prompt: &'a EventPrompt,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.prompt
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl PermissionPrompt for EventPrompt {
    fn ask<'a>(&'a self, device: &'a Device) -> impl Future<Output = bool> + Send + 'a {
        async move {
            let (tx, rx) = oneshot::channel();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, tx);
            let _pending = PendingRequest { prompt: self, id };

            self.events.publish(EngineEvent::PermissionRequested {
                request_id: id,
                mac: device.mac,
                device_name: device.name.clone(),
            });
            rx.await.unwrap_or(false)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use lanpush_core::device::{DeviceClass, ReceivePolicy};
    use lanpush_core::directory::MemoryDirectory;

    use super::*;
    use crate::tcp::{TcpConnector, TcpListenerFactory};

    const SERVER_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 2]);
    const CLIENT_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 1]);

    fn settings(name: &str, save_dir: &std::path::Path) -> Settings {
        Settings {
            device_name: name.into(),
            save_dir: save_dir.to_path_buf(),
            max_ping_ms: 2_000,
            max_permission_ask_wait_ms: 2_000,
            ..Settings::default()
        }
    }

    /// Helper: start an engine with TCP transport.
    fn start_tcp_engine(
        settings: Settings,
        devices: Vec<Device>,
    ) -> (EngineHandle, broadcast::Receiver<EngineEvent>) {
        let context = EngineContext {
            settings,
            directory: Arc::new(MemoryDirectory::with_devices(devices)),
            events: EventBus::default(),
            session: SessionSlot::new(),
        };
        let handle = Engine.start(
            TcpListenerFactory,
            TcpConnector::new(Duration::from_secs(2)),
            context,
        );
        let events_rx = handle.subscribe();
        (handle, events_rx)
    }

    fn device(mac: MacAddress, name: &str, policy: ReceivePolicy, password: Option<&str>) -> Device {
        let mut device = Device::new(mac, name, Ipv4Addr::LOCALHOST, DeviceClass::Computer);
        device.policy = policy;
        device.password = password.map(str::to_string);
        device
    }

    /// Helper: wait for a specific event, with a timeout.
    async fn wait_for_event(
        rx: &mut broadcast::Receiver<EngineEvent>,
        matches_fn: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if matches_fn(&ev) => return ev,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event channel error: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn start_accepting(
        handle: &EngineHandle,
        events_rx: &mut broadcast::Receiver<EngineEvent>,
    ) -> SocketAddr {
        handle
            .cmd_tx
            .send(EngineCmd::StartAccepting {
                addr: "127.0.0.1:0".into(),
            })
            .await
            .unwrap();
        let EngineEvent::Accepting { addr } = wait_for_event(events_rx, |e| {
            matches!(e, EngineEvent::Accepting { .. })
        })
        .await
        else {
            unreachable!()
        };
        addr.parse().unwrap()
    }

    fn sample_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), vec![7u8; 100]).unwrap();
        std::fs::write(root.join("sub").join("b.txt"), vec![9u8; 50]).unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn when_start_accepting_expect_accepting_event() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events_rx) = start_tcp_engine(settings("Bob", dir.path()), vec![]);
        let addr = start_accepting(&handle, &mut events_rx).await;
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        handle.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn when_stop_accepting_expect_stopped_event() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events_rx) = start_tcp_engine(settings("Bob", dir.path()), vec![]);
        start_accepting(&handle, &mut events_rx).await;

        handle.cmd_tx.send(EngineCmd::StopAccepting).await.unwrap();
        let ev = wait_for_event(&mut events_rx, |e| {
            matches!(e, EngineEvent::AcceptingStopped)
        })
        .await;

        assert!(matches!(ev, EngineEvent::AcceptingStopped));
        handle.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn when_bind_fails_expect_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events_rx) = start_tcp_engine(settings("Bob", dir.path()), vec![]);

        handle
            .cmd_tx
            .send(EngineCmd::StartAccepting {
                addr: "999.999.999.999:0".into(),
            })
            .await
            .unwrap();

        let ev = wait_for_event(&mut events_rx, |e| matches!(e, EngineEvent::Log { .. })).await;
        let EngineEvent::Log { severity, message } = ev else {
            unreachable!()
        };
        assert_eq!(severity, crate::events::Severity::Error);
        assert!(message.contains("999.999.999.999:0"));
        handle.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn given_busy_engine_when_start_transfer_then_session_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events_rx) = start_tcp_engine(
            settings("Alice", dir.path()),
            vec![device(SERVER_MAC, "Bob", ReceivePolicy::Deny, None)],
        );
        let _active = handle
            .session
            .try_claim(SessionInfo::new(CLIENT_MAC, "Carol", Direction::Receiving))
            .unwrap();
        let before = handle.session.current();

        handle
            .cmd_tx
            .send(EngineCmd::StartTransfer {
                device: SERVER_MAC,
                items: vec![dir.path().to_path_buf()],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handle.session.current(), before);
        handle.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn given_unknown_device_when_start_transfer_then_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events_rx) = start_tcp_engine(settings("Alice", dir.path()), vec![]);

        handle
            .cmd_tx
            .send(EngineCmd::StartTransfer {
                device: SERVER_MAC,
                items: vec![dir.path().to_path_buf()],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!handle.is_busy());
        handle.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn given_allowed_peer_when_transferring_folder_then_tree_received() {
        let (_src, root) = sample_tree();
        let recv_dir = tempfile::tempdir().unwrap();
        let send_dir = tempfile::tempdir().unwrap();

        let (server, mut server_rx) = start_tcp_engine(
            settings("Bob", recv_dir.path()),
            vec![device(CLIENT_MAC, "Alice", ReceivePolicy::AllowAlways, None)],
        );
        let addr = start_accepting(&server, &mut server_rx).await;

        let mut client_settings = settings("Alice", send_dir.path());
        client_settings.transfer_port = addr.port();
        let (client, mut client_rx) = start_tcp_engine(
            client_settings,
            vec![device(SERVER_MAC, "Bob", ReceivePolicy::Deny, None)],
        );

        client
            .cmd_tx
            .send(EngineCmd::StartTransfer {
                device: SERVER_MAC,
                items: vec![root],
            })
            .await
            .unwrap();

        let sent = wait_for_event(&mut client_rx, |e| {
            matches!(e, EngineEvent::SessionEnded { .. })
        })
        .await;
        assert!(matches!(sent, EngineEvent::SessionEnded { success: true, .. }));
        let received = wait_for_event(&mut server_rx, |e| {
            matches!(e, EngineEvent::SessionEnded { .. })
        })
        .await;
        assert!(matches!(
            received,
            EngineEvent::SessionEnded { success: true, direction: Direction::Receiving, .. }
        ));

        let got = recv_dir.path().join("root");
        assert_eq!(std::fs::read(got.join("a.txt")).unwrap(), vec![7u8; 100]);
        assert_eq!(std::fs::read(got.join("sub").join("b.txt")).unwrap(), vec![9u8; 50]);
        assert!(!client.is_busy());
        assert!(!server.is_busy());

        client.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
        server.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn given_ask_policy_and_password_when_user_allows_then_encrypted_transfer_received() {
        let (_src, root) = sample_tree();
        let recv_dir = tempfile::tempdir().unwrap();
        let send_dir = tempfile::tempdir().unwrap();

        let (server, mut server_rx) = start_tcp_engine(
            settings("Bob", recv_dir.path()),
            vec![device(CLIENT_MAC, "Alice", ReceivePolicy::AskEachTime, Some("pw"))],
        );
        let addr = start_accepting(&server, &mut server_rx).await;

        let mut client_settings = settings("Alice", send_dir.path());
        client_settings.transfer_port = addr.port();
        let (client, mut client_rx) = start_tcp_engine(
            client_settings,
            vec![device(SERVER_MAC, "Bob", ReceivePolicy::Deny, Some("pw"))],
        );

        client
            .cmd_tx
            .send(EngineCmd::StartTransfer {
                device: SERVER_MAC,
                items: vec![root.join("a.txt")],
            })
            .await
            .unwrap();

        let EngineEvent::PermissionRequested {
            request_id,
            mac,
            device_name,
        } = wait_for_event(&mut server_rx, |e| {
            matches!(e, EngineEvent::PermissionRequested { .. })
        })
        .await
        else {
            unreachable!()
        };
        assert_eq!(mac, CLIENT_MAC);
        assert_eq!(device_name, "Alice");
        server
            .cmd_tx
            .send(EngineCmd::AnswerPermission {
                request_id,
                allow: true,
            })
            .await
            .unwrap();

        let sent = wait_for_event(&mut client_rx, |e| {
            matches!(e, EngineEvent::SessionEnded { .. })
        })
        .await;
        assert!(matches!(sent, EngineEvent::SessionEnded { success: true, .. }));
        wait_for_event(&mut server_rx, |e| {
            matches!(e, EngineEvent::SessionEnded { success: true, .. })
        })
        .await;
        assert_eq!(
            std::fs::read(recv_dir.path().join("a.txt")).unwrap(),
            vec![7u8; 100]
        );

        client.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
        server.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn given_unreachable_peer_when_transferring_then_session_released_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let free_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut client_settings = settings("Alice", dir.path());
        client_settings.transfer_port = free_port;
        let (client, mut client_rx) = start_tcp_engine(
            client_settings,
            vec![device(SERVER_MAC, "Bob", ReceivePolicy::Deny, None)],
        );

        client
            .cmd_tx
            .send(EngineCmd::StartTransfer {
                device: SERVER_MAC,
                items: vec![dir.path().to_path_buf()],
            })
            .await
            .unwrap();

        let ended = wait_for_event(&mut client_rx, |e| {
            matches!(e, EngineEvent::SessionEnded { .. })
        })
        .await;
        assert!(matches!(ended, EngineEvent::SessionEnded { success: false, .. }));
        assert!(!client.is_busy());
        client.cmd_tx.send(EngineCmd::ShutDown).await.unwrap();
    }

    #[tokio::test]
    async fn when_answering_unknown_request_then_false() {
        let prompt = EventPrompt::new(EventBus::default());
        assert!(!prompt.answer(42, true));
    }
}
