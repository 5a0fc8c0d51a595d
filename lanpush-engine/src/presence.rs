//! UDP presence: announcing this device and tracking peers.
//!
//! One receive task decodes datagrams sequentially. Two interval tasks
//! broadcast `Present` and sweep the online registry. A `Hello` goes out
//! on start and a `Bye` on shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use lanpush_core::config::{NetworkIdentity, Settings};
use lanpush_core::device::{DeviceClass, MacAddress, truncate_name};
use lanpush_core::directory::{DeviceDirectory, DirectoryChange};
use lanpush_core::protocol::{Presence, PresencePacket};

use crate::events::{EngineEvent, EventBus};
use crate::registry::OnlineRegistry;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 2048;

// ── Processor ───────────────────────────────────────────────────────

/// Applies inbound presence datagrams to the directory and the registry.
pub struct PresenceProcessor {
    identity: NetworkIdentity,
    name: String,
    class: DeviceClass,
    directory: Arc<dyn DeviceDirectory>,
    registry: Arc<OnlineRegistry>,
    events: EventBus,
}

impl PresenceProcessor {
    pub fn new(
        identity: NetworkIdentity,
        name: &str,
        class: DeviceClass,
        directory: Arc<dyn DeviceDirectory>,
        registry: Arc<OnlineRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            identity,
            name: truncate_name(name),
            class,
            directory,
            registry,
            events,
        }
    }

    pub fn hello(&self) -> PresencePacket {
        self.packet(Presence::Hello {
            class: self.class,
            name: self.name.clone(),
        })
    }

    pub fn present(&self) -> PresencePacket {
        self.packet(Presence::Present {
            class: self.class,
            name: self.name.clone(),
        })
    }

    pub fn bye(&self) -> PresencePacket {
        self.packet(Presence::Bye)
    }

    fn packet(&self, presence: Presence) -> PresencePacket {
        PresencePacket {
            mac: self.identity.mac,
            presence,
        }
    }

    /// Handles one datagram received from `from`.
    ///
    /// Returns the courtesy `Present` to send back when the datagram was a
    /// `Hello`. Datagrams from our own address and undecodable datagrams
    /// are ignored.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<PresencePacket> {
        let IpAddr::V4(ip) = from.ip() else {
            return None;
        };
        if ip == self.identity.ip {
            return None;
        }
        let packet = match PresencePacket::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %from, error = %e, "Ignoring presence datagram");
                return None;
            }
        };
        if packet.mac == self.identity.mac {
            return None;
        }

        let mac = packet.mac;
        match packet.presence {
            Presence::Hello { class, name } => {
                self.upsert(mac, &name, ip, class);
                Some(self.present())
            }
            Presence::Present { class, name } => {
                self.upsert(mac, &name, ip, class);
                None
            }
            Presence::Bye => {
                debug!(mac = %mac, "Device said goodbye");
                self.registry.mark_offline(mac);
                None
            }
        }
    }

    fn upsert(&self, mac: MacAddress, name: &str, ip: Ipv4Addr, class: DeviceClass) {
        match self.directory.add_or_update(mac, name, ip, class) {
            DirectoryChange::Added => {
                self.events.info(format!("New device found: {name} ({ip})"));
                self.events.publish(EngineEvent::DeviceChanged { mac });
            }
            DirectoryChange::Updated { old_name, old_ip } => {
                let current = truncate_name(name);
                if let Some(old_name) = &old_name {
                    self.events
                        .info(format!("{old_name} changed name to '{current}'"));
                }
                if let Some(old_ip) = old_ip {
                    self.events
                        .warning(format!("{current}'s IP has changed from {old_ip} to {ip}"));
                }
                self.events.publish(EngineEvent::DeviceChanged { mac });
            }
            DirectoryChange::Unchanged => {}
        }
        self.registry.mark_online(mac);
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Running presence tasks. Call [`PresenceHandle::shutdown`] to say `Bye`.
pub struct PresenceHandle {
    socket: Arc<UdpSocket>,
    processor: Arc<PresenceProcessor>,
    broadcast_to: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PresenceService;

impl PresenceService {
    /// Binds the presence port, says `Hello` and spawns the receive loop,
    /// the periodic `Present` broadcast and the liveness sweep.
    ///
    /// # Errors
    ///
    /// Fails when the presence port cannot be bound or configured for
    /// broadcast.
    pub async fn start(
        settings: &Settings,
        identity: NetworkIdentity,
        directory: Arc<dyn DeviceDirectory>,
        registry: Arc<OnlineRegistry>,
        events: EventBus,
    ) -> anyhow::Result<PresenceHandle> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.presence_port));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind presence socket on {bind_addr}"))?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on presence socket")?;

        let broadcast_to = SocketAddr::from((identity.broadcast(), settings.presence_port));
        let processor = PresenceProcessor::new(
            identity,
            &settings.device_name,
            settings.device_class,
            directory,
            registry.clone(),
            events,
        );
        Ok(Self::run(socket, broadcast_to, processor, registry, settings).await)
    }

    /// Runs presence on an already bound socket, announcing to
    /// `broadcast_to`.
    pub async fn run(
        socket: UdpSocket,
        broadcast_to: SocketAddr,
        processor: PresenceProcessor,
        registry: Arc<OnlineRegistry>,
        settings: &Settings,
    ) -> PresenceHandle {
        let socket = Arc::new(socket);
        let processor = Arc::new(processor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            addr = ?socket.local_addr().ok(),
            broadcast = %broadcast_to,
            mac = %processor.identity.mac,
            "Presence started"
        );
        send_packet(&socket, &processor.hello(), broadcast_to).await;

        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            processor.clone(),
            shutdown_rx.clone(),
        ));

        let announcer = {
            let socket = socket.clone();
            let processor = processor.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            let mut interval = tokio::time::interval_at(
                Instant::now() + settings.presence_first_send_delay(),
                settings.presence_send_period(),
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            send_packet(&socket, &processor.present(), broadcast_to).await;
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            })
        };

        let sweeper = {
            let mut shutdown_rx = shutdown_rx;
            let mut interval = tokio::time::interval(settings.presence_timeout_check_period());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            registry.sweep_expired();
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            })
        };

        PresenceHandle {
            socket,
            processor,
            broadcast_to,
            shutdown_tx,
            tasks: vec![receiver, announcer, sweeper],
        }
    }
}

impl PresenceHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Broadcasts `Bye`, then stops every presence task.
    pub async fn shutdown(self) {
        send_packet(&self.socket, &self.processor.bye(), self.broadcast_to).await;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Presence stopped");
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    processor: Arc<PresenceProcessor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if let Some(reply) = processor.handle_datagram(&buf[..len], from) {
                        send_packet(&socket, &reply, from).await;
                    }
                }
                Err(e) => warn!(error = %e, "Presence receive failed"),
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("Presence receive loop exited");
}

async fn send_packet(socket: &UdpSocket, packet: &PresencePacket, to: SocketAddr) {
    if let Err(e) = socket.send_to(&packet.encode(), to).await {
        warn!(to = %to, opcode = ?packet.presence.opcode(), error = %e, "Presence send failed");
    }
}
