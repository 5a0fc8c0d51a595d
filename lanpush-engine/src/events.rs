use tokio::sync::broadcast;
use tracing::{info, warn};

use lanpush_core::device::MacAddress;

/// Importance of a recordable log event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Which way bytes flow in a transfer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Progress snapshot of the active transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// Name of the file currently streaming (empty before the first file).
    pub active_item: String,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub direction: Direction,
    /// Set on the final report of a session, successful or not.
    pub completed: bool,
}

impl TransferProgress {
    /// Whole percentage, forced to 100 once completed.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.completed || self.total_bytes == 0 {
            return 100;
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by 100
        let pct = (u128::from(self.bytes_done) * 100 / u128::from(self.total_bytes)).min(100) as u8;
        pct
    }
}

/// Events emitted by the engine and the presence service for UIs to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A recordable message for the console.
    Log { severity: Severity, message: String },
    /// The transfer listener is bound and accepting connections on `addr`.
    Accepting { addr: String },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A device went from offline to online.
    DeviceOnline { mac: MacAddress },
    /// A device timed out or said goodbye.
    DeviceOffline { mac: MacAddress },
    /// A device was added to the directory or its name/address changed.
    DeviceChanged { mac: MacAddress },
    /// An inbound transfer from a device with the "ask each time" policy is
    /// waiting for an answer via `EngineCmd::AnswerPermission`.
    PermissionRequested {
        request_id: u64,
        mac: MacAddress,
        device_name: String,
    },
    Progress(TransferProgress),
    /// The session slot was released.
    SessionEnded {
        peer: String,
        direction: Direction,
        success: bool,
    },
}

/// Broadcast bus shared by presence, registry and engine tasks.
///
/// Sending never fails: events published while nobody listens are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Publishes a recordable event and mirrors it into the tracing log.
    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!("{message}"),
            Severity::Warning | Severity::Error => warn!(severity = ?severity, "{message}"),
        }
        self.publish(EngineEvent::Log { severity, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Severity::Error, message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
