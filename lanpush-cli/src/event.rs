use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use lanpush_core::device::MacAddress;
use lanpush_core::directory::DeviceDirectory;
use lanpush_engine::events::{Direction, EngineEvent, Severity};

use crate::store::DeviceStore;
use crate::ui::{format_progress, print_prompt};

/// Inbound transfer waiting for a `yes` / `no` from the user.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request_id: u64,
    pub device_name: String,
}

/// Spawns a task that listens for engine events and prints them.
///
/// Permission requests are pushed into `pending_tx` so the prompt loop
/// can route the next `yes` / `no` to them. Directory changes are saved
/// to `store` as they happen.
pub fn spawn_event_printer(
    mut events_rx: broadcast::Receiver<EngineEvent>,
    directory: Arc<dyn DeviceDirectory>,
    store: DeviceStore,
    pending_tx: mpsc::UnboundedSender<PendingPermission>,
) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(EngineEvent::Progress(progress)) => {
                    print!("\r  {}", format_progress(&progress));
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                    if progress.completed {
                        println!();
                        print_prompt();
                    }
                }
                Ok(EngineEvent::PermissionRequested {
                    request_id,
                    device_name,
                    ..
                }) => {
                    println!();
                    println!("  📥 {device_name} wants to send you files.");
                    println!("     Type 'yes' or 'no' to respond.");
                    let _ = pending_tx.send(PendingPermission {
                        request_id,
                        device_name,
                    });
                    print_prompt();
                }
                Ok(EngineEvent::DeviceChanged { .. }) => {
                    if let Err(e) = store.save(&directory.devices()) {
                        warn!(error = %e, "Failed to save devices");
                    }
                }
                Ok(event) => {
                    if let Some(line) = describe(&event, &*directory) {
                        println!("\n  {line}");
                        print_prompt();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn device_label(directory: &dyn DeviceDirectory, mac: MacAddress) -> String {
    directory
        .device_by_mac(mac)
        .map_or_else(|| mac.to_string(), |d| d.name)
}

/// Console line for an event, or `None` for events printed elsewhere.
fn describe(event: &EngineEvent, directory: &dyn DeviceDirectory) -> Option<String> {
    let line = match event {
        EngineEvent::Log { severity, message } => {
            let icon = match severity {
                Severity::Info => "ℹ",
                Severity::Warning => "⚠",
                Severity::Error => "❌",
            };
            format!("{icon} {message}")
        }
        EngineEvent::Accepting { addr } => format!("✔ Listening on {addr}"),
        EngineEvent::AcceptingStopped => "⏹ Stopped accepting connections".into(),
        EngineEvent::DeviceOnline { mac } => {
            format!("🟢 {} is online", device_label(directory, *mac))
        }
        EngineEvent::DeviceOffline { mac } => {
            format!("⚪ {} went offline", device_label(directory, *mac))
        }
        EngineEvent::SessionEnded {
            peer,
            direction,
            success,
        } => {
            let what = match direction {
                Direction::Sending => "Sending to",
                Direction::Receiving => "Receiving from",
            };
            let outcome = if *success { "finished" } else { "stopped" };
            format!("👋 {what} {peer} {outcome}")
        }
        EngineEvent::DeviceChanged { .. }
        | EngineEvent::PermissionRequested { .. }
        | EngineEvent::Progress(_) => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use lanpush_core::device::DeviceClass;
    use lanpush_core::directory::MemoryDirectory;

    use super::*;

    const MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 7]);

    #[test]
    fn given_known_device_when_online_then_described_by_name() {
        let directory = MemoryDirectory::new();
        directory.add_or_update(MAC, "Alice", Ipv4Addr::new(10, 0, 0, 7), DeviceClass::Phone);
        let line = describe(&EngineEvent::DeviceOnline { mac: MAC }, &directory).unwrap();
        assert_eq!(line, "🟢 Alice is online");
    }

    #[test]
    fn given_unknown_device_when_offline_then_described_by_mac() {
        let directory = MemoryDirectory::new();
        let line = describe(&EngineEvent::DeviceOffline { mac: MAC }, &directory).unwrap();
        assert_eq!(line, "⚪ 02:00:00:00:00:07 went offline");
    }

    #[test]
    fn given_warning_log_then_prefixed() {
        let directory = MemoryDirectory::new();
        let event = EngineEvent::Log {
            severity: Severity::Warning,
            message: "careful".into(),
        };
        assert_eq!(describe(&event, &directory).unwrap(), "⚠ careful");
    }

    #[test]
    fn given_failed_session_then_reports_stopped() {
        let directory = MemoryDirectory::new();
        let event = EngineEvent::SessionEnded {
            peer: "Bob".into(),
            direction: Direction::Sending,
            success: false,
        };
        assert_eq!(describe(&event, &directory).unwrap(), "👋 Sending to Bob stopped");
    }
}
