use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use lanpush_core::device::{Device, MacAddress, ReceivePolicy};
use lanpush_core::directory::DeviceDirectory;
use lanpush_engine::engine::EngineCmd;
use lanpush_engine::registry::OnlineRegistry;

use crate::event::PendingPermission;
use crate::store::DeviceStore;
use crate::ui::print_help;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Devices,
    Send { device: String, paths: Vec<PathBuf> },
    Policy { device: String, policy: ReceivePolicy },
    Password { device: String, password: String },
    NoPassword { device: String },
    Forget { device: String },
    Answer(bool),
    Help,
    Quit,
}

impl Command {
    /// Parses a non-empty input line. The error is a usage hint.
    pub fn parse(line: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = words.split_first() else {
            return Err("Type 'help' for usage.".into());
        };

        match (*verb, args) {
            ("devices" | "ls", []) => Ok(Self::Devices),
            ("send", [device, paths @ ..]) if !paths.is_empty() => Ok(Self::Send {
                device: (*device).to_string(),
                paths: paths.iter().map(PathBuf::from).collect(),
            }),
            ("send", _) => Err("Usage: send <device> <path>...".into()),
            ("allow" | "ask" | "deny", [device]) => Ok(Self::Policy {
                device: (*device).to_string(),
                policy: match *verb {
                    "allow" => ReceivePolicy::AllowAlways,
                    "ask" => ReceivePolicy::AskEachTime,
                    _ => ReceivePolicy::Deny,
                },
            }),
            ("allow" | "ask" | "deny", _) => Err(format!("Usage: {verb} <device>")),
            ("password", [device, password]) => Ok(Self::Password {
                device: (*device).to_string(),
                password: (*password).to_string(),
            }),
            ("password", _) => Err("Usage: password <device> <secret>".into()),
            ("nopass", [device]) => Ok(Self::NoPassword {
                device: (*device).to_string(),
            }),
            ("forget", [device]) => Ok(Self::Forget {
                device: (*device).to_string(),
            }),
            ("nopass" | "forget", _) => Err(format!("Usage: {verb} <device>")),
            ("yes" | "y", []) => Ok(Self::Answer(true)),
            ("no" | "n", []) => Ok(Self::Answer(false)),
            ("help" | "?", _) => Ok(Self::Help),
            ("quit" | "exit" | "q", _) => Ok(Self::Quit),
            (other, _) => Err(format!(
                "Unknown command: \"{other}\". Type 'help' for usage."
            )),
        }
    }
}

/// Finds a device by its 1-based position in the listing, its MAC, or
/// its name (case-insensitive).
pub fn resolve_device(directory: &dyn DeviceDirectory, token: &str) -> Option<Device> {
    let devices = directory.devices();
    if let Ok(index) = token.parse::<usize>() {
        return index.checked_sub(1).and_then(|i| devices.get(i).cloned());
    }
    if let Ok(mac) = token.parse::<MacAddress>() {
        return directory.device_by_mac(mac);
    }
    devices
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(token))
}

/// What the prompt loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Everything a command may touch.
pub struct CliContext {
    pub directory: Arc<dyn DeviceDirectory>,
    pub registry: Arc<OnlineRegistry>,
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub store: DeviceStore,
    pub pending: VecDeque<PendingPermission>,
}

impl CliContext {
    fn save(&self) {
        if let Err(e) = self.store.save(&self.directory.devices()) {
            println!("  ❌ Failed to save devices: {e:#}");
        }
    }

    fn lookup(&self, token: &str) -> Option<Device> {
        let found = resolve_device(&*self.directory, token);
        if found.is_none() {
            println!("  ❓ No device matches \"{token}\". Type 'devices' to list them.");
        }
        found
    }
}

pub async fn execute(command: Command, ctx: &mut CliContext) -> Flow {
    match command {
        Command::Devices => print_devices(ctx),
        Command::Send { device, paths } => {
            let Some(device) = ctx.lookup(&device) else {
                return Flow::Continue;
            };
            if let Some(missing) = paths.iter().find(|p| !p.exists()) {
                println!("  ❌ {} does not exist", missing.display());
                return Flow::Continue;
            }
            if !ctx.registry.is_online(device.mac) {
                println!("  ⚠ {} looks offline, trying anyway...", device.name);
            }
            println!("  📤 Sending {} item(s) to {}...", paths.len(), device.name);
            if let Err(e) = ctx
                .cmd_tx
                .send(EngineCmd::StartTransfer {
                    device: device.mac,
                    items: paths,
                })
                .await
            {
                println!("  ❌ Failed to reach the engine: {e}");
            }
        }
        Command::Policy { device, policy } => {
            if let Some(device) = ctx.lookup(&device) {
                ctx.directory.set_receive_policy(device.mac, policy);
                println!("  ✔ {} receive policy: {policy}", device.name);
                ctx.save();
            }
        }
        Command::Password { device, password } => {
            if let Some(device) = ctx.lookup(&device) {
                ctx.directory
                    .set_encryption_password(device.mac, Some(password));
                println!("  🔒 Transfers with {} are now encrypted", device.name);
                ctx.save();
            }
        }
        Command::NoPassword { device } => {
            if let Some(device) = ctx.lookup(&device) {
                ctx.directory.set_encryption_password(device.mac, None);
                println!("  🔓 Transfers with {} are no longer encrypted", device.name);
                ctx.save();
            }
        }
        Command::Forget { device } => {
            if let Some(device) = ctx.lookup(&device) {
                ctx.directory.remove(device.mac);
                println!("  🗑 Forgot {}", device.name);
                ctx.save();
            }
        }
        Command::Answer(allow) => match ctx.pending.pop_front() {
            Some(request) => {
                let verb = if allow { "Accepting" } else { "Refusing" };
                println!("  {verb} files from {}", request.device_name);
                let _ = ctx
                    .cmd_tx
                    .send(EngineCmd::AnswerPermission {
                        request_id: request.request_id,
                        allow,
                    })
                    .await;
            }
            None => println!("  ℹ Nobody is waiting for an answer right now."),
        },
        Command::Help => print_help(),
        Command::Quit => return Flow::Quit,
    }
    Flow::Continue
}

fn print_devices(ctx: &CliContext) {
    let devices = ctx.directory.devices();
    if devices.is_empty() {
        println!("  No devices found yet. They appear as soon as they announce themselves.");
        return;
    }
    for (i, device) in devices.iter().enumerate() {
        let status = if ctx.registry.is_online(device.mac) {
            "🟢"
        } else {
            "⚪"
        };
        let lock = if device.encryption_enabled() { " 🔒" } else { "" };
        println!(
            "  {:>2}. {status} {:<20} {}  {:<15} {}{lock}",
            i + 1,
            device.name,
            device.mac,
            device.ip.to_string(),
            device.policy,
        );
    }
}
