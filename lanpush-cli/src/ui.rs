use std::io::Write;

use lanpush_core::config::{NetworkIdentity, Settings};
use lanpush_engine::events::TransferProgress;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// One-line progress bar, e.g. `📥 [██████░░░░]  60%  a.txt  90 B / 150 B`.
pub fn format_progress(progress: &TransferProgress) -> String {
    const WIDTH: usize = 30;
    let pct = progress.percent();
    let filled = WIDTH * usize::from(pct) / 100;
    let icon = match progress.direction {
        lanpush_engine::events::Direction::Sending => "📤",
        lanpush_engine::events::Direction::Receiving => "📥",
    };
    format!(
        "{icon} [{}{}] {pct:>3}%  {}  {} / {}",
        "█".repeat(filled),
        "░".repeat(WIDTH - filled),
        progress.active_item,
        format_size(progress.bytes_done),
        format_size(progress.total_bytes),
    )
}

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with device info.
pub fn print_banner(settings: &Settings, identity: &NetworkIdentity) {
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                  📡  lanpush  CLI                    ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Device  : {:<41} ║", settings.device_name);
    println!("║  MAC     : {:<41} ║", identity.mac.to_string());
    println!("║  Address : {:<41} ║", identity.ip.to_string());
    println!("║  Ports   : {:<41} ║", format!("presence {} / transfer {}", settings.presence_port, settings.transfer_port));
    println!("║  Save to : {:<41} ║", settings.save_dir.display().to_string());
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    devices                     List known devices and their status");
    println!("    send <device> <path>...     Send files or folders to a device");
    println!("    allow|ask|deny <device>     Set whether a device may send to you");
    println!("    password <device> <secret>  Encrypt transfers with a device");
    println!("    nopass <device>             Stop encrypting transfers with a device");
    println!("    forget <device>             Remove a device from the list");
    println!("    yes | no                    Answer the oldest permission request");
    println!("    help                        Show this help");
    println!("    quit                        Say goodbye and exit");
    println!();
    println!("  <device> is a number from `devices`, a name or a MAC address.");
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}
