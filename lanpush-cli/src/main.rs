mod command;
mod event;
mod store;
mod ui;

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use lanpush_core::config::{NetworkIdentity, Settings};
use lanpush_core::device::{MacAddress, truncate_name};
use lanpush_core::directory::{DeviceDirectory, MemoryDirectory};
use lanpush_engine::engine::{Engine, EngineCmd, EngineContext};
use lanpush_engine::events::EventBus;
use lanpush_engine::presence::PresenceService;
use lanpush_engine::registry::OnlineRegistry;
use lanpush_engine::session::SessionSlot;
use lanpush_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::{CliContext, Command, Flow, execute};
use crate::event::{PendingPermission, spawn_event_printer};
use crate::store::DeviceStore;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// lanpush: push files and folders to devices on the local network.
///
/// Announces this device over UDP broadcast, keeps track of which known
/// devices are online, and accepts or sends transfers over TCP. An
/// interactive prompt manages devices and starts transfers.
#[derive(Parser, Debug)]
#[command(name = "lanpush", version, about)]
struct Args {
    /// JSON settings file. Missing fields use defaults.
    #[arg(short, long, default_value = "lanpush.json")]
    config: PathBuf,

    /// Name announced to other devices (at most 20 characters).
    #[arg(short, long)]
    name: Option<String>,

    /// MAC address of the interface to announce, e.g. `AA:BB:CC:DD:EE:FF`.
    #[arg(short, long)]
    mac: Option<MacAddress>,

    /// IPv4 address of that interface. Detected when omitted.
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Subnet mask used to derive the broadcast address.
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,

    /// Directory where received files are stored.
    #[arg(short, long)]
    save_dir: Option<PathBuf>,

    /// JSON file holding known devices, policies and passwords.
    #[arg(short, long, default_value = "lanpush-devices.json")]
    devices: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the prompt on stdout.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lanpush_cli=info,warn")),
        )
        .init();

    let mut settings = Settings::load(&args.config)?;
    if let Some(name) = &args.name {
        settings.device_name = truncate_name(name);
    }
    if let Some(dir) = args.save_dir {
        settings.save_dir = dir;
    }
    if let Some(mac) = args.mac {
        settings.interface_mac = Some(mac);
    }

    let Some(mac) = settings.interface_mac else {
        bail!(
            "no interface MAC configured: pass --mac or set interface_mac in {}",
            args.config.display()
        );
    };
    let ip = match args.ip {
        Some(ip) => ip,
        None => detect_local_ip().context("failed to detect the local IPv4 address, pass --ip")?,
    };
    let identity = NetworkIdentity {
        mac,
        ip,
        netmask: args.netmask,
    };

    std::fs::create_dir_all(&settings.save_dir).with_context(|| {
        format!("failed to create save directory {}", settings.save_dir.display())
    })?;

    let store = DeviceStore::new(args.devices);
    let directory: Arc<dyn DeviceDirectory> =
        Arc::new(MemoryDirectory::with_devices(store.load()?));
    let events = EventBus::default();
    let registry = Arc::new(OnlineRegistry::new(settings.liveness_timeout(), events.clone()));

    let handle = Engine.start(
        TcpListenerFactory,
        TcpConnector::new(settings.max_ping()),
        EngineContext {
            settings: settings.clone(),
            directory: directory.clone(),
            events: events.clone(),
            session: SessionSlot::new(),
        },
    );

    let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<PendingPermission>();
    spawn_event_printer(handle.subscribe(), directory.clone(), store.clone(), pending_tx);

    handle
        .cmd_tx
        .send(EngineCmd::StartAccepting {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.transfer_port)).to_string(),
        })
        .await
        .context("engine stopped before it could listen")?;

    let presence = PresenceService::start(
        &settings,
        identity,
        directory.clone(),
        registry.clone(),
        events,
    )
    .await?;

    // Let the "Listening on ..." line print before the banner.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    print_banner(&settings, &identity);
    print_help();
    print_prompt();

    let mut ctx = CliContext {
        directory,
        registry,
        cmd_tx: handle.cmd_tx.clone(),
        store,
        pending: VecDeque::new(),
    };
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        tokio::select! {
            biased;

            Some(request) = pending_rx.recv() => {
                ctx.pending.push_back(request);
            }

            line = read_line(&mut stdin) => {
                let Some(line) = line else {
                    break;
                };
                if line.is_empty() {
                    print_prompt();
                    continue;
                }
                match Command::parse(&line) {
                    Ok(command) => {
                        if execute(command, &mut ctx).await == Flow::Quit {
                            break;
                        }
                    }
                    Err(usage) => println!("  {usage}"),
                }
                print_prompt();
            }
        }
    }

    println!("\n  Shutting down...");
    presence.shutdown().await;
    let _ = ctx.cmd_tx.send(EngineCmd::ShutDown).await;
    ctx.store
        .save(&ctx.directory.devices())
        .with_context(|| format!("failed to save devices to {}", ctx.store.path().display()))?;
    // Give running sessions a moment to clean up.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Exited cleanly");
    println!("  Bye! 👋");
    Ok(())
}

/// Finds the IPv4 address the OS would route outbound traffic from.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn detect_local_ip() -> anyhow::Result<Ipv4Addr> {
    let socket =
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("failed to bind probe socket")?;
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 65530))
        .context("no route to the outside network")?;
    match socket.local_addr().context("failed to read probe socket address")? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => bail!("unexpected local address {other}"),
    }
}
