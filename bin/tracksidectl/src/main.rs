//! ---
//! ts_section: "05-networking-external-interfaces"
//! ts_subsection: "binary"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Control CLI for a running link daemon."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use trackside_client::LinkManager;
use trackside_common::{init_cli, AppConfig};
use trackside_proto::{LinkEvent, StatusEvent, Telemetry};

mod device;
mod drive;

#[derive(Debug, Parser)]
#[command(author, version, about = "Trackside link control utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionOptions,
    #[command(subcommand)]
    command: Commands,
}

/// How to reach the daemon.
#[derive(Debug, Args)]
pub struct ConnectionOptions {
    /// WebSocket URL of the daemon.
    #[arg(long, env = "TRACKSIDE_URL", default_value = "ws://127.0.0.1:8000/ws", global = true)]
    pub url: String,
    /// Configuration file supplying throttle and watchdog settings.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
    /// Seconds to wait for replies.
    #[arg(long, default_value_t = 3, global = true)]
    pub wait: u64,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the link status.
    Status,
    /// Open a serial port or `TEST` and wait for confirmation.
    Open { endpoint: String },
    /// Close the active link.
    Close,
    /// Direction and speed.
    #[command(subcommand)]
    Drive(drive::DriveCommand),
    /// PID parameters.
    #[command(subcommand)]
    Pid(drive::PidCommand),
    /// Read a device parameter (pid, turnouts, relays, post, ports, accp, accm, updt).
    Get { name: String },
    /// Write a device parameter (updt, accp, accm).
    Set { name: String, value: u32 },
    /// Actuate a turnout output.
    Acc(device::AccessoryArgs),
    /// Switch a relay.
    Relay(device::RelayArgs),
    /// Self test, port map and device counts.
    Diag,
    /// Stream events as JSON lines.
    Monitor {
        /// Stop after this many events.
        #[arg(long)]
        count: Option<usize>,
        /// Prefix each line with the local receive time.
        #[arg(long)]
        timestamps: bool,
    },
}

fn main() -> Result<()> {
    init_cli();
    let cli = Cli::parse();
    let runtime = Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.connection)?;
    debug!(url = %cli.connection.url, "connecting to daemon");
    let manager = LinkManager::connect(&cli.connection.url, &config)
        .await
        .with_context(|| format!("failed to reach daemon at {}", cli.connection.url))?;
    let wait = Duration::from_secs(cli.connection.wait);

    let outcome = match cli.command {
        Commands::Status => status(&manager, wait).await,
        Commands::Open { endpoint } => open(&manager, &endpoint, wait).await,
        Commands::Close => {
            manager.close_endpoint().await?;
            println!("closed");
            Ok(())
        }
        Commands::Drive(cmd) => drive::run_drive(&manager, cmd, wait).await,
        Commands::Pid(cmd) => drive::run_pid(&manager, cmd, wait).await,
        Commands::Get { name } => device::get(&manager, &name, wait).await,
        Commands::Set { name, value } => device::set(&manager, &name, value, wait).await,
        Commands::Acc(args) => device::accessory(&manager, args, wait).await,
        Commands::Relay(args) => device::relay(&manager, args, wait).await,
        Commands::Diag => device::diag(&manager, wait).await,
        Commands::Monitor { count, timestamps } => monitor(&manager, count, timestamps).await,
    };
    manager.shutdown().await;
    outcome
}

fn load_config(options: &ConnectionOptions) -> Result<AppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = &options.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/trackside.toml"));
    Ok(AppConfig::load_with_source(&candidates)?.config)
}

async fn status(manager: &LinkManager, wait: Duration) -> Result<()> {
    let mut events = manager.subscribe();
    manager.request_status().await?;
    let deadline = Instant::now() + wait;
    loop {
        match next_event(&mut events, deadline).await? {
            LinkEvent::Status(status) => {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            LinkEvent::Input(_) => {}
        }
    }
}

async fn open(manager: &LinkManager, endpoint: &str, wait: Duration) -> Result<()> {
    let mut events = manager.subscribe();
    manager.open_endpoint(endpoint).await?;
    // Allow the confirmation frames on top of the reply wait.
    let deadline = Instant::now() + wait + Duration::from_secs(3);
    loop {
        if let LinkEvent::Status(status) = next_event(&mut events, deadline).await? {
            match status {
                StatusEvent { open: true, .. } => {
                    println!("open: {}", status.endpoint.as_deref().unwrap_or(endpoint));
                    return Ok(());
                }
                StatusEvent {
                    error: true,
                    message,
                    ..
                } => bail!(
                    "failed to open {endpoint}: {}",
                    message.unwrap_or_else(|| "unknown error".into())
                ),
                _ => {}
            }
        }
    }
}

async fn monitor(manager: &LinkManager, count: Option<usize>, timestamps: bool) -> Result<()> {
    let mut events = manager.subscribe();
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => {
                    let line = serde_json::to_string(&event)?;
                    if timestamps {
                        println!("{} {line}", Local::now().format("%H:%M:%S%.3f"));
                    } else {
                        println!("{line}");
                    }
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => eprintln!("skipped {skipped} events"),
                Err(RecvError::Closed) => bail!("daemon connection closed"),
            },
        }
    }
}

/// Next event before `deadline`.
pub(crate) async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<LinkEvent>,
    deadline: Instant,
) -> Result<LinkEvent> {
    loop {
        match timeout_at(deadline, events.recv()).await {
            Err(_) => bail!("timed out waiting for the daemon"),
            Ok(Ok(event)) => return Ok(event),
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => bail!("daemon connection closed"),
        }
    }
}

/// Waits for the reply to a command named `cmd`, skipping periodic traffic
/// and echoes. A negative acknowledgement is an error.
pub(crate) async fn await_reply(
    events: &mut tokio::sync::broadcast::Receiver<LinkEvent>,
    cmd: &str,
    wait: Duration,
) -> Result<Telemetry> {
    let deadline = Instant::now() + wait;
    loop {
        let LinkEvent::Input(telemetry) = next_event(events, deadline).await? else {
            continue;
        };
        match &telemetry {
            Telemetry::Ack(ack) if ack.cmd == cmd && !ack.ok => {
                bail!("device rejected `{cmd}`")
            }
            Telemetry::Ack(_)
            | Telemetry::Sample(_)
            | Telemetry::Heartbeat(_)
            | Telemetry::Direction(_)
            | Telemetry::Echo(_) => {}
            _ => return Ok(telemetry),
        }
    }
}

/// Waits for the acknowledgement of `cmd`.
pub(crate) async fn await_ack(
    events: &mut tokio::sync::broadcast::Receiver<LinkEvent>,
    cmd: &str,
    wait: Duration,
) -> Result<()> {
    let deadline = Instant::now() + wait;
    loop {
        if let LinkEvent::Input(Telemetry::Ack(ack)) = next_event(events, deadline).await? {
            if ack.cmd == cmd {
                if ack.ok {
                    return Ok(());
                }
                bail!("device rejected `{cmd}`");
            }
        }
    }
}

/// Fails fast when no device link is open.
pub(crate) async fn require_open(manager: &LinkManager, wait: Duration) -> Result<()> {
    manager
        .wait_connected(wait)
        .await
        .context("no device link is open; run `tracksidectl open <endpoint>` first")
}
