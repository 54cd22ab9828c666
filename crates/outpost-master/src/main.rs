//! Outpost Master
//!
//! Accepts mTLS WebSocket connections from paired slaves and relays tool
//! calls to them. Offline subcommands manage pairing and credentials against
//! the same data directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use outpost_master::app::Master;
use outpost_master::config::{DEFAULT_LISTEN_ADDR, MasterConfig, default_data_dir};
use outpost_master::upstream::NoUpstream;

#[derive(Parser, Debug)]
#[command(name = "outpost-master")]
#[command(version, about = "Outpost master - pairing and tool relay for remote slaves")]
struct Args {
    /// Directory holding the CA and, by default, the database.
    #[arg(long, env = "OUTPOST_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long, env = "OUTPOST_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the slave listener (default).
    Serve(ServeArgs),
    /// Inspect and decide pairing requests.
    #[command(subcommand)]
    Pairing(PairingCommand),
    /// Inspect and revoke paired slaves.
    #[command(subcommand)]
    Slaves(SlavesCommand),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "OUTPOST_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    addr: SocketAddr,

    /// DNS names and IPs for the master's TLS certificate.
    #[arg(long = "server-name", env = "OUTPOST_SERVER_NAMES", value_delimiter = ',')]
    server_names: Vec<String>,

    /// Tool call timeout in seconds.
    #[arg(long, env = "OUTPOST_RELAY_TIMEOUT", default_value_t = 30)]
    relay_timeout: u64,

    /// Heartbeat sweep interval in seconds.
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,

    /// Seconds without a heartbeat before a slave is evicted.
    #[arg(long, env = "OUTPOST_HEARTBEAT_TIMEOUT", default_value_t = 120)]
    heartbeat_timeout: u64,

    /// Seconds a new connection has to send `register`.
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// Pairing code lifetime in seconds.
    #[arg(long, env = "OUTPOST_PAIRING_TTL", default_value_t = 600)]
    pairing_ttl: u64,

    /// Validity of issued slave certificates in days.
    #[arg(long, env = "OUTPOST_CERT_VALIDITY_DAYS", default_value_t = 365)]
    cert_validity_days: u32,
}

#[derive(Subcommand, Debug)]
enum PairingCommand {
    /// List pending pairing requests.
    List,
    /// Approve a pairing request and issue the slave's certificate.
    Approve { host_id: String, code: String },
    /// Deny a pairing request.
    Deny { host_id: String, code: String },
}

#[derive(Subcommand, Debug)]
enum SlavesCommand {
    /// List paired slaves.
    List,
    /// Revoke a slave's certificate and disable it.
    Revoke {
        host_id: String,
        #[arg(long, default_value = "revoked by operator")]
        reason: String,
    },
    /// List revoked certificates.
    Revoked,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    outpost_core::tracing_init::init_tracing("outpost_master=info", args.log_json);

    let mut config = MasterConfig::with_data_dir(args.data_dir.unwrap_or_else(default_data_dir));
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    match args.command {
        None => serve(config).await,
        Some(Command::Serve(serve_args)) => {
            apply_serve_args(&mut config, serve_args);
            serve(config).await
        }
        Some(Command::Pairing(cmd)) => pairing_command(config, cmd).await,
        Some(Command::Slaves(cmd)) => slaves_command(config, cmd).await,
    }
}

fn apply_serve_args(config: &mut MasterConfig, args: ServeArgs) {
    config.listen_addr = args.addr;
    if !args.server_names.is_empty() {
        config.server_names = args.server_names;
    }
    config.relay_timeout = Duration::from_secs(args.relay_timeout);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    config.heartbeat_timeout = Duration::from_secs(args.heartbeat_timeout);
    config.handshake_timeout = Duration::from_secs(args.handshake_timeout);
    config.pairing_ttl = Duration::from_secs(args.pairing_ttl);
    config.cert_validity_days = args.cert_validity_days;
}

async fn open(config: MasterConfig) -> anyhow::Result<Master> {
    Ok(Master::open(config, Arc::new(NoUpstream), Arc::new(NoUpstream)).await?)
}

async fn serve(config: MasterConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        "Starting outpost-master"
    );

    let master = open(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = master.spawn_background(&shutdown_rx);

    let listener = tokio::net::TcpListener::bind(master.config.listen_addr).await?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        shutdown_tx.send_replace(true);
    });

    master.serve(listener, shutdown_rx).await?;
    for task in background {
        let _ = task.await;
    }

    info!("Master stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn pairing_command(config: MasterConfig, cmd: PairingCommand) -> anyhow::Result<()> {
    let master = open(config).await?;
    let pairing = &master.state.pairing;

    match cmd {
        PairingCommand::List => {
            let pending = pairing.pending_requests().await;
            if pending.is_empty() {
                println!("No pending pairing requests");
            }
            for request in pending {
                println!(
                    "{}  {}  platform={}  expires_at={}",
                    request.pairing_code, request.host_id, request.platform, request.expires_at
                );
            }
        }
        PairingCommand::Approve { host_id, code } => {
            let approved = pairing.approve(&host_id, &code).await?;
            println!(
                "Approved {host_id}: serial {} valid until {}",
                approved.serial, approved.expires_at
            );
        }
        PairingCommand::Deny { host_id, code } => {
            pairing.deny(&host_id, &code).await?;
            println!("Denied pairing request {code} for {host_id}");
        }
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn slaves_command(config: MasterConfig, cmd: SlavesCommand) -> anyhow::Result<()> {
    let master = open(config).await?;
    let manager = master.manager();

    match cmd {
        SlavesCommand::List => {
            for slave in manager.list_slaves().await? {
                println!(
                    "{}  platform={}  serial={}  enabled={}  version={}  last_seen={}",
                    slave.host_id,
                    slave.platform,
                    slave.cert_serial,
                    slave.enabled,
                    if slave.version.is_empty() { "-" } else { &slave.version },
                    slave
                        .last_seen
                        .map_or_else(|| "never".to_string(), |t| t.to_string()),
                );
            }
        }
        SlavesCommand::Revoke { host_id, reason } => {
            if manager.revoke_credential(&host_id, &reason).await? {
                println!("Revoked certificate of {host_id}");
            } else {
                println!("Certificate of {host_id} was already revoked");
            }
        }
        SlavesCommand::Revoked => {
            for revoked in manager.list_revoked().await? {
                println!(
                    "{}  serial={}  revoked_at={}  reason={}",
                    revoked.host_id, revoked.cert_serial, revoked.revoked_at, revoked.reason
                );
            }
        }
    }
    Ok(())
}
