//! # hichat
//!
//! HiChat server binary: opens the database, starts the relay, the
//! dispatcher and the HTTP/WebSocket listener.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hichat_server::{RelayMode, ServerConfig};
use hichat_store::Database;
use hichat_telemetry::{hichat_home, init_telemetry, TelemetryConfig};
use tracing::Level;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RelayKind {
    InProcess,
    Udp,
}

/// HiChat real-time chat server.
#[derive(Parser, Debug)]
#[command(name = "hichat", about = "HiChat real-time chat server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Transport between session readers and the dispatcher.
    #[arg(long, value_enum, default_value = "in-process")]
    relay: RelayKind,

    /// Loopback address of the UDP relay.
    #[arg(long, default_value = "127.0.0.1:3000")]
    relay_addr: SocketAddr,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Path to the warn+ incident database.
    #[arg(long)]
    log_db_path: Option<PathBuf>,

    /// Do not record warn+ incidents to SQLite.
    #[arg(long)]
    no_log_db: bool,

    /// Refuse WebSocket connections from unknown user ids.
    #[arg(long)]
    verify_users: bool,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        hichat_home().join("database").join("hichat.db")
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            log_level: self.log_level,
            log_to_sqlite: !self.no_log_db,
            log_db_path: self.log_db_path.clone().unwrap_or(defaults.log_db_path),
            ..defaults
        }
    }

    fn server_config(&self) -> ServerConfig {
        let relay = match self.relay {
            RelayKind::InProcess => RelayMode::InProcess,
            RelayKind::Udp => RelayMode::Udp {
                addr: self.relay_addr,
            },
        };
        ServerConfig {
            port: self.port,
            bind_host: self.host.clone(),
            relay,
            verify_users: self.verify_users,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(cli.telemetry_config());
    match telemetry.incident_db() {
        Some(path) => tracing::info!(incident_db = %path.display(), "Starting HiChat server"),
        None => tracing::info!("Starting HiChat server"),
    }

    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let handle = hichat_server::start(cli.server_config(), db)
        .await
        .context("Failed to start server")?;

    tracing::info!(port = handle.port, "HiChat server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown();
    Ok(())
}
