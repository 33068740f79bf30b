mod incidents;

pub use incidents::{IncidentLayer, IncidentStore};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "hichat_server::relay" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ events to the incident table.
    pub log_to_sqlite: bool,
    /// Path to the incident database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: hichat_home().join("database/hichat-logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,hichat_server=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Holds the incident store open for the lifetime of the process.
pub struct TelemetryGuard {
    incidents: Option<Arc<IncidentStore>>,
}

impl TelemetryGuard {
    /// Where warn+ events are being recorded, if anywhere.
    pub fn incident_db(&self) -> Option<&Path> {
        self.incidents.as_deref().map(IncidentStore::path)
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    // JSON formatting layer for stdout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let incidents = if config.log_to_sqlite {
        match IncidentStore::open(&config.log_db_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                eprintln!("hichat-telemetry: failed to open incident DB: {e}");
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(incidents.clone().map(IncidentLayer::new))
        .init();

    TelemetryGuard { incidents }
}

/// Base directory for default data paths (`~/.hichat`).
pub fn hichat_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".hichat")
}
