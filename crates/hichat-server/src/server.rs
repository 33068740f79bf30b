use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use hichat_core::RelayError;
use hichat_store::{CommunityRepo, Database, HistoryRepo, UserRepo};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::relay::{Relay, RelayConfig, RelayMode, RelaySender, MAX_UDP_PAYLOAD};
use crate::session::SessionRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_host: String,
    /// Outbound queue depth per session.
    pub session_queue_capacity: usize,
    pub relay_queue_capacity: usize,
    pub relay: RelayMode,
    pub max_datagram_bytes: usize,
    pub heartbeat_interval: Duration,
    /// Reject WebSocket upgrades for ids missing from the user table.
    pub verify_users: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_host: "0.0.0.0".to_string(),
            session_queue_capacity: 50,
            relay_queue_capacity: 1024,
            relay: RelayMode::InProcess,
            max_datagram_bytes: MAX_UDP_PAYLOAD,
            heartbeat_interval: Duration::from_secs(30),
            verify_users: false,
        }
    }
}

impl ServerConfig {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            mode: self.relay.clone(),
            queue_capacity: self.relay_queue_capacity,
            max_datagram_bytes: self.max_datagram_bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("relay failed to start: {0}")]
    Relay(#[from] RelayError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub relay: RelaySender,
    pub history: HistoryRepo,
    pub communities: CommunityRepo,
    pub users: UserRepo,
    pub heartbeat_interval: Duration,
    pub verify_users: bool,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/message/send", get(handlers::ws_handler))
        .route("/v1/message/get-records", post(handlers::records_handler))
        .route("/v1/relation/new", post(handlers::create_group_handler))
        .route("/v1/relation/join", post(handlers::join_group_handler))
        .route("/health", get(handlers::health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the relay, the dispatcher and the HTTP listener.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, ServerError> {
    let registry = Arc::new(SessionRegistry::new(config.session_queue_capacity));
    let history = HistoryRepo::new(db.clone());
    let communities = CommunityRepo::new(db.clone());
    let users = UserRepo::new(db);

    let relay = Relay::start(&config.relay_config()).await?;
    let relay_addr = relay.local_addr();
    let (relay_sender, ingress, mut tasks) = relay.into_parts();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        history.clone(),
        Arc::new(communities.clone()),
    ));
    tasks.push(tokio::spawn(dispatcher.run(ingress)));

    let state = AppState {
        registry: Arc::clone(&registry),
        relay: relay_sender,
        history,
        communities,
        users,
        heartbeat_interval: config.heartbeat_interval,
        verify_users: config.verify_users,
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.bind_host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(source) => {
            for task in &tasks {
                task.abort();
            }
            return Err(ServerError::Bind { addr, source });
        }
    };
    let local_addr = listener.local_addr()?;

    tracing::info!(
        port = local_addr.port(),
        relay = ?config.relay,
        "HiChat server started"
    );

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        relay_addr,
        registry,
        server,
        tasks,
    })
}

/// Handle returned by `start()`. Dropping it leaves the tasks running;
/// call [`shutdown`](Self::shutdown) to stop them.
pub struct ServerHandle {
    pub port: u16,
    /// Bound UDP relay address, when the relay runs over UDP.
    pub relay_addr: Option<SocketAddr>,
    registry: Arc<SessionRegistry>,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn shutdown(self) {
        self.server.abort();
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("HiChat server stopped");
    }
}
