//! Tangle Server - HTTP surface for the workflow engine.
//!
//! A thin axum adapter over `tangle-core`, providing:
//! - RESTful workflow, execution, agent and entanglement APIs
//! - Server-sent event stream of engine events
//! - Audit queries and a health endpoint
//!
//! This crate can be used standalone (via `tangle-cli`) or embedded in
//! other applications that already own a `StateBuilder`.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use tangle_core::audit::{AuditSink, JsonlAuditSink, MemoryAuditSink};
use tangle_core::store::AuditStore;
use tangle_core::{AppState, CoreConfig, Database, StateBuilder};

/// How often idle agents are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the Tangle HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// SQLite file for workflows, executions, agents and entanglements.
    /// `None` keeps everything in memory.
    pub db_path: Option<String>,
    /// Directory for JSONL audit files. Takes precedence over the
    /// database audit table.
    pub audit_dir: Option<String>,
    /// YAML file with `CoreConfig` settings.
    pub config_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3210,
            db_path: None,
            audit_dir: None,
            config_path: None,
        }
    }
}

/// Load the core config named by `config_path`, or defaults plus
/// `TANGLE_*` overrides.
pub fn load_core_config(config_path: Option<&str>) -> Result<CoreConfig, String> {
    match config_path {
        Some(path) => CoreConfig::from_file(path).map_err(|e| e.to_string()),
        None => {
            let mut config = CoreConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

/// Build the shared `AppState` and restore persisted workflows.
///
/// Useful when the caller wants to keep a handle on the state (e.g. to
/// shut it down on ctrl-c) while the HTTP server runs.
pub async fn create_app_state(config: &ServerConfig) -> Result<AppState, String> {
    let core_config = load_core_config(config.config_path.as_deref())?;

    let db = match config.db_path {
        Some(ref path) => Some(
            Database::open(path).map_err(|e| format!("Failed to open database: {}", e))?,
        ),
        None => None,
    };

    let audit_sink: Arc<dyn AuditSink> = match (&config.audit_dir, &db) {
        (Some(dir), _) => Arc::new(JsonlAuditSink::new(dir)),
        (None, Some(db)) => Arc::new(AuditStore::new(db.clone())),
        (None, None) => Arc::new(MemoryAuditSink::new()),
    };

    let mut builder = StateBuilder::new(core_config).audit_sink(audit_sink);
    if let Some(db) = db {
        builder = builder.database(db);
    }
    let state: AppState = Arc::new(builder.build().await);

    state
        .restore()
        .await
        .map_err(|e| format!("Failed to restore persisted state: {}", e))?;

    Ok(state)
}

/// Install the fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tangle_core=info,tangle_server=info,tower_http=info".into()
            }),
        )
        .try_init();
}

/// The full router: API routes plus CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server with a freshly built state.
///
/// Returns the actual address the server is listening on.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    init_tracing();

    tracing::info!(
        "Starting Tangle server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config).await?;

    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Tangle server listening on {}", local_addr);

    // Idle agent reaper
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if reaper_state.notifier.is_closed() {
                break;
            }
            reaper_state.agents.reap_idle().await;
        }
    });

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}
