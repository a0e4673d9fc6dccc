//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! tangle-core services through `AppState`.

pub mod server;
pub mod workflow;

use tangle_core::AppState;
use tangle_server::ServerConfig;

/// Where state lives, shared by every command.
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    pub config_path: Option<String>,
    pub db_path: Option<String>,
    pub audit_dir: Option<String>,
}

impl StateOptions {
    pub fn server_config(&self, host: String, port: u16) -> ServerConfig {
        ServerConfig {
            host,
            port,
            db_path: self.db_path.clone(),
            audit_dir: self.audit_dir.clone(),
            config_path: self.config_path.clone(),
        }
    }
}

/// Build the shared `AppState` the same way the server does.
pub async fn init_state(options: &StateOptions) -> Result<AppState, String> {
    let config = options.server_config("127.0.0.1".to_string(), 0);
    tangle_server::create_app_state(&config).await
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
