//! Tangle Core - transport-agnostic orchestration of multi-step agent workflows.
//!
//! This crate contains the workflow engine, step executor, agent lifecycle,
//! entanglement coordination, events, audit and SQLite persistence. It has
//! **no HTTP framework dependency** by default, making it suitable for use in:
//!
//! - HTTP servers (via `tangle-server`)
//! - CLI tools (via `tangle-cli`)
//! - Embedding in other services
//!
//! # Feature Flags
//!
//! - `axum` - Enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod agents;
pub mod audit;
pub mod config;
pub mod db;
pub mod entanglement;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::CoreConfig;
pub use db::Database;
pub use error::{CoreError, CoreResult, ServerError};
pub use state::{AppState, AppStateInner, StateBuilder};
pub use workflow::{StartOptions, Workflow, WorkflowEngine};
