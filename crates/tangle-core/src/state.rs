//! Explicit construction of the service graph.
//!
//! Every host (HTTP server, CLI, tests) builds one `AppStateInner` and
//! passes it around; there are no process-wide registries.

use std::sync::Arc;

use crate::agents::{AgentManager, EchoProvider, HttpCompletionProvider};
use crate::audit::{AuditRecorder, AuditSink, MemoryAuditSink};
use crate::config::CoreConfig;
use crate::db::Database;
use crate::entanglement::EntanglementCoordinator;
use crate::events::{EventNotifier, WebhookForwarder};
use crate::store::{AgentStore, EntanglementStore, ExecutionStore, WorkflowStore};
use crate::workflow::{HttpClient, ReqwestHttpClient, StepExecutor, WorkflowEngine};

/// Shared state accessible by every API handler and command.
pub struct AppStateInner {
    pub config: CoreConfig,
    pub db: Option<Database>,
    pub notifier: EventNotifier,
    pub audit: AuditRecorder,
    pub agents: AgentManager,
    pub entanglements: EntanglementCoordinator,
    pub engine: WorkflowEngine,
}

pub type AppState = Arc<AppStateInner>;

/// Collaborators a host may swap out. Defaults: in-memory audit,
/// reqwest for `api_call` steps, no database.
pub struct StateBuilder {
    config: CoreConfig,
    db: Option<Database>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl StateBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            db: None,
            audit_sink: None,
            http: None,
        }
    }

    pub fn database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Wire the services. Must run inside a tokio runtime: the webhook
    /// forwarder is spawned here.
    pub async fn build(self) -> AppStateInner {
        let config = self.config;
        let db = self.db;
        let notifier = EventNotifier::new(config.event_buffer_size);
        let audit = AuditRecorder::new(
            self.audit_sink
                .unwrap_or_else(|| Arc::new(MemoryAuditSink::new())),
        );

        let agents = AgentManager::new(
            &config,
            notifier.clone(),
            audit.clone(),
            db.clone().map(AgentStore::new),
        );
        agents.register_provider("echo", Arc::new(EchoProvider)).await;
        let anthropic = Arc::new(HttpCompletionProvider::anthropic());
        agents.register_provider("anthropic", anthropic.clone()).await;
        agents.register_provider("claude", anthropic).await;
        agents
            .register_provider("openai", Arc::new(HttpCompletionProvider::openai_compatible()))
            .await;

        let entanglements = EntanglementCoordinator::new(
            agents.clone(),
            notifier.clone(),
            audit.clone(),
            db.clone().map(EntanglementStore::new),
        )
        .await;

        let executor = StepExecutor::new(
            &config,
            agents.clone(),
            entanglements.clone(),
            notifier.clone(),
            self.http
                .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new())),
        );
        let engine = WorkflowEngine::new(
            &config,
            executor,
            notifier.clone(),
            audit.clone(),
            db.clone().map(WorkflowStore::new),
            db.clone().map(ExecutionStore::new),
        );

        WebhookForwarder::new(config.webhook_urls.clone()).spawn(&notifier);
        tracing::info!(
            "[State] Services ready (persistence: {})",
            if db.is_some() { "sqlite" } else { "memory" }
        );

        AppStateInner {
            config,
            db,
            notifier,
            audit,
            agents,
            entanglements,
            engine,
        }
    }
}

impl AppStateInner {
    /// Load persisted workflows and close out executions a previous
    /// process left running.
    pub async fn restore(&self) -> crate::error::CoreResult<()> {
        self.engine.load_workflows().await?;
        self.engine.recover_interrupted().await?;
        Ok(())
    }

    /// Cancel live executions and terminate agents, then close the notifier.
    pub async fn shutdown(&self) {
        self.engine.cancel_all().await;
        self.agents.terminate_all("shutdown").await;
        self.notifier.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::SpawnRequest;

    #[tokio::test]
    async fn test_build_with_sqlite() {
        let state = StateBuilder::new(CoreConfig::default())
            .database(Database::open_in_memory().unwrap())
            .build()
            .await;
        state.restore().await.unwrap();

        let id = state.agents.spawn(SpawnRequest::new("echo")).await.unwrap();
        let stored = AgentStore::new(state.db.clone().unwrap()).get(&id).await.unwrap();
        assert!(stored.is_some());
        state.shutdown().await;
        assert!(state.notifier.is_closed());
    }
}
