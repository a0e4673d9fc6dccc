//! AgentManager - spawns, tracks, invokes and terminates agent sessions.
//!
//! Agents follow `spawning → idle ⇄ working → terminated`, with `error`
//! reachable from `spawning` or `working`. The manager enforces the
//! `max_concurrent_agents` ceiling atomically at spawn time, bounds every
//! invocation by the agent timeout, and records each transition in the
//! audit log before treating it as done.

pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::RwLock;

use crate::audit::AuditRecorder;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{AgentEventPayload, Event, EventNotifier};
use crate::models::agent::{Agent, AgentReply, AgentStatus, AgentTask, SpawnRequest};
use crate::models::audit::{Actor, AuditEvent, TargetType};
use crate::store::AgentStore;

pub use provider::{
    ApiFlavor, CompletionProvider, EchoProvider, HttpCompletionProvider, ProviderError,
};

/// Called after an agent reaches `terminated`.
pub type TerminationHook = Arc<dyn Fn(Agent) -> BoxFuture<'static, ()> + Send + Sync>;

struct ManagerInner {
    agents: RwLock<HashMap<String, Agent>>,
    providers: RwLock<HashMap<String, Arc<dyn CompletionProvider>>>,
    hooks: RwLock<Vec<TerminationHook>>,
    max_agents: usize,
    agent_timeout: Duration,
    session_timeout: Duration,
    notifier: EventNotifier,
    audit: AuditRecorder,
    store: Option<AgentStore>,
}

#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(
        config: &CoreConfig,
        notifier: EventNotifier,
        audit: AuditRecorder,
        store: Option<AgentStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                agents: RwLock::new(HashMap::new()),
                providers: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
                max_agents: config.max_concurrent_agents,
                agent_timeout: config.agent_timeout(),
                session_timeout: config.agent_session_timeout(),
                notifier,
                audit,
                store,
            }),
        }
    }

    pub async fn register_provider(&self, agent_type: &str, provider: Arc<dyn CompletionProvider>) {
        tracing::info!(
            "[AgentManager] Registered provider '{}' for agent type '{}'",
            provider.name(),
            agent_type
        );
        self.inner
            .providers
            .write()
            .await
            .insert(agent_type.to_string(), provider);
    }

    pub async fn on_terminated(&self, hook: TerminationHook) {
        self.inner.hooks.write().await.push(hook);
    }

    async fn provider_for(&self, agent_type: &str) -> Option<Arc<dyn CompletionProvider>> {
        self.inner.providers.read().await.get(agent_type).cloned()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.inner.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.inner.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    /// Agents that are not terminated.
    pub async fn active_count(&self) -> usize {
        self.inner
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status.is_active())
            .count()
    }

    pub fn max_agents(&self) -> usize {
        self.inner.max_agents
    }

    /// Spawn an agent. Fails with `AgentSpawn` at capacity or for an unknown
    /// agent type; the agent count is unchanged on any failure.
    pub async fn spawn(&self, request: SpawnRequest) -> CoreResult<String> {
        let provider = self.provider_for(&request.agent_type).await.ok_or_else(|| {
            CoreError::AgentSpawn(format!("no provider for agent type '{}'", request.agent_type))
        })?;

        let mut agent = Agent::new(&request);
        let agent_id = agent.id.clone();
        {
            // Capacity check and reservation under one write lock.
            let mut agents = self.inner.agents.write().await;
            let active = agents.values().filter(|a| a.status.is_active()).count();
            if active >= self.inner.max_agents {
                tracing::warn!(
                    "[AgentManager] Spawn of '{}' rejected: {}/{} agents active",
                    request.agent_type,
                    active,
                    self.inner.max_agents
                );
                return Err(CoreError::AgentSpawn(format!(
                    "max_concurrent_agents reached ({}/{})",
                    active, self.inner.max_agents
                )));
            }
            agents.insert(agent_id.clone(), agent.clone());
        }

        let audit = AuditEvent::new(
            Actor::user_or_system(request.user_id.as_deref()),
            "agent.spawned",
            TargetType::Agent,
            &agent_id,
        )
        .with_metadata(json!({
            "agent_type": agent.agent_type,
            "execution_id": agent.execution_id,
        }));
        if let Err(e) = self.inner.audit.record(audit).await {
            self.inner.agents.write().await.remove(&agent_id);
            return Err(e);
        }

        let started = provider.start(&agent).await;
        let reason = match &started {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        let next = if started.is_ok() {
            AgentStatus::Idle
        } else {
            AgentStatus::Error
        };
        if let Some(updated) = self.set_status(&agent_id, next, reason.clone()).await {
            agent = updated;
        }

        match reason {
            None => {
                tracing::info!(
                    "[AgentManager] Spawned agent {} ({}, type {})",
                    agent.id,
                    agent.name,
                    agent.agent_type
                );
                Ok(agent_id)
            }
            Some(reason) => {
                tracing::error!("[AgentManager] Agent {} failed to start: {}", agent_id, reason);
                // Nothing can use an agent that never started; release its slot.
                if let Err(e) = self.terminate(&agent_id, "failed to start").await {
                    tracing::warn!("[AgentManager] Failed to release agent {}: {}", agent_id, e);
                }
                Err(CoreError::AgentSpawn(format!(
                    "agent {} failed to start: {}",
                    agent_id, reason
                )))
            }
        }
    }

    /// Run one task on an idle agent, bounded by the agent timeout (or the
    /// task's own, when shorter).
    pub async fn invoke(&self, agent_id: &str, task: AgentTask) -> CoreResult<AgentReply> {
        let agent = {
            let mut agents = self.inner.agents.write().await;
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| CoreError::NotFound(format!("Agent {}", agent_id)))?;
            if agent.status != AgentStatus::Idle {
                return Err(CoreError::AgentUnavailable(format!(
                    "agent {} is {}",
                    agent_id,
                    agent.status.as_str()
                )));
            }
            agent.transition(AgentStatus::Working);
            agent.current_step = task.step_id.clone();
            agent.clone()
        };

        let audit = AuditEvent::new(Actor::agent(agent_id), "agent.invoked", TargetType::Agent, agent_id)
            .with_metadata(json!({
                "execution_id": task.execution_id,
                "step_id": task.step_id,
            }));
        if let Err(e) = self.inner.audit.record(audit).await {
            self.finish_work(agent_id, AgentStatus::Idle, None).await;
            return Err(e);
        }
        self.announce(&agent, None);
        self.persist(&agent).await;

        let provider = match self.provider_for(&agent.agent_type).await {
            Some(p) => p,
            None => {
                let reason = format!("provider for '{}' was removed", agent.agent_type);
                self.finish_work(agent_id, AgentStatus::Error, Some(reason.clone())).await;
                return Err(CoreError::AgentUnavailable(reason));
            }
        };

        let timeout = task
            .timeout
            .map_or(self.inner.agent_timeout, |t| t.min(self.inner.agent_timeout));
        let outcome = tokio::time::timeout(timeout, provider.complete(&agent, &task)).await;

        let (result, next, reason, action) = match outcome {
            Ok(Ok(reply)) => (Ok(reply), AgentStatus::Idle, None, "agent.completed"),
            Ok(Err(ProviderError::Recoverable(msg))) => (
                Err(CoreError::StepExecution(format!("agent {}: {}", agent_id, msg))),
                AgentStatus::Idle,
                Some(msg),
                "agent.failed",
            ),
            Ok(Err(ProviderError::Fatal(msg))) => (
                Err(CoreError::StepExecution(format!("agent {}: {}", agent_id, msg))),
                AgentStatus::Error,
                Some(msg),
                "agent.errored",
            ),
            Err(_) => (
                Err(CoreError::AgentTimeout {
                    agent_id: agent_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                }),
                AgentStatus::Idle,
                Some(format!("no response within {:?}", timeout)),
                "agent.timed_out",
            ),
        };

        let audit = AuditEvent::new(Actor::agent(agent_id), action, TargetType::Agent, agent_id)
            .with_metadata(json!({ "step_id": task.step_id, "reason": reason }));
        let audited = self.inner.audit.record(audit).await;
        self.finish_work(agent_id, next, reason).await;
        audited?;
        result
    }

    /// Leave `working`, unless the agent was terminated meanwhile.
    async fn finish_work(&self, agent_id: &str, next: AgentStatus, reason: Option<String>) {
        let updated = {
            let mut agents = self.inner.agents.write().await;
            match agents.get_mut(agent_id) {
                Some(agent) if agent.status == AgentStatus::Working => {
                    agent.transition(next);
                    agent.current_step = None;
                    if next == AgentStatus::Error {
                        agent.last_error = reason.clone();
                    }
                    Some(agent.clone())
                }
                _ => None,
            }
        };
        if let Some(agent) = updated {
            if next == AgentStatus::Error {
                tracing::error!(
                    "[AgentManager] Agent {} entered error: {}",
                    agent_id,
                    reason.as_deref().unwrap_or("unknown")
                );
            }
            self.announce(&agent, reason);
            self.persist(&agent).await;
        }
    }

    async fn set_status(&self, agent_id: &str, next: AgentStatus, reason: Option<String>) -> Option<Agent> {
        let updated = {
            let mut agents = self.inner.agents.write().await;
            let agent = agents.get_mut(agent_id)?;
            if !agent.transition(next) {
                return None;
            }
            if next == AgentStatus::Error {
                agent.last_error = reason.clone();
            }
            agent.clone()
        };
        self.announce(&updated, reason);
        self.persist(&updated).await;
        Some(updated)
    }

    /// Idempotent: terminating a terminated agent is a no-op.
    pub async fn terminate(&self, agent_id: &str, reason: &str) -> CoreResult<()> {
        let previous = {
            let agents = self.inner.agents.read().await;
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| CoreError::NotFound(format!("Agent {}", agent_id)))?;
            if agent.status == AgentStatus::Terminated {
                return Ok(());
            }
            agent.clone()
        };

        self.inner
            .audit
            .record(
                AuditEvent::new(Actor::system(), "agent.terminated", TargetType::Agent, agent_id)
                    .with_metadata(json!({
                        "reason": reason,
                        "previous_status": previous.status.as_str(),
                    })),
            )
            .await?;

        let terminated = {
            let mut agents = self.inner.agents.write().await;
            match agents.get_mut(agent_id) {
                Some(agent) => {
                    if agent.transition(AgentStatus::Terminated) {
                        agent.termination_reason = Some(reason.to_string());
                        agent.current_step = None;
                        Some(agent.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        let Some(agent) = terminated else {
            return Ok(());
        };

        if let Some(provider) = self.provider_for(&agent.agent_type).await {
            provider.stop(&agent).await;
        }
        tracing::info!("[AgentManager] Terminated agent {}: {}", agent_id, reason);
        self.announce(&agent, Some(reason.to_string()));
        self.persist(&agent).await;

        let hooks: Vec<TerminationHook> = self.inner.hooks.read().await.clone();
        for hook in hooks {
            hook(agent.clone()).await;
        }
        Ok(())
    }

    /// Terminate, then spawn a fresh agent with the same type and config.
    pub async fn restart(&self, agent_id: &str) -> CoreResult<String> {
        let agent = self
            .get(agent_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("Agent {}", agent_id)))?;
        self.terminate(agent_id, "restart").await?;
        let new_id = self.spawn(agent.respawn_request()).await?;
        tracing::info!("[AgentManager] Restarted agent {} as {}", agent_id, new_id);
        Ok(new_id)
    }

    /// Terminate idle agents past the session timeout. Returns how many.
    pub async fn reap_idle(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.idle_for(now) >= self.inner.session_timeout)
            .map(|a| a.id.clone())
            .collect();

        let mut reaped = 0;
        for id in stale {
            match self.terminate(&id, "session timeout").await {
                Ok(()) => reaped += 1,
                Err(e) => tracing::warn!("[AgentManager] Failed to reap agent {}: {}", id, e),
            }
        }
        if reaped > 0 {
            tracing::info!("[AgentManager] Reaped {} idle agent(s)", reaped);
        }
        reaped
    }

    /// Terminate every active agent, e.g. on shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        let ids: Vec<String> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status.is_active())
            .map(|a| a.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.terminate(&id, reason).await {
                tracing::warn!("[AgentManager] Failed to terminate agent {}: {}", id, e);
            }
        }
    }

    fn announce(&self, agent: &Agent, reason: Option<String>) {
        self.inner.notifier.publish_safe(Event::Agent(AgentEventPayload {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            agent_type: agent.agent_type.clone(),
            status: agent.status.as_str().to_string(),
            user_id: agent.user_id.clone(),
            timestamp: Utc::now(),
            reason,
        }));
    }

    async fn persist(&self, agent: &Agent) {
        if let Some(ref store) = self.inner.store {
            if let Err(e) = store.save(agent).await {
                tracing::warn!("[AgentManager] Failed to persist agent {}: {}", agent.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowProvider(Duration);

    #[async_trait]
    impl CompletionProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _agent: &Agent, _task: &AgentTask) -> Result<AgentReply, ProviderError> {
            tokio::time::sleep(self.0).await;
            Ok(AgentReply::from_text("done"))
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl CompletionProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn complete(&self, _agent: &Agent, _task: &AgentTask) -> Result<AgentReply, ProviderError> {
            Err(ProviderError::Fatal("model crashed".into()))
        }
    }

    async fn manager(max_agents: usize) -> AgentManager {
        let config = CoreConfig {
            max_concurrent_agents: max_agents,
            agent_timeout_secs: 1,
            ..Default::default()
        };
        let manager = AgentManager::new(&config, EventNotifier::new(16), AuditRecorder::in_memory(), None);
        manager.register_provider("echo", Arc::new(EchoProvider)).await;
        manager
            .register_provider("slow", Arc::new(SlowProvider(Duration::from_secs(5))))
            .await;
        manager.register_provider("broken", Arc::new(BrokenProvider)).await;
        manager
    }

    #[tokio::test]
    async fn test_spawn_invoke_terminate() {
        let m = manager(2).await;
        let id = m.spawn(SpawnRequest::new("echo")).await.unwrap();
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Idle);

        let reply = m.invoke(&id, AgentTask::new("ping")).await.unwrap();
        assert_eq!(reply.content, "ping");
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Idle);

        m.terminate(&id, "done").await.unwrap();
        m.terminate(&id, "again").await.unwrap();
        let agent = m.get(&id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert_eq!(agent.termination_reason.as_deref(), Some("done"));
        assert!(matches!(
            m.invoke(&id, AgentTask::new("x")).await,
            Err(CoreError::AgentUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_at_capacity_leaves_count_unchanged() {
        let m = manager(1).await;
        m.spawn(SpawnRequest::new("echo")).await.unwrap();
        assert_eq!(m.active_count().await, 1);
        let err = m.spawn(SpawnRequest::new("echo")).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentSpawn(_)));
        assert_eq!(m.active_count().await, 1);
        assert_eq!(m.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_spawns_respect_capacity() {
        let m = manager(3).await;
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = m.clone();
                tokio::spawn(async move { m.spawn(SpawnRequest::new("echo")).await })
            })
            .collect();
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 3);
        assert_eq!(m.active_count().await, 3);
    }

    #[tokio::test]
    async fn test_timeout_returns_agent_to_idle() {
        let m = manager(2).await;
        let id = m.spawn(SpawnRequest::new("slow")).await.unwrap();
        let err = m.invoke(&id, AgentTask::new("think")).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentTimeout { .. }));
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_invoke_unknown_agent_is_not_retryable() {
        let m = manager(2).await;
        let err = m.invoke("missing", AgentTask::new("x")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_busy_agent_is_unavailable() {
        let m = manager(2).await;
        let id = m.spawn(SpawnRequest::new("slow")).await.unwrap();
        let busy = {
            let m = m.clone();
            let id = id.clone();
            tokio::spawn(async move { m.invoke(&id, AgentTask::new("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Working);
        let err = m.invoke(&id, AgentTask::new("b")).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentUnavailable(_)));
        let _ = busy.await;
    }

    #[tokio::test]
    async fn test_fatal_error_then_restart() {
        let m = manager(2).await;
        let id = m.spawn(SpawnRequest::new("broken")).await.unwrap();
        assert!(m.invoke(&id, AgentTask::new("x")).await.is_err());
        let agent = m.get(&id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert_eq!(agent.last_error.as_deref(), Some("model crashed"));

        let new_id = m.restart(&id).await.unwrap();
        assert_ne!(new_id, id);
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Terminated);
        assert_eq!(m.get(&new_id).await.unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_type_and_hooks() {
        let m = manager(2).await;
        assert!(matches!(
            m.spawn(SpawnRequest::new("nope")).await,
            Err(CoreError::AgentSpawn(_))
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        m.on_terminated(Arc::new(move |_agent: Agent| -> BoxFuture<'static, ()> {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;
        let id = m.spawn(SpawnRequest::new("echo")).await.unwrap();
        m.terminate(&id, "bye").await.unwrap();
        m.terminate(&id, "bye").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reap_idle() {
        let config = CoreConfig {
            agent_session_timeout_secs: 0,
            ..Default::default()
        };
        let m = AgentManager::new(&config, EventNotifier::new(16), AuditRecorder::in_memory(), None);
        m.register_provider("echo", Arc::new(EchoProvider)).await;
        let id = m.spawn(SpawnRequest::new("echo")).await.unwrap();
        assert_eq!(m.reap_idle().await, 1);
        assert_eq!(m.get(&id).await.unwrap().status, AgentStatus::Terminated);
    }
}
