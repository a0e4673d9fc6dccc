//! EntanglementCoordinator - shared mutable state for groups of agents.
//!
//! All writes to an entanglement's `shared_state` go through `update`, which
//! applies the patch atomically under the entanglement table lock: either the
//! whole patch commits as the next version or, on an unresolved merge-mode
//! conflict, nothing changes and `EntanglementConflict` names the colliding
//! paths.

pub mod merge;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::agents::AgentManager;
use crate::audit::AuditRecorder;
use crate::error::{CoreError, CoreResult};
use crate::events::{EntanglementEventPayload, Event, EventNotifier};
use crate::models::agent::Agent;
use crate::models::audit::{Actor, AuditEvent, TargetType};
use crate::models::entanglement::{CoordinationMode, Entanglement};
use crate::store::EntanglementStore;

use merge::{apply_patch, PatchContext, Stamps};

struct Record {
    entanglement: Entanglement,
    stamps: Stamps,
    /// agent → last version it observed
    seen: HashMap<String, u64>,
}

impl Record {
    fn state_map(&self) -> Map<String, Value> {
        self.entanglement
            .shared_state
            .as_object()
            .cloned()
            .unwrap_or_default()
    }
}

struct CoordinatorInner {
    records: RwLock<HashMap<String, Record>>,
    agents: AgentManager,
    notifier: EventNotifier,
    audit: AuditRecorder,
    store: Option<EntanglementStore>,
}

#[derive(Clone)]
pub struct EntanglementCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl EntanglementCoordinator {
    /// Also registers a termination hook so terminated agents leave their
    /// entanglements.
    pub async fn new(
        agents: AgentManager,
        notifier: EventNotifier,
        audit: AuditRecorder,
        store: Option<EntanglementStore>,
    ) -> Self {
        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                records: RwLock::new(HashMap::new()),
                agents: agents.clone(),
                notifier,
                audit,
                store,
            }),
        };

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&coordinator.inner);
        agents
            .on_terminated(Arc::new(move |agent: Agent| -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        EntanglementCoordinator { inner }.remove_agent(&agent.id).await;
                    }
                })
            }))
            .await;
        coordinator
    }

    async fn require_live_agent(&self, agent_id: &str) -> CoreResult<()> {
        match self.inner.agents.get(agent_id).await {
            Some(agent) if agent.status.is_active() => Ok(()),
            Some(_) => Err(CoreError::Validation(format!("agent {} is terminated", agent_id))),
            None => Err(CoreError::NotFound(format!("Agent {}", agent_id))),
        }
    }

    /// Bind two or more distinct live agents together.
    pub async fn create(
        &self,
        name: Option<String>,
        agent_ids: &[String],
        mode: CoordinationMode,
    ) -> CoreResult<String> {
        let participants: BTreeSet<String> = agent_ids.iter().cloned().collect();
        if participants.len() < 2 {
            return Err(CoreError::Validation(format!(
                "an entanglement needs at least two distinct agents, got {}",
                participants.len()
            )));
        }
        for id in &participants {
            self.require_live_agent(id).await?;
        }

        let name = name.unwrap_or_else(|| format!("entanglement-{}", participants.len()));
        let entanglement = Entanglement::new(name, participants.clone(), mode);
        let id = entanglement.id.clone();

        self.inner
            .audit
            .record(
                AuditEvent::new(Actor::system(), "entanglement.created", TargetType::Entanglement, &id)
                    .with_metadata(json!({
                        "participants": participants,
                        "mode": mode.as_str(),
                    })),
            )
            .await?;

        let seen = participants.iter().map(|p| (p.clone(), 0)).collect();
        self.inner.records.write().await.insert(
            id.clone(),
            Record {
                entanglement: entanglement.clone(),
                stamps: Stamps::new(),
                seen,
            },
        );

        tracing::info!(
            "[Entanglement] Created {} ({}) with {} agents in {} mode",
            id,
            entanglement.name,
            participants.len(),
            mode.as_str()
        );
        self.announce(&entanglement, "created", None);
        self.persist(&entanglement).await;
        for agent_id in &participants {
            self.evict_if_terminated(&id, agent_id).await;
        }
        Ok(id)
    }

    pub async fn get(&self, entanglement_id: &str) -> CoreResult<Entanglement> {
        self.inner
            .records
            .read()
            .await
            .get(entanglement_id)
            .map(|r| r.entanglement.clone())
            .ok_or_else(|| not_found(entanglement_id))
    }

    pub async fn list(&self) -> Vec<Entanglement> {
        let mut all: Vec<Entanglement> = self
            .inner
            .records
            .read()
            .await
            .values()
            .map(|r| r.entanglement.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn read(&self, entanglement_id: &str) -> CoreResult<Value> {
        Ok(self.get(entanglement_id).await?.shared_state)
    }

    /// Read on behalf of a participant, marking the current version as seen.
    pub async fn read_as(&self, entanglement_id: &str, agent_id: &str) -> CoreResult<Value> {
        let mut records = self.inner.records.write().await;
        let record = records
            .get_mut(entanglement_id)
            .ok_or_else(|| not_found(entanglement_id))?;
        if !record.entanglement.participants.contains(agent_id) {
            return Err(not_participant(entanglement_id, agent_id));
        }
        record
            .seen
            .insert(agent_id.to_string(), record.entanglement.version);
        Ok(record.entanglement.shared_state.clone())
    }

    /// Apply `patch` (a JSON object) as `agent_id`.
    pub async fn update(&self, entanglement_id: &str, agent_id: &str, patch: Value) -> CoreResult<Value> {
        let Value::Object(patch) = patch else {
            return Err(CoreError::Validation("entanglement patch must be a JSON object".to_string()));
        };

        // Held through the audit write so commits are serialized.
        let mut records = self.inner.records.write().await;
        let record = records
            .get_mut(entanglement_id)
            .ok_or_else(|| not_found(entanglement_id))?;
        if !record.entanglement.participants.contains(agent_id) {
            return Err(not_participant(entanglement_id, agent_id));
        }

        let version = record.entanglement.version + 1;
        let ctx = PatchContext {
            mode: record.entanglement.mode,
            writer: agent_id,
            seen: record.seen.get(agent_id).copied().unwrap_or(0),
            version,
        };

        let (state, stamps) = match apply_patch(&record.state_map(), &record.stamps, &patch, &ctx) {
            Ok(applied) => applied,
            Err(keys) => {
                tracing::warn!(
                    "[Entanglement] Conflict on {} from agent {}: {}",
                    entanglement_id,
                    agent_id,
                    keys.join(", ")
                );
                self.inner
                    .audit
                    .record(
                        AuditEvent::new(
                            Actor::agent(agent_id),
                            "entanglement.conflict",
                            TargetType::Entanglement,
                            entanglement_id,
                        )
                        .with_metadata(json!({ "keys": keys, "version": version - 1 })),
                    )
                    .await?;
                self.announce(&record.entanglement, "conflict", Some(agent_id));
                return Err(CoreError::EntanglementConflict {
                    entanglement_id: entanglement_id.to_string(),
                    keys,
                });
            }
        };

        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::agent(agent_id),
                    "entanglement.updated",
                    TargetType::Entanglement,
                    entanglement_id,
                )
                .with_metadata(json!({
                    "version": version,
                    "keys": patch.keys().collect::<Vec<_>>(),
                })),
            )
            .await?;

        record.entanglement.shared_state = Value::Object(state);
        record.entanglement.version = version;
        record.entanglement.updated_at = Utc::now();
        record.stamps = stamps;
        record.seen.insert(agent_id.to_string(), version);

        let snapshot = record.entanglement.clone();
        drop(records);

        tracing::debug!(
            "[Entanglement] {} updated by {} to version {}",
            entanglement_id,
            agent_id,
            version
        );
        self.announce(&snapshot, "updated", Some(agent_id));
        self.persist(&snapshot).await;
        Ok(snapshot.shared_state)
    }

    pub async fn join(&self, entanglement_id: &str, agent_id: &str) -> CoreResult<()> {
        self.require_live_agent(agent_id).await?;
        let mut records = self.inner.records.write().await;
        let record = records
            .get_mut(entanglement_id)
            .ok_or_else(|| not_found(entanglement_id))?;
        if record.entanglement.participants.contains(agent_id) {
            return Ok(());
        }
        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::agent(agent_id),
                    "entanglement.joined",
                    TargetType::Entanglement,
                    entanglement_id,
                ),
            )
            .await?;
        record.entanglement.participants.insert(agent_id.to_string());
        record
            .seen
            .insert(agent_id.to_string(), record.entanglement.version);
        let snapshot = record.entanglement.clone();
        drop(records);

        self.announce(&snapshot, "joined", Some(agent_id));
        self.persist(&snapshot).await;
        self.evict_if_terminated(entanglement_id, agent_id).await;
        Ok(())
    }

    /// Remove a participant; the last one leaving dissolves the entanglement.
    pub async fn leave(&self, entanglement_id: &str, agent_id: &str) -> CoreResult<()> {
        let mut records = self.inner.records.write().await;
        let record = records
            .get_mut(entanglement_id)
            .ok_or_else(|| not_found(entanglement_id))?;
        if !record.entanglement.participants.contains(agent_id) {
            return Err(not_participant(entanglement_id, agent_id));
        }
        let last = record.entanglement.participants.len() == 1;
        let action = if last { "entanglement.dissolved" } else { "entanglement.left" };
        self.inner
            .audit
            .record(
                AuditEvent::new(Actor::agent(agent_id), action, TargetType::Entanglement, entanglement_id)
                    .with_metadata(json!({ "reason": "participant left" })),
            )
            .await?;

        record.entanglement.participants.remove(agent_id);
        record.seen.remove(agent_id);
        if last {
            let removed = records.remove(entanglement_id);
            drop(records);
            if let Some(removed) = removed {
                self.finish_dissolve(&removed.entanglement).await;
            }
            return Ok(());
        }
        let snapshot = record.entanglement.clone();
        drop(records);
        self.announce(&snapshot, "left", Some(agent_id));
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn dissolve(&self, entanglement_id: &str) -> CoreResult<()> {
        let mut records = self.inner.records.write().await;
        if !records.contains_key(entanglement_id) {
            return Err(not_found(entanglement_id));
        }
        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::system(),
                    "entanglement.dissolved",
                    TargetType::Entanglement,
                    entanglement_id,
                )
                .with_metadata(json!({ "reason": "requested" })),
            )
            .await?;
        let removed = records.remove(entanglement_id);
        drop(records);
        if let Some(removed) = removed {
            self.finish_dissolve(&removed.entanglement).await;
        }
        Ok(())
    }

    async fn finish_dissolve(&self, entanglement: &Entanglement) {
        tracing::info!("[Entanglement] Dissolved {}", entanglement.id);
        self.announce(entanglement, "dissolved", None);
        if let Some(ref store) = self.inner.store {
            if let Err(e) = store.delete(&entanglement.id).await {
                tracing::warn!("[Entanglement] Failed to delete {}: {}", entanglement.id, e);
            }
        }
    }

    /// An agent terminated after its liveness check but before it was added
    /// missed the termination hook; remove it here instead.
    async fn evict_if_terminated(&self, entanglement_id: &str, agent_id: &str) {
        if self.require_live_agent(agent_id).await.is_ok() {
            return;
        }
        match self.leave(entanglement_id, agent_id).await {
            Ok(()) => tracing::info!(
                "[Entanglement] Agent {} terminated while joining {}",
                agent_id,
                entanglement_id
            ),
            Err(CoreError::NotFound(_) | CoreError::Validation(_)) => {}
            Err(e) => tracing::warn!(
                "[Entanglement] Failed to evict terminated agent {} from {}: {}",
                agent_id,
                entanglement_id,
                e
            ),
        }
    }

    /// Drop a terminated agent from every entanglement it belongs to.
    async fn remove_agent(&self, agent_id: &str) {
        let ids: Vec<String> = self
            .inner
            .records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.entanglement.participants.contains(agent_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.leave(&id, agent_id).await {
                tracing::warn!(
                    "[Entanglement] Failed to remove terminated agent {} from {}: {}",
                    agent_id,
                    id,
                    e
                );
            }
        }
    }

    fn announce(&self, entanglement: &Entanglement, action: &str, agent_id: Option<&str>) {
        self.inner
            .notifier
            .publish_safe(Event::Entanglement(EntanglementEventPayload {
                entanglement_id: entanglement.id.clone(),
                name: entanglement.name.clone(),
                action: action.to_string(),
                agent_id: agent_id.map(str::to_string),
                version: entanglement.version,
                timestamp: Utc::now(),
            }));
    }

    async fn persist(&self, entanglement: &Entanglement) {
        if let Some(ref store) = self.inner.store {
            if let Err(e) = store.save(entanglement).await {
                tracing::warn!("[Entanglement] Failed to persist {}: {}", entanglement.id, e);
            }
        }
    }
}

fn not_found(id: &str) -> CoreError {
    CoreError::NotFound(format!("Entanglement {}", id))
}

fn not_participant(entanglement_id: &str, agent_id: &str) -> CoreError {
    CoreError::Validation(format!(
        "agent {} is not a participant of entanglement {}",
        agent_id, entanglement_id
    ))
}
