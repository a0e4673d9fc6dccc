//! EventNotifier - typed pub/sub fan-out to UI, webhook and health observers.
//!
//! Every subscriber owns a bounded queue. `publish` never waits on a
//! subscriber: when a queue is full its oldest event is dropped and the
//! subscriber's dropped counter is bumped. Handlers registered with `on`
//! run as spawned tasks.

pub mod webhook;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};

pub use webhook::WebhookForwarder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Workflow,
    Step,
    Agent,
    Entanglement,
    Webhook,
    Notification,
    Health,
}

impl EventKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "step" => Some(Self::Step),
            "agent" => Some(Self::Agent),
            "entanglement" => Some(Self::Entanglement),
            "webhook" => Some(Self::Webhook),
            "notification" => Some(Self::Notification),
            "health" => Some(Self::Health),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Step => "step",
            Self::Agent => "agent",
            Self::Entanglement => "entanglement",
            Self::Webhook => "webhook",
            Self::Notification => "notification",
            Self::Health => "health",
        }
    }
}

/// Workflow payload consumed by external dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEventPayload {
    pub workflow_id: String,
    pub workflow_name: String,
    pub execution_id: String,
    pub status: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the execution started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub steps_completed: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEventPayload {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    pub status: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEventPayload {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub step_type: String,
    pub status: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntanglementEventPayload {
    pub entanglement_id: String,
    pub name: String,
    /// created | updated | joined | left | conflict | dissolved
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEventPayload {
    pub execution_id: String,
    pub step_id: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEventPayload {
    pub execution_id: String,
    pub step_id: String,
    pub channel: String,
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowBlocker {
    pub execution_id: String,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthPayload {
    pub agent_name: String,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
    /// 1 ok, 2 needs attention, 3 blocked
    pub status_id: u8,
    pub workflow_state: String,
    pub active_workflows: usize,
    pub workflow_blockers: Vec<WorkflowBlocker>,
    pub requires_attention: bool,
    pub attention_reason: Option<String>,
    pub active_agents: usize,
    pub system_resources: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Workflow(WorkflowEventPayload),
    Step(StepEventPayload),
    Agent(AgentEventPayload),
    Entanglement(EntanglementEventPayload),
    Webhook(WebhookEventPayload),
    Notification(NotificationEventPayload),
    Health(HealthPayload),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Workflow(_) => EventKind::Workflow,
            Self::Step(_) => EventKind::Step,
            Self::Agent(_) => EventKind::Agent,
            Self::Entanglement(_) => EventKind::Entanglement,
            Self::Webhook(_) => EventKind::Webhook,
            Self::Notification(_) => EventKind::Notification,
            Self::Health(_) => EventKind::Health,
        }
    }

    /// Payload without the `type` tag, as sent to webhooks.
    pub fn payload(&self) -> Value {
        let result = match self {
            Self::Workflow(p) => serde_json::to_value(p),
            Self::Step(p) => serde_json::to_value(p),
            Self::Agent(p) => serde_json::to_value(p),
            Self::Entanglement(p) => serde_json::to_value(p),
            Self::Webhook(p) => serde_json::to_value(p),
            Self::Notification(p) => serde_json::to_value(p),
            Self::Health(p) => serde_json::to_value(p),
        };
        result.unwrap_or(Value::Null)
    }
}

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

struct Slot {
    id: String,
    kinds: Option<HashSet<EventKind>>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
}

impl Slot {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct NotifierInner {
    capacity: usize,
    subscribers: RwLock<HashMap<String, Arc<Slot>>>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    closed: AtomicBool,
    published: AtomicU64,
}

#[derive(Clone)]
pub struct EventNotifier {
    inner: Arc<NotifierInner>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberStats {
    pub id: String,
    pub buffered: usize,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifierStats {
    pub published: u64,
    pub subscribers: usize,
    pub dropped_total: u64,
    pub per_subscriber: Vec<SubscriberStats>,
}

impl EventNotifier {
    /// `capacity` is the per-subscriber buffer size (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_filtered(None)
    }

    /// Subscribe to the given kinds only (`None` = all).
    pub fn subscribe_filtered(&self, kinds: Option<&[EventKind]>) -> Subscription {
        let slot = Arc::new(Slot {
            id: uuid::Uuid::new_v4().to_string(),
            kinds: kinds.map(|k| k.iter().copied().collect()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            closed: AtomicBool::new(self.inner.closed.load(Ordering::SeqCst)),
        });
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot.id.clone(), slot.clone());
        tracing::debug!("[EventNotifier] Subscriber {} registered", slot.id);
        Subscription {
            slot,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback invoked for every published event.
    pub fn on(&self, key: &str, handler: EventHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), handler);
    }

    pub fn off(&self, key: &str) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Deliver to every matching subscriber. Returns how many received it.
    pub fn publish(&self, event: Event) -> CoreResult<usize> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("event notifier is closed".to_string()));
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let kind = event.kind();
        let slots: Vec<Arc<Slot>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.wants(kind))
            .cloned()
            .collect();

        for slot in &slots {
            {
                let mut queue = slot.queue();
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        tracing::warn!(
                            "[EventNotifier] Subscriber {} is slow, {} events dropped so far",
                            slot.id,
                            dropped
                        );
                    }
                }
                queue.push_back(event.clone());
            }
            slot.notify.notify_one();
        }

        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move { handler(event) });
                }
                Err(_) => handler(event),
            }
        }

        Ok(slots.len())
    }

    /// Publish, logging instead of failing.
    pub fn publish_safe(&self, event: Event) {
        if let Err(e) = self.publish(event) {
            tracing::warn!("[EventNotifier] Failed to publish event: {}", e);
        }
    }

    pub fn stats(&self) -> NotifierStats {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let per_subscriber: Vec<SubscriberStats> = subscribers
            .values()
            .map(|s| SubscriberStats {
                id: s.id.clone(),
                buffered: s.queue().len(),
                delivered: s.delivered.load(Ordering::Relaxed),
                dropped: s.dropped.load(Ordering::Relaxed),
            })
            .collect();
        NotifierStats {
            published: self.inner.published.load(Ordering::Relaxed),
            subscribers: per_subscriber.len(),
            dropped_total: per_subscriber.iter().map(|s| s.dropped).sum(),
            per_subscriber,
        }
    }

    /// Stop accepting events; subscribers drain what they have, then end.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for slot in subscribers.values() {
            slot.closed.store(true, Ordering::SeqCst);
            slot.notify.notify_one();
        }
        tracing::info!("[EventNotifier] Closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Receiving end of a subscription. Unsubscribes on drop.
pub struct Subscription {
    slot: Arc<Slot>,
    notifier: Weak<NotifierInner>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.slot.id
    }

    /// Next event, or `None` once the notifier is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        let event = self.slot.queue().pop_front();
        if event.is_some() {
            self.slot.delivered.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<Event> {
        let events: Vec<Event> = self.slot.queue().drain(..).collect();
        self.slot
            .delivered
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        events
    }

    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.slot.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn agent_event(id: &str) -> Event {
        Event::Agent(AgentEventPayload {
            agent_id: id.to_string(),
            agent_name: id.to_string(),
            agent_type: "echo".to_string(),
            status: "idle".to_string(),
            user_id: None,
            timestamp: DateTime::<Utc>::default(),
            reason: None,
        })
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let notifier = EventNotifier::new(8);
        let a = notifier.subscribe();
        let b = notifier.subscribe();
        assert_eq!(notifier.publish(agent_event("x")).unwrap(), 2);
        assert_eq!(a.recv().await, Some(agent_event("x")));
        assert_eq!(b.try_recv(), Some(agent_event("x")));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let notifier = EventNotifier::new(2);
        let sub = notifier.subscribe();
        for i in 0..5 {
            notifier.publish(agent_event(&i.to_string())).unwrap();
        }
        let kept = sub.drain();
        assert_eq!(kept, vec![agent_event("3"), agent_event("4")]);
        assert_eq!(sub.dropped(), 3);
        assert_eq!(notifier.stats().dropped_total, 3);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let notifier = EventNotifier::new(8);
        let sub = notifier.subscribe_filtered(Some(&[EventKind::Workflow][..]));
        assert_eq!(notifier.publish(agent_event("x")).unwrap(), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish_and_ends_on_close() {
        let notifier = EventNotifier::new(8);
        let sub = notifier.subscribe();
        let publisher = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(agent_event("late")).unwrap();
            publisher.close();
        });
        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(first, Some(agent_event("late")));
        let end = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(end, None);
        assert!(notifier.publish(agent_event("after")).is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let notifier = EventNotifier::new(8);
        {
            let _sub = notifier.subscribe();
            assert_eq!(notifier.stats().subscribers, 1);
        }
        assert_eq!(notifier.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_handler_called() {
        let notifier = EventNotifier::new(8);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        notifier.on(
            "test",
            Arc::new(move |event: Event| {
                let _ = tx.send(event.kind());
            }),
        );
        notifier.publish(agent_event("x")).unwrap();
        let kind = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(kind, Some(EventKind::Agent));
    }

    #[test]
    fn test_workflow_payload_shape() {
        let event = Event::Workflow(WorkflowEventPayload {
            workflow_id: "w".into(),
            workflow_name: "W".into(),
            execution_id: "e".into(),
            status: "completed".into(),
            user_id: None,
            timestamp: Utc::now(),
            error: None,
            duration: Some(12),
            steps_completed: 4,
            total_steps: 4,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow");
        assert_eq!(json["steps_completed"], 4);
        assert!(json.get("error").is_none());
        assert!(json["user_id"].is_null());
        assert!(event.payload().get("type").is_none());
    }
}
