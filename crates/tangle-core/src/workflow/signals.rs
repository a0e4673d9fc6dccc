//! External signals delivered to `wait` steps of one execution.
//!
//! Signals are latched: once `name` has been received, every current and
//! future wait on `name` completes with its payload.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct SignalHub {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    received: Mutex<HashMap<String, Value>>,
    /// step key → signal name, for health blockers
    waiting: Mutex<BTreeMap<String, String>>,
    notify: Notify,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, name: &str, payload: Value) {
        self.inner
            .received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), payload);
        self.inner.notify.notify_waiters();
    }

    pub fn received(&self, name: &str) -> Option<Value> {
        self.inner
            .received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Wait for `name`; `waiter` identifies the step while it is blocked.
    pub async fn wait(&self, waiter: &str, name: &str) -> Value {
        let _guard = WaitingGuard::register(self, waiter, name);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(payload) = self.received(name) {
                return payload;
            }
            notified.await;
        }
    }

    /// Steps currently blocked, as (step key, signal name).
    pub fn waiting(&self) -> Vec<(String, String)> {
        self.inner
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

struct WaitingGuard<'a> {
    hub: &'a SignalHub,
    waiter: String,
}

impl<'a> WaitingGuard<'a> {
    fn register(hub: &'a SignalHub, waiter: &str, name: &str) -> Self {
        hub.inner
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(waiter.to_string(), name.to_string());
        Self {
            hub,
            waiter: waiter.to_string(),
        }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.hub
            .inner
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.waiter);
    }
}
