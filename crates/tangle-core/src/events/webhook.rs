//! Forwards workflow, agent and webhook-step events to HTTP endpoints.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::{Event, EventKind, EventNotifier};

pub struct WebhookForwarder {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookForwarder {
    pub fn new(urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, urls }
    }

    /// Run until the notifier closes.
    pub fn spawn(self, notifier: &EventNotifier) -> JoinHandle<()> {
        let subscription = notifier.subscribe_filtered(Some(&[
            EventKind::Workflow,
            EventKind::Agent,
            EventKind::Webhook,
        ][..]));
        tracing::info!(
            "[Webhook] Forwarding events to {} configured endpoint(s)",
            self.urls.len()
        );
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                self.forward(&event).await;
            }
            tracing::debug!("[Webhook] Forwarder stopped");
        })
    }

    async fn forward(&self, event: &Event) {
        let mut targets: Vec<&str> = self.urls.iter().map(String::as_str).collect();
        if let Event::Webhook(p) = event {
            if let Some(url) = p.url.as_deref() {
                targets.push(url);
            }
        }
        if targets.is_empty() {
            return;
        }

        let body = event.payload();
        for url in targets {
            match self.client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("[Webhook] Delivered {:?} event to {}", event.kind(), url);
                }
                Ok(resp) => {
                    tracing::warn!("[Webhook] {} responded with {}", url, resp.status());
                }
                Err(e) => {
                    tracing::warn!("[Webhook] Delivery to {} failed: {}", url, e);
                }
            }
        }
    }
}
