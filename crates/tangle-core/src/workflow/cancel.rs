//! Cooperative cancellation.
//!
//! A `CancelSignal` is cancelled when it, or any ancestor it was derived from
//! with [`CancelSignal::child`], is cancelled. Cancelling a child never
//! affects its parent, which is how a fail-fast parallel step stops its own
//! branches without touching the rest of the execution.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct CancelSignal {
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            chain: vec![Arc::new(tx)],
        }
    }

    /// Derived signal: cancelled by this one, cancellable on its own.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut chain = self.chain.clone();
        chain.push(Arc::new(tx));
        Self { chain }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|tx| *tx.borrow())
    }

    /// Resolves once this signal or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let receivers: Vec<watch::Receiver<bool>> =
            self.chain.iter().map(|tx| tx.subscribe()).collect();
        let waits = receivers.into_iter().map(|mut rx| {
            Box::pin(async move {
                // Err means the sender is gone; nobody can cancel through it anymore.
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
        });
        futures::future::select_all(waits).await;
    }
}
