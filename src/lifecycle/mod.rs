//! Shutdown coordination for the control plane
//!
//! Every long-running component subscribes to a single [`Shutdown`]
//! coordinator. Triggering it fans out to all subscribers; components are
//! responsible for their own orderly exit once signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks subscribe to,
/// plus a flag that lets late observers distinguish an expected stop from an
/// unexpected serve failure.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            triggered: self.triggered.clone(),
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Number of tasks still holding a subscription.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait until every subscriber has dropped its signal, or the timeout
    /// elapses. Returns true if all subscribers exited in time.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.receiver_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A single task's view of the shutdown signal.
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown signal. Also completes if the coordinator has
    /// been dropped, so tasks never outlive the process lifecycle.
    pub async fn recv(&mut self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        // Lagged cannot occur with a single () payload; Closed means the
        // coordinator is gone, which we treat as a stop.
        let _ = self.rx.recv().await;
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            triggered: self.triggered.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_releases_all_subscribers() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.subscribe();

        let task_a = tokio::spawn(async move { a.recv().await });
        let task_b = tokio::spawn(async move { b.recv().await });

        shutdown.trigger();
        task_a.await.unwrap();
        task_b.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn recv_after_trigger_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut sig = shutdown.subscribe();
        sig.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn drained_reports_lingering_subscribers() {
        let shutdown = Shutdown::new();
        let _held = shutdown.subscribe();
        assert!(!shutdown.drained(Duration::from_millis(200)).await);

        drop(_held);
        assert!(shutdown.drained(Duration::from_millis(200)).await);
    }
}
