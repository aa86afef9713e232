//! Process lifecycle shared by the scheduler, crawler and writer.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

/// A long-running pipeline component.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until stopped. Returns early only on a fatal error.
    async fn start(&self) -> Result<(), SyncError>;

    /// Signal shutdown, wait for in-flight work, and release resources.
    /// Safe to call more than once.
    async fn stop(&self) -> Result<(), SyncError>;
}

/// Runtime state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Waiting for the next tick or delivery.
    Idle,
    /// Reading the head and reconciling the persisted cursor.
    ReconcileCursor,
    /// Publishing crawl requests for the current window.
    EnqueueBatch,
    /// Consuming deliveries.
    Consuming,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ReconcileCursor => write!(f, "reconcile-cursor"),
            Self::EnqueueBatch => write!(f, "enqueue-batch"),
            Self::Consuming => write!(f, "consuming"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Start/stop bookkeeping for a [`Service`].
///
/// `stop()` may race with `start()` or be called twice; the lifecycle makes
/// sure resources are released exactly once and only after the run loop has
/// drained.
#[derive(Debug)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    finished: CancellationToken,
    running: AtomicBool,
    released: AtomicBool,
    state: watch::Sender<ServiceState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
            state,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Token the run loop selects on.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Mark the run loop as started.
    pub fn begin(&self, component: &'static str) -> Result<(), SyncError> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Closed(component));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Other(format!("{component} is already running")));
        }
        Ok(())
    }

    /// Mark the run loop as drained.
    pub fn finish(&self) {
        self.set_state(ServiceState::Stopped);
        self.finished.cancel();
    }

    /// Cancel the run loop and wait for it to drain. Returns `true` for the
    /// first caller only, which then owns releasing resources.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.cancel();
        if self.running.load(Ordering::SeqCst) {
            self.finished.cancelled().await;
        }
        self.set_state(ServiceState::Stopped);
        !self.released.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_releases_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.shutdown().await);
        assert!(!lifecycle.shutdown().await);
        assert!(lifecycle.begin("scheduler").is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_run_loop() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin("crawler").unwrap();
        assert!(lifecycle.begin("crawler").is_err());

        let runner = lifecycle.clone();
        let run = tokio::spawn(async move {
            runner.token().cancelled().await;
            runner.finish();
        });

        assert!(lifecycle.shutdown().await);
        run.await.unwrap();
        assert_eq!(lifecycle.state(), ServiceState::Stopped);
    }

    #[test]
    fn state_display() {
        assert_eq!(ServiceState::ReconcileCursor.to_string(), "reconcile-cursor");
        assert_eq!(ServiceState::Stopped.to_string(), "stopped");
    }
}
