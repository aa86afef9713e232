//! Subscriber middlewares: observers run before each handler invocation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chainsync_core::broker::Middleware;

/// Ordered, shareable list of registered middlewares.
#[derive(Default, Clone)]
pub struct Middlewares {
    inner: Arc<RwLock<Vec<Middleware>>>,
}

impl Middlewares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, middleware: Middleware) {
        if let Ok(mut list) = self.inner.write() {
            list.push(middleware);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every middleware in registration order. A panicking middleware is
    /// logged and skipped.
    pub fn run(&self, key: &str, payload: &[u8]) {
        let snapshot: Vec<Middleware> = match self.inner.read() {
            Ok(list) => list.clone(),
            Err(_) => return,
        };
        for middleware in snapshot {
            if catch_unwind(AssertUnwindSafe(|| middleware(key, payload))).is_err() {
                tracing::warn!(message_key = key, "middleware panicked");
            }
        }
    }
}

/// Access-log middleware installed by every driver.
pub fn audit_log(driver: &'static str) -> Middleware {
    Arc::new(move |key: &str, payload: &[u8]| {
        tracing::info!(driver, message_key = key, payload_bytes = payload.len(), "message received");
    })
}
