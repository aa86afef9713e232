//! Lazily-dialed upstream connection pool with round-robin selection.
//!
//! Slots start empty. The first `get()` landing on a slot dials it; later
//! calls reuse the memoized connection. A failed dial affects only the call
//! that triggered it, and the slot stays empty for the next caller.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransportError;

/// Produces new connections for a pool.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn dial(&self) -> Result<Self::Conn, TransportError>;
}

/// A connection borrowed from the pool, remembering which slot it came from.
pub struct Pooled<C> {
    slot: usize,
    conn: Arc<C>,
}

impl<C> Pooled<C> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<C> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

/// Bounded set of lazily-established connections.
pub struct ConnectionPool<D: Dial> {
    dialer: D,
    slots: Vec<Mutex<Option<Arc<D::Conn>>>>,
    cursor: AtomicUsize,
    established: AtomicUsize,
    closed: AtomicBool,
    dial_timeout: Duration,
}

impl<D: Dial> ConnectionPool<D> {
    /// A pool of `size` slots; a size of zero is treated as one.
    pub fn new(dialer: D, size: usize, dial_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            dialer,
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            cursor: AtomicUsize::new(0),
            established: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            dial_timeout,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of currently established connections.
    pub fn len(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next connection in round-robin order, dialing its slot on first use.
    pub async fn get(&self) -> Result<Pooled<D::Conn>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::PoolClosed);
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut entry = self.slots[slot].lock().await;
        if self.is_closed() {
            return Err(TransportError::PoolClosed);
        }
        if let Some(conn) = entry.as_ref() {
            return Ok(Pooled {
                slot,
                conn: conn.clone(),
            });
        }

        let conn = tokio::time::timeout(self.dial_timeout, self.dialer.dial())
            .await
            .map_err(|_| {
                TransportError::Dial(format!(
                    "dial timed out after {}ms",
                    self.dial_timeout.as_millis()
                ))
            })??;
        let conn = Arc::new(conn);
        *entry = Some(conn.clone());
        self.established.fetch_add(1, Ordering::SeqCst);
        debug!(slot, established = self.len(), "pool slot dialed");
        Ok(Pooled { slot, conn })
    }

    /// Drop the connection memoized in `slot`; the next `get()` on it re-dials.
    pub async fn invalidate(&self, slot: usize) {
        let Some(entry) = self.slots.get(slot) else {
            return;
        };
        if entry.lock().await.take().is_some() {
            self.established.fetch_sub(1, Ordering::SeqCst);
            debug!(slot, "pool slot invalidated");
        }
    }

    /// Tear down every established connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut dropped = 0usize;
        for entry in &self.slots {
            if entry.lock().await.take().is_some() {
                dropped += 1;
            }
        }
        self.established.store(0, Ordering::SeqCst);
        info!(connections = dropped, "connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDialer {
        dials: AtomicUsize,
        fail_first: bool,
    }

    struct Conn(usize);

    #[async_trait]
    impl Dial for CountingDialer {
        type Conn = Conn;

        async fn dial(&self) -> Result<Conn, TransportError> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(TransportError::Dial("connection refused".into()));
            }
            Ok(Conn(n))
        }
    }

    struct SlowDialer;

    #[async_trait]
    impl Dial for SlowDialer {
        type Conn = Conn;

        async fn dial(&self) -> Result<Conn, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Conn(0))
        }
    }

    fn dialer(fail_first: bool) -> CountingDialer {
        CountingDialer {
            dials: AtomicUsize::new(0),
            fail_first,
        }
    }

    #[tokio::test]
    async fn dials_lazily_and_reuses() {
        let pool = ConnectionPool::new(dialer(false), 2, Duration::from_secs(1));
        assert_eq!(pool.len(), 0);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let c = pool.get().await.unwrap();
        assert_eq!((a.slot(), b.slot(), c.slot()), (0, 1, 0));
        assert_eq!(a.0, c.0);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_size_means_one_slot() {
        let pool = ConnectionPool::new(dialer(false), 0, Duration::from_secs(1));
        assert_eq!(pool.capacity(), 1);
    }

    #[tokio::test]
    async fn dial_failure_is_per_request() {
        let pool = ConnectionPool::new(dialer(true), 1, Duration::from_secs(1));
        assert!(matches!(pool.get().await, Err(TransportError::Dial(_))));
        assert_eq!(pool.len(), 0);
        assert!(pool.get().await.is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_is_bounded_by_timeout() {
        let pool = ConnectionPool::new(SlowDialer, 1, Duration::from_millis(50));
        assert!(matches!(pool.get().await, Err(TransportError::Dial(_))));
    }

    #[tokio::test]
    async fn invalidate_forces_redial() {
        let pool = ConnectionPool::new(dialer(false), 1, Duration::from_secs(1));
        let first = pool.get().await.unwrap();
        pool.invalidate(first.slot()).await;
        assert_eq!(pool.len(), 0);
        let second = pool.get().await.unwrap();
        assert_ne!(first.0, second.0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = ConnectionPool::new(dialer(false), 3, Duration::from_secs(1));
        pool.get().await.unwrap();
        pool.close().await;
        pool.close().await;
        assert_eq!(pool.len(), 0);
        assert!(matches!(pool.get().await, Err(TransportError::PoolClosed)));
    }
}
