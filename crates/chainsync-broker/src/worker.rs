//! Consumer worker pool shared by every driver.
//!
//! A subscription runs `worker_count` tasks over one [`DeliverySource`]. Each
//! task pulls a delivery, runs the middlewares, invokes the handler inside a
//! panic boundary, and acknowledges according to the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use chainsync_core::broker::{ErrorCallback, MessageHandler};
use chainsync_core::error::{HandleError, SyncError};

use crate::delivery::{Delivery, DeliverySource};
use crate::middleware::Middlewares;

/// Everything a subscription's workers share.
#[derive(Clone)]
pub struct WorkerPool {
    topic: Arc<str>,
    source: Arc<dyn DeliverySource>,
    handler: Arc<dyn MessageHandler>,
    on_error: Arc<[ErrorCallback]>,
    middlewares: Middlewares,
}

impl WorkerPool {
    pub fn new(
        topic: &str,
        source: Arc<dyn DeliverySource>,
        handler: Arc<dyn MessageHandler>,
        on_error: Vec<ErrorCallback>,
        middlewares: Middlewares,
    ) -> Self {
        Self {
            topic: Arc::from(topic),
            source,
            handler,
            on_error: on_error.into(),
            middlewares,
        }
    }

    /// Run `worker_count` workers (at least one) until `cancel` fires or the
    /// source is exhausted. Returns after every worker has finished its
    /// in-flight delivery.
    pub async fn run(self, worker_count: usize, cancel: CancellationToken) {
        let worker_count = worker_count.max(1);
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let pool = self.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { pool.work(worker_id, cancel).await });
        }
        debug!(topic = %self.topic, workers = worker_count, "subscription started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(topic = %self.topic, error = %e, "worker task aborted");
            }
        }
        debug!(topic = %self.topic, "subscription drained");
    }

    /// [`run`](Self::run) that also stops when the broker's `shutdown` token
    /// fires. `stop` is cancelled in that case, and in-flight deliveries still
    /// finish before this returns.
    pub async fn run_until(
        self,
        worker_count: usize,
        stop: CancellationToken,
        shutdown: &CancellationToken,
    ) {
        let run = self.run(worker_count, stop.clone());
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = shutdown.cancelled() => {
                stop.cancel();
                run.await;
            }
        }
    }

    async fn work(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = self.source.next_delivery() => next,
            };
            let Some(delivery) = next else {
                debug!(topic = %self.topic, worker = worker_id, "worker stopping");
                return;
            };
            self.dispatch(delivery).await;
        }
    }

    /// Handle one delivery end to end. Never fails: every error is routed to
    /// the error callbacks.
    pub async fn dispatch(&self, delivery: Delivery) {
        let Delivery { key, payload, acker } = delivery;
        self.middlewares.run(&key, &payload);

        let outcome = AssertUnwindSafe(self.handler.handle(&key, &payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                warn!(topic = %self.topic, message_key = %key, panic = %message, "handler panicked");
                Err(HandleError::Terminal(SyncError::Panic(message)))
            });

        let ack = match outcome {
            Ok(()) => true,
            Err(e) => {
                let ack = e.should_ack();
                self.report(&key, &e.into_inner());
                ack
            }
        };

        let settled = if ack { acker.ack().await } else { acker.nack().await };
        if let Err(e) = settled {
            self.report(&key, &e);
        }
    }

    fn report(&self, key: &str, error: &SyncError) {
        for callback in self.on_error.iter() {
            callback(key, error);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Acknowledge;
    use async_trait::async_trait;
    use chainsync_core::broker::handler_fn;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingAcker {
        outcomes: Mutex<Vec<bool>>,
        fail_ack: bool,
    }

    #[async_trait]
    impl Acknowledge for Arc<RecordingAcker> {
        async fn ack(&self) -> Result<(), SyncError> {
            self.outcomes.lock().unwrap().push(true);
            if self.fail_ack {
                return Err(SyncError::Broker("commit rejected".into()));
            }
            Ok(())
        }

        async fn nack(&self) -> Result<(), SyncError> {
            self.outcomes.lock().unwrap().push(false);
            Ok(())
        }
    }

    type Reports = Arc<Mutex<Vec<(String, String)>>>;

    fn collector() -> (Reports, ErrorCallback) {
        let reports: Reports = Arc::default();
        let sink = reports.clone();
        let callback: ErrorCallback = Arc::new(move |key: &str, e: &SyncError| {
            sink.lock().unwrap().push((key.to_string(), e.to_string()));
        });
        (reports, callback)
    }

    fn pool(handler: Arc<dyn MessageHandler>, on_error: Vec<ErrorCallback>) -> WorkerPool {
        let (_tx, rx) = mpsc::unbounded_channel::<Delivery>();
        WorkerPool::new(
            "test",
            Arc::new(tokio::sync::Mutex::new(rx)),
            handler,
            on_error,
            Middlewares::new(),
        )
    }

    fn delivery(key: &str, acker: &Arc<RecordingAcker>) -> Delivery {
        Delivery::new(key, b"payload".to_vec(), Box::new(acker.clone()))
    }

    #[tokio::test]
    async fn success_acknowledges() {
        let (reports, cb) = collector();
        let pool = pool(handler_fn(|_, _| async { Ok(()) }), vec![cb]);
        let acker = Arc::new(RecordingAcker::default());
        pool.dispatch(delivery("k", &acker)).await;
        assert_eq!(*acker.outcomes.lock().unwrap(), vec![true]);
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_error_acknowledges_and_reports() {
        let (reports, cb) = collector();
        let pool = pool(
            handler_fn(|_, _| async { Err(HandleError::Terminal(SyncError::Decode("bad".into()))) }),
            vec![cb],
        );
        let acker = Arc::new(RecordingAcker::default());
        pool.dispatch(delivery("k1", &acker)).await;
        assert_eq!(*acker.outcomes.lock().unwrap(), vec![true]);
        assert_eq!(reports.lock().unwrap()[0].0, "k1");
    }

    #[tokio::test]
    async fn retryable_error_nacks_and_reports() {
        let (reports, cb) = collector();
        let pool = pool(
            handler_fn(|_, _| async { Err(HandleError::Retryable(SyncError::Rpc("down".into()))) }),
            vec![cb],
        );
        let acker = Arc::new(RecordingAcker::default());
        pool.dispatch(delivery("k2", &acker)).await;
        assert_eq!(*acker.outcomes.lock().unwrap(), vec![false]);
        assert_eq!(reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panic_is_terminal() {
        let (reports, cb) = collector();
        let pool = pool(
            handler_fn(|key, _| async move {
                if key == "boom" {
                    panic!("handler exploded");
                }
                Ok(())
            }),
            vec![cb],
        );
        let acker = Arc::new(RecordingAcker::default());
        pool.dispatch(delivery("boom", &acker)).await;
        assert_eq!(*acker.outcomes.lock().unwrap(), vec![true]);
        let reports = reports.lock().unwrap();
        assert!(reports[0].1.contains("handler exploded"));
    }

    #[tokio::test]
    async fn failed_ack_is_reported() {
        let (reports, cb) = collector();
        let pool = pool(handler_fn(|_, _| async { Ok(()) }), vec![cb]);
        let acker = Arc::new(RecordingAcker {
            fail_ack: true,
            ..Default::default()
        });
        pool.dispatch(delivery("k3", &acker)).await;
        assert!(reports.lock().unwrap()[0].1.contains("commit rejected"));
    }

    #[tokio::test]
    async fn workers_stop_on_cancel() {
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = WorkerPool::new(
            "test",
            Arc::new(tokio::sync::Mutex::new(rx)),
            handler_fn(move |key, _| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(key);
                    Ok(())
                }
            }),
            Vec::new(),
            Middlewares::new(),
        );
        let acker = Arc::new(RecordingAcker::default());
        for i in 0..5 {
            tx.send(delivery(&format!("k{i}"), &acker)).unwrap();
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn(pool.run(3, cancel.clone()));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while acker.outcomes.lock().unwrap().len() < 5 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_delivery_finish() {
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(Mutex::new(false));
        let (started_tx, done) = (started.clone(), finished.clone());
        let pool = WorkerPool::new(
            "test",
            Arc::new(tokio::sync::Mutex::new(rx)),
            handler_fn(move |_, _| {
                let (started, done) = (started_tx.clone(), done.clone());
                async move {
                    started.notify_one();
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    *done.lock().unwrap() = true;
                    Ok(())
                }
            }),
            Vec::new(),
            Middlewares::new(),
        );
        let acker = Arc::new(RecordingAcker::default());
        tx.send(delivery("slow", &acker)).unwrap();
        tx.send(delivery("queued", &acker)).unwrap();

        let stop = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let run = {
            let (stop, shutdown) = (stop.clone(), shutdown.clone());
            tokio::spawn(async move { pool.run_until(1, stop, &shutdown).await })
        };
        started.notified().await;
        shutdown.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(*finished.lock().unwrap());
        assert!(stop.is_cancelled());
        // the slow delivery was settled; the queued one was never taken
        assert_eq!(*acker.outcomes.lock().unwrap(), vec![true]);
    }
}
