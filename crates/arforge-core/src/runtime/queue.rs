//! Durable-in-process work queue with bounded retries.
//!
//! Items flow through a bounded `flume` channel shared by a pool of worker
//! tasks. A retryable failure re-enters the channel after an exponential
//! backoff; the item is handed to [`JobHandler::on_failed`] exactly once when
//! its attempts are exhausted or the error is permanent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::TrySendError;
use serde::Serialize;
use strum::Display;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::PipelineError;

/// Per-item retry and deadline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOptions {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff_base: Duration,
    /// Deadline for a single attempt.
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new(attempts: u32, backoff_base: Duration) -> Self {
        Self {
            attempts,
            backoff_base,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before the attempt following `attempt` (1-based): base, 2x, 4x ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedItem<T> {
    pub id: String,
    pub payload: T,
    /// 1-based number of the attempt being made.
    pub attempt: u32,
    pub options: EnqueueOptions,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> QueuedItem<T> {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.options.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub outcome: ItemOutcome,
    pub attempts: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    /// Items waiting in the channel.
    pub waiting: usize,
    /// Items accepted and not yet finished, including pending retries.
    pub outstanding: usize,
    pub completed: Vec<HistoryEntry>,
    pub failed: Vec<HistoryEntry>,
}

#[derive(Debug, Default)]
struct History {
    completed: VecDeque<HistoryEntry>,
    failed: VecDeque<HistoryEntry>,
}

/// Processes items taken from a [`WorkQueue`].
#[async_trait]
pub trait JobHandler<T: Send + Sync + 'static>: Send + Sync + 'static {
    async fn handle(&self, item: &QueuedItem<T>) -> Result<(), PipelineError>;

    /// An attempt failed and another one is scheduled after `delay`.
    async fn on_retry(&self, item: &QueuedItem<T>, error: &PipelineError, delay: Duration) {
        let _ = (item, error, delay);
    }

    /// The item will not be attempted again.
    async fn on_failed(&self, item: &QueuedItem<T>, error: &PipelineError);
}

/// Named, bounded queue of `T` work items.
pub struct WorkQueue<T> {
    name: Arc<str>,
    capacity: usize,
    defaults: EnqueueOptions,
    history_limit: usize,
    tx: flume::Sender<QueuedItem<T>>,
    rx: flume::Receiver<QueuedItem<T>>,
    outstanding: Arc<AtomicUsize>,
    history: Arc<Mutex<History>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            capacity: self.capacity,
            defaults: self.defaults,
            history_limit: self.history_limit,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            outstanding: Arc::clone(&self.outstanding),
            history: Arc::clone(&self.history),
        }
    }
}

impl<T: Send + Sync + 'static> WorkQueue<T> {
    pub fn new(name: &str, capacity: usize, defaults: EnqueueOptions, history_limit: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            name: Arc::from(name),
            capacity: capacity.max(1),
            defaults,
            history_limit,
            tx,
            rx,
            outstanding: Arc::new(AtomicUsize::new(0)),
            history: Arc::new(Mutex::new(History::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> EnqueueOptions {
        self.defaults
    }

    pub fn enqueue(&self, payload: T) -> Result<String, PipelineError> {
        self.enqueue_with(payload, self.defaults)
    }

    /// Accept an item; the returned id identifies it in history.
    pub fn enqueue_with(&self, payload: T, options: EnqueueOptions) -> Result<String, PipelineError> {
        if options.attempts == 0 {
            return Err(PipelineError::InvalidOptions(
                "attempts must be at least 1".to_owned(),
            ));
        }
        let item = QueuedItem {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 1,
            options,
            enqueued_at: Utc::now(),
        };
        let id = item.id.clone();

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(item) {
            Ok(()) => {
                debug!(queue = %self.name, item_id = %id, "item enqueued");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                Err(PipelineError::QueueFull {
                    queue: self.name.to_string(),
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                Err(PipelineError::QueueClosed(self.name.to_string()))
            }
        }
    }

    /// True when every accepted item has finished.
    pub fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        QueueSnapshot {
            name: self.name.to_string(),
            waiting: self.rx.len(),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            completed: history.completed.iter().cloned().collect(),
            failed: history.failed.iter().cloned().collect(),
        }
    }

    /// Start `workers` tasks pulling from this queue.
    pub fn process(&self, handler: Arc<dyn JobHandler<T>>, workers: usize) -> WorkerPool {
        let handles = (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                let span = info_span!("worker", queue = %self.name, worker);
                tokio::spawn(queue.worker_loop(handler).instrument(span))
            })
            .collect();
        WorkerPool { handles }
    }

    async fn worker_loop(self, handler: Arc<dyn JobHandler<T>>) {
        while let Ok(item) = self.rx.recv_async().await {
            let outcome = match item.options.timeout {
                Some(limit) => tokio::time::timeout(limit, handler.handle(&item))
                    .await
                    .unwrap_or_else(|_| {
                        Err(PipelineError::ConversionTimeout {
                            stage: self.name.to_string(),
                            timeout: limit,
                        })
                    }),
                None => handler.handle(&item).await,
            };

            match outcome {
                Ok(()) => {
                    debug!(item_id = %item.id, attempt = item.attempt, "item completed");
                    self.finish(&item, ItemOutcome::Completed, None);
                }
                Err(err) if err.is_retryable() && !item.is_last_attempt() => {
                    let delay = item.options.backoff_delay(item.attempt);
                    warn!(
                        item_id = %item.id,
                        attempt = item.attempt,
                        max_attempts = item.options.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    handler.on_retry(&item, &err, delay).await;
                    self.schedule_retry(item, delay);
                }
                Err(err) => {
                    warn!(
                        item_id = %item.id,
                        attempt = item.attempt,
                        retryable = err.is_retryable(),
                        error = %err,
                        "item failed"
                    );
                    handler.on_failed(&item, &err).await;
                    self.finish(&item, ItemOutcome::Failed, Some(err.to_string()));
                }
            }
        }
    }

    fn schedule_retry(&self, item: QueuedItem<T>, delay: Duration) {
        let tx = self.tx.clone();
        let outstanding = Arc::clone(&self.outstanding);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = QueuedItem {
                attempt: item.attempt + 1,
                ..item
            };
            if tx.send_async(next).await.is_err() {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    fn finish(&self, item: &QueuedItem<T>, outcome: ItemOutcome, error: Option<String>) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let bucket = match outcome {
                ItemOutcome::Completed => &mut history.completed,
                ItemOutcome::Failed => &mut history.failed,
            };
            bucket.push_back(HistoryEntry {
                id: item.id.clone(),
                outcome,
                attempts: item.attempt,
                error,
                finished_at: Utc::now(),
            });
            while bucket.len() > self.history_limit {
                bucket.pop_front();
            }
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker tasks of a queue. Dropping the pool stops them.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn merge(mut self, mut other: WorkerPool) -> WorkerPool {
        self.handles.append(&mut other.handles);
        self
    }

    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tracing_test::traced_test;

    use super::*;

    /// Fails the first `fail_first` attempts of every item with `error`.
    struct Scripted {
        fail_first: u32,
        error: PipelineError,
        delay: Option<Duration>,
        handled: AtomicU32,
        retries: AtomicU32,
        failed: Mutex<Vec<(String, u32)>>,
    }

    impl Scripted {
        fn new(fail_first: u32, error: PipelineError) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                error,
                delay: None,
                handled: AtomicU32::new(0),
                retries: AtomicU32::new(0),
                failed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobHandler<u32> for Scripted {
        async fn handle(&self, item: &QueuedItem<u32>) -> Result<(), PipelineError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if item.attempt <= self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }

        async fn on_retry(&self, _: &QueuedItem<u32>, _: &PipelineError, _: Duration) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_failed(&self, item: &QueuedItem<u32>, _: &PipelineError) {
            self.failed
                .lock()
                .unwrap()
                .push((item.id.clone(), item.attempt));
        }
    }

    fn queue(capacity: usize, attempts: u32) -> WorkQueue<u32> {
        WorkQueue::new(
            "test",
            capacity,
            EnqueueOptions::new(attempts, Duration::from_millis(1)),
            10,
        )
    }

    async fn wait_idle(queue: &WorkQueue<u32>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_idle() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("queue did not drain");
    }

    #[test]
    fn backoff_doubles_from_base() {
        let options = EnqueueOptions::new(3, Duration::from_secs(5));
        assert_eq!(options.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(options.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(options.backoff_delay(3), Duration::from_secs(20));
    }

    #[tokio::test]
    #[traced_test]
    async fn retryable_failures_stop_at_attempt_limit() {
        let q = queue(8, 3);
        let handler = Scripted::new(u32::MAX, PipelineError::backend("tool", "boom"));
        let _pool = q.process(handler.clone(), 2);

        q.enqueue(1).unwrap();
        wait_idle(&q).await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
        assert_eq!(handler.retries.load(Ordering::SeqCst), 2);
        let failed = handler.failed.lock().unwrap().clone();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1, 3);

        let snapshot = q.snapshot();
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(snapshot.failed[0].attempts, 3);
        assert!(logs_contain("attempt failed, retrying"));
    }

    #[tokio::test]
    async fn transient_failure_then_success_completes() {
        let q = queue(8, 3);
        let handler = Scripted::new(1, PipelineError::Io("reset".into()));
        let _pool = q.process(handler.clone(), 1);

        q.enqueue(7).unwrap();
        wait_idle(&q).await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert!(handler.failed.lock().unwrap().is_empty());
        let snapshot = q.snapshot();
        assert_eq!(snapshot.completed.len(), 1);
        assert_eq!(snapshot.completed[0].attempts, 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let q = queue(8, 3);
        let handler = Scripted::new(u32::MAX, PipelineError::UnsupportedFormat("dwg".into()));
        let _pool = q.process(handler.clone(), 1);

        q.enqueue(1).unwrap();
        wait_idle(&q).await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(handler.failed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attempt_deadline_counts_as_retryable_timeout() {
        let q: WorkQueue<u32> = WorkQueue::new(
            "slow",
            8,
            EnqueueOptions::new(2, Duration::from_millis(1)).with_timeout(Duration::from_millis(10)),
            10,
        );
        let handler = Arc::new(Scripted {
            delay: Some(Duration::from_secs(5)),
            ..Arc::into_inner(Scripted::new(0, PipelineError::Io("unused".into()))).unwrap()
        });
        let _pool = q.process(handler.clone(), 1);

        q.enqueue(1).unwrap();
        wait_idle(&q).await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        let snapshot = q.snapshot();
        assert!(snapshot.failed[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn full_queue_rejects_items() {
        let q = queue(1, 1);
        q.enqueue(1).unwrap();
        let err = q.enqueue(2).unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull { capacity: 1, .. }));
        assert_eq!(q.snapshot().outstanding, 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let q: WorkQueue<u32> =
            WorkQueue::new("bounded", 64, EnqueueOptions::new(1, Duration::from_millis(1)), 3);
        let handler = Scripted::new(0, PipelineError::Io("unused".into()));
        let _pool = q.process(handler, 2);
        for n in 0..10 {
            q.enqueue(n).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while !q.is_idle() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(q.snapshot().completed.len(), 3);
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let q = queue(4, 1);
        let err = q
            .enqueue_with(1, EnqueueOptions::new(0, Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOptions(_)));
    }
}
