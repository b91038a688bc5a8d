//! Generic priority-queued batch processor.
//!
//! Requests land in per-priority buckets; a flush (whichever of size-trigger
//! or interval fires first) drains buckets in descending priority into a
//! batch and hands it to one of the parallel dispatch workers over a bounded
//! channel. The bucket lock is never held across the channel send — the
//! signal fires after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use crate::errors::{CoreError, Result};
use crate::logging::Logger;
use crate::resilience::RetryPolicy;

use super::request::{BatchPriority, CompletionHandle, PendingRequest};

const LOGGER: Logger = Logger::new("batch");

/// Executes one batch against the underlying store.
///
/// The returned outcomes must align positionally with the input slice. A
/// top-level `Err` means the whole batch failed; every request in it receives
/// that error.
#[async_trait]
pub trait BatchDispatcher<T, R>: Send + Sync {
    async fn dispatch(&self, requests: &[T]) -> Result<Vec<Result<R>>>;
}

/// Knobs for one batcher
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchTuning {
    /// Maximum requests per dispatched batch
    pub batch_size: usize,

    /// Interval-triggered flush period
    pub flush_interval: Duration,

    /// Parallel dispatch workers
    pub workers: usize,

    /// Ingress cap across all priority buckets
    pub queue_capacity: usize,

    /// Default per-request deadline
    pub request_timeout: Duration,

    /// Dispatch attempts per batch, including the first
    pub max_retries: u32,

    /// Backoff before the second dispatch attempt
    pub retry_initial_delay: Duration,

    /// Bound on waiting for in-flight work during `stop`
    pub shutdown_timeout: Duration,
}

impl Default for BatchTuning {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
            workers: 2,
            queue_capacity: 10_000,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct BatchCounters {
    batches_processed: AtomicU64,
    requests_processed: AtomicU64,
    requests_failed: AtomicU64,
    batch_size_total: AtomicU64,
    dispatch_ms_total: AtomicU64,
    flushes: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time batcher statistics
#[derive(Debug, Clone, serde::Serialize)]
#[allow(missing_docs)]
pub struct BatcherStats {
    pub name: &'static str,
    pub running: bool,
    pub batches_dispatched: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub mean_batch_size: f64,
    pub mean_dispatch_ms: f64,
    pub flushes: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub queued: usize,
}

struct Shared<T, R> {
    name: &'static str,
    tuning: BatchTuning,
    buckets: AsyncMutex<[VecDeque<PendingRequest<T, R>>; 4]>,
    pending: AtomicUsize,
    flush_signal: Notify,
    running: AtomicBool,
    counters: BatchCounters,
    timeouts: Arc<AtomicU64>,
    dispatch_tx: parking_lot::Mutex<Option<mpsc::Sender<Vec<PendingRequest<T, R>>>>>,
    worker_rx: parking_lot::Mutex<Option<Arc<AsyncMutex<mpsc::Receiver<Vec<PendingRequest<T, R>>>>>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Priority-queued batcher over a dispatcher
pub struct BatchProcessor<T, R> {
    dispatcher: Arc<dyn BatchDispatcher<T, R>>,
    shared: Arc<Shared<T, R>>,
}

impl<T, R> BatchProcessor<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a processor; call [`start`](Self::start) before submitting
    pub fn new(
        name: &'static str,
        tuning: BatchTuning,
        dispatcher: Arc<dyn BatchDispatcher<T, R>>,
    ) -> Self {
        Self {
            dispatcher,
            shared: Arc::new(Shared {
                name,
                tuning,
                buckets: AsyncMutex::new([
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ]),
                pending: AtomicUsize::new(0),
                flush_signal: Notify::new(),
                running: AtomicBool::new(false),
                counters: BatchCounters::default(),
                timeouts: Arc::new(AtomicU64::new(0)),
                dispatch_tx: parking_lot::Mutex::new(None),
                worker_rx: parking_lot::Mutex::new(None),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the flush timer and the dispatch workers
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let channel_capacity = (self.shared.tuning.workers * 2).max(2);
        let (tx, rx) = mpsc::channel(channel_capacity);
        *self.shared.dispatch_tx.lock() = Some(tx);
        let rx = Arc::new(AsyncMutex::new(rx));
        *self.shared.worker_rx.lock() = Some(rx.clone());

        let mut tasks = self.shared.tasks.lock();

        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(shared.tuning.flush_interval) => {}
                    _ = shared.flush_signal.notified() => {}
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                Self::flush(&shared).await;
            }
        }));

        for worker_id in 0..self.shared.tuning.workers {
            let shared = self.shared.clone();
            let dispatcher = self.dispatcher.clone();
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move {
                Self::worker_loop(shared, dispatcher, rx, worker_id).await;
            }));
        }

        LOGGER.info(
            "batch processor started",
            &[
                ("batcher", json!(self.shared.name)),
                ("workers", json!(self.shared.tuning.workers)),
            ],
        );
    }

    /// Enqueue a request and return its completion handle.
    ///
    /// Rejects with `RateLimit` when the ingress queue is at capacity and
    /// with `System` when the batcher is not running.
    pub async fn submit(
        &self,
        payload: T,
        priority: BatchPriority,
        deadline: Option<Duration>,
    ) -> Result<CompletionHandle<R>> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(CoreError::system(format!(
                "batcher '{}' is not running",
                self.shared.name
            ))
            .with_code("NOT_RUNNING"));
        }

        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            id: Uuid::new_v4(),
            payload,
            priority,
            enqueued_at: Instant::now(),
            tx,
        };
        let id = request.id;

        let should_flush = {
            let mut buckets = self.shared.buckets.lock().await;
            let pending = self.shared.pending.load(Ordering::SeqCst);
            if pending >= self.shared.tuning.queue_capacity {
                return Err(CoreError::rate_limit(format!(
                    "batcher '{}' ingress queue is full",
                    self.shared.name
                ))
                .with_code("QUEUE_FULL")
                .with_detail("capacity", self.shared.tuning.queue_capacity));
            }
            buckets[priority.bucket()].push_back(request);
            self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1
                >= self.shared.tuning.batch_size
        };

        // Signalled outside the bucket lock so the flush path can take it
        if should_flush {
            self.shared.flush_signal.notify_one();
        }

        Ok(CompletionHandle {
            id,
            rx,
            deadline: deadline.unwrap_or(self.shared.tuning.request_timeout),
            timeouts: self.shared.timeouts.clone(),
        })
    }

    /// Drain buckets in descending priority into one batch, highest first
    fn drain_batch(
        buckets: &mut [VecDeque<PendingRequest<T, R>>; 4],
        batch_size: usize,
    ) -> Vec<PendingRequest<T, R>> {
        let mut batch = Vec::new();
        for priority in BatchPriority::DESCENDING {
            let bucket = &mut buckets[priority.bucket()];
            while batch.len() < batch_size {
                match bucket.pop_front() {
                    Some(request) => batch.push(request),
                    None => break,
                }
            }
            if batch.len() >= batch_size {
                break;
            }
        }
        batch
    }

    async fn flush(shared: &Arc<Shared<T, R>>) {
        loop {
            let batch = {
                let mut buckets = shared.buckets.lock().await;
                Self::drain_batch(&mut buckets, shared.tuning.batch_size)
            };
            if batch.is_empty() {
                return;
            }
            shared.pending.fetch_sub(batch.len(), Ordering::SeqCst);
            let was_full = batch.len() == shared.tuning.batch_size;

            let tx = shared.dispatch_tx.lock().clone();
            match tx {
                Some(tx) => {
                    if let Err(send_err) = tx.send(batch).await {
                        Self::fail_batch(
                            send_err.0,
                            &CoreError::system("shutdown").with_code("SHUTDOWN"),
                            &shared.counters,
                        );
                        return;
                    }
                    shared.counters.flushes.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    Self::fail_batch(
                        batch,
                        &CoreError::system("shutdown").with_code("SHUTDOWN"),
                        &shared.counters,
                    );
                    return;
                }
            }

            if !was_full {
                return;
            }
        }
    }

    async fn worker_loop(
        shared: Arc<Shared<T, R>>,
        dispatcher: Arc<dyn BatchDispatcher<T, R>>,
        rx: Arc<AsyncMutex<mpsc::Receiver<Vec<PendingRequest<T, R>>>>>,
        worker_id: usize,
    ) {
        loop {
            let batch = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            match batch {
                Some(batch) => Self::process_batch(&shared, &dispatcher, batch, worker_id).await,
                None => break,
            }
        }
    }

    async fn process_batch(
        shared: &Arc<Shared<T, R>>,
        dispatcher: &Arc<dyn BatchDispatcher<T, R>>,
        batch: Vec<PendingRequest<T, R>>,
        worker_id: usize,
    ) {
        let started = Instant::now();
        if let Some(head) = batch.first() {
            LOGGER.debug(
                "processing batch",
                &[
                    ("batcher", json!(shared.name)),
                    ("worker", json!(worker_id)),
                    ("size", json!(batch.len())),
                    ("head_priority", json!(head.priority)),
                    ("head_queued_ms", json!(head.enqueued_at.elapsed().as_millis() as u64)),
                ],
            );
        }
        let payloads: Vec<T> = batch.iter().map(|r| r.payload.clone()).collect();

        let policy = RetryPolicy {
            max_attempts: shared.tuning.max_retries.max(1),
            initial_delay: shared.tuning.retry_initial_delay,
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.0,
        };

        let attempts = AtomicU32::new(0);
        let outcome = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::Relaxed);
                dispatcher.dispatch(&payloads)
            })
            .await;
        let spent = attempts.load(Ordering::Relaxed);
        if spent > 1 {
            shared
                .counters
                .retries
                .fetch_add((spent - 1) as u64, Ordering::Relaxed);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(results) if results.len() == batch.len() => {
                let size = batch.len();
                let mut failed = 0u64;
                for (request, result) in batch.into_iter().zip(results) {
                    if result.is_err() {
                        failed += 1;
                    }
                    // The receiver may have timed out and gone away; the
                    // result for an abandoned slot is dropped here.
                    let _ = request.tx.send(result);
                }
                shared
                    .counters
                    .batches_processed
                    .fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .requests_processed
                    .fetch_add(size as u64, Ordering::Relaxed);
                shared
                    .counters
                    .batch_size_total
                    .fetch_add(size as u64, Ordering::Relaxed);
                shared
                    .counters
                    .dispatch_ms_total
                    .fetch_add(elapsed_ms, Ordering::Relaxed);
                shared
                    .counters
                    .requests_failed
                    .fetch_add(failed, Ordering::Relaxed);
            }
            Ok(results) => {
                let err = CoreError::system(format!(
                    "dispatcher for '{}' returned {} results for {} requests",
                    shared.name,
                    results.len(),
                    batch.len()
                ))
                .with_code("MISALIGNED_RESULTS");
                LOGGER.error(
                    "dispatcher results misaligned",
                    &[("batcher", json!(shared.name)), ("worker", json!(worker_id))],
                );
                Self::fail_batch(batch, &err, &shared.counters);
            }
            Err(err) => {
                LOGGER.error(
                    "batch dispatch failed",
                    &[
                        ("batcher", json!(shared.name)),
                        ("worker", json!(worker_id)),
                        ("error", json!(err.to_string())),
                    ],
                );
                Self::fail_batch(batch, &err, &shared.counters);
            }
        }
    }

    fn fail_batch(
        batch: Vec<PendingRequest<T, R>>,
        err: &CoreError,
        counters: &BatchCounters,
    ) {
        let size = batch.len() as u64;
        for request in batch {
            let _ = request.tx.send(Err(err.clone()));
        }
        counters.requests_failed.fetch_add(size, Ordering::Relaxed);
        counters.requests_processed.fetch_add(size, Ordering::Relaxed);
    }

    /// Stop the batcher: force a final flush, let in-flight batches finish
    /// within the shutdown bound, then resolve stragglers with the shutdown
    /// error.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Wake the timer task so it observes the stopped flag and exits
        self.shared.flush_signal.notify_one();

        // Final flush: everything still buffered goes out in capped batches.
        // Bounded, because stuck workers can jam the dispatch channel; a
        // batch dropped mid-send resolves its callers through the closed
        // completion handles.
        let flushed = timeout(
            self.shared.tuning.shutdown_timeout,
            Self::flush(&self.shared),
        )
        .await;
        if flushed.is_err() {
            let remaining: Vec<PendingRequest<T, R>> = {
                let mut buckets = self.shared.buckets.lock().await;
                buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
            };
            self.shared
                .pending
                .fetch_sub(remaining.len(), Ordering::SeqCst);
            Self::fail_batch(
                remaining,
                &CoreError::system("shutdown").with_code("SHUTDOWN"),
                &self.shared.counters,
            );
        }

        // Closing the channel lets workers drain and exit
        let abort_handles: Vec<_> = {
            let tasks = self.shared.tasks.lock();
            tasks.iter().map(|t| t.abort_handle()).collect()
        };
        drop(self.shared.dispatch_tx.lock().take());

        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        let drained = timeout(
            self.shared.tuning.shutdown_timeout,
            futures::future::join_all(tasks),
        )
        .await;

        if drained.is_err() {
            LOGGER.warn(
                "shutdown timed out, aborting in-flight work",
                &[("batcher", json!(self.shared.name))],
            );
            for handle in abort_handles {
                handle.abort();
            }
            // Anything still queued resolves with the shutdown error; senders
            // dropped by aborted workers resolve the same way on the caller
            // side.
            if let Some(rx) = self.shared.worker_rx.lock().take() {
                if let Ok(mut rx) = rx.try_lock() {
                    while let Ok(batch) = rx.try_recv() {
                        Self::fail_batch(
                            batch,
                            &CoreError::system("shutdown").with_code("SHUTDOWN"),
                            &self.shared.counters,
                        );
                    }
                }
            }
        }

        LOGGER.info(
            "batch processor stopped",
            &[("batcher", json!(self.shared.name))],
        );
    }

    /// Whether the batcher is accepting requests
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BatcherStats {
        let c = &self.shared.counters;
        let batches = c.batches_processed.load(Ordering::Relaxed);
        BatcherStats {
            name: self.shared.name,
            running: self.is_running(),
            batches_dispatched: batches,
            requests_processed: c.requests_processed.load(Ordering::Relaxed),
            requests_failed: c.requests_failed.load(Ordering::Relaxed),
            mean_batch_size: c.batch_size_total.load(Ordering::Relaxed) as f64
                / batches.max(1) as f64,
            mean_dispatch_ms: c.dispatch_ms_total.load(Ordering::Relaxed) as f64
                / batches.max(1) as f64,
            flushes: c.flushes.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            queued: self.shared.pending.load(Ordering::SeqCst),
        }
    }
}
