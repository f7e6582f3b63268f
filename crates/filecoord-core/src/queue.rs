//! Bounded-concurrency work queues.
//!
//! A [`WorkQueue`] is a fixed pool of worker threads fed by a bounded
//! submission channel. At most `max_concurrency` jobs run at any instant;
//! further jobs wait in the channel, and submissions beyond
//! `queue_capacity` are rejected rather than blocking the submitter.
//!
//! # Design
//!
//! - Fixed number of worker threads (`max_concurrency`)
//! - Bounded submission queue (reject-fast when full)
//! - Workers run below user-interactive priority where the OS allows it
//! - On shutdown, workers drain already-accepted jobs before exiting, so
//!   every accepted job runs exactly once

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Default number of jobs a queue runs concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default capacity of the submission backlog.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How often idle workers check the shutdown flag.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling tier of a queue's worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    /// Work the user is actively waiting on.
    UserInteractive,
    /// Work the user started and expects soon.
    UserInitiated,
    /// Long-running work the user is aware of.
    #[default]
    Utility,
    /// Maintenance work.
    Background,
}

impl QueuePriority {
    /// Nice value applied to worker threads on Linux.
    pub fn nice_value(self) -> i32 {
        match self {
            QueuePriority::UserInteractive => 0,
            QueuePriority::UserInitiated => 2,
            QueuePriority::Utility => 5,
            QueuePriority::Background => 10,
        }
    }
}

/// Configuration for a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Thread name prefix.
    pub label: String,
    /// Number of worker threads.
    pub max_concurrency: usize,
    /// Capacity of the submission backlog.
    pub queue_capacity: usize,
    /// Worker scheduling tier.
    pub priority: QueuePriority,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            label: "filecoord-queue".to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            priority: QueuePriority::default(),
        }
    }
}

impl QueueConfig {
    /// A default configuration with the given thread name prefix.
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Set the submission backlog capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the worker scheduling tier.
    #[must_use]
    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Error when submitting to a queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The backlog is full.
    #[error("queue '{label}' is full (capacity: {capacity})")]
    QueueFull {
        /// Queue label.
        label: String,
        /// Configured capacity.
        capacity: usize,
    },
    /// The queue has been shut down.
    #[error("queue '{label}' has been shut down")]
    Shutdown {
        /// Queue label.
        label: String,
    },
}

/// Statistics for a queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Jobs accepted.
    pub submitted: AtomicU64,
    /// Jobs finished.
    pub completed: AtomicU64,
    /// Jobs rejected (backlog full or shut down).
    pub rejected: AtomicU64,
    /// Jobs panicked.
    pub panicked: AtomicU64,
    /// Jobs running right now.
    pub active: AtomicUsize,
    /// Highest value `active` has reached.
    pub peak_active: AtomicUsize,
    /// Total execution time in nanoseconds.
    pub total_execution_nanos: AtomicU64,
}

impl QueueStats {
    fn record_start(&self) {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(active, Ordering::AcqRel);
    }

    fn record_finish(&self, duration: Duration, panicked: bool) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
        }
        // Truncation only matters past ~584 years of accumulated runtime.
        #[allow(clippy::cast_possible_truncation)]
        let nanos = duration.as_nanos() as u64;
        self.total_execution_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Acquire),
            peak_active: self.peak_active.load(Ordering::Acquire),
            total_execution_nanos: self.total_execution_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`QueueStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub active: usize,
    pub peak_active: usize,
    pub total_execution_nanos: u64,
}

struct QueueInner {
    submit_tx: Sender<Job>,
    /// Held shared while submitting and exclusively while raising `shutdown`,
    /// so every accepted job is in the channel before workers start draining.
    submit_gate: RwLock<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
    config: QueueConfig,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Workers exit once the channel drains and the sender is gone.
        self.shutdown.store(true, Ordering::Release);
    }
}

/// A bounded-concurrency work queue. Cheap to clone; clones share workers.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Start a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        let (submit_tx, submit_rx) = bounded(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(QueueStats::default());

        let mut workers = Vec::with_capacity(config.max_concurrency);
        for worker_id in 0..config.max_concurrency {
            let rx = submit_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let priority = config.priority;

            let handle = thread::Builder::new()
                .name(format!("{}-{worker_id}", config.label))
                .spawn(move || {
                    apply_priority(priority);
                    worker_loop(worker_id, &rx, &shutdown, &stats);
                })
                .expect("failed to spawn queue worker thread");
            workers.push(handle);
        }

        info!(
            label = %config.label,
            threads = config.max_concurrency,
            capacity = config.queue_capacity,
            priority = ?config.priority,
            "Work queue started"
        );

        Self {
            inner: Arc::new(QueueInner {
                submit_tx,
                submit_gate: RwLock::new(()),
                workers: Mutex::new(workers),
                shutdown,
                stats,
                config,
            }),
        }
    }

    /// Submit a job, handing it back if the queue cannot accept it.
    pub fn try_execute(&self, job: Job) -> Result<(), (SubmitError, Job)> {
        let inner = &self.inner;
        let _open = inner.submit_gate.read();
        if inner.shutdown.load(Ordering::Acquire) {
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err((self.shutdown_error(), job));
        }

        match inner.submit_tx.try_send(job) {
            Ok(()) => {
                inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
                trace!(label = %inner.config.label, "Job submitted");
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    label = %inner.config.label,
                    capacity = inner.config.queue_capacity,
                    "Queue full, rejecting job"
                );
                Err((
                    SubmitError::QueueFull {
                        label: inner.config.label.clone(),
                        capacity: inner.config.queue_capacity,
                    },
                    job,
                ))
            }
            Err(TrySendError::Disconnected(job)) => {
                inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err((self.shutdown_error(), job))
            }
        }
    }

    /// Submit a closure. A rejected closure is dropped without running.
    pub fn execute<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_execute(Box::new(job)).map_err(|(err, _job)| err)
    }

    fn shutdown_error(&self) -> SubmitError {
        SubmitError::Shutdown {
            label: self.inner.config.label.clone(),
        }
    }

    /// Queue label.
    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    /// Configured number of worker threads.
    pub fn max_concurrency(&self) -> usize {
        self.inner.config.max_concurrency
    }

    /// Queue statistics.
    pub fn stats(&self) -> &QueueStats {
        &self.inner.stats
    }

    /// Returns true if the queue still accepts work.
    pub fn is_healthy(&self) -> bool {
        !self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work. Accepted jobs still run.
    pub fn shutdown(&self) {
        info!(label = %self.inner.config.label, "Initiating queue shutdown");
        let _closed = self.inner.submit_gate.write();
        self.inner.shutdown.store(true, Ordering::Release);
    }

    /// Shut down and wait for all workers to exit.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // A job joining its own queue would deadlock.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!(label = %self.inner.config.label, "Queue shutdown complete");
    }

    /// Returns true if two handles refer to the same queue.
    pub fn same_queue(&self, other: &WorkQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("label", &self.inner.config.label)
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .field("active", &self.inner.stats.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn worker_loop(worker_id: usize, rx: &Receiver<Job>, shutdown: &AtomicBool, stats: &QueueStats) {
    debug!(worker_id, "Queue worker started");

    loop {
        match rx.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
            Ok(job) => run_job(job, stats),
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Acquire) {
                    // Drain whatever was accepted before shutdown.
                    while let Ok(job) = rx.try_recv() {
                        run_job(job, stats);
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker_id, "Queue worker exiting");
}

fn run_job(job: Job, stats: &QueueStats) {
    let start = Instant::now();
    stats.record_start();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
    let panicked = result.is_err();
    if panicked {
        warn!("Queue job panicked");
    }
    stats.record_finish(start.elapsed(), panicked);
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: QueuePriority) {
    let nice = priority.nice_value();
    if nice == 0 {
        return;
    }
    // On Linux, PRIO_PROCESS with who = 0 targets the calling thread only.
    // SAFETY: setpriority has no memory-safety preconditions.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        trace!(nice, "setpriority failed; keeping default priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(_priority: QueuePriority) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.priority, QueuePriority::Utility);
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::labeled("ops").with_concurrency(4).with_capacity(16);
        assert_eq!(config.label, "ops");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(QueueConfig::default().with_concurrency(0).max_concurrency, 1);
    }

    #[test]
    fn test_execute_runs_job() {
        let queue = WorkQueue::new(QueueConfig::labeled("test").with_concurrency(2));
        let (tx, rx) = mpsc::channel();
        queue.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        queue.shutdown_and_wait();
        assert_eq!(queue.stats().snapshot().completed, 1);
    }

    #[test]
    fn test_concurrency_never_exceeds_limit() {
        let queue = WorkQueue::new(QueueConfig::labeled("limit").with_concurrency(3));
        let (tx, rx) = mpsc::channel();
        for _ in 0..12 {
            let tx = tx.clone();
            queue
                .execute(move || {
                    thread::sleep(Duration::from_millis(20));
                    tx.send(()).unwrap();
                })
                .unwrap();
        }
        for _ in 0..12 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let snapshot = queue.stats().snapshot();
        assert!(snapshot.peak_active <= 3, "peak {}", snapshot.peak_active);
        assert!(snapshot.peak_active >= 1);
    }

    #[test]
    fn test_rejects_when_full() {
        let queue = WorkQueue::new(QueueConfig::labeled("full").with_concurrency(1).with_capacity(1));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        queue
            .execute(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker busy: one job fits in the backlog, the next is rejected.
        queue.execute(|| {}).unwrap();
        let err = queue.execute(|| {}).unwrap_err();
        assert!(matches!(err, SubmitError::QueueFull { capacity: 1, .. }));
        assert_eq!(queue.stats().snapshot().rejected, 1);

        release_tx.send(()).unwrap();
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_rejects_after_shutdown_and_returns_job() {
        let queue = WorkQueue::new(QueueConfig::labeled("closed").with_concurrency(1));
        queue.shutdown();
        let (tx, rx) = mpsc::channel();
        let Err((err, job)) = queue.try_execute(Box::new(move || tx.send(1).unwrap())) else {
            panic!("submission after shutdown should fail");
        };
        assert!(matches!(err, SubmitError::Shutdown { .. }));
        job();
        assert_eq!(rx.recv().unwrap(), 1);
    }

    #[test]
    fn test_accepted_jobs_drain_on_shutdown() {
        let queue = WorkQueue::new(QueueConfig::labeled("drain").with_concurrency(1));
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            queue
                .execute(move || {
                    thread::sleep(Duration::from_millis(5));
                    tx.send(i).unwrap();
                })
                .unwrap();
        }
        queue.shutdown_and_wait();
        drop(tx);
        assert_eq!(rx.iter().count(), 5);
    }

    #[test]
    fn test_jobs_accepted_during_shutdown_all_run() {
        for _ in 0..20 {
            let queue = WorkQueue::new(
                QueueConfig::labeled("racing")
                    .with_concurrency(2)
                    .with_capacity(100_000),
            );
            let accepted = Arc::new(AtomicU64::new(0));
            let executed = Arc::new(AtomicU64::new(0));

            let submitters: Vec<_> = (0..4)
                .map(|_| {
                    let queue = queue.clone();
                    let accepted = Arc::clone(&accepted);
                    let executed = Arc::clone(&executed);
                    thread::spawn(move || {
                        while queue.is_healthy() {
                            let executed = Arc::clone(&executed);
                            let job = move || {
                                executed.fetch_add(1, Ordering::SeqCst);
                            };
                            if queue.execute(job).is_ok() {
                                accepted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(5));
            queue.shutdown_and_wait();
            for submitter in submitters {
                submitter.join().unwrap();
            }

            assert_eq!(
                executed.load(Ordering::SeqCst),
                accepted.load(Ordering::SeqCst)
            );
        }
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let queue = WorkQueue::new(QueueConfig::labeled("panic").with_concurrency(1));
        queue.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        queue.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        queue.shutdown_and_wait();
        assert_eq!(queue.stats().snapshot().panicked, 1);
    }
}
