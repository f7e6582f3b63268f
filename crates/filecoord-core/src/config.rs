//! Configuration for the access layer.
//!
//! Defaults match a mobile client reading database files that may live on
//! slow cloud providers: eight concurrent operations per queue, a generous
//! resolution timeout, and memory-mapped reads for large local files.

use std::time::Duration;

use crate::buffer::{DEFAULT_MMAP_THRESHOLD, ReadMode};
use crate::queue::{DEFAULT_MAX_CONCURRENCY, DEFAULT_QUEUE_CAPACITY, QueuePriority};

/// Default timeout for resolving a file reference.
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of bytes read by the materialization probe.
pub const DEFAULT_PROBE_SIZE: usize = 1;

/// Configuration for [`FileAccessor`](crate::FileAccessor) and its queues.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Concurrent jobs per background queue.
    pub max_concurrency: usize,
    /// Submission backlog per background queue.
    pub queue_capacity: usize,
    /// Scheduling tier of the background queues.
    pub priority: QueuePriority,
    /// Timeout used by file references when the caller gives none.
    pub default_resolution_timeout: Duration,
    /// Bytes peeked to force a provider to materialize a file before stat.
    pub probe_size: usize,
    /// How file content is loaded.
    pub read_mode: ReadMode,
    /// Minimum size for memory-mapped reads.
    pub mmap_threshold: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            priority: QueuePriority::Utility,
            default_resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            probe_size: DEFAULT_PROBE_SIZE,
            read_mode: ReadMode::MappedIfSafe,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }
}

impl AccessConfig {
    /// Sets the concurrency limit of each background queue.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Sets the submission backlog of each background queue.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the scheduling tier of the background queues.
    #[must_use]
    pub fn priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the default reference resolution timeout.
    #[must_use]
    pub fn default_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.default_resolution_timeout = timeout;
        self
    }

    /// Sets the materialization probe size.
    #[must_use]
    pub fn probe_size(mut self, bytes: usize) -> Self {
        self.probe_size = bytes;
        self
    }

    /// Sets the read mode.
    #[must_use]
    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    /// Sets the memory-map threshold.
    #[must_use]
    pub fn mmap_threshold(mut self, bytes: u64) -> Self {
        self.mmap_threshold = bytes;
        self
    }
}
