//! The two background queues used by the access layer.
//!
//! Coordinated access needs two independent pools:
//!
//! - the **operation queue** runs granted operation bodies, and is where the
//!   coordination facility delivers its grant callbacks;
//! - the **coordination-wait queue** hosts the blocking wait for each
//!   coordination handshake.
//!
//! If the thread that requested coordination blocked on the operation queue
//! itself, the grant callback could never run once every operation slot was
//! taken by a waiter. Keeping the waiters on their own queue means they can
//! never starve the bodies they are waiting for.

use std::sync::LazyLock;

use crate::config::AccessConfig;
use crate::queue::{QueueConfig, WorkQueue};

/// Operation queue + coordination-wait queue.
#[derive(Debug, Clone)]
pub struct BackgroundQueues {
    operation: WorkQueue,
    coordination_wait: WorkQueue,
}

static GLOBAL_QUEUES: LazyLock<BackgroundQueues> =
    LazyLock::new(|| BackgroundQueues::new(&AccessConfig::default()));

impl BackgroundQueues {
    /// Start an isolated pair of queues.
    pub fn new(config: &AccessConfig) -> Self {
        let queue_config = |label: &str| {
            QueueConfig::labeled(label)
                .with_concurrency(config.max_concurrency)
                .with_capacity(config.queue_capacity)
                .with_priority(config.priority)
        };
        Self {
            operation: WorkQueue::new(queue_config("filecoord-op")),
            coordination_wait: WorkQueue::new(queue_config("filecoord-wait")),
        }
    }

    /// The process-wide queues, started on first use with the default
    /// configuration.
    pub fn global() -> &'static BackgroundQueues {
        &GLOBAL_QUEUES
    }

    /// Queue running operation bodies and grant callbacks.
    pub fn operation(&self) -> &WorkQueue {
        &self.operation
    }

    /// Queue hosting blocking coordination waits.
    pub fn coordination_wait(&self) -> &WorkQueue {
        &self.coordination_wait
    }

    /// Shut down both queues and wait for their workers.
    pub fn shutdown_and_wait(&self) {
        self.coordination_wait.shutdown_and_wait();
        self.operation.shutdown_and_wait();
    }
}
