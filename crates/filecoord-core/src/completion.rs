//! Delivery of operation outcomes.
//!
//! Every operation reports exactly one [`FileAccessResult`] to a
//! [`Completion`]: a continuation plus the queue it should run on. When no
//! queue is named, the outcome is delivered on the operation queue.

use std::fmt;

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{FileAccessError, FileAccessResult};
use crate::queue::WorkQueue;

type Callback<T> = Box<dyn FnOnce(FileAccessResult<T>) + Send + 'static>;

/// Where and how an operation outcome is delivered.
pub struct Completion<T> {
    queue: Option<WorkQueue>,
    callback: Callback<T>,
}

impl<T: Send + 'static> Completion<T> {
    /// Deliver on the operation queue.
    pub fn new(callback: impl FnOnce(FileAccessResult<T>) + Send + 'static) -> Self {
        Self {
            queue: None,
            callback: Box::new(callback),
        }
    }

    /// Deliver on `queue`.
    pub fn on(queue: &WorkQueue, callback: impl FnOnce(FileAccessResult<T>) + Send + 'static) -> Self {
        Self {
            queue: Some(queue.clone()),
            callback: Box::new(callback),
        }
    }

    /// A completion that forwards the outcome into a oneshot channel, for
    /// awaiting from async code.
    pub fn channel() -> (Self, OutcomeReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |outcome| {
            // The receiver may have been dropped by a cancelled future.
            let _ = tx.send(outcome);
        });
        (completion, OutcomeReceiver { rx })
    }

    /// The queue this completion runs on, if one was named.
    pub fn queue(&self) -> Option<&WorkQueue> {
        self.queue.as_ref()
    }

    /// Adapt this completion to accept a different outcome type.
    ///
    /// `f` runs on the same queue, immediately before the original callback.
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(FileAccessResult<U>) -> FileAccessResult<T> + Send + 'static,
    {
        let Completion { queue, callback } = self;
        Completion {
            queue,
            callback: Box::new(move |outcome| callback(f(outcome))),
        }
    }

    /// Deliver `outcome`, on `default_queue` unless a queue was named.
    ///
    /// If the target queue refuses the job, the outcome is delivered inline
    /// so that it is never lost.
    pub(crate) fn deliver(self, default_queue: &WorkQueue, outcome: FileAccessResult<T>) {
        let Completion { queue, callback } = self;
        let queue = queue.as_ref().unwrap_or(default_queue);
        let job = Box::new(move || callback(outcome));
        if let Err((err, job)) = queue.try_execute(job) {
            warn!(queue = queue.label(), error = %err, "Delivering outcome inline");
            job();
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("queue", &self.queue.as_ref().map(WorkQueue::label))
            .finish_non_exhaustive()
    }
}

/// Receiving half of [`Completion::channel`].
#[derive(Debug)]
pub struct OutcomeReceiver<T> {
    rx: oneshot::Receiver<FileAccessResult<T>>,
}

impl<T> OutcomeReceiver<T> {
    /// Wait for the outcome.
    pub async fn recv(self) -> FileAccessResult<T> {
        self.rx.await.unwrap_or_else(|_| {
            Err(FileAccessError::system(
                "operation finished without delivering an outcome",
            ))
        })
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(self) -> FileAccessResult<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| {
            Err(FileAccessError::system(
                "operation finished without delivering an outcome",
            ))
        })
    }
}
