//! Testing utilities for code built on the access layer.
//!
//! - **Scopes**: [`CountingScope`] records begin/end pairing
//! - **Facilities**: [`StalledFacility`] never grants; [`ScriptedFacility`]
//!   grants or fails after a delay, optionally staging reads elsewhere
//! - **Generators**: [`random_bytes`]
//!
//! # Usage
//!
//! ```ignore
//! use filecoord_core::testing::{CountingScope, StalledFacility};
//!
//! let facility = Arc::new(StalledFacility::new());
//! let accessor = FileAccessor::builder().facility(facility.clone()).build();
//! // ... every call times out and cancels its request ...
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::coordinator::{
    CancellationToken, CoordinationError, CoordinationFacility, CoordinationRequest,
    GrantCallback, GrantedPaths,
};
use crate::queue::WorkQueue;
use crate::scope::SecurityScope;

/// Generate random bytes of the specified size.
pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Security scope that counts begin/end calls.
#[derive(Debug, Default)]
pub struct CountingScope {
    granted: bool,
    begins: AtomicU64,
    ends: AtomicU64,
}

impl CountingScope {
    /// A scope whose `begin_access` returns `granted`.
    pub fn new(granted: bool) -> Self {
        Self {
            granted,
            ..Self::default()
        }
    }

    /// Number of `begin_access` calls.
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    /// Number of `end_access` calls.
    pub fn ends(&self) -> u64 {
        self.ends.load(Ordering::SeqCst)
    }

    /// Begins not yet matched by an end.
    #[allow(clippy::cast_possible_wrap)]
    pub fn outstanding(&self) -> i64 {
        self.begins() as i64 - self.ends() as i64
    }
}

impl SecurityScope for CountingScope {
    fn begin_access(&self, _path: &Path) -> bool {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.granted
    }

    fn end_access(&self, _path: &Path) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

/// Facility that never grants, simulating an unresponsive provider.
///
/// Callbacks are held until their request is cancelled.
#[derive(Default)]
pub struct StalledFacility {
    requests: AtomicU64,
    cancelled: Arc<AtomicU64>,
    held: Arc<Mutex<Vec<(u64, GrantCallback)>>>,
}

impl StalledFacility {
    /// A facility with no requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests cancelled.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests still waiting.
    pub fn waiting(&self) -> usize {
        self.held.lock().len()
    }
}

impl CoordinationFacility for StalledFacility {
    fn coordinate(
        &self,
        _request: CoordinationRequest,
        _queue: &WorkQueue,
        on_grant: GrantCallback,
    ) -> CancellationToken {
        let id = self.requests.fetch_add(1, Ordering::SeqCst);
        self.held.lock().push((id, on_grant));

        let token = CancellationToken::new();
        let held = Arc::clone(&self.held);
        let cancelled = Arc::clone(&self.cancelled);
        token.on_cancel(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
            held.lock().retain(|(held_id, _)| *held_id != id);
        });
        token
    }
}

/// What a [`ScriptedFacility`] does with each request.
#[derive(Debug, Clone)]
enum Script {
    Grant { read_from: Option<PathBuf> },
    Fail(io::ErrorKind),
}

/// Facility that answers every request after a fixed delay.
///
/// Answers are scheduled on a helper thread and delivered on the queue
/// given to `coordinate`. No exclusion is performed.
#[derive(Debug, Clone)]
pub struct ScriptedFacility {
    delay: Duration,
    script: Script,
}

impl ScriptedFacility {
    /// Grant every request after `delay`.
    pub fn granting_after(delay: Duration) -> Self {
        Self {
            delay,
            script: Script::Grant { read_from: None },
        }
    }

    /// Fail every request with an I/O error of `kind` after `delay`.
    pub fn failing_after(delay: Duration, kind: io::ErrorKind) -> Self {
        Self {
            delay,
            script: Script::Fail(kind),
        }
    }

    /// Grant read intents at `path` instead of the requested path, the way
    /// versioned providers stage a copy for reading.
    #[must_use]
    pub fn staging_reads_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Script::Grant {
            read_from: Some(path.into()),
        };
        self
    }
}

impl CoordinationFacility for ScriptedFacility {
    fn coordinate(
        &self,
        request: CoordinationRequest,
        queue: &WorkQueue,
        on_grant: GrantCallback,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let outcome = match &self.script {
            Script::Grant { read_from } => Ok(GrantedPaths::new(
                request
                    .intents()
                    .iter()
                    .map(|intent| {
                        let path = match read_from {
                            Some(staged) if !intent.is_write() => staged.clone(),
                            _ => intent.path().to_path_buf(),
                        };
                        (path, intent.is_write())
                    })
                    .collect(),
            )),
            Script::Fail(kind) => Err(CoordinationError::Io {
                path: request
                    .primary_path()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
                source: io::Error::new(*kind, "scripted coordination failure"),
            }),
        };

        let delay = self.delay;
        let queue = queue.clone();
        let watched = token.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let outcome = if watched.is_cancelled() {
                Err(CoordinationError::Cancelled)
            } else {
                outcome
            };
            let slot = Arc::new(Mutex::new(Some(on_grant)));
            let job_slot = Arc::clone(&slot);
            let submitted = queue.execute(move || {
                let callback = job_slot.lock().take();
                if let Some(callback) = callback {
                    callback(outcome);
                }
            });
            if let Err(err) = submitted {
                let callback = slot.lock().take();
                if let Some(callback) = callback {
                    callback(Err(CoordinationError::Rejected(err)));
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinationIntent, ReadOptions, WriteOptions};
    use crate::queue::QueueConfig;
    use std::sync::mpsc;

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(100).len(), 100);
        assert!(random_bytes(0).is_empty());
    }

    #[test]
    fn test_stalled_facility_holds_until_cancelled() {
        let facility = StalledFacility::new();
        let queue = WorkQueue::new(QueueConfig::labeled("stalled").with_concurrency(1));
        let token = facility.coordinate(
            CoordinationRequest::single(CoordinationIntent::read("/tmp/s", ReadOptions::empty())),
            &queue,
            Box::new(|_| panic!("stalled facility granted")),
        );
        assert_eq!(facility.waiting(), 1);
        token.cancel();
        assert_eq!(facility.waiting(), 0);
        assert_eq!(facility.cancelled(), 1);
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_scripted_facility_stages_reads() {
        let facility = ScriptedFacility::granting_after(Duration::from_millis(5))
            .staging_reads_at("/tmp/staged/db");
        let queue = WorkQueue::new(QueueConfig::labeled("scripted").with_concurrency(1));
        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            CoordinationRequest::read_then_write(
                Path::new("/tmp/db"),
                ReadOptions::empty(),
                WriteOptions::FOR_MERGING,
            ),
            &queue,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        let granted = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(granted.reading(), Some(Path::new("/tmp/staged/db")));
        assert_eq!(granted.writing(), Some(Path::new("/tmp/db")));
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_scripted_facility_failure() {
        let facility =
            ScriptedFacility::failing_after(Duration::ZERO, io::ErrorKind::PermissionDenied);
        let queue = WorkQueue::new(QueueConfig::labeled("failing").with_concurrency(1));
        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            CoordinationRequest::single(CoordinationIntent::write("/tmp/f", WriteOptions::empty())),
            &queue,
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::Io { .. }));
        queue.shutdown_and_wait();
    }
}
