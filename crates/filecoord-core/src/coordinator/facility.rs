//! The coordination facility contract.
//!
//! A [`CoordinationFacility`] arbitrates conflicting access to file paths.
//! It accepts a set of intents, and once every intent can be honored it
//! invokes a grant callback on the operation queue with the concrete paths to
//! use. Access is held while the callback runs and released when it returns.
//! A pending request can be withdrawn through the [`CancellationToken`] the
//! facility hands back.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use super::intent::{CoordinationIntent, ReadOptions, WriteOptions};
use crate::error::FileAccessError;
use crate::queue::{SubmitError, WorkQueue};

/// A set of intents serviced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationRequest {
    intents: Vec<CoordinationIntent>,
}

impl CoordinationRequest {
    /// A request made of the given intents.
    pub fn new(intents: Vec<CoordinationIntent>) -> Self {
        Self { intents }
    }

    /// A request for a single intent.
    pub fn single(intent: CoordinationIntent) -> Self {
        Self {
            intents: vec![intent],
        }
    }

    /// A read intent and a write intent on the same path, granted together.
    pub fn read_then_write(path: &Path, read: ReadOptions, write: WriteOptions) -> Self {
        Self {
            intents: vec![
                CoordinationIntent::read(path, read),
                CoordinationIntent::write(path, write),
            ],
        }
    }

    /// The intents, in request order.
    pub fn intents(&self) -> &[CoordinationIntent] {
        &self.intents
    }

    /// Returns true if the request has no intents.
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// The path of the first intent, used for diagnostics.
    pub fn primary_path(&self) -> Option<&Path> {
        self.intents.first().map(CoordinationIntent::path)
    }
}

/// Concrete paths granted for a request, one per intent, in request order.
///
/// A granted path may differ from the requested one when symlinks are
/// resolved or when a provider stages a versioned copy for reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedPaths {
    entries: Vec<(PathBuf, bool)>,
}

impl GrantedPaths {
    /// Build from `(path, is_write)` pairs in request order.
    pub fn new(entries: Vec<(PathBuf, bool)>) -> Self {
        Self { entries }
    }

    /// Granted path of the first read intent.
    pub fn reading(&self) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(_, write)| !write)
            .map(|(path, _)| path.as_path())
    }

    /// Granted path of the first write intent.
    pub fn writing(&self) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(_, write)| *write)
            .map(|(path, _)| path.as_path())
    }
}

/// Failure reported by a coordination facility.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The request was cancelled before access was granted.
    #[error("coordination request was cancelled")]
    Cancelled,

    /// The grant callback could not be scheduled.
    #[error("coordination callback could not be scheduled: {0}")]
    Rejected(#[from] SubmitError),

    /// The facility failed to prepare a path.
    #[error("coordination failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The request cannot be serviced.
    #[error("invalid coordination request: {0}")]
    InvalidRequest(String),
}

impl From<CoordinationError> for FileAccessError {
    fn from(err: CoordinationError) -> Self {
        let kind = match &err {
            CoordinationError::Io { source, .. } => Some(source.kind()),
            CoordinationError::Cancelled => Some(io::ErrorKind::Interrupted),
            _ => None,
        };
        FileAccessError::System {
            message: err.to_string(),
            kind,
        }
    }
}

/// Callback invoked once a request is granted or has permanently failed.
pub type GrantCallback = Box<dyn FnOnce(Result<GrantedPaths, CoordinationError>) + Send + 'static>;

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// Handle for withdrawing a pending coordination request.
///
/// Cancelling is idempotent. Hooks registered by the facility run once, on
/// the first call to [`cancel`](Self::cancel); a hook registered after
/// cancellation runs immediately.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<CancelHook>>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the request. Only the first call has any effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Register work to run on cancellation.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.hooks.lock();
            if !self.inner.cancelled.load(Ordering::Acquire) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Arbitrates conflicting access to file paths.
///
/// Implementations must:
///
/// - invoke `on_grant` at most once, on `queue` (or inline if `queue`
///   rejects the job),
/// - hold access to every granted path while `on_grant` runs,
/// - treat a cancelled pending request as withdrawn; its callback is either
///   dropped or invoked with [`CoordinationError::Cancelled`].
pub trait CoordinationFacility: Send + Sync {
    /// Submit `request`. Returns immediately.
    fn coordinate(
        &self,
        request: CoordinationRequest,
        queue: &WorkQueue,
        on_grant: GrantCallback,
    ) -> CancellationToken;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_read_then_write_request() {
        let request = CoordinationRequest::read_then_write(
            Path::new("/tmp/db"),
            ReadOptions::empty(),
            WriteOptions::FOR_MERGING,
        );
        assert_eq!(request.intents().len(), 2);
        assert!(!request.intents()[0].is_write());
        assert!(request.intents()[1].is_write());
        assert_eq!(request.primary_path(), Some(Path::new("/tmp/db")));
    }

    #[test]
    fn test_granted_paths_lookup() {
        let granted = GrantedPaths::new(vec![
            (PathBuf::from("/tmp/v1/db"), false),
            (PathBuf::from("/tmp/db"), true),
        ]);
        assert_eq!(granted.reading(), Some(Path::new("/tmp/v1/db")));
        assert_eq!(granted.writing(), Some(Path::new("/tmp/db")));
        assert_eq!(GrantedPaths::new(Vec::new()).reading(), None);
    }

    #[test]
    fn test_cancel_runs_hooks_once() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        token.on_cancel(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        token.on_cancel(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_coordination_error_becomes_system_error() {
        let err: FileAccessError = CoordinationError::Io {
            path: PathBuf::from("/tmp/db"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        }
        .into();
        assert!(!err.is_timeout());
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(err.to_string().contains("/tmp/db"));
    }
}
