//! In-process coordination facility.
//!
//! [`LocalFacility`] arbitrates between callers in the same process with
//! per-path reader/writer accounting:
//!
//! - any number of readers may hold a path at once,
//! - a writer holds a path alone,
//! - a request is granted all-or-nothing across its paths,
//! - pending requests are served in FIFO order per path, so a waiting
//!   writer is not starved by a stream of later readers.
//!
//! A request's own read and write intents on the same path never conflict
//! with each other; the path is simply held exclusively.
//!
//! Paths are held by their resolved location, so a symbolic link and its
//! target exclude each other. The granted path is the resolved one only for
//! reads that ask for it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::facility::{
    CancellationToken, CoordinationError, CoordinationFacility, CoordinationRequest,
    GrantCallback, GrantedPaths,
};
use crate::queue::WorkQueue;

/// `(path, exclusive)` pairs a request needs to hold.
type Claims = Vec<(PathBuf, bool)>;

#[derive(Debug, Default, Clone, Copy)]
struct Holders {
    readers: usize,
    writer: bool,
}

struct Pending {
    id: u64,
    claims: Claims,
    granted: GrantedPaths,
    queue: WorkQueue,
    callback: GrantCallback,
}

#[derive(Default)]
struct State {
    held: HashMap<PathBuf, Holders>,
    pending: VecDeque<Pending>,
    next_id: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

/// In-process reader/writer coordination.
#[derive(Clone, Default)]
pub struct LocalFacility {
    shared: Arc<Shared>,
}

impl LocalFacility {
    /// A facility with no holders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests waiting for access.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Number of paths currently held by granted requests.
    pub fn held_paths(&self) -> usize {
        self.shared.state.lock().held.len()
    }
}

impl fmt::Debug for LocalFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("LocalFacility")
            .field("held", &state.held.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl CoordinationFacility for LocalFacility {
    fn coordinate(
        &self,
        request: CoordinationRequest,
        queue: &WorkQueue,
        on_grant: GrantCallback,
    ) -> CancellationToken {
        let token = CancellationToken::new();

        let (claims, granted) = match plan(&request) {
            Ok(plan) => plan,
            Err(err) => {
                dispatch(queue, on_grant, Err(err), None);
                return token;
            }
        };

        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            trace!(id, paths = claims.len(), "Coordination request queued");
            state.pending.push_back(Pending {
                id,
                claims,
                granted,
                queue: queue.clone(),
                callback: on_grant,
            });
            id
        };
        self.shared.pump();

        let shared = Arc::clone(&self.shared);
        token.on_cancel(move || shared.withdraw(id));
        token
    }
}

impl Shared {
    /// Grant every pending request that can run now.
    fn pump(self: &Arc<Self>) {
        let grants = {
            let mut state = self.state.lock();
            take_grantable(&mut state)
        };
        for grant in grants {
            trace!(id = grant.id, "Coordination granted");
            let release = ReleaseGuard {
                shared: Arc::clone(self),
                claims: grant.claims,
            };
            dispatch(&grant.queue, grant.callback, Ok(grant.granted), Some(release));
        }
    }

    fn release(self: &Arc<Self>, claims: &[(PathBuf, bool)]) {
        {
            let mut state = self.state.lock();
            for (path, exclusive) in claims {
                let Some(holders) = state.held.get_mut(path) else {
                    continue;
                };
                if *exclusive {
                    holders.writer = false;
                } else {
                    holders.readers = holders.readers.saturating_sub(1);
                }
                if !holders.writer && holders.readers == 0 {
                    state.held.remove(path);
                }
            }
        }
        self.pump();
    }

    fn withdraw(self: &Arc<Self>, id: u64) {
        let removed = {
            let mut state = self.state.lock();
            let index = state.pending.iter().position(|pending| pending.id == id);
            index.and_then(|index| state.pending.remove(index))
        };
        let Some(pending) = removed else {
            return;
        };
        debug!(id, "Pending coordination request cancelled");
        dispatch(
            &pending.queue,
            pending.callback,
            Err(CoordinationError::Cancelled),
            None,
        );
        // The withdrawn request may have been blocking later ones.
        self.pump();
    }
}

/// Releases held paths when the grant callback finishes, even by panicking.
struct ReleaseGuard {
    shared: Arc<Shared>,
    claims: Claims,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.shared.release(&self.claims);
    }
}

fn plan(request: &CoordinationRequest) -> Result<(Claims, GrantedPaths), CoordinationError> {
    if request.is_empty() {
        return Err(CoordinationError::InvalidRequest(
            "request has no intents".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(request.intents().len());
    let mut merged: BTreeMap<PathBuf, bool> = BTreeMap::new();
    for intent in request.intents() {
        // Missing files have nothing to resolve; keep the requested path.
        let real = fs::canonicalize(intent.path()).unwrap_or_else(|_| intent.path().to_path_buf());
        let granted = if intent.resolves_symlinks() {
            real.clone()
        } else {
            intent.path().to_path_buf()
        };
        *merged.entry(real).or_default() |= intent.is_write();
        entries.push((granted, intent.is_write()));
    }

    Ok((merged.into_iter().collect(), GrantedPaths::new(entries)))
}

fn conflicts_with_holders(held: &HashMap<PathBuf, Holders>, claims: &[(PathBuf, bool)]) -> bool {
    claims.iter().any(|(path, exclusive)| {
        held.get(path)
            .is_some_and(|holders| holders.writer || (*exclusive && holders.readers > 0))
    })
}

fn overlaps(blocked: &[(PathBuf, bool)], claims: &[(PathBuf, bool)]) -> bool {
    claims.iter().any(|(path, exclusive)| {
        blocked
            .iter()
            .any(|(other, other_exclusive)| other == path && (*exclusive || *other_exclusive))
    })
}

fn take_grantable(state: &mut State) -> Vec<Pending> {
    let mut grants = Vec::new();
    let mut blocked: Claims = Vec::new();
    let mut waiting = VecDeque::with_capacity(state.pending.len());

    while let Some(pending) = state.pending.pop_front() {
        if conflicts_with_holders(&state.held, &pending.claims) || overlaps(&blocked, &pending.claims) {
            blocked.extend(pending.claims.iter().cloned());
            waiting.push_back(pending);
            continue;
        }
        for (path, exclusive) in &pending.claims {
            let holders = state.held.entry(path.clone()).or_default();
            if *exclusive {
                holders.writer = true;
            } else {
                holders.readers += 1;
            }
        }
        grants.push(pending);
    }

    state.pending = waiting;
    grants
}

/// Deliver `outcome` to `callback` on `queue`.
///
/// If the queue refuses the job, access is released and the callback is
/// told the grant could not be scheduled.
fn dispatch(
    queue: &WorkQueue,
    callback: GrantCallback,
    outcome: Result<GrantedPaths, CoordinationError>,
    release: Option<ReleaseGuard>,
) {
    let slot = Arc::new(Mutex::new(Some(callback)));
    let job_slot = Arc::clone(&slot);
    let job = move || {
        // Declared first so it drops last, after the callback returns.
        let _release = release;
        let callback = job_slot.lock().take();
        if let Some(callback) = callback {
            callback(outcome);
        }
    };

    if let Err((err, job)) = queue.try_execute(Box::new(job)) {
        warn!(queue = queue.label(), error = %err, "Could not schedule coordination callback");
        drop(job);
        let callback = slot.lock().take();
        if let Some(callback) = callback {
            callback(Err(CoordinationError::Rejected(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::intent::{CoordinationIntent, ReadOptions, WriteOptions};
    use crate::queue::QueueConfig;
    use std::path::Path;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn queue() -> WorkQueue {
        WorkQueue::new(QueueConfig::labeled("local-test").with_concurrency(4))
    }

    fn read(path: &str) -> CoordinationRequest {
        CoordinationRequest::single(CoordinationIntent::read(path, ReadOptions::empty()))
    }

    fn write(path: &str) -> CoordinationRequest {
        CoordinationRequest::single(CoordinationIntent::write(path, WriteOptions::empty()))
    }

    /// Submit a request whose callback reports the grant, then blocks until
    /// released through the returned sender.
    fn hold(
        facility: &LocalFacility,
        queue: &WorkQueue,
        request: CoordinationRequest,
        granted_tx: mpsc::Sender<&'static str>,
        name: &'static str,
    ) -> (mpsc::Sender<()>, CancellationToken) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let token = facility.coordinate(
            request,
            queue,
            Box::new(move |result| {
                if result.is_ok() {
                    granted_tx.send(name).unwrap();
                    let _ = release_rx.recv_timeout(WAIT);
                }
            }),
        );
        (release_tx, token)
    }

    #[test]
    fn test_grant_delivers_paths() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            CoordinationRequest::read_then_write(
                Path::new("/tmp/filecoord-local/db"),
                ReadOptions::empty(),
                WriteOptions::FOR_MERGING,
            ),
            &queue,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        let granted = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(granted.reading(), Some(Path::new("/tmp/filecoord-local/db")));
        assert_eq!(granted.writing(), Some(Path::new("/tmp/filecoord-local/db")));
        queue.shutdown_and_wait();
        assert_eq!(facility.held_paths(), 0);
    }

    #[test]
    fn test_readers_share_a_path() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();

        let (release_a, _) = hold(&facility, &queue, read("/tmp/shared"), granted_tx.clone(), "a");
        let (release_b, _) = hold(&facility, &queue, read("/tmp/shared"), granted_tx, "b");

        let mut granted = vec![
            granted_rx.recv_timeout(WAIT).unwrap(),
            granted_rx.recv_timeout(WAIT).unwrap(),
        ];
        granted.sort_unstable();
        assert_eq!(granted, vec!["a", "b"]);

        release_a.send(()).unwrap();
        release_b.send(()).unwrap();
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_writer_excludes_reader() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();

        let (release_writer, _) = hold(&facility, &queue, write("/tmp/excl"), granted_tx.clone(), "writer");
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "writer");

        let (release_reader, _) = hold(&facility, &queue, read("/tmp/excl"), granted_tx, "reader");
        assert!(granted_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(facility.pending_requests(), 1);

        release_writer.send(()).unwrap();
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "reader");
        release_reader.send(()).unwrap();
        queue.shutdown_and_wait();
        assert_eq!(facility.held_paths(), 0);
    }

    #[test]
    fn test_waiting_writer_blocks_later_readers() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();

        let (release_first, _) = hold(&facility, &queue, read("/tmp/fair"), granted_tx.clone(), "first");
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "first");

        let (release_writer, _) = hold(&facility, &queue, write("/tmp/fair"), granted_tx.clone(), "writer");
        let (release_late, _) = hold(&facility, &queue, read("/tmp/fair"), granted_tx, "late");
        assert!(granted_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(facility.pending_requests(), 2);

        release_first.send(()).unwrap();
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "writer");
        release_writer.send(()).unwrap();
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "late");
        release_late.send(()).unwrap();
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_unrelated_paths_do_not_block() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();

        let (release_a, _) = hold(&facility, &queue, write("/tmp/a"), granted_tx.clone(), "a");
        let (release_b, _) = hold(&facility, &queue, write("/tmp/b"), granted_tx, "b");
        let mut granted = vec![
            granted_rx.recv_timeout(WAIT).unwrap(),
            granted_rx.recv_timeout(WAIT).unwrap(),
        ];
        granted.sort_unstable();
        assert_eq!(granted, vec!["a", "b"]);

        release_a.send(()).unwrap();
        release_b.send(()).unwrap();
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_cancel_pending_request() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();

        let (release_writer, _) = hold(&facility, &queue, write("/tmp/cancel"), granted_tx, "writer");
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "writer");

        let (tx, rx) = mpsc::channel();
        let token = facility.coordinate(
            read("/tmp/cancel"),
            &queue,
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        assert_eq!(facility.pending_requests(), 1);

        token.cancel();
        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(result, Err(CoordinationError::Cancelled)));
        assert_eq!(facility.pending_requests(), 0);

        release_writer.send(()).unwrap();
        queue.shutdown_and_wait();
        assert_eq!(facility.held_paths(), 0);
    }

    #[test]
    fn test_empty_request_is_invalid() {
        let facility = LocalFacility::new();
        let queue = queue();
        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            CoordinationRequest::new(Vec::new()),
            &queue,
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(CoordinationError::InvalidRequest(_))
        ));
        queue.shutdown_and_wait();
    }

    #[test]
    fn test_rejected_callback_releases_access() {
        let facility = LocalFacility::new();
        let queue = queue();
        queue.shutdown();

        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            write("/tmp/rejected"),
            &queue,
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(CoordinationError::Rejected(_))
        ));
        assert_eq!(facility.held_paths(), 0);
        assert_eq!(facility.pending_requests(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_symlinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("real.kdbx");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.kdbx");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let facility = LocalFacility::new();
        let queue = queue();
        let (tx, rx) = mpsc::channel();
        facility.coordinate(
            CoordinationRequest::single(CoordinationIntent::read(
                &link,
                ReadOptions::RESOLVES_SYMBOLIC_LINK,
            )),
            &queue,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        let granted = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(granted.reading(), Some(fs::canonicalize(&target).unwrap().as_path()));
        queue.shutdown_and_wait();
    }

    #[cfg(unix)]
    #[test]
    fn test_link_and_target_exclude_each_other() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("real.kdbx");
        fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.kdbx");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let facility = LocalFacility::new();
        let queue = queue();
        let (granted_tx, granted_rx) = mpsc::channel();
        let through_link =
            CoordinationRequest::single(CoordinationIntent::write(&link, WriteOptions::empty()));
        let direct =
            CoordinationRequest::single(CoordinationIntent::write(&target, WriteOptions::empty()));

        let (release_link, _) = hold(&facility, &queue, through_link, granted_tx.clone(), "link");
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "link");
        let (release_direct, _) = hold(&facility, &queue, direct, granted_tx, "direct");
        assert!(granted_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(facility.held_paths(), 1);

        release_link.send(()).unwrap();
        assert_eq!(granted_rx.recv_timeout(WAIT).unwrap(), "direct");
        release_direct.send(()).unwrap();
        queue.shutdown_and_wait();
        assert_eq!(facility.held_paths(), 0);
    }
}
