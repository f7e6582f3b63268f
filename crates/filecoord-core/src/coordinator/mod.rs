//! Deadline-bounded coordinated access.
//!
//! [`AccessCoordinator::coordinate`] submits a [`CoordinationRequest`] to the
//! coordination facility and runs an operation body once access is granted,
//! delivering exactly one outcome to the caller's [`Completion`].
//!
//! # Flow
//!
//! 1. The call is handed to the coordination-wait queue; the caller's thread
//!    never blocks.
//! 2. On that queue, the request goes to the facility. Scoped access held
//!    for the call is released as soon as the facility has taken the request.
//! 3. The wait-queue thread blocks on a [`SignalOnce`] until the deadline.
//! 4. The facility invokes the grant callback on the operation queue. The
//!    callback claims the signal *before* running the body, so a call that
//!    reports a timeout never ran its body. Claiming wakes the waiter, which
//!    gives up its wait-queue thread; the callback runs the body and
//!    delivers the outcome itself.
//! 5. If the deadline passes first, the waiter claims the signal, cancels
//!    the pending request and reports a timeout naming the provider.
//!
//! Grant callbacks run on the operation queue and waits run on the
//! coordination-wait queue, so a full set of waiters can never starve the
//! bodies they are waiting for. A slow body occupies an operation thread
//! only; it never holds a wait slot that another call's deadline depends on.

pub mod facility;
pub mod intent;
pub mod local;
pub mod signal;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

pub use facility::{
    CancellationToken, CoordinationError, CoordinationFacility, CoordinationRequest,
    GrantCallback, GrantedPaths,
};
pub use intent::{CoordinationIntent, IntentKind, ReadOptions, WriteOptions};
pub use local::LocalFacility;
pub use signal::SignalOnce;

use crate::background::BackgroundQueues;
use crate::completion::Completion;
use crate::deadline::Deadline;
use crate::error::{BodyError, FileAccessError, FileAccessResult};
use crate::provider::FileProvider;
use crate::scope::ScopedAccess;

/// Counters for coordinated calls.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Calls submitted.
    pub requests: AtomicU64,
    /// Calls whose request was granted and whose body ran.
    pub grants: AtomicU64,
    /// Calls that ended in a timeout.
    pub timeouts: AtomicU64,
    /// Calls that ended in a system error.
    pub failures: AtomicU64,
    /// Pending coordination requests cancelled after a timeout.
    pub cancellations: AtomicU64,
    /// Read-then-write calls whose transform chose not to write.
    pub noop_merges: AtomicU64,
}

impl CoordinatorStats {
    pub(crate) fn record_noop_merge(&self) {
        self.noop_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            noop_merges: self.noop_merges.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStatsSnapshot {
    pub requests: u64,
    pub grants: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub noop_merges: u64,
}

/// Parameters of one coordinated call.
#[derive(Debug)]
pub struct CoordinatedCall {
    request: CoordinationRequest,
    deadline: Deadline,
    provider: Option<FileProvider>,
    access: Vec<ScopedAccess>,
}

impl CoordinatedCall {
    /// A call for `request` that must be granted before `deadline`.
    pub fn new(request: CoordinationRequest, deadline: Deadline) -> Self {
        Self {
            request,
            deadline,
            provider: None,
            access: Vec::new(),
        }
    }

    /// Provider named in a timeout outcome.
    #[must_use]
    pub fn provider(mut self, provider: Option<FileProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Keep `access` alive until the facility has taken the request.
    #[must_use]
    pub fn holding(mut self, access: ScopedAccess) -> Self {
        self.access.push(access);
        self
    }
}

/// Runs operation bodies inside coordinated, deadline-bounded windows.
#[derive(Clone)]
pub struct AccessCoordinator {
    facility: Arc<dyn CoordinationFacility>,
    queues: BackgroundQueues,
    stats: Arc<CoordinatorStats>,
}

impl std::fmt::Debug for AccessCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCoordinator")
            .field("queues", &self.queues)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl AccessCoordinator {
    /// A coordinator using `facility`, waiting and running on `queues`.
    pub fn new(facility: Arc<dyn CoordinationFacility>, queues: BackgroundQueues) -> Self {
        Self {
            facility,
            queues,
            stats: Arc::new(CoordinatorStats::default()),
        }
    }

    /// The background queues.
    pub fn queues(&self) -> &BackgroundQueues {
        &self.queues
    }

    /// Call counters.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Run `body` once `call.request` is granted, or time out at `call.deadline`.
    ///
    /// `body` receives the granted paths and runs on the operation queue
    /// while access is held. Errors it returns, and panics, are reported as
    /// system errors. Exactly one outcome reaches `completion`.
    pub fn coordinate<T, F>(&self, call: CoordinatedCall, body: F, completion: Completion<T>)
    where
        T: Send + 'static,
        F: FnOnce(&GrantedPaths) -> Result<T, BodyError> + Send + 'static,
    {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let this = self.clone();
        let slot = Arc::new(Mutex::new(Some((call, body, completion))));
        let job_slot = Arc::clone(&slot);
        let submitted = self.queues.coordination_wait().try_execute(Box::new(move || {
            let taken = job_slot.lock().take();
            if let Some((call, body, completion)) = taken {
                this.wait_for_grant(call, body, completion);
            }
        }));

        if let Err((err, job)) = submitted {
            drop(job);
            let taken = slot.lock().take();
            if let Some((call, _body, completion)) = taken {
                let path = describe(&call.request);
                drop(call);
                self.finish(
                    completion,
                    Err(FileAccessError::system(format!("could not schedule coordination: {err}"))),
                    &path,
                    Instant::now(),
                );
            }
        }
    }

    /// Run `work` on the operation queue, or time out at `deadline`.
    ///
    /// Used for steps that may stall on a provider but need no coordination,
    /// such as resolving a file reference. `work` does not run at all if
    /// the deadline wins.
    pub fn run_with_deadline<T, F>(
        &self,
        deadline: Deadline,
        provider: Option<FileProvider>,
        work: F,
        completion: Completion<T>,
    ) where
        T: Send + 'static,
        F: FnOnce() -> FileAccessResult<T> + Send + 'static,
    {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let this = self.clone();
        let slot = Arc::new(Mutex::new(Some((work, completion))));
        let job_slot = Arc::clone(&slot);
        let submitted = self.queues.coordination_wait().try_execute(Box::new(move || {
            let taken = job_slot.lock().take();
            if let Some((work, completion)) = taken {
                this.wait_for_work(deadline, provider, work, completion);
            }
        }));

        if let Err((err, job)) = submitted {
            drop(job);
            let taken = slot.lock().take();
            if let Some((_work, completion)) = taken {
                self.finish(
                    completion,
                    Err(FileAccessError::system(format!("could not schedule operation: {err}"))),
                    "",
                    Instant::now(),
                );
            }
        }
    }

    fn wait_for_grant<T, F>(&self, call: CoordinatedCall, body: F, completion: Completion<T>)
    where
        T: Send + 'static,
        F: FnOnce(&GrantedPaths) -> Result<T, BodyError> + Send + 'static,
    {
        let CoordinatedCall {
            request,
            deadline,
            provider,
            access,
        } = call;
        let path = describe(&request);
        let started = Instant::now();

        if deadline.is_expired() {
            drop(access);
            self.finish(completion, Err(FileAccessError::timeout(provider)), &path, started);
            return;
        }

        // Whichever side claims the signal takes the completion and delivers.
        let signal = Arc::new(SignalOnce::new());
        let pending = Arc::new(Mutex::new(Some(completion)));
        let grant_signal = Arc::clone(&signal);
        let grant_pending = Arc::clone(&pending);
        let grant_path = path.clone();
        let this = self.clone();
        let on_grant: GrantCallback = Box::new(move |granted| {
            if !grant_signal.try_claim() {
                debug!("Access granted after the deadline; skipping operation");
                return;
            }
            // Frees the waiter's slot on the coordination-wait queue.
            grant_signal.fulfill(());
            let outcome = match granted {
                Ok(paths) => {
                    this.stats.grants.fetch_add(1, Ordering::Relaxed);
                    run_guarded(|| body(&paths).map_err(|err| FileAccessError::from_body(&err)))
                }
                Err(err) => Err(err.into()),
            };
            let completion = grant_pending.lock().take();
            if let Some(completion) = completion {
                this.finish(completion, outcome, &grant_path, started);
            }
        });

        let token = self
            .facility
            .coordinate(request, self.queues.operation(), on_grant);
        drop(access);

        if deadline_claimed(&signal, deadline) {
            token.cancel();
            self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
            let completion = pending.lock().take();
            if let Some(completion) = completion {
                self.finish(completion, Err(FileAccessError::timeout(provider)), &path, started);
            }
        }
    }

    fn wait_for_work<T, F>(
        &self,
        deadline: Deadline,
        provider: Option<FileProvider>,
        work: F,
        completion: Completion<T>,
    ) where
        T: Send + 'static,
        F: FnOnce() -> FileAccessResult<T> + Send + 'static,
    {
        let started = Instant::now();
        if deadline.is_expired() {
            self.finish(completion, Err(FileAccessError::timeout(provider)), "", started);
            return;
        }

        let signal = Arc::new(SignalOnce::new());
        let pending = Arc::new(Mutex::new(Some(completion)));
        let work_signal = Arc::clone(&signal);
        let work_pending = Arc::clone(&pending);
        let this = self.clone();
        let submitted = self.queues.operation().execute(move || {
            if !work_signal.try_claim() {
                return;
            }
            work_signal.fulfill(());
            let outcome = run_guarded(work);
            let completion = work_pending.lock().take();
            if let Some(completion) = completion {
                this.finish(completion, outcome, "", started);
            }
        });
        if let Err(err) = submitted {
            // The job was dropped unrun.
            if signal.try_claim() {
                let completion = pending.lock().take();
                if let Some(completion) = completion {
                    self.finish(
                        completion,
                        Err(FileAccessError::system(format!("could not schedule operation: {err}"))),
                        "",
                        started,
                    );
                }
            }
            return;
        }

        if deadline_claimed(&signal, deadline) {
            let completion = pending.lock().take();
            if let Some(completion) = completion {
                self.finish(completion, Err(FileAccessError::timeout(provider)), "", started);
            }
        }
    }

    fn finish<T: Send + 'static>(
        &self,
        completion: Completion<T>,
        outcome: FileAccessResult<T>,
        path: &str,
        started: Instant,
    ) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(_) => debug!(path, elapsed_ms, "Coordinated operation finished"),
            Err(err @ FileAccessError::Timeout { provider }) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(path, elapsed_ms, provider = ?provider, error = %err, "Coordinated operation timed out");
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(path, elapsed_ms, error = %err, "Coordinated operation failed");
            }
        }
        completion.deliver(self.queues.operation(), outcome);
    }
}

/// Wait for the other side to claim `signal` until `deadline`.
///
/// Returns true if the deadline passed and this side claimed the signal,
/// making it responsible for reporting the timeout. Returns false as soon as
/// the other side claims; the outcome is then delivered from there.
fn deadline_claimed(signal: &SignalOnce<()>, deadline: Deadline) -> bool {
    signal.wait_until(deadline.instant()).is_none() && signal.try_claim()
}

fn run_guarded<T>(work: impl FnOnce() -> FileAccessResult<T>) -> FileAccessResult<T> {
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
        Err(FileAccessError::system(format!(
            "operation panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

fn describe(request: &CoordinationRequest) -> String {
    request
        .primary_path()
        .map(|path| path.display().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::queue::{QueueConfig, WorkQueue};
    use crate::testing::{CountingScope, StalledFacility};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn queues() -> BackgroundQueues {
        BackgroundQueues::new(&AccessConfig::default().max_concurrency(2))
    }

    fn read_call(path: &str, deadline: Deadline) -> CoordinatedCall {
        CoordinatedCall::new(
            CoordinationRequest::single(CoordinationIntent::read(path, ReadOptions::empty())),
            deadline,
        )
    }

    fn sender<T: Send + 'static>() -> (Completion<T>, mpsc::Receiver<FileAccessResult<T>>) {
        let (tx, rx) = mpsc::channel();
        (Completion::new(move |outcome| tx.send(outcome).unwrap()), rx)
    }

    #[test]
    fn test_body_runs_with_granted_path() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender();
        coordinator.coordinate(
            read_call("/tmp/coord/a", Deadline::after(WAIT)),
            |paths| Ok(paths.reading().map(Path::to_path_buf)),
            completion,
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Ok(Some(PathBuf::from("/tmp/coord/a")))
        );
        let stats = coordinator.stats().snapshot();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.grants, 1);
        coordinator.queues().shutdown_and_wait();
    }

    #[test]
    fn test_expired_deadline_times_out_without_running_body() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let ran = Arc::new(AtomicBool::new(false));
        let body_ran = Arc::clone(&ran);
        let (completion, rx) = sender::<()>();
        coordinator.coordinate(
            read_call("/tmp/coord/expired", Deadline::expired()).provider(Some(FileProvider::Dropbox)),
            move |_| {
                body_ran.store(true, Ordering::SeqCst);
                Ok(())
            },
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.provider(), Some(&FileProvider::Dropbox));
        coordinator.queues().shutdown_and_wait();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(coordinator.stats().snapshot().timeouts, 1);
    }

    #[test]
    fn test_stalled_facility_is_cancelled_on_timeout() {
        let facility = Arc::new(StalledFacility::new());
        let coordinator = AccessCoordinator::new(facility.clone(), queues());
        let (completion, rx) = sender::<()>();
        coordinator.coordinate(
            read_call("/tmp/coord/stalled", Deadline::after(Duration::from_millis(50))),
            |_| Ok(()),
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(facility.requests(), 1);
        assert_eq!(facility.cancelled(), 1);
        assert_eq!(coordinator.stats().snapshot().cancellations, 1);
        coordinator.queues().shutdown_and_wait();
    }

    #[test]
    fn test_body_error_becomes_system_error() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender::<()>();
        coordinator.coordinate(
            read_call("/tmp/coord/err", Deadline::after(WAIT)),
            |_| Err("disk on fire".into()),
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err, FileAccessError::system("disk on fire"));
        coordinator.queues().shutdown_and_wait();
        assert_eq!(coordinator.stats().snapshot().failures, 1);
    }

    #[test]
    fn test_body_panic_becomes_system_error() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender::<()>();
        coordinator.coordinate(
            read_call("/tmp/coord/panic", Deadline::after(WAIT)),
            |_| panic!("body exploded"),
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(err.to_string().contains("body exploded"));
        coordinator.queues().shutdown_and_wait();
    }

    #[test]
    fn test_slow_body_that_won_the_grant_is_not_timed_out() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender();
        coordinator.coordinate(
            read_call("/tmp/coord/slow", Deadline::after(Duration::from_millis(200))),
            |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok("done")
            },
            completion,
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok("done"));
        coordinator.queues().shutdown_and_wait();
    }

    #[test]
    fn test_slow_body_does_not_hold_wait_slot() {
        let coordinator = AccessCoordinator::new(
            Arc::new(LocalFacility::new()),
            BackgroundQueues::new(&AccessConfig::default().max_concurrency(1)),
        );
        // The operation queue is busy with the slow body; deliver elsewhere.
        let side = WorkQueue::new(QueueConfig::labeled("side").with_concurrency(1));

        let (slow_completion, slow_rx) = sender();
        coordinator.coordinate(
            read_call("/tmp/coord/long", Deadline::after(WAIT)),
            |_| {
                std::thread::sleep(Duration::from_millis(1000));
                Ok("slow")
            },
            slow_completion,
        );

        let ran = Arc::new(AtomicBool::new(false));
        let body_ran = Arc::clone(&ran);
        let (tx, rx) = mpsc::channel();
        let submitted = Instant::now();
        coordinator.coordinate(
            read_call("/tmp/coord/short", Deadline::after(Duration::from_millis(100))),
            move |_| {
                body_ran.store(true, Ordering::SeqCst);
                Ok(())
            },
            Completion::on(&side, move |outcome: FileAccessResult<()>| {
                tx.send(outcome).unwrap();
            }),
        );

        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(
            submitted.elapsed() < Duration::from_millis(600),
            "timeout reported after {:?}",
            submitted.elapsed()
        );

        assert_eq!(slow_rx.recv_timeout(WAIT).unwrap(), Ok("slow"));
        coordinator.queues().shutdown_and_wait();
        side.shutdown_and_wait();
        assert!(!ran.load(Ordering::SeqCst));
        let stats = coordinator.stats().snapshot();
        assert_eq!(stats.grants, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn test_scoped_access_released_after_handoff() {
        let scope = Arc::new(CountingScope::new(true));
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender::<()>();
        let access = ScopedAccess::begin(scope.clone(), Path::new("/tmp/coord/scoped"));
        coordinator.coordinate(
            read_call("/tmp/coord/scoped", Deadline::after(WAIT)).holding(access),
            |_| Ok(()),
            completion,
        );
        rx.recv_timeout(WAIT).unwrap().unwrap();
        coordinator.queues().shutdown_and_wait();
        assert_eq!(scope.begins(), 1);
        assert_eq!(scope.ends(), 1);
    }

    #[test]
    fn test_rejected_wait_job_reports_system_error_and_releases_scope() {
        let scope = Arc::new(CountingScope::new(true));
        let queues = queues();
        queues.coordination_wait().shutdown_and_wait();
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues);
        let (completion, rx) = sender::<()>();
        let access = ScopedAccess::begin(scope.clone(), Path::new("/tmp/coord/rejected"));
        coordinator.coordinate(
            read_call("/tmp/coord/rejected", Deadline::after(WAIT)).holding(access),
            |_| Ok(()),
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(scope.outstanding(), 0);
        coordinator.queues().shutdown_and_wait();
    }

    #[test]
    fn test_run_with_deadline() {
        let coordinator = AccessCoordinator::new(Arc::new(LocalFacility::new()), queues());
        let (completion, rx) = sender();
        coordinator.run_with_deadline(Deadline::after(WAIT), None, || Ok(7), completion);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(7));

        let (completion, rx) = sender::<u32>();
        coordinator.run_with_deadline(
            Deadline::expired(),
            Some(FileProvider::OneDrive),
            || Ok(8),
            completion,
        );
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.provider(), Some(&FileProvider::OneDrive));
        coordinator.queues().shutdown_and_wait();
    }
}
