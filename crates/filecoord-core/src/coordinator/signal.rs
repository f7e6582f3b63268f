//! Single-fulfillment signal shared by the deadline and grant paths.
//!
//! A coordinated call has two parties that may finish it: the grant callback
//! (access granted, body ran, or coordination failed) and the waiter whose
//! deadline expired. Exactly one of them may win. The winner *claims* the
//! signal with a compare-and-swap; the loser's claim fails and it backs off.
//!
//! Claiming and fulfilling are separate steps so that the grant path can
//! claim before running the operation body. Once it holds the claim, the
//! deadline path can no longer report a timeout; the grant path owns the
//! outcome from then on.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

const EMPTY: u8 = 0;
const CLAIMED: u8 = 1;
const FULFILLED: u8 = 2;

/// A value that can be signaled at most once.
#[derive(Debug)]
pub struct SignalOnce<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Default for SignalOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignalOnce<T> {
    /// A fresh, unclaimed signal.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Try to become the party that completes this signal.
    ///
    /// Returns `true` for exactly one caller over the signal's lifetime.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Store the value. Only the party whose `try_claim` succeeded may call this.
    pub fn fulfill(&self, value: T) {
        let mut slot = self.value.lock();
        debug_assert_eq!(self.state.load(Ordering::Acquire), CLAIMED);
        *slot = Some(value);
        self.state.store(FULFILLED, Ordering::Release);
        self.ready.notify_all();
    }

    /// Claim and fulfill in one step.
    ///
    /// Returns `false` (dropping `value`) if another party already claimed.
    pub fn try_signal(&self, value: T) -> bool {
        if self.try_claim() {
            self.fulfill(value);
            true
        } else {
            false
        }
    }

    /// Wait until the signal is fulfilled or `deadline` passes.
    ///
    /// Returns `None` on timeout. A value can be taken only once.
    pub fn wait_until(&self, deadline: Instant) -> Option<T> {
        let mut slot = self.value.lock();
        while self.state.load(Ordering::Acquire) != FULFILLED {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}
