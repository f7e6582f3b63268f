//! Absolute deadlines for file access operations.

use std::time::{Duration, Instant};

/// Upper bound used when `now + timeout` overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An absolute point in time by which an operation must complete.
///
/// Every operation in this crate takes a deadline rather than a relative
/// timeout, so that multi-step operations (resolve, then coordinate) share a
/// single time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self(
            now.checked_add(timeout)
                .or_else(|| now.checked_add(FAR_FUTURE))
                .unwrap_or(now),
        )
    }

    /// A deadline at the given instant.
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// A deadline that has already passed.
    pub fn expired() -> Self {
        Self(Instant::now())
    }

    /// The underlying instant.
    pub fn instant(self) -> Instant {
        self.0
    }

    /// Returns true once the deadline has been reached.
    pub fn is_expired(self) -> bool {
        Instant::now() >= self.0
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self(instant)
    }
}
