//! Coordinated, deadline-bounded access to database files.
//!
//! This crate reads and writes files that may live on slow or remote
//! providers (cloud drives, network volumes) while several independent
//! consumers race to open, read, write or lock the same file. Conflicting
//! operations on a path are serialized by a coordination facility, every
//! operation carries an absolute deadline, and failures are reported as
//! either a system error or a timeout naming the provider.
//!
//! # Components
//!
//! - [`ByteBuffer`] - immutable file content, optionally memory-mapped
//! - [`FileReference`] - stable handle to a file, resolved with a deadline
//! - [`AccessCoordinator`] - runs operation bodies inside granted windows
//! - [`BackgroundQueues`] - operation queue + coordination-wait queue
//! - [`FileAccessor`] - bookmark, read file info, read, write, read-then-write
//!
//! # Why two queues?
//!
//! Grant callbacks run on the operation queue. If the wait for a grant also
//! occupied an operation-queue slot, a full queue of waiters would leave no
//! slot for the callbacks they wait on. Waits therefore run on their own
//! queue.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//!
//! use filecoord_core::{AccessConfig, ByteBuffer, Deadline, FileAccessor};
//!
//! # async fn demo() -> filecoord_core::FileAccessResult<()> {
//! let accessor = FileAccessor::new(AccessConfig::default());
//! let path = Path::new("/tmp/db.kdbx");
//!
//! accessor
//!     .write_async(ByteBuffer::from(vec![0u8; 100]), path, None, Deadline::after(Duration::from_secs(5)))
//!     .await?;
//! let content = accessor
//!     .read_async(path, None, Deadline::after(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(content.len(), 100);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod background;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod deadline;
pub mod error;
pub mod file_info;
pub mod provider;
pub mod queue;
pub mod reference;
pub mod scope;

pub use access::{FileAccessor, FileAccessorBuilder};
pub use background::BackgroundQueues;
pub use buffer::{ByteBuffer, DEFAULT_MMAP_THRESHOLD, LoadOptions, ReadMode};
pub use completion::{Completion, OutcomeReceiver};
pub use config::{AccessConfig, DEFAULT_PROBE_SIZE, DEFAULT_RESOLUTION_TIMEOUT};
pub use coordinator::{
    AccessCoordinator, CancellationToken, CoordinatedCall, CoordinationError,
    CoordinationFacility, CoordinationIntent, CoordinationRequest, CoordinatorStats,
    CoordinatorStatsSnapshot, GrantedPaths, IntentKind, LocalFacility, ReadOptions, SignalOnce,
    WriteOptions,
};
pub use deadline::Deadline;
pub use error::{BodyError, FileAccessError, FileAccessResult};
pub use file_info::FileInfo;
pub use provider::{FileProvider, LocationKind, UnknownLocationKind};
pub use queue::{
    DEFAULT_MAX_CONCURRENCY, DEFAULT_QUEUE_CAPACITY, QueueConfig, QueuePriority, QueueStats,
    QueueStatsSnapshot, SubmitError, WorkQueue,
};
pub use reference::{FileReference, ReferenceError};
pub use scope::{ScopedAccess, SecurityScope, UnrestrictedScope};

/// Testing utilities: counting scopes, stalled and scripted facilities,
/// content generators.
pub mod testing;
