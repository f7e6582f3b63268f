//! The public file access operations.
//!
//! Every operation follows the same shape:
//!
//! 1. begin scoped access to each path argument,
//! 2. build the coordination request for the operation,
//! 3. hand it to the [`AccessCoordinator`] together with the body that does
//!    the actual I/O inside the granted window,
//! 4. deliver the typed outcome to the caller's [`Completion`].
//!
//! Each operation has a callback form and an `async` form.
//!
//! | Operation | Intent | Payload |
//! |---|---|---|
//! | [`bookmark`](FileAccessor::bookmark) | read, without changes, resolving symlinks | [`FileReference`] |
//! | [`read_file_info`](FileAccessor::read_file_info) | read (metadata only when cached info is acceptable) | [`FileInfo`] |
//! | [`read_reference`](FileAccessor::read_reference) | resolve, then as `read` | [`ByteBuffer`] |
//! | [`read`](FileAccessor::read) | read, for uploading | [`ByteBuffer`] |
//! | [`write`](FileAccessor::write) | write, for merging | none |
//! | [`read_then_write`](FileAccessor::read_then_write) | read + write, for merging | none |

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use tracing::{debug, instrument};

use crate::background::BackgroundQueues;
use crate::buffer::{ByteBuffer, LoadOptions};
use crate::completion::Completion;
use crate::config::AccessConfig;
use crate::coordinator::{
    AccessCoordinator, CoordinatedCall, CoordinationFacility, CoordinationIntent,
    CoordinationRequest, CoordinatorStats, GrantedPaths, LocalFacility, ReadOptions, WriteOptions,
};
use crate::deadline::Deadline;
use crate::error::{BodyError, FileAccessResult};
use crate::file_info::FileInfo;
use crate::provider::{FileProvider, LocationKind};
use crate::reference::FileReference;
use crate::scope::{ScopedAccess, SecurityScope, UnrestrictedScope};

static GLOBAL_ACCESSOR: LazyLock<FileAccessor> = LazyLock::new(|| {
    FileAccessor::builder()
        .queues(BackgroundQueues::global().clone())
        .build()
});

/// Builder for [`FileAccessor`].
#[derive(Default)]
pub struct FileAccessorBuilder {
    config: AccessConfig,
    queues: Option<BackgroundQueues>,
    facility: Option<Arc<dyn CoordinationFacility>>,
    scope: Option<Arc<dyn SecurityScope>>,
}

impl FileAccessorBuilder {
    /// Use `config`. Queue settings only apply if no queues are given.
    #[must_use]
    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    /// Use existing background queues.
    #[must_use]
    pub fn queues(mut self, queues: BackgroundQueues) -> Self {
        self.queues = Some(queues);
        self
    }

    /// Use a coordination facility other than [`LocalFacility`].
    #[must_use]
    pub fn facility(mut self, facility: Arc<dyn CoordinationFacility>) -> Self {
        self.facility = Some(facility);
        self
    }

    /// Use a security scope other than [`UnrestrictedScope`].
    #[must_use]
    pub fn scope(mut self, scope: Arc<dyn SecurityScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Build the accessor, starting fresh queues if none were given.
    pub fn build(self) -> FileAccessor {
        let queues = self
            .queues
            .unwrap_or_else(|| BackgroundQueues::new(&self.config));
        let facility = self
            .facility
            .unwrap_or_else(|| Arc::new(LocalFacility::new()));
        FileAccessor {
            inner: Arc::new(AccessorInner {
                coordinator: AccessCoordinator::new(facility, queues),
                scope: self.scope.unwrap_or_else(|| Arc::new(UnrestrictedScope)),
                config: self.config,
            }),
        }
    }
}

struct AccessorInner {
    coordinator: AccessCoordinator,
    scope: Arc<dyn SecurityScope>,
    config: AccessConfig,
}

/// Coordinated, deadline-bounded file access.
///
/// Cheap to clone; clones share queues, facility and statistics.
#[derive(Clone)]
pub struct FileAccessor {
    inner: Arc<AccessorInner>,
}

impl std::fmt::Debug for FileAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccessor")
            .field("coordinator", &self.inner.coordinator)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl FileAccessor {
    /// An accessor with its own queues and the default facility and scope.
    pub fn new(config: AccessConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Start building an accessor.
    pub fn builder() -> FileAccessorBuilder {
        FileAccessorBuilder::default()
    }

    /// The process-wide accessor, on the process-wide queues.
    pub fn global() -> &'static FileAccessor {
        &GLOBAL_ACCESSOR
    }

    /// Active configuration.
    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    /// The underlying coordinator.
    pub fn coordinator(&self) -> &AccessCoordinator {
        &self.inner.coordinator
    }

    /// The background queues.
    pub fn queues(&self) -> &BackgroundQueues {
        self.inner.coordinator.queues()
    }

    /// Call counters.
    pub fn stats(&self) -> &CoordinatorStats {
        self.inner.coordinator.stats()
    }

    fn begin_access(&self, path: &Path) -> ScopedAccess {
        ScopedAccess::begin(Arc::clone(&self.inner.scope), path)
    }

    fn load_options(&self, path: &Path, provider: Option<&FileProvider>) -> LoadOptions {
        let local = provider.map_or_else(|| FileProvider::detect(path).is_local(), FileProvider::is_local);
        LoadOptions {
            mode: self.inner.config.read_mode,
            local,
            mmap_threshold: self.inner.config.mmap_threshold,
        }
    }

    /// Create a [`FileReference`] to `path`.
    ///
    /// The path is resolved (symlinks included) inside a read window that
    /// does not ask other holders to save first.
    #[instrument(level = "debug", skip(self, path, completion), fields(path = %path.display()))]
    pub fn bookmark(
        &self,
        path: &Path,
        location: LocationKind,
        deadline: Deadline,
        completion: Completion<FileReference>,
    ) {
        let access = self.begin_access(path);
        let default_timeout = self.inner.config.default_resolution_timeout;
        let call = CoordinatedCall::new(
            CoordinationRequest::single(CoordinationIntent::read(
                path,
                ReadOptions::WITHOUT_CHANGES | ReadOptions::RESOLVES_SYMBOLIC_LINK,
            )),
            deadline,
        )
        .provider(timeout_provider(Some(FileProvider::detect(path))))
        .holding(access);

        self.inner.coordinator.coordinate(
            call,
            move |granted| {
                let path = granted_read(granted)?;
                fs::metadata(path).map_err(|err| with_context(&err, "Failed to bookmark", path))?;
                Ok(FileReference::from_path(path, location, default_timeout)?)
            },
            completion,
        );
    }

    /// Read metadata of the file at `path`.
    ///
    /// Unless `can_use_cache` is set, a small probe read runs first so that
    /// providers fetch the file and the metadata reflects current content.
    #[instrument(level = "debug", skip(self, path, completion), fields(path = %path.display()))]
    pub fn read_file_info(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        can_use_cache: bool,
        deadline: Deadline,
        completion: Completion<FileInfo>,
    ) {
        let access = self.begin_access(path);
        let options = if can_use_cache {
            ReadOptions::IMMEDIATELY_AVAILABLE_METADATA_ONLY
        } else {
            ReadOptions::empty()
        };
        let probe_size = self.inner.config.probe_size;
        let call = CoordinatedCall::new(
            CoordinationRequest::single(CoordinationIntent::read(path, options)),
            deadline,
        )
        .provider(timeout_provider(provider))
        .holding(access);

        self.inner.coordinator.coordinate(
            call,
            move |granted| {
                let path = granted_read(granted)?;
                if !can_use_cache && probe_size > 0 {
                    // Directories and special files have no content to probe.
                    if let Err(err) = ByteBuffer::read_prefix(path, probe_size) {
                        debug!(path = %path.display(), error = %err, "Probe read failed");
                    }
                }
                let metadata = fs::metadata(path)
                    .map_err(|err| with_context(&err, "Failed to read attributes of", path))?;
                Ok(FileInfo::from_metadata(path, &metadata))
            },
            completion,
        );
    }

    /// Re-read metadata through `reference` and cache it there.
    pub fn refresh_info(
        &self,
        reference: &FileReference,
        deadline: Deadline,
        completion: Completion<FileInfo>,
    ) {
        let accessor = self.clone();
        let target = reference.clone();
        let access = self.begin_access(reference.bookmarked_path());
        reference.resolve(
            deadline,
            self.coordinator(),
            Completion::new(move |resolved: FileAccessResult<PathBuf>| {
                // Resolution is over; the next step takes its own grant.
                drop(access);
                match resolved {
                    Ok(path) => {
                        let provider = target.provider().cloned();
                        let completion = completion.map(move |outcome: FileAccessResult<FileInfo>| {
                            if let Ok(info) = &outcome {
                                target.record_info(info);
                            }
                            outcome
                        });
                        accessor.read_file_info(&path, provider, false, deadline, completion);
                    }
                    Err(err) => completion.deliver(accessor.queues().operation(), Err(err)),
                }
            }),
        );
    }

    /// Read the whole file behind `reference`.
    ///
    /// The reference is resolved first; resolution and the read share
    /// `deadline`.
    pub fn read_reference(
        &self,
        reference: &FileReference,
        deadline: Deadline,
        completion: Completion<ByteBuffer>,
    ) {
        let accessor = self.clone();
        let provider = reference.provider().cloned();
        let access = self.begin_access(reference.bookmarked_path());
        reference.resolve(
            deadline,
            self.coordinator(),
            Completion::new(move |resolved: FileAccessResult<PathBuf>| {
                // Resolution is over; the next step takes its own grant.
                drop(access);
                match resolved {
                    Ok(path) => accessor.read(&path, provider, deadline, completion),
                    Err(err) => completion.deliver(accessor.queues().operation(), Err(err)),
                }
            }),
        );
    }

    /// Read the whole file at `path`.
    #[instrument(level = "debug", skip(self, path, completion), fields(path = %path.display()))]
    pub fn read(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
        completion: Completion<ByteBuffer>,
    ) {
        let access = self.begin_access(path);
        let load = self.load_options(path, provider.as_ref());
        let call = CoordinatedCall::new(
            CoordinationRequest::single(CoordinationIntent::read(path, ReadOptions::FOR_UPLOADING)),
            deadline,
        )
        .provider(timeout_provider(provider))
        .holding(access);

        self.inner.coordinator.coordinate(
            call,
            move |granted| {
                let path = granted_read(granted)?;
                let buffer = ByteBuffer::read_from(path, load)
                    .map_err(|err| with_context(&err, "Failed to read", path))?;
                Ok(buffer)
            },
            completion,
        );
    }

    /// Replace the content of the file at `path` with `buffer`.
    #[instrument(level = "debug", skip(self, buffer, path, completion), fields(path = %path.display(), bytes = buffer.len()))]
    pub fn write(
        &self,
        buffer: ByteBuffer,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
        completion: Completion<()>,
    ) {
        let access = self.begin_access(path);
        let call = CoordinatedCall::new(
            CoordinationRequest::single(CoordinationIntent::write(path, WriteOptions::FOR_MERGING)),
            deadline,
        )
        .provider(timeout_provider(provider))
        .holding(access);

        self.inner.coordinator.coordinate(
            call,
            move |granted| {
                let path = granted_write(granted)?;
                buffer
                    .write_to(path)
                    .map_err(|err| with_context(&err, "Failed to write", path))?;
                Ok(())
            },
            completion,
        );
    }

    /// Read the file at `path`, transform it, and write the result back,
    /// all inside one coordinated window.
    ///
    /// `transform` returning `Ok(None)` leaves the file untouched. An error
    /// from `transform` is reported as a system error and nothing is
    /// written.
    #[instrument(level = "debug", skip(self, path, transform, completion), fields(path = %path.display()))]
    pub fn read_then_write<F>(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
        transform: F,
        completion: Completion<()>,
    ) where
        F: FnOnce(ByteBuffer) -> Result<Option<ByteBuffer>, BodyError> + Send + 'static,
    {
        let access = self.begin_access(path);
        let load = self.load_options(path, provider.as_ref());
        let coordinator = self.inner.coordinator.clone();
        let call = CoordinatedCall::new(
            CoordinationRequest::read_then_write(path, ReadOptions::empty(), WriteOptions::FOR_MERGING),
            deadline,
        )
        .provider(timeout_provider(provider))
        .holding(access);

        self.inner.coordinator.coordinate(
            call,
            move |granted| {
                let read_path = granted_read(granted)?;
                let write_path = granted_write(granted)?;
                let current = ByteBuffer::read_from(read_path, load)
                    .map_err(|err| with_context(&err, "Failed to read", read_path))?;
                match transform(current)? {
                    Some(updated) => {
                        updated
                            .write_to(write_path)
                            .map_err(|err| with_context(&err, "Failed to write", write_path))?;
                    }
                    None => {
                        debug!(path = %write_path.display(), "Transform produced no changes; skipping write");
                        coordinator.stats().record_noop_merge();
                    }
                }
                Ok(())
            },
            completion,
        );
    }

    /// Async form of [`bookmark`](Self::bookmark).
    pub async fn bookmark_async(
        &self,
        path: &Path,
        location: LocationKind,
        deadline: Deadline,
    ) -> FileAccessResult<FileReference> {
        let (completion, outcome) = Completion::channel();
        self.bookmark(path, location, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`read_file_info`](Self::read_file_info).
    pub async fn read_file_info_async(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        can_use_cache: bool,
        deadline: Deadline,
    ) -> FileAccessResult<FileInfo> {
        let (completion, outcome) = Completion::channel();
        self.read_file_info(path, provider, can_use_cache, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`refresh_info`](Self::refresh_info).
    pub async fn refresh_info_async(
        &self,
        reference: &FileReference,
        deadline: Deadline,
    ) -> FileAccessResult<FileInfo> {
        let (completion, outcome) = Completion::channel();
        self.refresh_info(reference, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`read_reference`](Self::read_reference).
    pub async fn read_reference_async(
        &self,
        reference: &FileReference,
        deadline: Deadline,
    ) -> FileAccessResult<ByteBuffer> {
        let (completion, outcome) = Completion::channel();
        self.read_reference(reference, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`read`](Self::read).
    pub async fn read_async(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
    ) -> FileAccessResult<ByteBuffer> {
        let (completion, outcome) = Completion::channel();
        self.read(path, provider, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`write`](Self::write).
    pub async fn write_async(
        &self,
        buffer: ByteBuffer,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
    ) -> FileAccessResult<()> {
        let (completion, outcome) = Completion::channel();
        self.write(buffer, path, provider, deadline, completion);
        outcome.recv().await
    }

    /// Async form of [`read_then_write`](Self::read_then_write).
    pub async fn read_then_write_async<F>(
        &self,
        path: &Path,
        provider: Option<FileProvider>,
        deadline: Deadline,
        transform: F,
    ) -> FileAccessResult<()>
    where
        F: FnOnce(ByteBuffer) -> Result<Option<ByteBuffer>, BodyError> + Send + 'static,
    {
        let (completion, outcome) = Completion::channel();
        self.read_then_write(path, provider, deadline, transform, completion);
        outcome.recv().await
    }
}

/// Provider to name in a timeout: the caller's hint, ignoring local storage.
///
/// Without a hint a raw path names no provider.
fn timeout_provider(hint: Option<FileProvider>) -> Option<FileProvider> {
    hint.filter(|provider| !provider.is_local())
}

fn granted_read(granted: &GrantedPaths) -> Result<&Path, BodyError> {
    granted
        .reading()
        .ok_or_else(|| "coordination granted no read path".into())
}

fn granted_write(granted: &GrantedPaths) -> Result<&Path, BodyError> {
    granted
        .writing()
        .ok_or_else(|| "coordination granted no write path".into())
}

fn with_context(err: &io::Error, action: &str, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{action} {}: {err}", path.display()))
}
