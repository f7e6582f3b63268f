//! File references.
//!
//! A [`FileReference`] is a stable handle to a file location. It carries an
//! opaque bookmark (base64 of a small JSON payload naming the path and the
//! provider), the [`LocationKind`] the file was found through, and state
//! refreshed by resolution: the last display name, the last error, and the
//! last [`FileInfo`] read through it.
//!
//! Identity is the bookmark plus the location. Resolution may land on a
//! different concrete path from one call to the next, and the cached state
//! changes, but two handles to the same bookmark always compare equal.

use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::config::DEFAULT_RESOLUTION_TIMEOUT;
use crate::coordinator::AccessCoordinator;
use crate::deadline::Deadline;
use crate::error::{FileAccessError, FileAccessResult};
use crate::file_info::FileInfo;
use crate::provider::{FileProvider, LocationKind};

/// Error decoding or encoding bookmark data.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("bookmark data is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("bookmark data is malformed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct BookmarkPayload {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<FileProvider>,
}

/// On-disk form of a reference.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredReference {
    bookmark: String,
    location: LocationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default = "default_timeout_ms")]
    resolution_timeout_ms: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn default_timeout_ms() -> u64 {
    DEFAULT_RESOLUTION_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Default)]
struct ReferenceState {
    display_name: String,
    resolved_path: Option<PathBuf>,
    error: Option<FileAccessError>,
    cached_info: Option<FileInfo>,
}

struct ReferenceInner {
    bookmark: String,
    path: PathBuf,
    location: LocationKind,
    provider: Option<FileProvider>,
    default_timeout: Duration,
    state: Mutex<ReferenceState>,
}

/// Stable, revalidatable handle to a file location.
///
/// Cheap to clone; clones share cached state.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "StoredReference", try_from = "StoredReference")]
pub struct FileReference {
    inner: Arc<ReferenceInner>,
}

impl FileReference {
    /// Create a reference to `path`.
    ///
    /// The provider is detected from the path. Local storage is recorded as
    /// no provider, so timeouts on local files name none.
    pub fn from_path(
        path: &Path,
        location: LocationKind,
        default_timeout: Duration,
    ) -> Result<Self, ReferenceError> {
        let provider = Some(FileProvider::detect(path)).filter(|provider| !provider.is_local());
        let payload = BookmarkPayload {
            path: path
                .to_str()
                .ok_or_else(|| ReferenceError::NonUtf8Path(path.to_path_buf()))?
                .to_string(),
            provider: provider.clone(),
        };
        let bookmark = STANDARD.encode(serde_json::to_vec(&payload)?);
        Ok(Self::assemble(
            bookmark,
            PathBuf::from(payload.path),
            location,
            provider,
            default_timeout,
            None,
        ))
    }

    /// Rebuild a reference from bookmark data produced by
    /// [`bookmark_data`](Self::bookmark_data).
    pub fn from_bookmark(bookmark: &str, location: LocationKind) -> Result<Self, ReferenceError> {
        Self::decode(bookmark, location, DEFAULT_RESOLUTION_TIMEOUT, None)
    }

    fn decode(
        bookmark: &str,
        location: LocationKind,
        default_timeout: Duration,
        display_name: Option<String>,
    ) -> Result<Self, ReferenceError> {
        let payload: BookmarkPayload = serde_json::from_slice(&STANDARD.decode(bookmark)?)?;
        Ok(Self::assemble(
            bookmark.to_string(),
            PathBuf::from(payload.path),
            location,
            payload.provider,
            default_timeout,
            display_name,
        ))
    }

    fn assemble(
        bookmark: String,
        path: PathBuf,
        location: LocationKind,
        provider: Option<FileProvider>,
        default_timeout: Duration,
        display_name: Option<String>,
    ) -> Self {
        let display_name = display_name.unwrap_or_else(|| file_name(&path));
        Self {
            inner: Arc::new(ReferenceInner {
                bookmark,
                path,
                location,
                provider,
                default_timeout,
                state: Mutex::new(ReferenceState {
                    display_name,
                    ..ReferenceState::default()
                }),
            }),
        }
    }

    /// Opaque bookmark data.
    pub fn bookmark_data(&self) -> &str {
        &self.inner.bookmark
    }

    /// How the file became known.
    pub fn location(&self) -> LocationKind {
        self.inner.location
    }

    /// Non-local provider hosting the file, if any.
    pub fn provider(&self) -> Option<&FileProvider> {
        self.inner.provider.as_ref()
    }

    /// Path recorded when the reference was created.
    pub fn bookmarked_path(&self) -> &Path {
        &self.inner.path
    }

    /// Timeout used when callers give no deadline.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// A deadline [`default_timeout`](Self::default_timeout) from now.
    pub fn default_deadline(&self) -> Deadline {
        Deadline::after(self.inner.default_timeout)
    }

    /// Last known display name.
    pub fn display_name(&self) -> String {
        self.inner.state.lock().display_name.clone()
    }

    /// Path the last successful resolution produced.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.inner.state.lock().resolved_path.clone()
    }

    /// Error from the last resolution, cleared by a successful one.
    pub fn error(&self) -> Option<FileAccessError> {
        self.inner.state.lock().error.clone()
    }

    /// Returns true if the last resolution failed.
    pub fn has_error(&self) -> bool {
        self.inner.state.lock().error.is_some()
    }

    /// Metadata from the last info refresh through this reference.
    pub fn cached_info(&self) -> Option<FileInfo> {
        self.inner.state.lock().cached_info.clone()
    }

    /// Resolve to a concrete path before `deadline`.
    ///
    /// The resolution runs on the operation queue and is bounded by the
    /// deadline; a timeout names the reference's provider. The outcome is
    /// recorded in the reference before `completion` sees it.
    pub fn resolve(
        &self,
        deadline: Deadline,
        coordinator: &AccessCoordinator,
        completion: Completion<PathBuf>,
    ) {
        let path = self.inner.path.clone();
        let reference = self.clone();
        let completion = completion.map(move |outcome: FileAccessResult<PathBuf>| {
            reference.record_resolution(&outcome);
            outcome
        });
        coordinator.run_with_deadline(
            deadline,
            self.inner.provider.clone(),
            move || resolve_path(&path),
            completion,
        );
    }

    pub(crate) fn record_resolution(&self, outcome: &FileAccessResult<PathBuf>) {
        let mut state = self.inner.state.lock();
        match outcome {
            Ok(path) => {
                state.display_name = file_name(path);
                state.resolved_path = Some(path.clone());
                state.error = None;
            }
            Err(err) => {
                warn!(path = %self.inner.path.display(), error = %err, "Failed to resolve file reference");
                state.error = Some(err.clone());
            }
        }
    }

    pub(crate) fn record_info(&self, info: &FileInfo) {
        self.inner.state.lock().cached_info = Some(info.clone());
    }
}

fn resolve_path(path: &Path) -> FileAccessResult<PathBuf> {
    match fs::metadata(path) {
        Ok(_) => {
            debug!(path = %path.display(), "Resolved file reference");
            Ok(path.to_path_buf())
        }
        Err(err) => Err(FileAccessError::io(
            &format!("Failed to resolve {}", path.display()),
            &err,
        )),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl PartialEq for FileReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.bookmark == other.inner.bookmark && self.inner.location == other.inner.location
    }
}

impl Eq for FileReference {}

impl Hash for FileReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.bookmark.hash(state);
        self.inner.location.hash(state);
    }
}

impl fmt::Debug for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReference")
            .field("path", &self.inner.path)
            .field("location", &self.inner.location)
            .field("provider", &self.inner.provider)
            .field("has_error", &self.has_error())
            .finish_non_exhaustive()
    }
}

impl From<FileReference> for StoredReference {
    fn from(reference: FileReference) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let resolution_timeout_ms = reference.inner.default_timeout.as_millis() as u64;
        StoredReference {
            bookmark: reference.inner.bookmark.clone(),
            location: reference.inner.location,
            display_name: Some(reference.display_name()),
            resolution_timeout_ms,
        }
    }
}

impl TryFrom<StoredReference> for FileReference {
    type Error = ReferenceError;

    fn try_from(stored: StoredReference) -> Result<Self, Self::Error> {
        Self::decode(
            &stored.bookmark,
            stored.location,
            Duration::from_millis(stored.resolution_timeout_ms),
            stored.display_name,
        )
    }
}
