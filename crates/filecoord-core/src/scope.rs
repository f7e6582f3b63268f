//! Security-scoped access grants.
//!
//! Some file locations (files picked by the user from outside the app's own
//! storage) may only be touched between a "begin access" and an "end access"
//! call. [`ScopedAccess`] pairs the two: it begins access when created and
//! ends it exactly once when dropped, on every exit path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

/// Platform hook for security-scoped resources.
pub trait SecurityScope: Send + Sync {
    /// Begin accessing `path`.
    ///
    /// Returns whether a grant was actually needed and obtained.
    fn begin_access(&self, path: &Path) -> bool;

    /// End accessing `path`.
    ///
    /// Must be safe to call even if `begin_access` returned false.
    fn end_access(&self, path: &Path);
}

/// Scope for platforms without sandboxed file access.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrestrictedScope;

impl SecurityScope for UnrestrictedScope {
    fn begin_access(&self, _path: &Path) -> bool {
        false
    }

    fn end_access(&self, _path: &Path) {}
}

/// An active access grant; ends access when dropped.
pub struct ScopedAccess {
    scope: Arc<dyn SecurityScope>,
    path: PathBuf,
    granted: bool,
}

impl ScopedAccess {
    /// Begin access to `path` through `scope`.
    pub fn begin(scope: Arc<dyn SecurityScope>, path: &Path) -> Self {
        let granted = scope.begin_access(path);
        trace!(path = %path.display(), granted, "Began scoped access");
        Self {
            scope,
            path: path.to_path_buf(),
            granted,
        }
    }

    /// Whether the scope reported that a grant was obtained.
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// The path this grant covers.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedAccess {
    fn drop(&mut self) {
        self.scope.end_access(&self.path);
        trace!(path = %self.path.display(), "Ended scoped access");
    }
}

impl fmt::Debug for ScopedAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedAccess")
            .field("path", &self.path)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}
