//! Coordination intents.
//!
//! An intent names one file path and whether the caller wants to read or
//! write it, plus qualifiers that tell the facility (and the provider behind
//! it) how to prepare the file.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Qualifiers for a read intent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadOptions: u32 {
        /// Do not ask other holders to save pending changes first.
        const WITHOUT_CHANGES = 1;
        /// Resolve symbolic links before granting; the granted path is the target.
        const RESOLVES_SYMBOLIC_LINK = 1 << 1;
        /// Only metadata will be read; the provider need not fetch content.
        const IMMEDIATELY_AVAILABLE_METADATA_ONLY = 1 << 2;
        /// The content is being read to upload or copy elsewhere; the
        /// provider may stage a fresh copy.
        const FOR_UPLOADING = 1 << 3;
    }
}

bitflags! {
    /// Qualifiers for a write intent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteOptions: u32 {
        /// The file is being deleted.
        const FOR_DELETING = 1;
        /// The file is being moved.
        const FOR_MOVING = 1 << 1;
        /// The write merges with existing content; providers that reconcile
        /// concurrent edits may do so.
        const FOR_MERGING = 1 << 2;
        /// The file is being replaced wholesale.
        const FOR_REPLACING = 1 << 3;
        /// Only metadata changes.
        const CONTENT_INDEPENDENT_METADATA_ONLY = 1 << 4;
    }
}

/// Read or write, with qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    /// Shared access.
    Read(ReadOptions),
    /// Exclusive access.
    Write(WriteOptions),
}

impl IntentKind {
    /// Returns true for write intents.
    pub fn is_write(self) -> bool {
        matches!(self, IntentKind::Write(_))
    }
}

/// A request to access one file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoordinationIntent {
    path: PathBuf,
    kind: IntentKind,
}

impl CoordinationIntent {
    /// A read intent on `path`.
    pub fn read(path: impl Into<PathBuf>, options: ReadOptions) -> Self {
        Self {
            path: path.into(),
            kind: IntentKind::Read(options),
        }
    }

    /// A write intent on `path`.
    pub fn write(path: impl Into<PathBuf>, options: WriteOptions) -> Self {
        Self {
            path: path.into(),
            kind: IntentKind::Write(options),
        }
    }

    /// The requested path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read or write, with qualifiers.
    pub fn kind(&self) -> IntentKind {
        self.kind
    }

    /// Returns true for write intents.
    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    /// Returns true if the granted path should have symlinks resolved.
    pub fn resolves_symlinks(&self) -> bool {
        matches!(self.kind, IntentKind::Read(options) if options.contains(ReadOptions::RESOLVES_SYMBOLIC_LINK))
    }
}
