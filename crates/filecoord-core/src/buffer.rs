//! Byte buffers exchanged between the access layer and its callers.
//!
//! A [`ByteBuffer`] is the unit of file content: reads produce one, writes
//! consume one. It is backed by [`bytes::Bytes`], so it is cheap to clone
//! and safe to hand across threads, and it is never mutated after creation.
//!
//! # Read modes
//!
//! Database files can be large, and reading them through the page cache only
//! to copy them into a private buffer doubles memory use. [`ReadMode`]
//! selects how [`ByteBuffer::read_from`] loads a file:
//!
//! - [`ReadMode::Buffered`] - plain read into an owned buffer
//! - [`ReadMode::Uncached`] - owned buffer, OS advised to drop cached pages
//! - [`ReadMode::MappedIfSafe`] - memory-map large local files, otherwise
//!   fall back to `Uncached`

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Files at or above this size are memory-mapped in [`ReadMode::MappedIfSafe`].
pub const DEFAULT_MMAP_THRESHOLD: u64 = 1024 * 1024;

/// How file content is loaded into a [`ByteBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Ordinary buffered read.
    Buffered,
    /// Read while advising the OS not to keep the file cached.
    Uncached,
    /// Memory-map files that are safe to map; otherwise read uncached.
    #[default]
    MappedIfSafe,
}

/// Options for [`ByteBuffer::read_from`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Requested read mode.
    pub mode: ReadMode,
    /// Whether the file is served by a local provider. Only local files are
    /// ever mapped.
    pub local: bool,
    /// Minimum file size for mapping.
    pub mmap_threshold: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            mode: ReadMode::default(),
            local: true,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }
}

/// Immutable, shareable file content.
#[derive(Clone, PartialEq, Eq, Default, Hash)]
pub struct ByteBuffer(Bytes);

impl ByteBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self(Bytes::new())
    }

    /// Number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the content.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Consume the buffer, returning the underlying `Bytes`.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Copy the content into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Read the whole file at `path`.
    pub fn read_from(path: &Path, options: LoadOptions) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let mode = match options.mode {
            ReadMode::MappedIfSafe if options.local && len > 0 && len >= options.mmap_threshold => {
                return map_file(&file, path, len);
            }
            ReadMode::MappedIfSafe => ReadMode::Uncached,
            other => other,
        };

        if mode == ReadMode::Uncached {
            disable_caching(&file);
        }
        let content = read_all(file, len)?;
        if mode == ReadMode::Uncached {
            drop_cached_pages(path);
        }
        trace!(path = %path.display(), bytes = content.len(), ?mode, "Read file");
        Ok(Self(Bytes::from(content)))
    }

    /// Read at most `limit` bytes from the start of the file at `path`.
    ///
    /// Used as a cheap probe that forces providers to materialize a file.
    pub fn read_prefix(path: &Path, limit: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut content = Vec::with_capacity(limit);
        file.take(limit as u64).read_to_end(&mut content)?;
        Ok(Self(Bytes::from(content)))
    }

    /// Replace the file at `path` with this buffer's content.
    ///
    /// The content goes to a temporary file in the destination directory,
    /// which is synced and then renamed over `path`. Readers never observe a
    /// partially written file.
    ///
    /// A symbolic link at `path` is followed: the link stays in place and its
    /// target is replaced. An existing file keeps its permissions; a new one
    /// is readable by its owner only.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let target = match fs::canonicalize(path) {
            Ok(target) => target,
            Err(err) if err.kind() == io::ErrorKind::NotFound => path.to_path_buf(),
            Err(err) => return Err(err),
        };
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        match fs::metadata(&target) {
            Ok(existing) => tmp.as_file().set_permissions(existing.permissions())?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        tmp.write_all(&self.0)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        debug!(path = %target.display(), bytes = self.0.len(), "Wrote file");
        Ok(())
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.0.len())
            .finish()
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(content: Vec<u8>) -> Self {
        Self(Bytes::from(content))
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(content: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(content))
    }
}

impl From<&'static str> for ByteBuffer {
    fn from(content: &'static str) -> Self {
        Self(Bytes::from_static(content.as_bytes()))
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(content: Bytes) -> Self {
        Self(content)
    }
}

fn read_all(mut file: File, len_hint: u64) -> io::Result<Vec<u8>> {
    let capacity = usize::try_from(len_hint).unwrap_or(0);
    let mut content = Vec::with_capacity(capacity);
    file.read_to_end(&mut content)?;
    Ok(content)
}

fn map_file(file: &File, path: &Path, len: u64) -> io::Result<ByteBuffer> {
    // SAFETY: only local files are mapped, and all writes through this crate
    // replace files by rename, so the mapped inode is never truncated by us.
    #[allow(unsafe_code)]
    let map = unsafe { memmap2::Mmap::map(file)? };
    debug!(path = %path.display(), bytes = len, "Mapped file");
    Ok(ByteBuffer(Bytes::from_owner(map)))
}

#[cfg(target_os = "macos")]
fn disable_caching(file: &File) {
    use std::os::fd::AsRawFd;
    // SAFETY: fcntl on a valid, open descriptor.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if rc == -1 {
        trace!(error = %io::Error::last_os_error(), "F_NOCACHE failed");
    }
}

#[cfg(not(target_os = "macos"))]
fn disable_caching(_file: &File) {}

#[cfg(target_os = "linux")]
fn drop_cached_pages(path: &Path) {
    use std::os::fd::AsRawFd;
    let Ok(file) = File::open(path) else {
        return;
    };
    // SAFETY: posix_fadvise on a valid, open descriptor.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        trace!(errno = rc, "posix_fadvise(DONTNEED) failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn drop_cached_pages(_path: &Path) {}
