//! File metadata snapshots.

use std::fs::Metadata;
use std::path::{Component, Path};
use std::time::SystemTime;

/// Metadata of a file as observed inside a granted coordination window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Last path component.
    pub file_name: String,
    /// Size in bytes, if the entry is a regular file.
    pub file_size: Option<u64>,
    /// Creation time, where the platform records one.
    pub creation_date: Option<SystemTime>,
    /// Last modification time.
    pub modification_date: Option<SystemTime>,
    /// Whether the file sits in a trash folder.
    pub is_in_trash: bool,
    /// Whether the file name is hidden (dot-prefixed).
    pub is_hidden: bool,
}

impl FileInfo {
    /// Build a snapshot from a path and its metadata.
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            is_hidden: file_name.starts_with('.'),
            file_name,
            file_size: metadata.is_file().then(|| metadata.len()),
            creation_date: metadata.created().ok(),
            modification_date: metadata.modified().ok(),
            is_in_trash: is_in_trash(path),
        }
    }
}

fn is_in_trash(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name == ".Trash" || name.starts_with(".Trash-") || name == ".Trashes"
        }
        _ => false,
    })
}
