//! Error taxonomy for coordinated file access.
//!
//! Every operation in this crate produces a [`FileAccessResult`]. Failures
//! are either a [`FileAccessError::System`] error (I/O, provider or
//! coordination failure, carrying a human-readable message) or a
//! [`FileAccessError::Timeout`], which names the storage provider when one
//! is known so the caller can show provider-specific guidance.

use std::io;

use thiserror::Error;

use crate::provider::FileProvider;

/// Error type produced by operation bodies and read-then-write transforms.
///
/// Anything returned through this type is reported to the caller as a
/// [`FileAccessError::System`] carrying the original message.
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// A failed file access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileAccessError {
    /// Underlying I/O, coordination or provider failure.
    #[error("{message}")]
    System {
        /// Human-readable description (the original error message).
        message: String,
        /// I/O error kind, when the failure originated from an `io::Error`.
        kind: Option<io::ErrorKind>,
    },

    /// The deadline elapsed before access was granted or the reference resolved.
    #[error("{}", timeout_message(provider.as_ref()))]
    Timeout {
        /// Storage provider implicated in the timeout, if known.
        provider: Option<FileProvider>,
    },
}

fn timeout_message(provider: Option<&FileProvider>) -> String {
    match provider {
        Some(provider) => format!("{} is not responding", provider.display_name()),
        None => "file access timed out".to_string(),
    }
}

impl FileAccessError {
    /// Creates a system error with the given message.
    pub fn system(message: impl Into<String>) -> Self {
        FileAccessError::System {
            message: message.into(),
            kind: None,
        }
    }

    /// Creates a timeout error naming the given provider.
    pub fn timeout(provider: Option<FileProvider>) -> Self {
        FileAccessError::Timeout { provider }
    }

    /// Wraps an I/O error, prefixing its message with `context`.
    pub fn io(context: &str, err: &io::Error) -> Self {
        FileAccessError::System {
            message: format!("{context}: {err}"),
            kind: Some(err.kind()),
        }
    }

    /// Wraps an error returned by an operation body.
    ///
    /// I/O errors keep their kind; everything else keeps its message only.
    pub fn from_body(err: &BodyError) -> Self {
        let kind = err.downcast_ref::<io::Error>().map(io::Error::kind);
        FileAccessError::System {
            message: err.to_string(),
            kind,
        }
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FileAccessError::Timeout { .. })
    }

    /// The provider named by a timeout, if any.
    pub fn provider(&self) -> Option<&FileProvider> {
        match self {
            FileAccessError::Timeout { provider } => provider.as_ref(),
            FileAccessError::System { .. } => None,
        }
    }

    /// The I/O error kind behind a system error, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            FileAccessError::System { kind, .. } => *kind,
            FileAccessError::Timeout { .. } => Some(io::ErrorKind::TimedOut),
        }
    }
}

impl From<io::Error> for FileAccessError {
    fn from(err: io::Error) -> Self {
        FileAccessError::System {
            message: err.to_string(),
            kind: Some(err.kind()),
        }
    }
}

/// Result type for file access operations.
pub type FileAccessResult<T> = Result<T, FileAccessError>;
