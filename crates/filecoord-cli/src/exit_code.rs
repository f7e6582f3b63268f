//! Exit codes for the CLI.
//!
//! Scripts wrapping `filecoord` can tell a slow provider apart from a
//! missing or unreadable file without parsing stderr.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Command-line usage error (bad arguments)
pub const USAGE_ERROR: u8 = 2;

/// The deadline passed before the file became available
pub const TIMED_OUT: u8 = 3;

/// File or reference target not found
pub const NOT_FOUND: u8 = 4;

/// Permission denied by the filesystem or provider
pub const PERMISSION_DENIED: u8 = 5;
