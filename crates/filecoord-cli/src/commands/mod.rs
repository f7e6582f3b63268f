pub mod append;
pub mod bookmark;
pub mod cat;
pub mod info;
pub mod open;
pub mod write;

use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};

use filecoord_core::FileProvider;

/// Provider hint for a path given on the command line.
///
/// Local storage is passed through; the accessor leaves it out of timeouts.
pub fn provider_hint(path: &Path) -> Option<FileProvider> {
    Some(FileProvider::detect(path))
}

/// Read all of stdin.
pub fn read_stdin() -> Result<Vec<u8>> {
    let mut content = Vec::new();
    io::stdin()
        .read_to_end(&mut content)
        .context("Failed to read stdin")?;
    Ok(content)
}
