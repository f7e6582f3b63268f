//! Write command - replace a file's contents with stdin.
//!
//! The new contents land atomically: concurrent readers see either the old
//! file or the new one.
//!
//! # Examples
//!
//! ```bash
//! echo "hello" | filecoord write ~/notes.txt
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use filecoord_core::ByteBuffer;

use super::{provider_hint, read_stdin};
use crate::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File to write
    pub path: PathBuf,
}

#[instrument(level = "info", name = "cmd::write", skip_all, fields(path = %args.path.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let content = read_stdin()?;
    session
        .accessor
        .write_async(
            ByteBuffer::from(content),
            &args.path,
            provider_hint(&args.path),
            session.deadline(),
        )
        .await
        .with_context(|| format!("Failed to write {}", args.path.display()))
}
