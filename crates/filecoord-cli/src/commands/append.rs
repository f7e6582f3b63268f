//! Append command - add stdin to the end of a file.
//!
//! The read and the write happen inside one coordinated window. The default
//! facility arbitrates within a single process only, so it keeps concurrent
//! appends made through one accessor from losing each other's data, but two
//! `filecoord append` processes on the same file are not excluded from each
//! other. Empty input leaves the file untouched.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use filecoord_core::ByteBuffer;

use super::{provider_hint, read_stdin};
use crate::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File to append to
    pub path: PathBuf,
}

#[instrument(level = "info", name = "cmd::append", skip_all, fields(path = %args.path.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let addition = read_stdin()?;
    if addition.is_empty() {
        info!("Nothing to append");
    }

    session
        .accessor
        .read_then_write_async(
            &args.path,
            provider_hint(&args.path),
            session.deadline(),
            move |current| {
                if addition.is_empty() {
                    return Ok(None);
                }
                let mut updated = current.to_vec();
                updated.extend_from_slice(&addition);
                Ok(Some(ByteBuffer::from(updated)))
            },
        )
        .await
        .with_context(|| format!("Failed to append to {}", args.path.display()))
}
