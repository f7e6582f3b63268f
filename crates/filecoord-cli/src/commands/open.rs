//! Open command - read the file behind a saved reference.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{debug, instrument};

use filecoord_core::FileReference;

use crate::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// Reference JSON written by `filecoord bookmark --output`
    pub reference: PathBuf,
}

#[instrument(level = "info", name = "cmd::open", skip_all, fields(reference = %args.reference.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let json = fs::read_to_string(&args.reference)
        .with_context(|| format!("Failed to read reference {}", args.reference.display()))?;
    let reference: FileReference = serde_json::from_str(&json)
        .with_context(|| format!("Invalid reference {}", args.reference.display()))?;

    let content = session
        .accessor
        .read_reference_async(&reference, session.deadline())
        .await
        .with_context(|| format!("Failed to open {}", reference.display_name()))?;
    debug!(resolved = ?reference.resolved_path(), bytes = content.len(), "Opened reference");

    io::stdout().write_all(content.as_slice())?;
    Ok(())
}
