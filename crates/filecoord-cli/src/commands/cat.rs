use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use super::provider_hint;
use crate::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File to read
    pub path: PathBuf,
}

#[instrument(level = "info", name = "cmd::cat", skip_all, fields(path = %args.path.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let content = session
        .accessor
        .read_async(&args.path, provider_hint(&args.path), session.deadline())
        .await
        .with_context(|| format!("Failed to read {}", args.path.display()))?;
    io::stdout().write_all(content.as_slice())?;
    Ok(())
}
