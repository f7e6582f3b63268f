//! Bookmark command - create a persistent file reference.
//!
//! # Examples
//!
//! ```bash
//! # Print the reference
//! filecoord bookmark ~/db.kdbx
//!
//! # Save it for `filecoord open`
//! filecoord bookmark ~/Dropbox/db.kdbx --location remote --output db.ref.json
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use filecoord_core::LocationKind;

use crate::Session;

#[derive(ClapArgs)]
pub struct Args {
    /// File to reference
    pub path: PathBuf,

    /// Location kind: local, internal-backup, internal-inbox, external, remote
    #[arg(long, default_value = "external")]
    pub location: LocationKind,

    /// Save the reference to FILE instead of printing it
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::bookmark", skip_all, fields(path = %args.path.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let reference = session
        .accessor
        .bookmark_async(&args.path, args.location, session.deadline())
        .await
        .with_context(|| format!("Failed to bookmark {}", args.path.display()))?;
    let json = serde_json::to_string_pretty(&reference)?;

    match &args.output {
        Some(output) => {
            fs::write(output, json)
                .with_context(|| format!("Failed to save reference to {}", output.display()))?;
            info!(output = %output.display(), name = %reference.display_name(), "Saved reference");
        }
        None => println!("{json}"),
    }
    Ok(())
}
