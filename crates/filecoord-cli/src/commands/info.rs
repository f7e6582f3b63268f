//! Info command - show file metadata.
//!
//! # Examples
//!
//! ```bash
//! # Fetch the file from its provider first, then stat it
//! filecoord info ~/Dropbox/db.kdbx
//!
//! # Accept whatever metadata the provider has cached
//! filecoord info ~/Dropbox/db.kdbx --cached
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use filecoord_core::FileProvider;

use super::provider_hint;
use crate::Session;
use crate::output::{create_table, format_size, format_time};

#[derive(ClapArgs)]
pub struct Args {
    /// File to inspect
    pub path: PathBuf,

    /// Accept cached metadata instead of fetching the file first
    #[arg(long)]
    pub cached: bool,
}

#[instrument(level = "info", name = "cmd::info", skip_all, fields(path = %args.path.display()))]
pub async fn execute(session: &Session, args: &Args) -> Result<()> {
    let info = session
        .accessor
        .read_file_info_async(
            &args.path,
            provider_hint(&args.path),
            args.cached,
            session.deadline(),
        )
        .await
        .with_context(|| format!("Failed to read info for {}", args.path.display()))?;

    let mut table = create_table();
    table.set_header(vec!["Property", "Value"]);
    table.add_row(vec!["Name", info.file_name.as_str()]);
    table.add_row(vec![
        "Provider",
        FileProvider::detect(&args.path).display_name(),
    ]);
    table.add_row(vec![
        "Size".to_string(),
        info.file_size.map_or_else(|| "-".to_string(), format_size),
    ]);
    table.add_row(vec!["Created".to_string(), format_time(info.creation_date)]);
    table.add_row(vec!["Modified".to_string(), format_time(info.modification_date)]);
    table.add_row(vec!["Hidden", if info.is_hidden { "yes" } else { "no" }]);
    table.add_row(vec!["In Trash", if info.is_in_trash { "yes" } else { "no" }]);
    println!("{table}");

    Ok(())
}
