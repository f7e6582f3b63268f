#![deny(unsafe_code)]

mod commands;
mod exit_code;
mod output;

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use filecoord_core::{AccessConfig, DEFAULT_MAX_CONCURRENCY, Deadline, FileAccessError, FileAccessor};

use crate::commands::{append, bookmark, cat, info, open, write};

/// Coordinated, deadline-bounded access to database files
#[derive(Parser)]
#[command(name = "filecoord")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Print a file, giving a slow cloud provider 30 seconds
    filecoord --timeout 30 cat ~/Dropbox/db.kdbx

    # Save a reference and read through it later
    filecoord bookmark ~/db.kdbx --output db.ref.json
    filecoord open db.ref.json

    # Append stdin inside one coordinated read-then-write
    echo \"entry\" | filecoord append ~/log.txt
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Seconds each operation may take before it times out
    #[arg(long, env = "FILECOORD_TIMEOUT", value_name = "SECS", default_value = "15", value_parser = parse_timeout, global = true)]
    timeout: Duration,

    /// Concurrent operations per background queue
    #[arg(long, env = "FILECOORD_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY, global = true)]
    concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a file reference and print or save it as JSON
    Bookmark(bookmark::Args),

    /// Show file metadata
    Info(info::Args),

    /// Write file contents to stdout
    Cat(cat::Args),

    /// Replace file contents with stdin
    Write(write::Args),

    /// Append stdin to a file in one coordinated read-then-write
    Append(append::Args),

    /// Read the file behind a saved reference
    Open(open::Args),
}

/// Accessor and per-operation timeout shared by every command.
pub struct Session {
    pub accessor: FileAccessor,
    timeout: Duration,
}

impl Session {
    /// A fresh deadline for the next operation.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                exit_code::USAGE_ERROR
            } else {
                exit_code::SUCCESS
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }
    let quiet = cli.quiet;

    match run(cli).await {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            if !quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(categorize_error(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let session = Session {
        accessor: FileAccessor::new(AccessConfig::default().max_concurrency(cli.concurrency)),
        timeout: cli.timeout,
    };

    match cli.command {
        Commands::Bookmark(args) => bookmark::execute(&session, &args).await,
        Commands::Info(args) => info::execute(&session, &args).await,
        Commands::Cat(args) => cat::execute(&session, &args).await,
        Commands::Write(args) => write::execute(&session, &args).await,
        Commands::Append(args) => append::execute(&session, &args).await,
        Commands::Open(args) => open::execute(&session, &args).await,
    }
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout '{value}': {e}"))
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(access_err) = cause.downcast_ref::<FileAccessError>() {
            if access_err.is_timeout() {
                return exit_code::TIMED_OUT;
            }
            if let Some(code) = access_err.io_kind().and_then(code_for_kind) {
                return code;
            }
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && let Some(code) = code_for_kind(io_err.kind())
        {
            return code;
        }
    }

    exit_code::GENERAL_ERROR
}

fn code_for_kind(kind: io::ErrorKind) -> Option<u8> {
    match kind {
        io::ErrorKind::NotFound => Some(exit_code::NOT_FOUND),
        io::ErrorKind::PermissionDenied => Some(exit_code::PERMISSION_DENIED),
        io::ErrorKind::TimedOut => Some(exit_code::TIMED_OUT),
        _ => None,
    }
}
