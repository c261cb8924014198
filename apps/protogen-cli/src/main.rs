//! protogen CLI binary entry point.
//!
//! Parses command-line arguments with clap, initializes the tracing
//! subscriber, and dispatches to the selected subcommand via [`Cli::run`].

mod cli;
mod logging;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Clean old logs (best-effort, before tracing is initialized).
    if let Some(dir) = cli.log_dir.as_deref() {
        logging::cleanup_old_logs(dir);
    }

    let _guard = logging::init_tracing(cli.log_dir.as_deref())?;

    cli.run().await
}
