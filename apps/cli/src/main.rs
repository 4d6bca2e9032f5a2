//! DocVault CLI: incremental documentation builds for Python projects.
//!
//! Renders a source tree into an Obsidian-style vault of Markdown notes,
//! rebuilding only what changed since the last run.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    let code = commands::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
