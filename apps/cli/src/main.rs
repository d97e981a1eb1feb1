//! Worldforge CLI: ingest tabletop rulebooks into structured records and worlds.
//!
//! Files and URLs go through upload, AI extraction and persistence as one
//! batch; the rulebooks that make it are grouped into a world.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
