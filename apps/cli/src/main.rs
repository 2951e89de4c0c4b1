//! seoscope CLI: administration for the site audit result cache.
//!
//! Inspects, clears, and invalidates cached analyses, computes URL-set
//! fingerprints, and manages the user configuration file.

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
