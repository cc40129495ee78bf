//! levalideur binary entry point

use clap::Parser;
use levalideur::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Cli::parse().run().await
}
