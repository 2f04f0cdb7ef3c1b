use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    parsed.dispatch().await
}
