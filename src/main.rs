//! Entry point: initializes structured logging, then parses and runs the
//! requested CLI command.

use anyhow::Result;
use clap::Parser;
use dbfsync_engine::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    cli.execute().await
}
