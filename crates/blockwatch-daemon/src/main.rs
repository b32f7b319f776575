#![warn(missing_docs)]

//! `blockwatchd` entry point.

use anyhow::Result;
use blockwatch_daemon::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("blockwatchd starting");

    Cli::parse().run().await
}
