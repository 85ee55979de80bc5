#![warn(missing_docs)]

//! `git-bits` binary.

use anyhow::Result;
use clap::Parser;
use gitbits_git::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries filter and scan output; logs go to stderr only
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    Cli::parse().run().await
}
