//! `git-bits` command line: git filter endpoints and the history scan.

use crate::config::BitsConfig;
use crate::repository::Repository;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "git-bits")]
#[command(
    about = "Store large files in git as lists of content-addressed chunk keys",
    long_about = None
)]
pub struct Cli {
    /// Config file (toml or json); defaults to .git/bits.toml when present
    #[arg(short, long, env = "GIT_BITS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Workspace directory
    #[arg(short = 'C', long, default_value = ".")]
    pub dir: PathBuf,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Clean filter: read content on stdin, store its chunks, write the key stream to stdout
    Split,
    /// Smudge filter: read a key stream on stdin, write the content to stdout
    Combine,
    /// Print the keys recorded in key blobs reachable from RIGHT but not LEFT
    Scan {
        /// Excluded revision; empty to scan all of RIGHT's history
        left: String,
        /// Included revision
        #[arg(default_value = "HEAD")]
        right: String,
    },
}

impl Cli {
    /// Execute the selected subcommand
    pub async fn run(self) -> Result<()> {
        let repo = self.open()?;
        match self.command {
            Command::Split => split(repo).await,
            Command::Combine => combine(repo).await,
            Command::Scan { ref left, ref right } => scan(&repo, left, right).await,
        }
    }

    fn open(&self) -> Result<Repository> {
        let config = match &self.config {
            Some(path) => BitsConfig::from_file(path)?,
            None => BitsConfig::for_workspace(&self.dir)?,
        };
        Repository::open_with_config(&self.dir, config)
            .with_context(|| format!("failed to open workspace '{}'", self.dir.display()))
    }
}

async fn split(repo: Repository) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin().lock();
        let mut stdout = BufWriter::new(std::io::stdout().lock());
        repo.clean(stdin, &mut stdout)?;
        stdout.flush().context("failed to flush stdout")?;
        Ok(())
    })
    .await?
}

async fn combine(repo: Repository) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin().lock();
        let mut stdout = BufWriter::new(std::io::stdout().lock());
        repo.smudge(stdin, &mut stdout)?;
        stdout.flush().context("failed to flush stdout")?;
        Ok(())
    })
    .await?
}

async fn scan(repo: &Repository, left: &str, right: &str) -> Result<()> {
    let mut stdout = tokio::io::BufWriter::new(tokio::io::stdout());
    let report = repo.scan(left, right, &mut stdout).await?;
    stdout.flush().await.context("failed to flush stdout")?;
    if report.warnings_dropped > 0 {
        tracing::warn!(
            dropped = report.warnings_dropped,
            "more objects were skipped than reported"
        );
    }
    Ok(())
}
