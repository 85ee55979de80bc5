//! Workspace configuration, loaded from toml or json.

use crate::error::{GitError, GitResult};
use gitbits_reduce::ChunkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the optional config file inside the git metadata directory.
pub const CONFIG_FILE_NAME: &str = "bits.toml";

/// Where stderr of git invocations goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrSink {
    /// Inherit our stderr
    #[default]
    Inherit,
    /// Re-emit each line as a tracing warning
    Log,
    /// Drop it
    Discard,
}

/// Tuning for the history scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Capacity of each in-memory pipe between scan stages
    pub pipe_buffer_size: usize,
    /// Warnings kept in a scan report; further ones are only counted
    pub max_warnings: usize,
    /// Overall scan deadline, unbounded when unset
    pub deadline_secs: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            pipe_buffer_size: 64 * 1024,
            max_warnings: 100,
            deadline_secs: None,
        }
    }
}

impl ScanConfig {
    /// Deadline as a duration
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// git-bits configuration for one workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitsConfig {
    /// Content-defined chunking parameters
    pub chunker: ChunkerConfig,
    /// Explicit git executable; looked up on PATH when unset
    pub git_executable: Option<PathBuf>,
    /// Chunk store directory, relative to the git metadata directory
    pub chunk_dir: PathBuf,
    /// Where git's stderr goes
    pub stderr: StderrSink,
    /// History scan tuning
    pub scan: ScanConfig,
}

impl Default for BitsConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            git_executable: None,
            chunk_dir: PathBuf::from("chunks"),
            stderr: StderrSink::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl BitsConfig {
    /// Load from a `.toml` or `.json` file; missing fields take their defaults
    pub fn from_file(path: &Path) -> GitResult<Self> {
        let fail = |reason: String| GitError::Config {
            path: path.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| fail(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| fail(e.to_string())),
            _ => Err(fail(format!("unsupported config file extension: '{ext}'"))),
        }
    }

    /// Load `<workspace>/.git/bits.toml` if present, defaults otherwise
    pub fn for_workspace(work_dir: &Path) -> GitResult<Self> {
        let path = work_dir.join(".git").join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }
}
