#![warn(missing_docs)]

//! git-bits git integration: command runner, repository handle, key-blob scan of history
//!
//! Scan pipeline:
//! rev-list --objects → object ids → cat-file --batch-check → size filter → cat-file --batch → sentinel scan

pub mod cli;
pub mod config;
pub mod error;
pub mod repository;
pub mod runner;
pub mod scan;

pub use config::{BitsConfig, ScanConfig, StderrSink};
pub use error::{GitError, GitResult};
pub use repository::Repository;
pub use runner::{find_executable, GitRunner, NoInput, NoOutput};
pub use scan::{Classification, ScanReport, ScanStage, ScanWarning, WarningLog};
