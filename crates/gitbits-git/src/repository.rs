//! Handle on one git workspace: executable, chunk directory, transcoder.

use crate::config::BitsConfig;
use crate::error::{GitError, GitResult};
use crate::runner::{find_executable, GitRunner};
use crate::scan::{run_scan, ScanReport};
use gitbits_reduce::{
    ChunkStore, Chunker, CleanSummary, Sentinels, SmudgeSummary, Transcoder, FOOTER, HEADER,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const GIT_DIR: &str = ".git";

/// An opened git workspace with its local chunk store
#[derive(Debug, Clone)]
pub struct Repository {
    runner: GitRunner,
    chunk_dir: PathBuf,
    transcoder: Transcoder,
    config: BitsConfig,
}

impl Repository {
    /// Open the workspace at `dir`, loading `.git/bits.toml` if it exists
    pub fn open(dir: impl AsRef<Path>) -> GitResult<Self> {
        let config = BitsConfig::for_workspace(dir.as_ref())?;
        Self::open_with_config(dir, config)
    }

    /// Open the workspace at `dir` with an explicit configuration.
    ///
    /// Fails if git can't be found, if `dir` has no git metadata directory, or
    /// if the chunk directory can't be created.
    pub fn open_with_config(dir: impl AsRef<Path>, config: BitsConfig) -> GitResult<Self> {
        let exe_name = config
            .git_executable
            .clone()
            .unwrap_or_else(|| PathBuf::from("git"));
        let exe = find_executable(&exe_name).ok_or_else(|| GitError::ExecutableNotFound {
            name: exe_name.display().to_string(),
        })?;

        let work_dir = std::path::absolute(dir.as_ref()).map_err(|source| {
            GitError::NotAWorkspace {
                dir: dir.as_ref().to_path_buf(),
                source,
            }
        })?;
        let git_dir = work_dir.join(GIT_DIR);
        std::fs::metadata(&git_dir).map_err(|source| GitError::NotAWorkspace {
            dir: work_dir.clone(),
            source,
        })?;

        let chunk_dir = git_dir.join(&config.chunk_dir);
        let store = ChunkStore::open(&chunk_dir).map_err(|source| GitError::ChunkDirSetup {
            dir: chunk_dir.clone(),
            source,
        })?;
        let chunker = Chunker::with_config(config.chunker.clone())?;
        let sentinels = Sentinels::new(HEADER, FOOTER)?;

        debug!(work_dir = %work_dir.display(), git = %exe.display(), "opened repository");
        Ok(Self {
            runner: GitRunner::new(exe, work_dir, config.stderr),
            chunk_dir,
            transcoder: Transcoder::new(chunker, store, sentinels),
            config,
        })
    }

    /// Absolute path of the workspace
    pub fn work_dir(&self) -> &Path {
        self.runner.work_dir()
    }

    /// Directory holding the local chunks
    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    /// Local chunk store
    pub fn store(&self) -> &ChunkStore {
        self.transcoder.store()
    }

    /// Header/footer pair of key blobs
    pub fn sentinels(&self) -> &Sentinels {
        self.transcoder.sentinels()
    }

    /// Transcoder bound to this workspace's store
    pub fn transcoder(&self) -> &Transcoder {
        &self.transcoder
    }

    /// Configuration in effect
    pub fn config(&self) -> &BitsConfig {
        &self.config
    }

    /// Git runner bound to this workspace
    pub fn runner(&self) -> &GitRunner {
        &self.runner
    }

    /// Turn content into a framed key stream, storing its chunks
    pub fn clean<R: Read, W: Write>(&self, input: R, output: W) -> GitResult<CleanSummary> {
        Ok(self.transcoder.clean(input, output)?)
    }

    /// Turn a framed key stream back into content
    pub fn smudge<R: Read, W: Write>(&self, input: R, output: W) -> GitResult<SmudgeSummary> {
        Ok(self.transcoder.smudge(input, output)?)
    }

    /// Run `git <args>` in the workspace
    pub async fn git<I, O>(
        &self,
        args: &[&str],
        input: Option<I>,
        output: Option<O>,
        cancel: &CancellationToken,
    ) -> GitResult<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        self.runner.run(args, input, output, cancel).await
    }

    /// Run `git <args>` in the workspace and return its trimmed stdout
    pub async fn git_output(&self, args: &[&str]) -> GitResult<String> {
        self.runner.output(args).await
    }

    /// Write every key recorded in key blobs reachable from `right` but not from
    /// `left` to `out`, one hex key per line. An empty `left` scans all of
    /// `right`'s history.
    pub async fn scan<W>(&self, left: &str, right: &str, out: &mut W) -> GitResult<ScanReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.scan_with_cancel(left, right, out, CancellationToken::new())
            .await
    }

    /// Like [`Repository::scan`], stopping early when `cancel` fires
    pub async fn scan_with_cancel<W>(
        &self,
        left: &str,
        right: &str,
        out: &mut W,
        cancel: CancellationToken,
    ) -> GitResult<ScanReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        info!(left, right, "scanning for key blobs");
        run_scan(
            &self.runner,
            self.sentinels(),
            &self.config.scan,
            left,
            right,
            out,
            cancel,
        )
        .await
    }
}
