//! Runs git with the workspace as working directory, streaming stdin/stdout.

use crate::config::StderrSink;
use crate::error::{GitError, GitResult};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Placeholder input type for invocations without stdin
pub type NoInput = tokio::io::Empty;

/// Placeholder output type for invocations whose stdout is discarded
pub type NoOutput = tokio::io::Sink;

/// Look up an executable the way a shell would: paths containing a separator are
/// taken as is, bare names are searched in `PATH`.
pub fn find_executable(name: impl AsRef<OsStr>) -> Option<PathBuf> {
    let name = Path::new(name.as_ref());
    if name.components().count() > 1 {
        return name.is_file().then(|| name.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Spawns git processes for one workspace
#[derive(Debug, Clone)]
pub struct GitRunner {
    exe: PathBuf,
    work_dir: PathBuf,
    stderr: StderrSink,
}

impl GitRunner {
    /// Create a runner for an already resolved executable
    pub fn new(exe: PathBuf, work_dir: PathBuf, stderr: StderrSink) -> Self {
        Self {
            exe,
            work_dir,
            stderr,
        }
    }

    /// Path of the git executable
    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Working directory of spawned processes
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run `git <args>`.
    ///
    /// `input` is copied to the child's stdin and closed when exhausted; the
    /// child's stdout is copied to `output`. Without an input the child gets an
    /// empty stdin, without an output its stdout is discarded. The child is
    /// killed when `cancel` fires or the returned future is dropped.
    pub async fn run<I, O>(
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
        let command = args.join(" ");
        let mut cmd = Command::new(&self.exe);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .kill_on_drop(true)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if output.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(match self.stderr {
                StderrSink::Inherit => Stdio::inherit(),
                StderrSink::Log => Stdio::piped(),
                StderrSink::Discard => Stdio::null(),
            });

        debug!(command = %command, "running git");
        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feed = async move {
            if let (Some(mut input), Some(mut stdin)) = (input, stdin) {
                match tokio::io::copy(&mut input, &mut stdin).await {
                    Ok(_) => {}
                    // git stopped reading; its exit status tells why
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(()),
                    Err(e) => return Err(e),
                }
                // dropping stdin closes the pipe so git sees end of input
                stdin.shutdown().await.or_else(ignore_broken_pipe)?;
            }
            Ok::<(), std::io::Error>(())
        };

        let drain = async move {
            if let (Some(mut output), Some(mut stdout)) = (output, stdout) {
                tokio::io::copy(&mut stdout, &mut output).await?;
                output.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let log = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(command = %command, "git: {}", line);
                }
            }
        };

        let finished = async {
            let (fed, drained, ()) = tokio::join!(feed, drain, log);
            let status = child.wait().await.map_err(|source| GitError::Pipe {
                command: command.clone(),
                source,
            })?;
            if !status.success() {
                return Err(GitError::CommandFailed {
                    command: command.clone(),
                    status,
                });
            }
            fed.and(drained).map_err(|source| GitError::Pipe {
                command: command.clone(),
                source,
            })
        };

        tokio::select! {
            biased;
            // the child is killed on drop when we return
            _ = cancel.cancelled() => Err(GitError::Cancelled),
            result = finished => result,
        }
    }

    /// Run `git <args>` and return its trimmed stdout
    pub async fn output(&self, args: &[&str]) -> GitResult<String> {
        let mut out = Vec::new();
        self.run(args, None::<NoInput>, Some(&mut out), &CancellationToken::new())
            .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

fn ignore_broken_pipe(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == ErrorKind::BrokenPipe {
        Ok(())
    } else {
        Err(e)
    }
}
