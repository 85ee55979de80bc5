//! Key-blob discovery across a revision range.
//!
//! Stages run concurrently, joined by small in-memory pipes so each one blocks
//! while its neighbour catches up and no stage holds more than a line or a pipe
//! buffer at a time:
//!
//! 1. `git rev-list --objects <right> ^<left>`
//! 2. reduce each line to its object id
//! 3. `git cat-file --batch-check`, then keep only blobs whose size is a non-zero
//!    multiple of the key line width
//! 4. `git cat-file --batch` over the surviving ids
//! 5. header/footer scan of the combined output, writing the recorded keys
//!
//! A failing stage cancels the rest and its error is reported tagged with the
//! stage. When an upstream stage fails, the scanner's complaint about the cut
//! short input is not reported in its place.

use crate::config::ScanConfig;
use crate::error::{GitError, GitResult};
use crate::runner::{GitRunner, NoInput};
use gitbits_reduce::{BoundedLine, Sentinels, KEY_LINE_WIDTH};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Pipeline stage, used to tag failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScanStage {
    /// `git rev-list --objects`
    ListObjects,
    /// Object id extraction
    ExtractIds,
    /// `git cat-file --batch-check`
    ClassifyObjects,
    /// Type/size filter over metadata replies
    FilterBlobs,
    /// `git cat-file --batch`
    FetchContent,
    /// Header/footer scan
    ScanSentinels,
}

impl std::fmt::Display for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanStage::ListObjects => "list-objects",
            ScanStage::ExtractIds => "extract-ids",
            ScanStage::ClassifyObjects => "classify-objects",
            ScanStage::FilterBlobs => "filter-blobs",
            ScanStage::FetchContent => "fetch-content",
            ScanStage::ScanSentinels => "scan-sentinels",
        };
        f.write_str(name)
    }
}

/// A non-fatal problem with one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    /// Object id, or the raw line when no id could be read
    pub object_id: String,
    /// What was wrong
    pub reason: String,
}

/// Bounded collection of scan warnings
#[derive(Debug, Clone, Default)]
pub struct WarningLog {
    limit: usize,
    warnings: Vec<ScanWarning>,
    dropped: usize,
}

impl WarningLog {
    /// Keep at most `limit` warnings
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            warnings: Vec::new(),
            dropped: 0,
        }
    }

    /// Record a warning; past the limit it is only counted
    pub fn push(&mut self, warning: ScanWarning) {
        warn!(object = %warning.object_id, reason = %warning.reason, "skipping object");
        if self.warnings.len() < self.limit {
            self.warnings.push(warning);
        } else {
            self.dropped += 1;
        }
    }

    /// Recorded warnings
    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    /// Warnings counted but not kept
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Result of a successful scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Key blobs found (header sentinels seen)
    pub key_blobs: usize,
    /// Keys written to the output
    pub keys: usize,
    /// Objects skipped because their metadata could not be read
    pub warnings: Vec<ScanWarning>,
    /// Warnings beyond the configured limit
    pub warnings_dropped: usize,
}

/// Verdict on one `cat-file --batch-check` reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Might be a key blob: fetch its content
    Candidate(String),
    /// Not a key blob
    Skip,
    /// Reply could not be interpreted
    Warn(ScanWarning),
}

/// Classify a `<id> <type> <size>` reply.
///
/// A key blob is a list of equal-width key lines framed by sentinels of the same
/// width, so its size is a multiple of [`KEY_LINE_WIDTH`]. Anything else can be
/// ruled out without reading it.
pub fn classify_line(line: &[u8]) -> Classification {
    let fields: Vec<&[u8]> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Classification::Skip;
    }
    let object_id = String::from_utf8_lossy(fields[0]).into_owned();
    if fields.len() < 3 {
        return Classification::Warn(ScanWarning {
            object_id,
            reason: format!(
                "expected '<id> <type> <size>', got '{}'",
                String::from_utf8_lossy(line)
            ),
        });
    }
    if fields[1] != b"blob" {
        return Classification::Skip;
    }
    let size = match std::str::from_utf8(fields[2])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    {
        Some(size) => size,
        None => {
            return Classification::Warn(ScanWarning {
                object_id,
                reason: format!(
                    "unparsable object size '{}'",
                    String::from_utf8_lossy(fields[2])
                ),
            })
        }
    };
    if size == 0 || size % KEY_LINE_WIDTH as u64 != 0 {
        return Classification::Skip;
    }
    Classification::Candidate(object_id)
}

async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut BoundedLine,
) -> std::io::Result<bool> {
    line.clear();
    let mut any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(any);
        }
        let (used, done) = line.feed(available);
        reader.consume(used);
        any = true;
        if done {
            return Ok(true);
        }
    }
}

// object ids are at most 64 hex chars (sha256 repositories); the rest of a
// rev-list line is a path we don't need
const ID_LINE_LIMIT: usize = 4096;

/// Stage 2: reduce each `rev-list --objects` line to its leading object id
pub async fn extract_ids<R, W>(mut input: R, mut output: W) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = BoundedLine::new(ID_LINE_LIMIT);
    let mut ids = 0u64;
    while read_line(&mut input, &mut line).await? {
        let Some(id) = line
            .bytes()
            .split(|b| b.is_ascii_whitespace())
            .find(|f| !f.is_empty())
        else {
            continue;
        };
        output.write_all(id).await?;
        output.write_all(b"\n").await?;
        ids += 1;
    }
    output.flush().await?;
    Ok(ids)
}

/// Stage 3 filter: forward the ids of candidate blobs, collecting warnings
pub async fn filter_candidates<R, W>(
    mut input: R,
    mut output: W,
    warnings: &mut WarningLog,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = BoundedLine::new(ID_LINE_LIMIT);
    let mut candidates = 0u64;
    while read_line(&mut input, &mut line).await? {
        match classify_line(line.bytes()) {
            Classification::Candidate(id) => {
                output.write_all(id.as_bytes()).await?;
                output.write_all(b"\n").await?;
                candidates += 1;
            }
            Classification::Skip => {}
            Classification::Warn(warning) => warnings.push(warning),
        }
    }
    output.flush().await?;
    Ok(candidates)
}

/// Stage 5: apply the header/footer toggle to the raw `cat-file --batch` output
/// and write every recorded key as a hex line. Returns (key blobs, keys).
pub async fn scan_sentinels<R, W>(
    mut input: R,
    output: &mut W,
    sentinels: &Sentinels,
) -> GitResult<(usize, usize)>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let io = |source| GitError::Io {
        context: "failed to scan key blobs",
        source,
    };
    let mut line = BoundedLine::for_keys();
    let mut recorder = sentinels.recorder();
    while read_line(&mut input, &mut line).await.map_err(io)? {
        if let Some(key) = recorder.observe(&line)? {
            output
                .write_all(format!("{key}\n").as_bytes())
                .await
                .map_err(io)?;
        }
    }
    recorder.finish()?;
    output.flush().await.map_err(io)?;
    Ok((recorder.windows(), recorder.keys()))
}

async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> GitResult<T>
where
    F: Future<Output = GitResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GitError::Cancelled),
        result = fut => result,
    }
}

/// True if `input` has already signalled end of input. Never waits for data.
async fn at_end<R: AsyncBufRead + Unpin>(input: &mut R) -> bool {
    matches!(
        tokio::time::timeout(Duration::ZERO, input.fill_buf()).await,
        Ok(Ok(buf)) if buf.is_empty()
    )
}

enum StageOutput {
    Done,
    Warnings(WarningLog),
}

/// Run the whole pipeline for `left..right`, writing keys to `out`
#[instrument(skip(runner, sentinels, config, out, cancel))]
pub(crate) async fn run_scan<W>(
    runner: &GitRunner,
    sentinels: &Sentinels,
    config: &ScanConfig,
    left: &str,
    right: &str,
    out: &mut W,
    cancel: CancellationToken,
) -> GitResult<ScanReport>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let cancel = cancel.child_token();
    let deadline_hit = Arc::new(AtomicBool::new(false));
    let timer = config.deadline().map(|deadline| {
        let cancel = cancel.clone();
        let deadline_hit = deadline_hit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            deadline_hit.store(true, Ordering::SeqCst);
            cancel.cancel();
        })
    });

    let cap = config.pipe_buffer_size;
    let (w1, r1) = tokio::io::duplex(cap);
    let (w2, r2) = tokio::io::duplex(cap);
    let (w3, r3) = tokio::io::duplex(cap);
    let (w4, r4) = tokio::io::duplex(cap);
    let (w5, r5) = tokio::io::duplex(cap);

    let mut rev_list = vec!["rev-list".to_string(), "--objects".to_string(), right.to_string()];
    if !left.is_empty() {
        rev_list.push(format!("^{left}"));
    }

    let mut stages: JoinSet<(ScanStage, GitResult<StageOutput>)> = JoinSet::new();

    {
        let runner = runner.clone();
        let cancel = cancel.clone();
        stages.spawn(async move {
            let args: Vec<&str> = rev_list.iter().map(String::as_str).collect();
            let result = runner.run(&args, None::<NoInput>, Some(w1), &cancel).await;
            (ScanStage::ListObjects, result.map(|_| StageOutput::Done))
        });
    }
    {
        let cancel = cancel.clone();
        stages.spawn(async move {
            let result = guarded(&cancel, async {
                let ids = extract_ids(BufReader::new(r1), w2)
                    .await
                    .map_err(|source| GitError::Io {
                        context: "failed to extract object ids",
                        source,
                    })?;
                debug!(ids, "object ids extracted");
                Ok(StageOutput::Done)
            })
            .await;
            (ScanStage::ExtractIds, result)
        });
    }
    {
        let runner = runner.clone();
        let cancel = cancel.clone();
        stages.spawn(async move {
            let result = runner
                .run(&["cat-file", "--batch-check"], Some(r2), Some(w3), &cancel)
                .await;
            (ScanStage::ClassifyObjects, result.map(|_| StageOutput::Done))
        });
    }
    {
        let cancel = cancel.clone();
        let mut warnings = WarningLog::new(config.max_warnings);
        stages.spawn(async move {
            let result = guarded(&cancel, async {
                let candidates = filter_candidates(BufReader::new(r3), w4, &mut warnings)
                    .await
                    .map_err(|source| GitError::Io {
                        context: "failed to filter candidate blobs",
                        source,
                    })?;
                debug!(candidates, "candidate blobs selected");
                Ok(())
            })
            .await;
            (
                ScanStage::FilterBlobs,
                result.map(|()| StageOutput::Warnings(warnings)),
            )
        });
    }
    {
        let runner = runner.clone();
        let cancel = cancel.clone();
        stages.spawn(async move {
            let result = runner
                .run(&["cat-file", "--batch"], Some(r4), Some(w5), &cancel)
                .await;
            (ScanStage::FetchContent, result.map(|_| StageOutput::Done))
        });
    }

    // first stage failure, and first stage that only saw the cancellation
    let mut upstream_failure: Option<(ScanStage, GitError)> = None;
    let mut upstream_cancelled: Option<(ScanStage, GitError)> = None;
    let mut warnings = WarningLog::default();

    let scanner = async {
        let mut input = BufReader::new(r5);
        let result = guarded(&cancel, scan_sentinels(&mut input, out, sentinels)).await;
        if let Err(e) = &result {
            // at end of input the failure may just mirror an upstream stage that
            // stopped early; upstream is done writing, so let it report first
            if !e.is_cancelled() && !at_end(&mut input).await {
                cancel.cancel();
            }
        }
        result
    };

    let watcher = async {
        while let Some(joined) = stages.join_next().await {
            let (stage, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    cancel.cancel();
                    upstream_failure.get_or_insert((
                        ScanStage::ListObjects,
                        GitError::Io {
                            context: "scan stage panicked",
                            source: std::io::Error::other(e.to_string()),
                        },
                    ));
                    continue;
                }
            };
            match result {
                Ok(StageOutput::Done) => debug!(%stage, "stage finished"),
                Ok(StageOutput::Warnings(log)) => warnings = log,
                Err(e) if e.is_cancelled() => {
                    upstream_cancelled.get_or_insert((stage, e));
                }
                Err(e) => {
                    debug!(%stage, error = %e, "stage failed");
                    cancel.cancel();
                    upstream_failure.get_or_insert((stage, e));
                }
            }
        }
    };

    let (scanned, ()) = tokio::join!(scanner, watcher);
    if let Some(timer) = timer {
        timer.abort();
    }

    let stage_error = |stage: ScanStage, source: GitError| {
        if source.is_cancelled() && deadline_hit.load(Ordering::SeqCst) {
            return GitError::DeadlineExceeded {
                secs: config.deadline_secs.unwrap_or_default(),
            };
        }
        GitError::Stage {
            stage,
            source: Box::new(source),
        }
    };

    // an upstream failure ends the scanner's input early, so whatever the
    // scanner reported then is a consequence; the stage that failed is the cause
    let (stage, source) = match (scanned, upstream_failure, upstream_cancelled) {
        (Ok((key_blobs, keys)), None, None) => {
            let report = ScanReport {
                key_blobs,
                keys,
                warnings: warnings.warnings().to_vec(),
                warnings_dropped: warnings.dropped(),
            };
            info!(
                key_blobs = report.key_blobs,
                keys = report.keys,
                warnings = report.warnings.len() + report.warnings_dropped,
                "scan complete"
            );
            return Ok(report);
        }
        (_, Some(failed), _) => failed,
        (Err(e), None, _) if !e.is_cancelled() => (ScanStage::ScanSentinels, e),
        (_, None, Some(cancelled)) => cancelled,
        (Err(e), None, None) => (ScanStage::ScanSentinels, e),
    };
    Err(stage_error(stage, source))
}
