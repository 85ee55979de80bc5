//! Clean and smudge transcoders: content ⇄ framed key stream

use crate::{
    chunker::Chunker,
    error::{ReduceError, ReduceResult},
    framing::{read_line, BoundedLine, Sentinels},
    key::Key,
    store::{ChunkStore, PutOutcome},
};
use std::io::{BufReader, Read, Write};
use tracing::{debug, info, instrument};

/// Statistics and key list from a clean run
#[derive(Debug, Default, Clone)]
pub struct CleanSummary {
    /// Keys in stream order
    pub keys: Vec<Key>,
    /// Total input bytes
    pub input_bytes: u64,
    /// Chunks newly written to the store
    pub chunks_written: usize,
    /// Chunks that were already stored
    pub chunks_deduplicated: usize,
}

/// Statistics from a smudge run
#[derive(Debug, Default, Clone)]
pub struct SmudgeSummary {
    /// Keys fetched, in stream order
    pub keys: usize,
    /// Total bytes written to the output
    pub output_bytes: u64,
}

/// Converts content to framed key streams and back, against one chunk store
#[derive(Debug, Clone)]
pub struct Transcoder {
    chunker: Chunker,
    store: ChunkStore,
    sentinels: Sentinels,
}

impl Transcoder {
    /// Create a transcoder
    pub fn new(chunker: Chunker, store: ChunkStore, sentinels: Sentinels) -> Self {
        Self {
            chunker,
            store,
            sentinels,
        }
    }

    /// Chunk store in use
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Sentinels in use
    pub fn sentinels(&self) -> &Sentinels {
        &self.sentinels
    }

    /// Chunker in use
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Split `input` into chunks, store each one, and write the framed key stream
    /// to `output`.
    ///
    /// On error no footer is written, so the partial output never unframes.
    #[instrument(skip_all)]
    pub fn clean<R: Read, W: Write>(&self, input: R, mut output: W) -> ReduceResult<CleanSummary> {
        let mut summary = CleanSummary::default();
        output
            .write_all(self.sentinels.header())
            .map_err(ReduceError::Output)?;

        for chunk in self.chunker.stream(input) {
            let chunk = chunk?;
            summary.input_bytes += chunk.data.len() as u64;
            match self.store.put(&chunk.key, &chunk.data)? {
                PutOutcome::Written => summary.chunks_written += 1,
                PutOutcome::AlreadyPresent => summary.chunks_deduplicated += 1,
            }
            writeln!(output, "{}", chunk.key).map_err(ReduceError::Output)?;
            debug!(
                key = %chunk.key,
                offset = chunk.offset,
                size = chunk.data.len(),
                "chunk emitted"
            );
            summary.keys.push(chunk.key);
        }

        output
            .write_all(self.sentinels.footer())
            .map_err(ReduceError::Output)?;
        output.flush().map_err(ReduceError::Output)?;

        info!(
            input_bytes = summary.input_bytes,
            chunks = summary.keys.len(),
            written = summary.chunks_written,
            deduplicated = summary.chunks_deduplicated,
            "clean complete"
        );
        Ok(summary)
    }

    /// Read a framed key stream from `input` and write the reassembled content to
    /// `output`, fetching one chunk at a time.
    ///
    /// Any error means `output` must not be trusted.
    #[instrument(skip_all)]
    pub fn smudge<R: Read, W: Write>(
        &self,
        input: R,
        mut output: W,
    ) -> ReduceResult<SmudgeSummary> {
        let mut reader = BufReader::new(input);
        let mut line = BoundedLine::for_keys();
        let mut recorder = self.sentinels.recorder();
        let mut summary = SmudgeSummary::default();

        while read_line(&mut reader, &mut line).map_err(ReduceError::Input)? {
            if let Some(key) = recorder.observe(&line)? {
                summary.output_bytes += self.store.copy_to(&key, &mut output)?;
                summary.keys += 1;
            }
        }
        recorder.finish()?;
        output.flush().map_err(ReduceError::Output)?;

        info!(
            keys = summary.keys,
            output_bytes = summary.output_bytes,
            "smudge complete"
        );
        Ok(summary)
    }
}
