//! Error types for the gitbits-reduce subsystem

use crate::key::Key;
use std::path::PathBuf;

/// Result type alias for reduction operations.
pub type ReduceResult<T> = Result<T, ReduceError>;

/// All errors that can occur while chunking, storing or framing content
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Reading the input failed while a chunk was being buffered
    #[error("Failed to read chunk ({length} bytes) into buffer (size {limit} bytes): {source}")]
    ChunkRead {
        /// Bytes buffered for the chunk before the failure
        length: usize,
        /// Configured chunk buffer size
        limit: usize,
        /// Underlying read error
        source: std::io::Error,
    },
    /// Chunker parameters are inconsistent
    #[error("Invalid chunker configuration: {0}")]
    InvalidChunkerConfig(String),
    /// A shard directory could not be created
    #[error("Failed to create chunk dir '{}': {source}", .path.display())]
    StoreDir {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// A chunk file could not be created or written
    #[error("Failed to write chunk {key} to '{}': {source}", .path.display())]
    StoreWrite {
        /// Key of the chunk being written
        key: Key,
        /// Path of the chunk file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// A chunk file exists but could not be read
    #[error("Failed to read chunk {key} from '{}': {source}", .path.display())]
    StoreRead {
        /// Key of the chunk being read
        key: Key,
        /// Path of the chunk file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The requested chunk is not present in the store
    #[error("Chunk {key} not found in store at '{}'", .path.display())]
    ChunkNotFound {
        /// Missing key
        key: Key,
        /// Path where the chunk was expected
        path: PathBuf,
    },
    /// A key line is not valid hex
    #[error("Failed to decode key line '{line}' as hex: {reason}")]
    KeyDecode {
        /// Raw (lossily decoded) line content
        line: String,
        /// Why decoding failed
        reason: String,
    },
    /// A key line decoded to the wrong number of bytes
    #[error("Decoded key line '{line}' has an invalid length {actual}, expected {expected}")]
    KeyLength {
        /// Raw line content
        line: String,
        /// Expected key size in bytes
        expected: usize,
        /// Decoded size in bytes
        actual: usize,
    },
    /// Header/footer sentinels do not have the width of a key line
    #[error("Header and footer must be {expected} bytes ending in a newline: header {header}, footer {footer}")]
    InvalidSentinels {
        /// Required width
        expected: usize,
        /// Header width
        header: usize,
        /// Footer width
        footer: usize,
    },
    /// Input ended inside a header/footer window
    #[error("Key stream ended after {keys} keys without a footer")]
    UnterminatedKeyStream {
        /// Keys recorded in the open window
        keys: usize,
    },
    /// Reading the input stream failed
    #[error("Failed to read input: {0}")]
    Input(#[source] std::io::Error),
    /// Writing the output stream failed
    #[error("Failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

impl ReduceError {
    /// True if this error reports a chunk missing from the store
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReduceError::ChunkNotFound { .. })
    }
}
