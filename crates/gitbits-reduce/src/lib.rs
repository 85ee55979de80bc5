#![warn(missing_docs)]

//! git-bits reduction subsystem: content-defined chunking, SHA-256 keyed chunk store, key-stream framing
//!
//! Clean path:  Data → Chunk (Rabin CDC) → Key (SHA-256) → Store (write-once) → Framed key stream
//! Smudge path: Framed key stream → Key → Store → Data

pub mod chunker;
pub mod error;
pub mod framing;
pub mod key;
pub mod store;
pub mod transcode;

pub use chunker::{Chunk, ChunkStream, Chunker, ChunkerConfig, Polynomial};
pub use error::{ReduceError, ReduceResult};
pub use framing::{read_line, BoundedLine, KeyRecorder, Sentinels, FOOTER, HEADER};
pub use key::{Key, KEY_HEX_LEN, KEY_LINE_WIDTH, KEY_SIZE};
pub use store::{ChunkStore, PutOutcome};
pub use transcode::{CleanSummary, SmudgeSummary, Transcoder};
