//! Content-defined chunking with a Rabin rolling hash over a fixed polynomial
//!
//! A boundary is cut when the fingerprint of the trailing 64-byte window has its
//! low `average_bits` bits clear, or when the chunk reaches `max_size`. Only the
//! window before the cut matters, so an edit perturbs the chunks around it and
//! leaves boundaries elsewhere where they were.

use crate::error::{ReduceError, ReduceResult};
use crate::key::Key;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

const WINDOW_SIZE: usize = 64;
const READ_BUFFER_SIZE: usize = 512 * 1024;

/// Default chunk buffer size, the largest chunk ever emitted (8 MiB)
pub const DEFAULT_MAX_SIZE: usize = 8 * 1024 * 1024;

/// Default polynomial. Boundaries depend on it, so it must be equal across the
/// whole de-duplication space.
pub const DEFAULT_POLYNOMIAL: Polynomial = Polynomial(0x3DA3358B4DC173);

/// A polynomial over GF(2), bit i holding the coefficient of x^i
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polynomial(pub u64);

impl Polynomial {
    /// Degree of the polynomial, -1 for the zero polynomial
    pub fn degree(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    /// Remainder of `self` divided by `modulus`
    pub fn reduce(self, modulus: Polynomial) -> Polynomial {
        let d = modulus.degree();
        let mut x = self.0;
        loop {
            let deg = 63 - x.leading_zeros() as i32;
            if x == 0 || deg < d {
                return Polynomial(x);
            }
            x ^= modulus.0 << (deg - d);
        }
    }
}

/// Configuration for the chunker. Treated as immutable once a [`Chunker`] is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes; no cut happens before this
    pub min_size: usize,
    /// Maximum chunk size in bytes, also the size of the chunk buffer
    pub max_size: usize,
    /// A cut happens where the low `average_bits` fingerprint bits are zero
    pub average_bits: u32,
    /// Rolling hash polynomial
    pub polynomial: Polynomial,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 512 * 1024,
            max_size: DEFAULT_MAX_SIZE,
            average_bits: 20,
            polynomial: DEFAULT_POLYNOMIAL,
        }
    }
}

impl ChunkerConfig {
    /// Check the parameters describe a usable cut policy
    pub fn validate(&self) -> ReduceResult<()> {
        let deg = self.polynomial.degree();
        // the top byte of the fingerprint indexes the reduction table and
        // shifting in a byte must not overflow 64 bits
        if !(9..=55).contains(&deg) {
            return Err(ReduceError::InvalidChunkerConfig(format!(
                "polynomial {:#x} has degree {}, expected 9..=55",
                self.polynomial.0, deg
            )));
        }
        if self.min_size < WINDOW_SIZE {
            return Err(ReduceError::InvalidChunkerConfig(format!(
                "min_size {} is smaller than the {} byte hash window",
                self.min_size, WINDOW_SIZE
            )));
        }
        if self.min_size > self.max_size {
            return Err(ReduceError::InvalidChunkerConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if !(1..=40).contains(&self.average_bits) {
            return Err(ReduceError::InvalidChunkerConfig(format!(
                "average_bits {} out of range 1..=40",
                self.average_bits
            )));
        }
        Ok(())
    }
}

/// A content-defined chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// SHA-256 of the chunk content (store key)
    pub key: Key,
    /// Byte offset of this chunk in the original stream
    pub offset: u64,
}

/// Lookup tables derived from the polynomial
struct RabinTables {
    /// out[b]: fingerprint of b followed by WINDOW_SIZE - 1 zero bytes, XOR-ed
    /// in to slide b out of the window
    out: [u64; 256],
    /// reduce[b]: (b * x^deg mod pol) | (b * x^deg), XOR-ed in to fold the top
    /// byte back under the polynomial degree
    reduce: [u64; 256],
}

impl RabinTables {
    fn new(pol: Polynomial) -> Self {
        let append = |hash: u64, b: u8| Polynomial((hash << 8) | b as u64).reduce(pol).0;
        let deg = pol.degree() as u32;

        let mut out = [0u64; 256];
        for (b, slot) in out.iter_mut().enumerate() {
            let mut h = append(0, b as u8);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append(h, 0);
            }
            *slot = h;
        }

        let mut reduce = [0u64; 256];
        for (b, slot) in reduce.iter_mut().enumerate() {
            let shifted = (b as u64) << deg;
            *slot = Polynomial(shifted).reduce(pol).0 | shifted;
        }

        Self { out, reduce }
    }
}

/// Content-defined chunker. Cheap to clone; tables are shared.
#[derive(Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    tables: Arc<RabinTables>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker").field("config", &self.config).finish()
    }
}

impl Chunker {
    /// Create a chunker with the default cut policy
    pub fn new() -> Self {
        Self::build(ChunkerConfig::default())
    }

    /// Create a chunker with a custom configuration
    pub fn with_config(config: ChunkerConfig) -> ReduceResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ChunkerConfig) -> Self {
        let tables = Arc::new(RabinTables::new(config.polynomial));
        Self { config, tables }
    }

    /// Chunker configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split a reader lazily. The stream is finite and cannot be restarted.
    pub fn stream<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            reader,
            tables: self.tables.clone(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            split_mask: (1u64 << self.config.average_bits) - 1,
            pol_shift: self.config.polynomial.degree() as u32 - 8,
            buf: vec![0u8; READ_BUFFER_SIZE.min(self.config.max_size)],
            bpos: 0,
            bmax: 0,
            offset: 0,
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            done: false,
        }
    }

    /// Chunk an in-memory buffer.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunk(&self, data: &[u8]) -> ReduceResult<Vec<Chunk>> {
        self.stream(data).collect()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the chunks of a reader, see [`Chunker::stream`]
pub struct ChunkStream<R> {
    reader: R,
    tables: Arc<RabinTables>,
    min_size: usize,
    max_size: usize,
    split_mask: u64,
    pol_shift: u32,
    buf: Vec<u8>,
    bpos: usize,
    bmax: usize,
    offset: u64,
    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    done: bool,
}

impl<R: Read> ChunkStream<R> {
    fn reset_hash(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.slide(1);
    }

    #[inline]
    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> self.pol_shift) as usize;
        self.digest = (self.digest << 8) | b as u64;
        self.digest ^= self.tables.reduce[index];
    }

    fn fill(&mut self, buffered: usize) -> ReduceResult<usize> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(n) => {
                    self.bpos = 0;
                    self.bmax = n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ReduceError::ChunkRead {
                        length: buffered,
                        limit: self.max_size,
                        source,
                    })
                }
            }
        }
    }

    fn emit(&mut self, data: Vec<u8>) -> Chunk {
        let chunk = Chunk {
            key: Key::digest(&data),
            offset: self.offset,
            data: Bytes::from(data),
        };
        self.offset += chunk.data.len() as u64;
        chunk
    }

    fn next_chunk(&mut self) -> ReduceResult<Option<Chunk>> {
        let mut data: Vec<u8> = Vec::new();
        // bytes before the first full window cannot influence the cut
        let skip = self.min_size - WINDOW_SIZE;
        self.reset_hash();

        loop {
            if self.bpos >= self.bmax && self.fill(data.len())? == 0 {
                if data.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.emit(data)));
            }

            if data.len() < skip {
                let take = (skip - data.len()).min(self.bmax - self.bpos);
                data.extend_from_slice(&self.buf[self.bpos..self.bpos + take]);
                self.bpos += take;
                continue;
            }

            let start = self.bpos;
            let mut cut = None;
            for i in start..self.bmax {
                let b = self.buf[i];
                self.slide(b);
                let len = data.len() + (i - start) + 1;
                if len >= self.min_size
                    && (self.digest & self.split_mask == 0 || len >= self.max_size)
                {
                    cut = Some(i + 1);
                    break;
                }
            }

            match cut {
                Some(end) => {
                    data.extend_from_slice(&self.buf[start..end]);
                    self.bpos = end;
                    return Ok(Some(self.emit(data)));
                }
                None => {
                    data.extend_from_slice(&self.buf[start..self.bmax]);
                    self.bpos = self.bmax;
                }
            }
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = ReduceResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
