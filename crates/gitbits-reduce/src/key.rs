//! Chunk keys: SHA-256 digests of chunk content and their hex line encoding

use crate::error::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Size of a key in bytes (SHA-256 output)
pub const KEY_SIZE: usize = 32;

/// Length of a hex encoded key
pub const KEY_HEX_LEN: usize = KEY_SIZE * 2;

/// Width of one key line in a key stream: hex encoded key plus newline.
/// Every key blob is an exact multiple of this width.
pub const KEY_LINE_WIDTH: usize = KEY_HEX_LEN + 1;

/// A 32-byte SHA-256 digest identifying a chunk's content. Used as the store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Compute the key of a chunk
    pub fn digest(data: &[u8]) -> Self {
        Key(Sha256::digest(data).into())
    }

    /// Return the key as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Decode one key line (without its newline).
    /// Fails on invalid hex or when the decoded length is not [`KEY_SIZE`].
    pub fn from_hex_line(line: &[u8]) -> ReduceResult<Self> {
        let data = hex::decode(line).map_err(|e| ReduceError::KeyDecode {
            line: String::from_utf8_lossy(line).into_owned(),
            reason: e.to_string(),
        })?;
        let actual = data.len();
        let bytes: [u8; KEY_SIZE] = data.try_into().map_err(|_| ReduceError::KeyLength {
            line: String::from_utf8_lossy(line).into_owned(),
            expected: KEY_SIZE,
            actual,
        })?;
        Ok(Key(bytes))
    }

    /// Shard directory name: the first two hex characters
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// File name inside the shard: the remaining hex characters
    pub fn shard_entry(&self) -> String {
        hex::encode(&self.0[1..])
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_hex_line(s.as_bytes())
    }
}
