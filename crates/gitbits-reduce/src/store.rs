//! Sharded, write-once, content-addressed chunk store on the local filesystem.
//!
//! Layout: `<root>/<first 2 hex chars>/<remaining 62 hex chars>`, raw chunk bytes,
//! no header. There is no index: the presence of a file is the only record that a
//! chunk is known, so every lookup goes to the filesystem.

use crate::error::{ReduceError, ReduceResult};
use crate::key::Key;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of a [`ChunkStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk file was created by this call
    Written,
    /// A chunk file already existed; nothing was written
    AlreadyPresent,
}

/// Local chunk store rooted at a directory
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open a store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> ReduceResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| ReduceError::StoreDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`
    pub fn path_for(&self, key: &Key) -> PathBuf {
        self.root.join(key.shard()).join(key.shard_entry())
    }

    /// True if a chunk file exists for `key`
    pub fn contains(&self, key: &Key) -> bool {
        self.path_for(key).is_file()
    }

    /// Persist a chunk. Idempotent: an existing entry is left untouched.
    ///
    /// The bytes go to a temporary file in the shard directory, are synced, and
    /// are then published under the final name with an exclusive link. A chunk
    /// path therefore only ever names complete content, and of two concurrent
    /// writers for the same key exactly one publishes while the other observes
    /// [`PutOutcome::AlreadyPresent`]. A crash mid-write leaves at most a stray
    /// temporary file behind.
    pub fn put(&self, key: &Key, data: &[u8]) -> ReduceResult<PutOutcome> {
        let dir = self.root.join(key.shard());
        let path = dir.join(key.shard_entry());
        if path.is_file() {
            debug!(key = %key, "chunk already stored");
            return Ok(PutOutcome::AlreadyPresent);
        }
        fs::create_dir_all(&dir).map_err(|source| ReduceError::StoreDir {
            path: dir.clone(),
            source,
        })?;

        let write_err = |source| ReduceError::StoreWrite {
            key: *key,
            path: path.clone(),
            source,
        };
        let mut staged = NamedTempFile::new_in(&dir).map_err(write_err)?;
        staged.write_all(data).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;

        match staged.persist_noclobber(&path) {
            Ok(_) => {
                debug!(key = %key, size = data.len(), "chunk written");
                Ok(PutOutcome::Written)
            }
            // the temporary file is removed when the returned handle drops
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!(key = %key, "chunk stored concurrently");
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(write_err(e.error)),
        }
    }

    /// Open a chunk for reading. Fails with [`ReduceError::ChunkNotFound`] if absent.
    pub fn get(&self, key: &Key) -> ReduceResult<File> {
        let path = self.path_for(key);
        match File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ReduceError::ChunkNotFound { key: *key, path })
            }
            Err(source) => Err(ReduceError::StoreRead {
                key: *key,
                path,
                source,
            }),
        }
    }

    /// Read a whole chunk into memory
    pub fn read(&self, key: &Key) -> ReduceResult<Vec<u8>> {
        let mut data = Vec::new();
        self.copy_to(key, &mut data)?;
        Ok(data)
    }

    /// Copy a chunk's bytes verbatim to `out`, returning the number of bytes copied
    pub fn copy_to<W: Write + ?Sized>(&self, key: &Key, out: &mut W) -> ReduceResult<u64> {
        let mut file = self.get(key)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => return Ok(copied),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ReduceError::StoreRead {
                        key: *key,
                        path: self.path_for(key),
                        source,
                    })
                }
            };
            out.write_all(&buf[..n]).map_err(ReduceError::Output)?;
            copied += n as u64;
        }
    }
}
