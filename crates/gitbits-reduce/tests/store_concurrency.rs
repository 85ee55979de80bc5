//! Concurrent writers against one chunk store.
//!
//! Parallel filter invocations share the store without locking; publishing each
//! chunk file with an exclusive link is the only coordination.

use gitbits_reduce::{ChunkStore, Key, PutOutcome};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn test_same_key_concurrent_puts() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path()).unwrap();
    let data: Arc<Vec<u8>> = Arc::new((0..1_000_000u32).map(|i| (i % 251) as u8).collect());
    let key = Key::digest(&data);

    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|_| {
            let store = store.clone();
            let data = data.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.put(&key, &data).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<PutOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let written = outcomes.iter().filter(|o| **o == PutOutcome::Written).count();
    assert_eq!(written, 1);
    assert_eq!(store.read(&key).unwrap(), *data);
}

#[test]
fn test_distinct_keys_concurrent_puts() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path()).unwrap();

    let handles: Vec<_> = (0..16u32)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                let mut keys = Vec::new();
                for i in 0..50u32 {
                    let data = format!("thread {t} chunk {i}").into_bytes();
                    let key = Key::digest(&data);
                    store.put(&key, &data).unwrap();
                    keys.push((key, data));
                }
                keys
            })
        })
        .collect();

    for handle in handles {
        for (key, data) in handle.join().unwrap() {
            assert_eq!(store.read(&key).unwrap(), data);
        }
    }
}

#[test]
fn test_shared_chunks_across_parallel_writers() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path()).unwrap();
    let shared: Vec<Vec<u8>> = (0..20u32).map(|i| vec![i as u8; 4096 + i as usize]).collect();
    let shared = Arc::new(shared);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                for data in shared.iter() {
                    store.put(&Key::digest(data), data).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for data in shared.iter() {
        assert_eq!(&store.read(&Key::digest(data)).unwrap(), data);
    }
}

#[test]
fn test_visible_chunk_is_always_complete() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path()).unwrap();

    for round in 0..3u32 {
        let data: Arc<Vec<u8>> = Arc::new(
            (0..32 * 1024 * 1024u32)
                .map(|i| (i.wrapping_mul(31).wrapping_add(round) % 253) as u8)
                .collect(),
        );
        let key = Key::digest(&data);
        let path = store.path_for(&key);

        let writer = {
            let store = store.clone();
            let data = data.clone();
            thread::spawn(move || store.put(&key, &data).unwrap())
        };
        while !path.exists() && !writer.is_finished() {
            thread::yield_now();
        }

        // as soon as the entry is visible it must hold the whole chunk
        assert_eq!(store.put(&key, &data).unwrap(), PutOutcome::AlreadyPresent);
        assert_eq!(store.read(&key).unwrap().len(), data.len());
        assert_eq!(writer.join().unwrap(), PutOutcome::Written);
        assert_eq!(store.read(&key).unwrap(), *data);
    }
}
