// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The block-region lock & update engine: serializes read-modify-write access
//! to a single handle's block via a cache-backed distributed lock.

use crate::block::{AlignedBlock, HANDLES_PER_BLOCK};
use crate::deadline::Deadline;
use crate::direct_io::DirectFile;
use crate::error::{Error, Result};
use crate::handle::HANDLE_SIZE_BYTES;
use crate::lock::{jittered_retry_interval, L2Cache, LockGuard, LockKey};
use crate::uuid::Uuid;
use std::time::{Duration, Instant};

/// How long a single block-region lock may be held before it's considered
/// stale and safe to reclaim by a fresh acquirer.
pub const DEFAULT_LOCK_FILE_REGION_DURATION: Duration = Duration::from_secs(5 * 60);

/// Total time a caller will retry lock acquisition before giving up with
/// [`Error::LockAcquisitionFailure`].
pub const LOCK_SECTOR_RETRY_TIMEOUT: Duration = Duration::from_secs(180);

/// Acquires the block-region lock for `(filename, block_offset)`, retrying
/// with jitter until `LOCK_SECTOR_RETRY_TIMEOUT` elapses.
///
/// # Errors
///
/// Returns the context's cancellation/deadline error if `ctx` expires first;
/// otherwise returns [`Error::LockAcquisitionFailure`] once the retry budget
/// is exhausted, carrying the lock key so the caller can drive stale-lock
/// recovery via the priority log.
fn acquire_block_region_lock<'a, C: L2Cache>(
    cache: &'a C,
    filename: &str,
    block_offset: u64,
    lock_duration: Duration,
    last_seen_tid: Uuid,
    ctx: &Deadline,
) -> Result<LockGuard<'a, C>> {
    let key = LockKey::for_block_region(filename, block_offset);
    let deadline = Instant::now() + LOCK_SECTOR_RETRY_TIMEOUT;

    loop {
        ctx.check()?;

        match cache.try_lock(&key.key, lock_duration) {
            Ok(true) => {
                // Double-check to guard against a race between try_lock
                // succeeding and a concurrent unlock/steal.
                match cache.is_locked(&key.key) {
                    Ok(true) => return Ok(LockGuard::new(cache, key.key)),
                    Ok(false) => {
                        log::warn!("lock {} reported held then immediately unheld, retrying", key.key);
                    }
                    Err(e) => {
                        let _ = cache.unlock(&key.key);
                        return Err(e);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                log::warn!("try_lock({}) errored, retrying: {e:?}", key.key);
            }
        }

        if Instant::now() >= deadline {
            return Err(Error::LockAcquisitionFailure {
                key: key.with_lock_id(last_seen_tid),
            });
        }

        std::thread::sleep(jittered_retry_interval());
    }
}

/// Reads the block at `block_offset`, splices `handle_bytes` into the slot at
/// `slot_offset`, and writes the block back, all while holding the
/// block-region lock.
///
/// # Errors
///
/// See the module docs: may return the context's error, a
/// [`Error::LockAcquisitionFailure`], or a propagated I/O error from the
/// underlying read/write.
pub fn update_file_block_region<C: L2Cache>(
    cache: &C,
    file: &DirectFile,
    filename: &str,
    lock_duration: Duration,
    block_offset: u64,
    slot_offset: u64,
    handle_bytes: &[u8],
    last_seen_tid: Uuid,
    ctx: &Deadline,
) -> Result<()> {
    debug_assert_eq!(HANDLE_SIZE_BYTES, handle_bytes.len());
    debug_assert!(slot_offset as usize + HANDLE_SIZE_BYTES <= crate::block::B as usize);

    let _guard = acquire_block_region_lock(cache, filename, block_offset, lock_duration, last_seen_tid, ctx)?;

    // `file.read_block` itself errors on a short/truncated read; a block
    // reaching past this point is always exactly `B` bytes.
    let mut block = file.read_block(block_offset)?;

    let start = slot_offset as usize;
    block.as_mut_slice()[start..start + HANDLE_SIZE_BYTES].copy_from_slice(handle_bytes);

    file.write_block(block_offset, &block)?;

    Ok(())
}

/// Zero-fills the handle-sized slot at `(block_offset, slot_offset)`, through
/// the same locked read-modify-write path as a normal update.
///
/// # Errors
///
/// Same as [`update_file_block_region`].
pub fn mark_delete<C: L2Cache>(
    cache: &C,
    file: &DirectFile,
    filename: &str,
    lock_duration: Duration,
    block_offset: u64,
    slot_offset: u64,
    last_seen_tid: Uuid,
    ctx: &Deadline,
) -> Result<()> {
    let zeroed = vec![0u8; HANDLE_SIZE_BYTES];
    update_file_block_region(cache, file, filename, lock_duration, block_offset, slot_offset, &zeroed, last_seen_tid, ctx)
}

const _: () = assert!(HANDLES_PER_BLOCK == crate::block::HANDLES_PER_BLOCK);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryL2Cache;
    use test_log::test;

    fn handle_bytes(fill: u8) -> Vec<u8> {
        vec![fill; HANDLE_SIZE_BYTES]
    }

    #[test]
    fn update_then_read_back_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regtest-1.reg");
        std::fs::File::create(&path).unwrap().set_len(crate::block::B).unwrap();
        let file = DirectFile::open(&path, true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        update_file_block_region(
            &cache,
            &file,
            "regtest-1.reg",
            Duration::from_secs(1),
            0,
            0,
            &handle_bytes(0xAB),
            Uuid::NIL,
            &ctx,
        )
        .unwrap();

        let block = file.read_block(0).unwrap();
        assert_eq!(&handle_bytes(0xAB)[..], &block.as_slice()[0..HANDLE_SIZE_BYTES]);
    }

    #[test]
    fn mark_delete_zeroes_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regtest-1.reg");
        std::fs::File::create(&path).unwrap().set_len(crate::block::B).unwrap();
        let file = DirectFile::open(&path, true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        update_file_block_region(&cache, &file, "regtest-1.reg", Duration::from_secs(1), 0, 0, &handle_bytes(9), Uuid::NIL, &ctx).unwrap();
        mark_delete(&cache, &file, "regtest-1.reg", Duration::from_secs(1), 0, 0, Uuid::NIL, &ctx).unwrap();

        let block = file.read_block(0).unwrap();
        assert!(block.as_slice()[0..HANDLE_SIZE_BYTES].iter().all(|&b| b == 0));
    }

    #[test]
    fn two_slots_in_same_block_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regtest-1.reg");
        std::fs::File::create(&path).unwrap().set_len(crate::block::B).unwrap();
        let file = DirectFile::open(&path, true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        let slot0 = AlignedBlock::slot_range(0).start as u64;
        let slot1 = AlignedBlock::slot_range(1).start as u64;

        update_file_block_region(&cache, &file, "regtest-1.reg", Duration::from_secs(1), 0, slot0, &handle_bytes(1), Uuid::NIL, &ctx).unwrap();
        update_file_block_region(&cache, &file, "regtest-1.reg", Duration::from_secs(1), 0, slot1, &handle_bytes(2), Uuid::NIL, &ctx).unwrap();

        let block = file.read_block(0).unwrap();
        assert_eq!(1, block.as_slice()[0]);
        assert_eq!(2, block.as_slice()[HANDLE_SIZE_BYTES]);
    }

    #[test]
    fn cancelled_context_returns_cancelled_not_lock_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regtest-1.reg");
        std::fs::File::create(&path).unwrap().set_len(crate::block::B).unwrap();
        let file = DirectFile::open(&path, true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        ctx.cancel();

        let err = update_file_block_region(&cache, &file, "regtest-1.reg", Duration::from_secs(1), 0, 0, &handle_bytes(1), Uuid::NIL, &ctx).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
