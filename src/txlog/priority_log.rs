// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Priority logs (`.plg`, with a `.plb` backup variant): opaque marshaled
//! payloads used to guide prioritized recovery/rollback.

use crate::deadline::Deadline;
use crate::error::Result;
use crate::fs_gateway::FsGateway;
use crate::uuid::Uuid;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

const TRANSLOG_DIR: &str = "translogs";

/// Minimum age before a `.plg` entry is eligible for `get_batch`, unless the
/// caller's context asks to ignore age.
pub const PRIORITY_LOG_MIN_AGE: Duration = Duration::from_secs(5 * 60);

/// Default batch size for `get_batch` when the caller passes `0` or less.
pub const DEFAULT_BATCH_SIZE: usize = 25;

fn plg_relative(tid: Uuid) -> PathBuf {
    PathBuf::from(TRANSLOG_DIR).join(format!("{tid}.plg"))
}

fn plb_relative(tid: Uuid) -> PathBuf {
    PathBuf::from(TRANSLOG_DIR).join(format!("{tid}.plb"))
}

/// Writes a priority-log payload for `tid`.
///
/// # Errors
///
/// Propagates a filesystem failure.
pub fn write(gateway: &FsGateway, ctx: &Deadline, tid: Uuid, payload: &[u8]) -> Result<()> {
    gateway.write_atomic(ctx, plg_relative(tid), payload)
}

/// Writes the `.plb` backup variant for `tid`.
///
/// # Errors
///
/// Propagates a filesystem failure.
pub fn write_backup(gateway: &FsGateway, ctx: &Deadline, tid: Uuid, payload: &[u8]) -> Result<()> {
    gateway.write_atomic(ctx, plb_relative(tid), payload)
}

/// Returns up to `batch_size` oldest `.plg` entries, filtered by
/// [`PRIORITY_LOG_MIN_AGE`] unless `ignore_age` is set (the equivalent of the
/// spec's `ContextPriorityLogIgnoreAge` context flag).
///
/// `batch_size <= 0` (passed as `0`) defaults to [`DEFAULT_BATCH_SIZE`].
///
/// # Errors
///
/// Propagates a filesystem failure.
pub fn get_batch(gateway: &FsGateway, ctx: &Deadline, batch_size: usize, ignore_age: bool) -> Result<Vec<(Uuid, Vec<u8>)>> {
    let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };

    let entries = gateway.list(ctx, TRANSLOG_DIR)?;
    let now = SystemTime::now();

    let mut candidates: Vec<(std::path::PathBuf, SystemTime)> = entries
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "plg"))
        .filter_map(|p| {
            let mtime = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            if ignore_age || now.duration_since(mtime).unwrap_or_default() >= PRIORITY_LOG_MIN_AGE {
                Some((p, mtime))
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by_key(|(_, mtime)| *mtime);
    candidates.truncate(batch_size);

    let mut out = Vec::with_capacity(candidates.len());
    for (path, _) in candidates {
        let Some(tid) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| Uuid::parse(s).ok()) else {
            continue;
        };
        let relative = path.strip_prefix(gateway.base()).unwrap_or(&path);
        let bytes = gateway.read(ctx, relative)?;
        out.push((tid, bytes));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn write_then_get_batch_with_ignore_age() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();
        let tid = Uuid::new(1, 1);

        write(&gateway, &ctx, tid, b"payload").unwrap();

        let batch = get_batch(&gateway, &ctx, 0, true).unwrap();
        assert_eq!(1, batch.len());
        assert_eq!(tid, batch[0].0);
        assert_eq!(b"payload".to_vec(), batch[0].1);
    }

    #[test]
    fn fresh_entries_excluded_without_ignore_age() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();

        write(&gateway, &ctx, Uuid::new(2, 2), b"x").unwrap();

        assert!(get_batch(&gateway, &ctx, 0, false).unwrap().is_empty());
    }

    #[test]
    fn batch_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();

        for i in 0..5 {
            write(&gateway, &ctx, Uuid::new(i, i), b"x").unwrap();
        }

        assert_eq!(3, get_batch(&gateway, &ctx, 3, true).unwrap().len());
    }
}
