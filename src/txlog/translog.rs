// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only per-transaction logs, bucketed by hour of last write so a
//! background cleaner can claim and process one completed hour at a time.

use super::base64_bytes;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::fs_gateway::FsGateway;
use crate::lock::{acquire_named_lock, L2Cache, LockKey};
use crate::uuid::Uuid;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TRANSLOG_DIR: &str = "translogs";

/// An hour bucket is only eligible for cleanup once it's been closed for
/// this long, so a still-being-written transaction is never claimed.
pub const HOUR_SETTLE_DURATION: Duration = Duration::from_secs(70 * 60);

/// `GetOneOfHour` refuses hours older than this, bounding how far back a
/// cleanup processor may reach.
pub const MAX_HOUR_LOOKBACK: Duration = Duration::from_secs(4 * 60 * 60);

/// TTL of the single-slot hour-bucket claim lock.
pub const HOUR_LOCK_TTL: Duration = Duration::from_secs(7 * 60 * 60);

const HOUR_LOCK_KEY: &str = "infs_hourlock";
const HOUR_LOCK_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// One JSON-encoded line in a transaction log.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TransactionRecord {
    /// The commit-function code identifying how to interpret `value`.
    #[serde(rename = "Key")]
    pub func_code: i32,
    /// The record payload.
    #[serde(rename = "Value", with = "base64_bytes")]
    pub value: Vec<u8>,
}

fn log_relative(tid: Uuid) -> PathBuf {
    PathBuf::from(TRANSLOG_DIR).join(format!("{tid}.log"))
}

/// Appends one record to `<active>/translogs/<tid>.log`, creating it on the
/// transaction's first call.
///
/// # Errors
///
/// Propagates filesystem and JSON-encoding errors.
pub fn add(gateway: &FsGateway, ctx: &Deadline, tid: Uuid, func_code: i32, payload: &[u8]) -> Result<()> {
    let record = TransactionRecord {
        func_code,
        value: payload.to_vec(),
    };
    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');
    gateway.append(ctx, log_relative(tid), &line)
}

fn hour_bucket(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / 3600
}

fn tid_from_log_path(path: &std::path::Path) -> Option<Uuid> {
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse(stem).ok()
}

fn parse_records(bytes: &[u8]) -> Result<Vec<TransactionRecord>> {
    bytes
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(Error::from))
        .collect()
}

/// Claims and reads the oldest settled hour bucket's transaction log, under a
/// single-slot cross-process lock.
///
/// # Errors
///
/// Propagates a lock-acquisition or filesystem failure. Returns `Ok(None)`
/// when nothing is eligible yet.
pub fn get_one<C: L2Cache>(gateway: &FsGateway, cache: &C, ctx: &Deadline) -> Result<Option<(Uuid, String, Vec<TransactionRecord>)>> {
    let key = LockKey {
        key: HOUR_LOCK_KEY.to_owned(),
        lock_id: Uuid::NIL,
    };
    let _guard = acquire_named_lock(cache, key, HOUR_LOCK_TTL, HOUR_LOCK_RETRY_TIMEOUT, ctx)?;

    let entries = gateway.list(ctx, TRANSLOG_DIR)?;
    let now = SystemTime::now();

    let mut eligible: Vec<(std::path::PathBuf, SystemTime)> = entries
        .into_iter()
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|p| {
            let mtime = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            let age = now.duration_since(mtime).unwrap_or_default();
            (age >= HOUR_SETTLE_DURATION).then_some((p, mtime))
        })
        .collect();

    eligible.sort_by_key(|(_, mtime)| *mtime);

    let Some((path, mtime)) = eligible.into_iter().next() else {
        return Ok(None);
    };

    let Some(tid) = tid_from_log_path(&path) else {
        return Ok(None);
    };

    let relative = path.strip_prefix(gateway.base()).unwrap_or(&path);
    let bytes = gateway.read(ctx, relative)?;
    let records = parse_records(&bytes)?;

    Ok(Some((tid, hour_bucket(mtime).to_string(), records)))
}

/// Like [`get_one`], but for a caller that already knows which hour bucket it
/// wants to claim (used by a resuming cleanup processor).
///
/// # Errors
///
/// Returns [`Error::Corrupt`] if `hour` is more than
/// [`MAX_HOUR_LOOKBACK`] in the past.
pub fn get_one_of_hour<C: L2Cache>(gateway: &FsGateway, cache: &C, ctx: &Deadline, hour: u64) -> Result<Option<(Uuid, String, Vec<TransactionRecord>)>> {
    let current_hour = hour_bucket(SystemTime::now());
    let lookback_hours = MAX_HOUR_LOOKBACK.as_secs() / 3600;

    if current_hour.saturating_sub(hour) > lookback_hours {
        return Err(Error::Corrupt("requested hour is too far in the past to process"));
    }

    get_one(gateway, cache, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryL2Cache;
    use test_log::test;

    #[test]
    fn add_then_read_back_raw() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();
        let tid = Uuid::new(1, 1);

        add(&gateway, &ctx, tid, 7, b"payload").unwrap();

        let bytes = gateway.read(&ctx, log_relative(tid)).unwrap();
        let records = parse_records(&bytes).unwrap();
        assert_eq!(1, records.len());
        assert_eq!(7, records[0].func_code);
        assert_eq!(b"payload".to_vec(), records[0].value);
    }

    #[test]
    fn get_one_skips_fresh_logs() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        add(&gateway, &ctx, Uuid::new(2, 2), 1, b"x").unwrap();

        assert!(get_one(&gateway, &cache, &ctx).unwrap().is_none());
    }

    #[test]
    fn get_one_of_hour_rejects_stale_hour() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        let err = get_one_of_hour(&gateway, &cache, &ctx, 0).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
