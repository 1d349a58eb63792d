// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-transaction commit-change logs, written while replication is
//! degraded and replayed onto the passive side during reinstatement.

use crate::deadline::Deadline;
use crate::error::Result;
use crate::fs_gateway::FsGateway;
use crate::registry_map::TablePayload;
use crate::uuid::Uuid;
use std::path::{Path, PathBuf};

/// One commit's worth of registry mutations, as persisted under
/// `<active>/commitlogs/<tid>.log`.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct CommitChangeRecord {
    /// Store directories touched by this commit, if any (`None` skips
    /// store-list mirroring during replay).
    pub stores: Option<Vec<String>>,
    /// New root handles, applied as adds.
    pub new_roots: Vec<TablePayload>,
    /// Newly added handles, applied as adds.
    pub added: Vec<TablePayload>,
    /// Updated handles, applied as in-place sets.
    pub updated: Vec<TablePayload>,
    /// Removed handles, applied as deletions.
    pub removed: Vec<TablePayload>,
}

const COMMIT_LOG_DIR: &str = "commitlogs";

fn commit_log_relative_path(tid: Uuid) -> PathBuf {
    Path::new(COMMIT_LOG_DIR).join(format!("{tid}.log"))
}

/// Writes one commit-change record under `<active>/commitlogs/<tid>.log`.
///
/// # Errors
///
/// Propagates filesystem and JSON-encoding errors.
pub fn write_commit_change(gateway: &FsGateway, ctx: &Deadline, tid: Uuid, record: &CommitChangeRecord) -> Result<()> {
    let bytes = serde_json::to_vec(record)?;
    gateway.write_atomic(ctx, commit_log_relative_path(tid), &bytes)
}

/// Lists every pending commit-change log under `<active>/commitlogs/`, sorted
/// by modification time (oldest first), as required for replay ordering.
///
/// # Errors
///
/// Propagates filesystem errors.
pub fn list_commit_changes_oldest_first(gateway: &FsGateway, ctx: &Deadline) -> Result<Vec<PathBuf>> {
    let mut entries = gateway.list(ctx, COMMIT_LOG_DIR)?;
    entries.retain(|p| p.extension().is_some_and(|ext| ext == "log"));
    entries.sort_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
    Ok(entries)
}

/// Reads and decodes one commit-change log.
///
/// # Errors
///
/// Propagates filesystem and JSON-decoding errors.
pub fn read_commit_change(gateway: &FsGateway, ctx: &Deadline, path: &Path) -> Result<CommitChangeRecord> {
    let relative = path.strip_prefix(gateway.base()).unwrap_or(path);
    let bytes = gateway.read(ctx, relative)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Deletes a commit-change log after it has been successfully replayed.
///
/// # Errors
///
/// Propagates filesystem errors.
pub fn delete_commit_change(gateway: &FsGateway, ctx: &Deadline, path: &Path) -> Result<()> {
    let relative = path.strip_prefix(gateway.base()).unwrap_or(path);
    gateway.remove(ctx, relative)
}
