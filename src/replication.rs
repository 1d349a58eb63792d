// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The replication tracker: owns the active/passive toggle, persists status
//! to disk and the L2 cache, performs failover, logs commit changes while
//! degraded, and orchestrates drive reinstatement.

use crate::commit_log::{delete_commit_change, list_commit_changes_oldest_first, read_commit_change, write_commit_change, CommitChangeRecord};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::fs_gateway::FsGateway;
use crate::lock::{acquire_named_lock, L2Cache, LockKey};
use crate::registry_map::RegistryMap;
use crate::uuid::Uuid;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

const REPLSTAT_FILENAME: &str = "replstat.txt";
const REPLSTAT_CACHE_KEY: &str = "infs_replstat";
const REPLSTAT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const REPLSTAT_LOCK_HOLD: Duration = Duration::from_secs(30);
const REPLSTAT_LOCK_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// The small persisted structure mirrored between disk (`replstat.txt` in
/// both base folders) and the L2 cache.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReplicationStatus {
    /// Set once a failover-qualifying error has been observed.
    pub failed_to_replicate: bool,
    /// `true` ⇒ base folder index 0 is active.
    pub active_folder_toggler: bool,
    /// Whether commit-change logging is currently active (i.e. degraded mode).
    pub log_commit_changes: bool,
}

fn read_replstat(gateway: &FsGateway, ctx: &Deadline) -> Option<(ReplicationStatus, std::time::SystemTime)> {
    let bytes = gateway.read(ctx, REPLSTAT_FILENAME).ok()?;
    let status: ReplicationStatus = serde_json::from_slice(&bytes).ok()?;
    let mtime = std::fs::metadata(gateway.base().join(REPLSTAT_FILENAME)).and_then(|m| m.modified()).ok()?;
    Some((status, mtime))
}

/// Owns the active/passive toggle for a pair of base folders.
#[derive(Clone)]
pub struct ReplicationTracker {
    folder_0: PathBuf,
    folder_1: PathBuf,
    gateway_0: FsGateway,
    gateway_1: FsGateway,
    replicate: bool,
    status: std::sync::Arc<RwLock<ReplicationStatus>>,
    last_seen_tid: std::sync::Arc<RwLock<Uuid>>,
}

impl ReplicationTracker {
    /// Builds a tracker over two base folders, reading whichever `replstat.txt`
    /// is present and newest, or leaving defaults if neither exists.
    ///
    /// # Errors
    ///
    /// This constructor does not itself fail on a missing or corrupt status
    /// file; it falls back to defaults, matching the spec's "leaves defaults"
    /// behavior for a startup-time detail that's allowed to be best-effort.
    pub fn new(folder_0: impl Into<PathBuf>, folder_1: impl Into<PathBuf>, replicate: bool) -> Result<Self> {
        let folder_0 = folder_0.into();
        let folder_1 = folder_1.into();
        let gateway_0 = FsGateway::new(&folder_0);
        let gateway_1 = FsGateway::new(&folder_1);
        let ctx = Deadline::none();

        let candidate_0 = read_replstat(&gateway_0, &ctx);
        let candidate_1 = read_replstat(&gateway_1, &ctx);

        let status = match (candidate_0, candidate_1) {
            (Some((s0, t0)), Some((s1, t1))) => {
                if t1 > t0 {
                    s1
                } else {
                    s0
                }
            }
            (Some((s0, _)), None) => s0,
            (None, Some((s1, _))) => s1,
            (None, None) => ReplicationStatus::default(),
        };

        Ok(Self {
            folder_0,
            folder_1,
            gateway_0,
            gateway_1,
            replicate,
            status: std::sync::Arc::new(RwLock::new(status)),
            last_seen_tid: std::sync::Arc::new(RwLock::new(Uuid::NIL)),
        })
    }

    /// Returns a snapshot of the current status.
    #[must_use]
    pub fn status(&self) -> ReplicationStatus {
        *self.status.read().expect("lock is poisoned")
    }

    /// Whether replication is enabled for this process.
    #[must_use]
    pub fn replicate(&self) -> bool {
        self.replicate
    }

    fn active_folder(&self) -> &Path {
        if self.status().active_folder_toggler {
            &self.folder_0
        } else {
            &self.folder_1
        }
    }

    fn passive_folder(&self) -> &Path {
        if self.status().active_folder_toggler {
            &self.folder_1
        } else {
            &self.folder_0
        }
    }

    /// Returns the gateway rooted at the currently active folder.
    #[must_use]
    pub fn active_gateway(&self) -> &FsGateway {
        if self.status().active_folder_toggler {
            &self.gateway_0
        } else {
            &self.gateway_1
        }
    }

    /// Returns the gateway rooted at the currently passive folder.
    #[must_use]
    pub fn passive_gateway(&self) -> &FsGateway {
        if self.status().active_folder_toggler {
            &self.gateway_1
        } else {
            &self.gateway_0
        }
    }

    /// Returns the absolute path of `name` under the currently active folder,
    /// tolerant of trailing separators in `name`.
    #[must_use]
    pub fn format_active_folder_entity(&self, name: &str) -> PathBuf {
        self.active_folder().join(name.trim_start_matches('/'))
    }

    /// Returns the absolute path of `name` under the currently passive folder.
    #[must_use]
    pub fn format_passive_folder_entity(&self, name: &str) -> PathBuf {
        self.passive_folder().join(name.trim_start_matches('/'))
    }

    /// Temporarily swaps which folder is "active", runs `f`, then restores
    /// the toggler — used by `Registry::replicate` to target the passive side
    /// with the ordinary active-side code path.
    pub fn with_toggled_active<T>(&self, f: impl FnOnce() -> T) -> T {
        {
            let mut status = self.status.write().expect("lock is poisoned");
            status.active_folder_toggler = !status.active_folder_toggler;
        }
        let result = f();
        {
            let mut status = self.status.write().expect("lock is poisoned");
            status.active_folder_toggler = !status.active_folder_toggler;
        }
        result
    }

    fn persist_to(&self, gateway: &FsGateway, ctx: &Deadline) -> Result<()> {
        let bytes = serde_json::to_vec(&self.status())?;
        gateway.write_atomic(ctx, REPLSTAT_FILENAME, &bytes)
    }

    fn push_to_cache<C: L2Cache>(&self, cache: &C) {
        if let Err(e) = cache.set_struct(REPLSTAT_CACHE_KEY, &self.status(), Some(REPLSTAT_CACHE_TTL)) {
            log::warn!("failed to push replication status to cache: {e:?}");
        }
    }

    fn pull_from_cache<C: L2Cache>(&self, cache: &C) -> Result<Option<ReplicationStatus>> {
        cache.get_struct(REPLSTAT_CACHE_KEY)
    }

    /// The failover protocol: flips the active folder on a qualifying error.
    ///
    /// # Errors
    ///
    /// Surfaces a persistence failure; on such failure the toggler is left
    /// unchanged so a subsequent retry may succeed.
    pub fn handle_replication_related_error<C: L2Cache>(&self, cache: &C, err: &Error, rollback_succeeded: bool, ctx: &Deadline) -> Result<()> {
        let qualifies = err.is_failover_qualified();

        if !qualifies || (rollback_succeeded && !qualifies) {
            return Ok(());
        }

        let key = LockKey {
            key: REPLSTAT_CACHE_KEY.to_owned(),
            lock_id: Uuid::NIL,
        };
        let _guard = acquire_named_lock(cache, key, REPLSTAT_LOCK_HOLD, REPLSTAT_LOCK_RETRY_TIMEOUT, ctx)?;

        if let Some(latest) = self.pull_from_cache(cache)? {
            if latest.active_folder_toggler != self.status().active_folder_toggler {
                // Someone else already flipped it.
                *self.status.write().expect("lock is poisoned") = latest;
                return Ok(());
            }
        }

        {
            let mut status = self.status.write().expect("lock is poisoned");
            status.active_folder_toggler = !status.active_folder_toggler;
            status.failed_to_replicate = true;
        }

        let new_active = self.active_gateway().clone();
        self.persist_to(&new_active, ctx)?;
        self.push_to_cache(cache);

        Ok(())
    }

    /// Idempotently marks `FailedToReplicate`, logging (not failing) on a
    /// cache push error.
    ///
    /// # Errors
    ///
    /// Surfaces a disk persistence failure.
    pub fn handle_failed_to_replicate<C: L2Cache>(&self, cache: &C, ctx: &Deadline) -> Result<()> {
        if self.status().failed_to_replicate {
            return Ok(());
        }

        if let Ok(Some(latest)) = self.pull_from_cache(cache) {
            if latest.failed_to_replicate {
                self.status.write().expect("lock is poisoned").failed_to_replicate = true;
                return Ok(());
            }
        }

        let key = LockKey {
            key: REPLSTAT_CACHE_KEY.to_owned(),
            lock_id: Uuid::NIL,
        };
        let _guard = acquire_named_lock(cache, key, REPLSTAT_LOCK_HOLD, REPLSTAT_LOCK_RETRY_TIMEOUT, ctx)?;

        if self.status().failed_to_replicate {
            return Ok(());
        }

        self.status.write().expect("lock is poisoned").failed_to_replicate = true;

        let active = self.active_gateway().clone();
        self.persist_to(&active, ctx)?;
        self.push_to_cache(cache);

        Ok(())
    }

    /// Records the last-seen transaction id, surfaced in a subsequent
    /// [`crate::Error::LockAcquisitionFailure`] should one occur.
    pub fn note_transaction(&self, tid: Uuid) {
        *self.last_seen_tid.write().expect("lock is poisoned") = tid;
    }

    /// Writes a commit-change record while degraded (`LogCommitChanges`); a
    /// no-op when logging is disabled.
    ///
    /// # Errors
    ///
    /// Propagates a write failure.
    pub fn log_commit_changes(&self, tid: Uuid, record: &CommitChangeRecord, ctx: &Deadline) -> Result<()> {
        if !self.status().log_commit_changes {
            return Ok(());
        }

        write_commit_change(self.active_gateway(), ctx, tid, record)
    }

    /// Replays a single commit-change log onto `passive_map`, returning
    /// `(found, ())` so the caller can loop until exhausted.
    ///
    /// # Errors
    ///
    /// Propagates a replay or deletion failure.
    pub fn fast_forward<C: L2Cache>(&self, cache: &C, passive_map: &RegistryMap, ctx: &Deadline) -> Result<bool> {
        let pending = list_commit_changes_oldest_first(self.active_gateway(), ctx)?;
        let Some(path) = pending.into_iter().next() else {
            return Ok(false);
        };

        let record = read_commit_change(self.active_gateway(), ctx, &path)?;

        if let Some(stores) = &record.stores {
            ensure_stores_mirrored(self.passive_gateway(), ctx, stores)?;
        }

        if !record.new_roots.is_empty() {
            passive_map.add(cache, &record.new_roots, ctx)?;
        }
        if !record.added.is_empty() {
            passive_map.add(cache, &record.added, ctx)?;
        }
        if !record.updated.is_empty() {
            passive_map.set(cache, &record.updated, ctx)?;
        }
        if !record.removed.is_empty() {
            passive_map.remove(cache, &record.removed, ctx)?;
        }

        delete_commit_change(self.active_gateway(), ctx, &path)?;

        Ok(true)
    }

    /// Clears `FailedToReplicate` and `LogCommitChanges`, persisting the
    /// healthy status to both folders.
    ///
    /// # Errors
    ///
    /// Propagates a persistence failure.
    pub fn turn_on_replication<C: L2Cache>(&self, cache: &C, ctx: &Deadline) -> Result<()> {
        {
            let mut status = self.status.write().expect("lock is poisoned");
            status.failed_to_replicate = false;
            status.log_commit_changes = false;
        }

        self.persist_to(&self.gateway_0, ctx)?;
        self.persist_to(&self.gateway_1, ctx)?;
        self.push_to_cache(cache);

        Ok(())
    }

    /// Drives drive reinstatement: copies store metadata/segments from active
    /// to passive, replays every pending commit-change log in order, then
    /// turns replication back on.
    ///
    /// Precondition: `replicate && FailedToReplicate`; violating it is a
    /// caller bug, not surfaced as an error, since callers are expected to
    /// check [`Self::status`] first.
    ///
    /// # Errors
    ///
    /// Propagates any copy, replay, or persistence failure.
    pub fn reinstate_failed_drives<C: L2Cache>(&self, cache: &C, passive_map: &RegistryMap, ctx: &Deadline) -> Result<()> {
        if !self.replicate || !self.status().failed_to_replicate {
            return Ok(());
        }

        copy_active_to_passive(self.active_gateway(), self.passive_gateway(), ctx)?;

        while self.fast_forward(cache, passive_map, ctx)? {
            ctx.check()?;
        }

        self.turn_on_replication(cache, ctx)
    }
}

const STORELIST_FILENAME: &str = "storelist.txt";

/// Ensures each of `stores` has a directory on `passive` and is present in
/// `passive`'s `storelist.txt`, as required before replaying a commit-change
/// record that touched them.
fn ensure_stores_mirrored(passive: &FsGateway, ctx: &Deadline, stores: &[String]) -> Result<()> {
    let mut names: Vec<String> = if passive.exists(STORELIST_FILENAME) {
        serde_json::from_slice(&passive.read(ctx, STORELIST_FILENAME)?)?
    } else {
        Vec::new()
    };

    let mut changed = false;
    for store in stores {
        passive.mkdir_all(ctx, store)?;
        if !names.iter().any(|n| n == store) {
            names.push(store.clone());
            changed = true;
        }
    }

    if changed {
        passive.write_atomic(ctx, STORELIST_FILENAME, &serde_json::to_vec(&names)?)?;
    }

    Ok(())
}

fn copy_active_to_passive(active: &FsGateway, passive: &FsGateway, ctx: &Deadline) -> Result<()> {
    if active.exists("storelist.txt") {
        let bytes = active.read(ctx, "storelist.txt")?;
        passive.write_atomic(ctx, "storelist.txt", &bytes)?;
    }

    for entry in active.list(ctx, ".")? {
        if !entry.is_dir() {
            continue;
        }

        let Some(store_name) = entry.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if matches!(store_name, "commitlogs" | "translogs" | "regionsignals") {
            continue;
        }

        let storeinfo_relative = Path::new(store_name).join("storeinfo.txt");
        if active.exists(&storeinfo_relative) {
            let bytes = active.read(ctx, &storeinfo_relative)?;
            passive.write_atomic(ctx, &storeinfo_relative, &bytes)?;
        }

        for table_entry in active.list(ctx, store_name)? {
            if !table_entry.is_dir() {
                continue;
            }

            let Some(table_name) = table_entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let table_relative = Path::new(store_name).join(table_name);
            for segment in active.list(ctx, &table_relative)? {
                if segment.extension().is_some_and(|ext| ext == "reg") {
                    let Some(segment_name) = segment.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let segment_relative = table_relative.join(segment_name);
                    let bytes = active.read(ctx, &segment_relative)?;
                    passive.write_atomic(ctx, &segment_relative, &bytes)?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FlakyL2Cache, InMemoryL2Cache};
    use test_log::test;

    #[test]
    fn starts_with_defaults_when_no_status_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ReplicationTracker::new(dir.path().join("a"), dir.path().join("b"), true).unwrap();
        assert_eq!(ReplicationStatus::default(), tracker.status());
    }

    #[test]
    fn picks_newer_replstat_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        std::fs::write(a.join(REPLSTAT_FILENAME), serde_json::to_vec(&ReplicationStatus {
            active_folder_toggler: true,
            ..Default::default()
        }).unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(b.join(REPLSTAT_FILENAME), serde_json::to_vec(&ReplicationStatus {
            active_folder_toggler: false,
            failed_to_replicate: true,
            ..Default::default()
        }).unwrap()).unwrap();

        let tracker = ReplicationTracker::new(a, b, true).unwrap();
        assert!(tracker.status().failed_to_replicate);
        assert!(!tracker.status().active_folder_toggler);
    }

    #[test]
    fn failover_flips_toggler_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ReplicationTracker::new(dir.path().join("a"), dir.path().join("b"), true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        let before = tracker.status().active_folder_toggler;
        tracker.handle_replication_related_error(&cache, &Error::FailoverQualified(std::io::Error::other("x")), false, &ctx).unwrap();

        assert_ne!(before, tracker.status().active_folder_toggler);
        assert!(tracker.status().failed_to_replicate);
        assert!(tracker.active_gateway().exists(REPLSTAT_FILENAME));
    }

    #[test]
    fn non_qualifying_error_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ReplicationTracker::new(dir.path().join("a"), dir.path().join("b"), true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();

        let before = tracker.status();
        tracker.handle_replication_related_error(&cache, &Error::NotFound, false, &ctx).unwrap();
        assert_eq!(before, tracker.status());
    }

    #[test]
    fn fast_forward_is_idempotent_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ReplicationTracker::new(dir.path().join("a"), dir.path().join("b"), true).unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        let passive_map = RegistryMap::new(dir.path().join("b"), 250, Duration::from_secs(1));

        assert!(!tracker.fast_forward(&cache, &passive_map, &ctx).unwrap());
    }

    #[test]
    fn handle_failed_to_replicate_tolerates_a_flaky_cache_read() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ReplicationTracker::new(dir.path().join("a"), dir.path().join("b"), true).unwrap();
        let cache = FlakyL2Cache::new(InMemoryL2Cache::new());
        let ctx = Deadline::none();

        // The cache-read check at the top of the call fails once; the status
        // must still end up marked and persisted to disk.
        tracker.handle_failed_to_replicate(&cache, &ctx).unwrap();

        assert!(tracker.status().failed_to_replicate);
        assert!(tracker.active_gateway().exists(REPLSTAT_FILENAME));
    }
}
