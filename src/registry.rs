// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The registry: composes the registry map with L2-cache-backed read-through
//! and write-through, exposing Get/Add/Update/UpdateNoLocks/Remove/Replicate
//! over batches of handles grouped by table.

use crate::deadline::Deadline;
use crate::error::Result;
use crate::handle::Handle;
use crate::lock::{acquire_named_lock, L2Cache, LockKey};
use crate::registry_map::{RegistryMap, TablePayload};
use crate::replication::ReplicationTracker;
use crate::uuid::Uuid;
use std::time::Duration;

/// TTL of a per-id coordination lock taken around `Add`/`Update`.
pub const PER_ID_LOCK_DURATION: Duration = Duration::from_secs(60);

/// How long a caller retries for a per-id lock before giving up.
pub const PER_ID_LOCK_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

fn handle_cache_key(table: &str, id: &Uuid) -> String {
    format!("infs_handle_{table}_{id}")
}

/// Composes a [`RegistryMap`] with an [`L2Cache`] and a [`ReplicationTracker`].
#[derive(Clone)]
pub struct Registry<C: L2Cache> {
    map: RegistryMap,
    cache: C,
    tracker: ReplicationTracker,
}

impl<C: L2Cache> Registry<C> {
    /// Builds a registry over `map`, read/write-through `cache`, and `tracker`.
    #[must_use]
    pub fn new(map: RegistryMap, cache: C, tracker: ReplicationTracker) -> Self {
        Self { map, cache, tracker }
    }

    /// Resolves each requested id, preferring a fresh cache entry and falling
    /// back to disk on a miss or stale entry. Cache errors are logged as
    /// warnings and never fail the call.
    ///
    /// # Errors
    ///
    /// Propagates a disk-read failure from the registry map.
    pub fn get(&self, payload: &[TablePayload], ctx: &Deadline) -> Result<Vec<TablePayload>> {
        let mut out = Vec::with_capacity(payload.len());

        for group in payload {
            let mut handles = Vec::with_capacity(group.handles.len());

            for requested in &group.handles {
                let key = handle_cache_key(&group.table, &requested.logical_id);

                let cached = match self.cache.is_cache_ttl(&key) {
                    Ok(true) => self.cache.get_struct::<Handle>(&key).unwrap_or_else(|e| {
                        log::warn!("cache get for {key} failed: {e:?}");
                        None
                    }),
                    Ok(false) => None,
                    Err(e) => {
                        log::warn!("cache TTL check for {key} failed: {e:?}");
                        None
                    }
                };

                if let Some(handle) = cached {
                    handles.push(handle);
                    continue;
                }

                let disk_group = vec![TablePayload {
                    table: group.table.clone(),
                    handles: vec![requested.clone()],
                }];
                let fetched = self.map.fetch(&self.cache, &disk_group, ctx)?;

                if let Some(handle) = fetched.into_iter().flat_map(|g| g.handles).next() {
                    if let Err(e) = self.cache.set_struct(&key, &handle, None) {
                        log::warn!("cache set for {key} failed: {e:?}");
                    }
                    handles.push(handle);
                }
            }

            out.push(TablePayload {
                table: group.table.clone(),
                handles,
            });
        }

        Ok(out)
    }

    fn per_id_lock_key(id: &Uuid) -> LockKey {
        LockKey::for_logical_id(id)
    }

    fn evict(&self, table: &str, id: &Uuid) {
        let key = handle_cache_key(table, id);
        if let Err(e) = self.cache.delete(&key) {
            log::warn!("cache evict for {key} failed: {e:?}");
        }
    }

    /// Adds each handle under a per-id coordination lock.
    ///
    /// # Errors
    ///
    /// Returns the lock-acquisition failure if a per-id lock can't be taken
    /// (and evicts any stale cache entry for that id), or a registry-map error.
    pub fn add(&self, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        for group in payload {
            for handle in &group.handles {
                let guard = acquire_named_lock(&self.cache, Self::per_id_lock_key(&handle.logical_id), PER_ID_LOCK_DURATION, PER_ID_LOCK_RETRY_TIMEOUT, ctx);

                let _guard = match guard {
                    Ok(g) => g,
                    Err(e) => {
                        self.evict(&group.table, &handle.logical_id);
                        return Err(e);
                    }
                };

                let singleton = vec![TablePayload {
                    table: group.table.clone(),
                    handles: vec![handle.clone()],
                }];
                self.map.add(&self.cache, &singleton, ctx)?;
            }
        }

        Ok(())
    }

    /// Updates each handle under a per-id coordination lock.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add`].
    pub fn update(&self, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        for group in payload {
            for handle in &group.handles {
                let guard = acquire_named_lock(&self.cache, Self::per_id_lock_key(&handle.logical_id), PER_ID_LOCK_DURATION, PER_ID_LOCK_RETRY_TIMEOUT, ctx);

                let _guard = match guard {
                    Ok(g) => g,
                    Err(e) => {
                        self.evict(&group.table, &handle.logical_id);
                        return Err(e);
                    }
                };

                let singleton = vec![TablePayload {
                    table: group.table.clone(),
                    handles: vec![handle.clone()],
                }];
                self.map.set(&self.cache, &singleton, ctx)?;
            }
        }

        Ok(())
    }

    /// Updates without taking per-id locks, writing straight through `set`.
    ///
    /// # Errors
    ///
    /// Propagates a registry-map error; a post-success cache-set failure is
    /// logged and ignored.
    pub fn update_no_locks(&self, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        self.map.set(&self.cache, payload, ctx)?;

        for group in payload {
            for handle in &group.handles {
                let key = handle_cache_key(&group.table, &handle.logical_id);
                if let Err(e) = self.cache.set_struct(&key, handle, None) {
                    log::warn!("cache set for {key} failed: {e:?}");
                }
            }
        }

        Ok(())
    }

    /// Removes each handle, best-effort evicting its cache entry afterward.
    ///
    /// # Errors
    ///
    /// Propagates a registry-map error.
    pub fn remove(&self, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        self.map.remove(&self.cache, payload, ctx)?;

        for group in payload {
            for handle in &group.handles {
                self.evict(&group.table, &handle.logical_id);
            }
        }

        Ok(())
    }

    /// Applies `new_roots`/`added`/`updated`/`removed` to the passive side, a
    /// no-op when replication is disabled or already degraded.
    ///
    /// # Errors
    ///
    /// Returns the first error seen; the tracker is told to mark
    /// `FailedToReplicate` regardless of which step failed.
    pub fn replicate(
        &self,
        new_roots: &[TablePayload],
        added: &[TablePayload],
        updated: &[TablePayload],
        removed: &[TablePayload],
        ctx: &Deadline,
    ) -> Result<()> {
        if !self.tracker.replicate() || self.tracker.status().failed_to_replicate {
            return Ok(());
        }

        let result = self.tracker.with_toggled_active(|| -> Result<()> {
            let passive_map = RegistryMap::new(self.tracker.active_gateway().base(), self.hash_mod_value_hint(), self.lock_duration_hint());

            passive_map.add(&self.cache, new_roots, ctx)?;
            passive_map.add(&self.cache, added, ctx)?;
            passive_map.set(&self.cache, updated, ctx)?;
            passive_map.remove(&self.cache, removed, ctx)?;

            passive_map.close()
        });

        if let Err(ref e) = result {
            log::warn!("replicate failed, marking FailedToReplicate: {e:?}");
            if let Err(mark_err) = self.tracker.handle_failed_to_replicate(&self.cache, ctx) {
                log::warn!("failed to mark FailedToReplicate after replicate error: {mark_err:?}");
            }
        }

        result
    }

    fn hash_mod_value_hint(&self) -> u64 {
        // The passive-side registry map must agree with the active side's
        // hash-mod value; callers construct `Registry` with a `RegistryMap`
        // already configured for the shared value, so reuse it here too.
        self.map.hash_mod_value()
    }

    fn lock_duration_hint(&self) -> Duration {
        self.map.lock_duration()
    }

    /// Returns a reference to the underlying registry map.
    #[must_use]
    pub fn map(&self) -> &RegistryMap {
        &self.map
    }

    /// Returns a reference to the replication tracker this registry uses.
    #[must_use]
    pub fn tracker(&self) -> &ReplicationTracker {
        &self.tracker
    }
}
