// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A thin layer over the hashmap implementing add/set/remove/fetch batched by
//! registry table, with the duplicate/mismatch error handling the registry
//! itself relies on.

use crate::block_region::{mark_delete, update_file_block_region};
use crate::coding::Encode;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::hashmap::{Hashmap, HashmapRegistry};
use crate::lock::L2Cache;
use crate::uuid::Uuid;
use std::path::Path;
use std::time::Duration;

/// One table's worth of handles to add/set/remove/fetch in a single call.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TablePayload {
    /// The registry table name these handles belong to.
    pub table: String,
    /// The handles themselves.
    pub handles: Vec<Handle>,
}

/// Composes [`Hashmap`]s (one per table) with the block-region update engine.
#[derive(Clone)]
pub struct RegistryMap {
    base: std::path::PathBuf,
    hash_mod_value: u64,
    lock_duration: Duration,
    hashmaps: std::sync::Arc<HashmapRegistry>,
}

impl RegistryMap {
    /// Creates a registry map rooted at `base`, using `hash_mod_value` for
    /// every table it opens.
    #[must_use]
    pub fn new(base: impl Into<std::path::PathBuf>, hash_mod_value: u64, lock_duration: Duration) -> Self {
        Self {
            base: base.into(),
            hash_mod_value,
            lock_duration,
            hashmaps: std::sync::Arc::new(HashmapRegistry::new()),
        }
    }

    fn hashmap_for(&self, table: &str) -> Hashmap {
        self.hashmaps.get_or_open(&self.base, table, self.hash_mod_value)
    }

    /// Adds every handle in every payload, locating-or-creating its ideal
    /// region and splicing it in.
    ///
    /// # Errors
    ///
    /// Fails a given handle with [`Error::AddMismatch`] if its target slot is
    /// already occupied by a different logical ID; other errors propagate
    /// from the hashmap/block-region layers. Earlier handles in the batch are
    /// not rolled back on a later failure.
    pub fn add<C: L2Cache>(&self, cache: &C, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        for group in payload {
            let hashmap = self.hashmap_for(&group.table);

            for handle in &group.handles {
                let frd = hashmap.find_one_file_region(cache, true, &handle.logical_id, ctx)?;

                if let Some(existing) = &frd.handle {
                    if existing.logical_id != handle.logical_id && !existing.is_empty() {
                        return Err(Error::AddMismatch);
                    }
                }

                let filename = hashmap.filename_for(&frd);
                let bytes = handle.encode_into_vec()?;

                hashmap.with_region_file(&frd, |file| {
                    update_file_block_region(
                        cache,
                        file,
                        &filename,
                        self.lock_duration,
                        frd.block_offset,
                        frd.slot_offset,
                        &bytes,
                        Uuid::NIL,
                        ctx,
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Overwrites each handle's region, failing on a logical-ID mismatch at
    /// the located slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogicalIdMismatch`] if the slot found for a handle's
    /// id is non-empty and holds a different id.
    pub fn set<C: L2Cache>(&self, cache: &C, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        for group in payload {
            let hashmap = self.hashmap_for(&group.table);

            for handle in &group.handles {
                let frd = hashmap.find_one_file_region(cache, true, &handle.logical_id, ctx)?;

                if let Some(existing) = &frd.handle {
                    if !existing.is_empty() && existing.logical_id != handle.logical_id {
                        return Err(Error::LogicalIdMismatch);
                    }
                }

                let filename = hashmap.filename_for(&frd);
                let bytes = handle.encode_into_vec()?;

                hashmap.with_region_file(&frd, |file| {
                    update_file_block_region(
                        cache,
                        file,
                        &filename,
                        self.lock_duration,
                        frd.block_offset,
                        frd.slot_offset,
                        &bytes,
                        Uuid::NIL,
                        ctx,
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Zeroes each id's region, failing if it's already empty or held by a
    /// different logical ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingItem`] for an already-empty slot, or
    /// [`Error::LogicalIdMismatch`] for a slot held by a different id.
    pub fn remove<C: L2Cache>(&self, cache: &C, payload: &[TablePayload], ctx: &Deadline) -> Result<()> {
        for group in payload {
            let hashmap = self.hashmap_for(&group.table);

            for handle in &group.handles {
                let frd = match hashmap.find_one_file_region(cache, false, &handle.logical_id, ctx) {
                    Ok(frd) => frd,
                    Err(Error::NotFound) => return Err(Error::MissingItem),
                    Err(e) => return Err(e),
                };

                match &frd.handle {
                    None => return Err(Error::MissingItem),
                    Some(existing) if existing.is_empty() => return Err(Error::MissingItem),
                    Some(existing) if existing.logical_id != handle.logical_id => return Err(Error::LogicalIdMismatch),
                    Some(_) => {}
                }

                let filename = hashmap.filename_for(&frd);

                hashmap.with_region_file(&frd, |file| {
                    mark_delete(cache, file, &filename, self.lock_duration, frd.block_offset, frd.slot_offset, Uuid::NIL, ctx)
                })?;
            }
        }

        Ok(())
    }

    /// Resolves handles per request, table-by-table in input order.
    ///
    /// # Errors
    ///
    /// Propagates any non-not-found error from the hashmap layer.
    pub fn fetch<C: L2Cache>(&self, cache: &C, payload: &[TablePayload], ctx: &Deadline) -> Result<Vec<TablePayload>> {
        let mut out = Vec::with_capacity(payload.len());

        for group in payload {
            let hashmap = self.hashmap_for(&group.table);
            let ids: Vec<Uuid> = group.handles.iter().map(|h| h.logical_id).collect();
            let handles = hashmap.fetch(cache, &ids, ctx)?;
            out.push(TablePayload {
                table: group.table.clone(),
                handles,
            });
        }

        Ok(out)
    }

    /// Closes every table's hashmap opened so far.
    ///
    /// # Errors
    ///
    /// Returns the last error seen while closing, if any.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Returns the base directory this registry map is rooted at.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the hash-mod value every table under this registry map uses.
    #[must_use]
    pub fn hash_mod_value(&self) -> u64 {
        self.hash_mod_value
    }

    /// Returns the block-region lock hold duration this registry map uses.
    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryL2Cache;
    use test_log::test;

    fn handle(id: Uuid) -> Handle {
        Handle {
            logical_id: id,
            version: 1,
            flags: 0,
            physical_id: Uuid::new(7, 7),
            physical_id_backup: Uuid::NIL,
        }
    }

    fn payload(table: &str, handles: Vec<Handle>) -> Vec<TablePayload> {
        vec![TablePayload {
            table: table.to_owned(),
            handles,
        }]
    }

    #[test]
    fn add_then_fetch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        let map = RegistryMap::new(dir.path(), 250, Duration::from_secs(1));

        let id = Uuid::new(1, 2);
        let h = handle(id);
        map.add(&cache, &payload("regtest", vec![h]), &ctx).unwrap();

        let fetched = map.fetch(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        assert_eq!(1, fetched[0].handles.len());
        assert_eq!(id, fetched[0].handles[0].logical_id);
    }

    #[test]
    fn remove_missing_item_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        let map = RegistryMap::new(dir.path(), 250, Duration::from_secs(1));

        let err = map.remove(&cache, &payload("regtest", vec![handle(Uuid::new(3, 3))]), &ctx).unwrap_err();
        assert!(matches!(err, Error::MissingItem));
    }

    #[test]
    fn remove_then_get_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        let map = RegistryMap::new(dir.path(), 250, Duration::from_secs(1));

        let id = Uuid::new(5, 6);
        map.add(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        map.remove(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();

        let fetched = map.fetch(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        assert!(fetched[0].handles.is_empty());
    }

    #[test]
    fn remove_after_add_then_readd_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryL2Cache::new();
        let ctx = Deadline::none();
        let map = RegistryMap::new(dir.path(), 250, Duration::from_secs(1));

        let id = Uuid::new(8, 8);
        map.add(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        map.remove(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        map.add(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();

        let fetched = map.fetch(&cache, &payload("regtest", vec![handle(id)]), &ctx).unwrap();
        assert_eq!(1, fetched[0].handles.len());
    }
}
