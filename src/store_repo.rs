// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persists the store list, each store's metadata, and the shared registry
//! hash-mod value; can mirror the active side's artifacts to passive.

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::fs_gateway::FsGateway;
use crate::lock::L2Cache;
use crate::replication::ReplicationTracker;
use std::path::Path;
use std::time::Duration;

const STORELIST_FILENAME: &str = "storelist.txt";
const REGHASHMOD_FILENAME: &str = "reghashmod.txt";
const STOREINFO_FILENAME: &str = "storeinfo.txt";
const STOREINFO_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Per-store metadata persisted as `<base>/<storeName>/storeinfo.txt`.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct StoreInfo {
    /// The store's name (redundant with its directory, kept for self-description).
    pub name: String,
    /// Approximate item count, adjusted by `Update`'s `count_delta`.
    pub count: i64,
}

fn storeinfo_cache_key(store_name: &str) -> String {
    format!("infs_storeinfo_{store_name}")
}

fn storeinfo_relative(name: &str) -> std::path::PathBuf {
    Path::new(name).join(STOREINFO_FILENAME)
}

/// Manages `storelist.txt`, each store's `storeinfo.txt`, and `reghashmod.txt`,
/// always reading/writing through whichever folder the tracker currently
/// considers active.
pub struct StoreRepository<C: L2Cache> {
    tracker: ReplicationTracker,
    cache: C,
    default_hash_mod_value: u64,
}

impl<C: L2Cache> StoreRepository<C> {
    /// Builds a store repository over `tracker`'s active/passive folders.
    #[must_use]
    pub fn new(tracker: ReplicationTracker, cache: C, default_hash_mod_value: u64) -> Self {
        Self {
            tracker,
            cache,
            default_hash_mod_value,
        }
    }

    fn active(&self) -> &FsGateway {
        self.tracker.active_gateway()
    }

    /// Reads the persisted store list, or an empty list if absent.
    ///
    /// # Errors
    ///
    /// Propagates a read or JSON-decode failure (other than "file absent").
    pub fn list(&self, ctx: &Deadline) -> Result<Vec<String>> {
        if !self.active().exists(STORELIST_FILENAME) {
            return Ok(Vec::new());
        }
        let bytes = self.active().read(ctx, STORELIST_FILENAME)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_list(&self, ctx: &Deadline, names: &[String]) -> Result<()> {
        let bytes = serde_json::to_vec(names)?;
        self.active().write_atomic(ctx, STORELIST_FILENAME, &bytes)
    }

    /// Adds a new store: appends its name to the store list and writes its
    /// initial `storeinfo.txt`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if `name` is already present.
    pub fn add(&self, ctx: &Deadline, name: &str) -> Result<()> {
        let mut names = self.list(ctx)?;
        if names.iter().any(|n| n == name) {
            return Err(Error::AlreadyExists);
        }
        names.push(name.to_owned());
        self.write_list(ctx, &names)?;

        let info = StoreInfo {
            name: name.to_owned(),
            count: 0,
        };
        self.write_storeinfo(ctx, name, &info)
    }

    fn write_storeinfo(&self, ctx: &Deadline, name: &str, info: &StoreInfo) -> Result<()> {
        let bytes = serde_json::to_vec(info)?;
        self.active().write_atomic(ctx, storeinfo_relative(name), &bytes)
    }

    /// Reads a single store's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the store doesn't exist.
    pub fn get_storeinfo(&self, ctx: &Deadline, name: &str) -> Result<StoreInfo> {
        if !self.active().exists(storeinfo_relative(name)) {
            return Err(Error::NotFound);
        }
        let bytes = self.active().read(ctx, storeinfo_relative(name))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reads `reghashmod.txt`, seeding it with `default_hash_mod_value` on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] if the file's contents aren't a valid
    /// decimal integer.
    pub fn get_registry_hash_mod_value(&self, ctx: &Deadline) -> Result<u64> {
        if !self.active().exists(REGHASHMOD_FILENAME) {
            self.active()
                .write_atomic(ctx, REGHASHMOD_FILENAME, self.default_hash_mod_value.to_string().as_bytes())?;
            return Ok(self.default_hash_mod_value);
        }

        let bytes = self.active().read(ctx, REGHASHMOD_FILENAME)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| Error::Corrupt("reghashmod.txt is not valid UTF-8"))?;
        text.trim().parse::<u64>().map_err(|_| Error::Corrupt("reghashmod.txt is not a valid integer"))
    }

    /// Batches `count_delta` into in-place updates of each named store's
    /// `storeinfo.txt`. On any read or write failure, previously-written
    /// stores in this batch are restored from their saved pre-images.
    ///
    /// # Errors
    ///
    /// Returns the triggering read/write/marshal error after rolling back.
    pub fn update(&self, ctx: &Deadline, deltas: &[(String, i64)]) -> Result<()> {
        let mut pre_images = Vec::with_capacity(deltas.len());
        let mut failure = None;

        for (name, delta) in deltas {
            let before = match self.get_storeinfo(ctx, name) {
                Ok(before) => before,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let after = StoreInfo {
                name: before.name.clone(),
                count: before.count + delta,
            };

            if let Err(e) = self.write_storeinfo(ctx, name, &after) {
                failure = Some(e);
                break;
            }

            pre_images.push((name.clone(), before));

            if let Err(e) = self.cache.set_struct(&storeinfo_cache_key(name), &after, Some(STOREINFO_CACHE_TTL)) {
                log::warn!("failed to push storeinfo for {name} to cache: {e:?}");
            }
        }

        if let Some(e) = failure {
            for (restored_name, restored_info) in &pre_images {
                if let Err(undo_err) = self.write_storeinfo(ctx, restored_name, restored_info) {
                    log::warn!("failed to restore storeinfo for {restored_name} during rollback: {undo_err:?}");
                }
            }
            return Err(e);
        }

        Ok(())
    }

    /// Mirrors the store list, every store's `storeinfo.txt`, and every
    /// registry table's `.reg` segments from the currently active side to the
    /// other side.
    ///
    /// # Errors
    ///
    /// Propagates any read/list/write failure.
    pub fn copy_to_passive_folders(&self, ctx: &Deadline) -> Result<()> {
        let active = self.active().clone();
        let passive = self.tracker.passive_gateway().clone();

        let names = self.list(ctx)?;
        let bytes = serde_json::to_vec(&names)?;
        passive.write_atomic(ctx, STORELIST_FILENAME, &bytes)?;

        for name in &names {
            if active.exists(storeinfo_relative(name)) {
                let bytes = active.read(ctx, storeinfo_relative(name))?;
                passive.write_atomic(ctx, storeinfo_relative(name), &bytes)?;
            }

            for table_entry in active.list(ctx, name)? {
                if !table_entry.is_dir() {
                    continue;
                }
                let Some(table_name) = table_entry.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                let table_relative = Path::new(name).join(table_name);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryL2Cache;
    use test_log::test;

    fn repo(dir: &Path) -> StoreRepository<InMemoryL2Cache> {
        let tracker = ReplicationTracker::new(dir.join("a"), dir.join("b"), false).unwrap();
        StoreRepository::new(tracker, InMemoryL2Cache::new(), 250)
    }

    #[test]
    fn add_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        repo.add(&ctx, "regtest").unwrap();
        assert_eq!(vec!["regtest".to_owned()], repo.list(&ctx).unwrap());
    }

    #[test]
    fn duplicate_add_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        repo.add(&ctx, "regtest").unwrap();
        let err = repo.add(&ctx, "regtest").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn hash_mod_value_seeded_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        assert_eq!(250, repo.get_registry_hash_mod_value(&ctx).unwrap());
    }

    #[test]
    fn update_adjusts_count() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        repo.add(&ctx, "regtest").unwrap();
        repo.update(&ctx, &[("regtest".to_owned(), 5)]).unwrap();

        assert_eq!(5, repo.get_storeinfo(&ctx, "regtest").unwrap().count);
    }

    #[test]
    fn update_rolls_back_on_failure_of_unknown_store() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        repo.add(&ctx, "regtest").unwrap();
        let err = repo.update(&ctx, &[("regtest".to_owned(), 5), ("missing".to_owned(), 1)]).unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert_eq!(0, repo.get_storeinfo(&ctx, "regtest").unwrap().count);
    }

    #[test]
    fn copy_to_passive_mirrors_store_list() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let ctx = Deadline::none();

        repo.add(&ctx, "regtest").unwrap();
        repo.copy_to_passive_folders(&ctx).unwrap();

        let passive_gateway = FsGateway::new(dir.path().join("b"));
        assert!(passive_gateway.exists(STORELIST_FILENAME));
        assert!(passive_gateway.exists(storeinfo_relative("regtest")));
    }
}
