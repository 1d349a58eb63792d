// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The hash-addressed segment store: opens/pre-allocates segment files, scans
//! a block for a matching logical ID or free slot, and grows a registry table
//! across segments when the current one fills up.

use crate::block::{AlignedBlock, B, HANDLES_PER_BLOCK, MAX_SEGMENTS_PER_TABLE};
use crate::coding::{Decode, Encode};
use crate::deadline::Deadline;
use crate::direct_io::DirectFile;
use crate::error::{Error, Result};
use crate::handle::{Handle, HANDLE_SIZE_BYTES};
use crate::lock::{acquire_named_lock, L2Cache, LockKey};
use crate::uuid::Uuid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

/// How long a segment-file pre-allocate lock may be held.
pub const PREALLOCATE_LOCK_DURATION: Duration = Duration::from_secs(20 * 60);

/// How long a caller retries to acquire the pre-allocate lock before giving up.
pub const PREALLOCATE_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// The resolved location of a handle's home slot.
#[derive(Copy, Clone, Debug)]
pub struct FileRegionDescriptor {
    /// 1-based segment index within the table.
    pub segment_index: u64,
    /// Byte offset of the containing block within the segment file.
    pub block_offset: u64,
    /// Byte offset of the handle's slot within the block.
    pub slot_offset: u64,
    /// The handle found at this slot, if any (populated on a read hit).
    pub handle: Option<Handle>,
}

struct Inner {
    base: PathBuf,
    table: String,
    hash_mod_value: u64,
    files: Mutex<HashMap<String, DirectFile>>,
}

/// Exclusively owns the open segment-file handles for one registry table.
///
/// Cloning a `Hashmap` is cheap (it's `Arc`-backed) but every clone shares the
/// same underlying file-handle ownership — never open two `Hashmap`s over the
/// same table concurrently.
#[derive(Clone)]
pub struct Hashmap(std::sync::Arc<Inner>);

impl Hashmap {
    /// Opens a registry table rooted at `<base>/<table>/`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, table: impl Into<String>, hash_mod_value: u64) -> Self {
        Self(std::sync::Arc::new(Inner {
            base: base.into(),
            table: table.into(),
            hash_mod_value,
            files: Mutex::new(HashMap::new()),
        }))
    }

    fn segment_filename(&self, segment_index: u64) -> String {
        format!("{}-{segment_index}.reg", self.0.table)
    }

    fn segment_path(&self, segment_index: u64) -> PathBuf {
        self.0.base.join(&self.0.table).join(self.segment_filename(segment_index))
    }

    fn expected_segment_size(&self) -> u64 {
        self.0.hash_mod_value * B
    }

    /// Opens (creating and pre-allocating if needed and `for_writing`) segment
    /// `segment_index`, so it's available to read/write via
    /// [`with_region_file`](Self::with_region_file).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the segment is absent and `for_writing`
    /// is false. Propagates I/O and lock-acquisition errors otherwise.
    pub fn open_or_create_segment<C: L2Cache>(&self, cache: &C, segment_index: u64, for_writing: bool, ctx: &Deadline) -> Result<()> {
        let filename = self.segment_filename(segment_index);
        let path = self.segment_path(segment_index);

        {
            let files = self.0.files.lock().expect("lock is poisoned");
            if files.contains_key(&filename) {
                return Ok(());
            }
        }

        let needs_preallocate = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() < self.expected_segment_size(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(Error::FileIo(e)),
        };

        if needs_preallocate && !for_writing {
            return Err(Error::NotFound);
        }

        if needs_preallocate {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let key = LockKey::for_segment_preallocate(&path.to_string_lossy());
            let _guard = acquire_named_lock(cache, key, PREALLOCATE_LOCK_DURATION, PREALLOCATE_RETRY_TIMEOUT, ctx)?;

            // Re-check under the lock: another process may have already grown it.
            let still_needs = match std::fs::metadata(&path) {
                Ok(meta) => meta.len() < self.expected_segment_size(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => return Err(Error::FileIo(e)),
            };

            if still_needs {
                let file = std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
                file.set_len(self.expected_segment_size())?;
            }
        }

        let file = DirectFile::open(&path, for_writing)?;
        self.0.files.lock().expect("lock is poisoned").insert(filename, file);

        Ok(())
    }

    fn with_file<T>(&self, filename: &str, f: impl FnOnce(&DirectFile) -> Result<T>) -> Result<T> {
        let files = self.0.files.lock().expect("lock is poisoned");
        let file = files.get(filename).ok_or(Error::NotFound)?;
        f(file)
    }

    fn scan_block_for_slot(block: &AlignedBlock, id: &Uuid, ideal_slot: u64, for_writing: bool) -> Option<(u64, Option<Handle>)> {
        let ideal_range = AlignedBlock::slot_range(ideal_slot);
        let ideal_bytes = &block.as_slice()[ideal_range];

        if Handle::slot_is_empty(ideal_bytes) {
            if for_writing {
                return Some((ideal_slot, None));
            }
        } else if Handle::peek_logical_id(ideal_bytes).ok() == Some(*id) {
            let handle = Handle::decode_from_slice(ideal_bytes).ok();
            return Some((ideal_slot, handle));
        }

        for slot in 0..HANDLES_PER_BLOCK {
            if slot == ideal_slot {
                continue;
            }

            let range = AlignedBlock::slot_range(slot);
            let bytes = &block.as_slice()[range];

            if Handle::slot_is_empty(bytes) {
                if for_writing {
                    return Some((slot, None));
                }
                continue;
            }

            if Handle::peek_logical_id(bytes).ok() == Some(*id) {
                let handle = Handle::decode_from_slice(bytes).ok();
                return Some((slot, handle));
            }
        }

        None
    }

    /// Locates (or, when `for_writing`, allocates) the region for `id`,
    /// scanning segments `1..=MAX_SEGMENTS_PER_TABLE` as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for a read miss, or
    /// [`Error::SegmentLimitExceeded`] if writing would need a segment beyond
    /// the table's limit.
    pub fn find_one_file_region<C: L2Cache>(&self, cache: &C, for_writing: bool, id: &Uuid, ctx: &Deadline) -> Result<FileRegionDescriptor> {
        let ideal_block = id.ideal_block_index(self.0.hash_mod_value);
        let ideal_slot = id.ideal_slot_index(HANDLES_PER_BLOCK);
        let block_offset = ideal_block * B;

        for segment_index in 1..=MAX_SEGMENTS_PER_TABLE {
            let filename = self.segment_filename(segment_index);

            let opened = self.open_or_create_segment(cache, segment_index, for_writing, ctx);
            match opened {
                Ok(_) => {}
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }

            let block = self.with_file(&filename, |file| file.read_block(block_offset))?;

            if let Some((slot, handle)) = Self::scan_block_for_slot(&block, id, ideal_slot, for_writing) {
                return Ok(FileRegionDescriptor {
                    segment_index,
                    block_offset,
                    slot_offset: slot * HANDLE_SIZE_BYTES as u64,
                    handle,
                });
            }

            if for_writing && segment_index == MAX_SEGMENTS_PER_TABLE {
                return Err(Error::SegmentLimitExceeded);
            }
        }

        if for_writing {
            Err(Error::SegmentLimitExceeded)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Resolves a read-only batch of ids, skipping not-found and empty hits.
    ///
    /// # Errors
    ///
    /// Any error other than not-found aborts the whole batch.
    pub fn fetch<C: L2Cache>(&self, cache: &C, ids: &[Uuid], ctx: &Deadline) -> Result<Vec<Handle>> {
        let mut out = Vec::with_capacity(ids.len());

        for id in ids {
            match self.find_one_file_region(cache, false, id, ctx) {
                Ok(frd) => {
                    if let Some(handle) = frd.handle {
                        if !handle.is_empty() {
                            out.push(handle);
                        }
                    }
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    /// Resolves a write-side batch of ids, allocating fresh regions as needed.
    ///
    /// Failures do not auto-undo earlier entries in the batch; the caller is
    /// responsible for per-id transactional handling.
    ///
    /// # Errors
    ///
    /// Propagates the first [`find_one_file_region`](Self::find_one_file_region) failure.
    pub fn find_file_region<C: L2Cache>(&self, cache: &C, ids: &[Uuid], ctx: &Deadline) -> Result<Vec<FileRegionDescriptor>> {
        ids.iter().map(|id| self.find_one_file_region(cache, true, id, ctx)).collect()
    }

    /// Returns the filename a [`FileRegionDescriptor`] resolves to.
    #[must_use]
    pub fn filename_for(&self, frd: &FileRegionDescriptor) -> String {
        self.segment_filename(frd.segment_index)
    }

    /// Runs `f` with the open [`DirectFile`] for a resolved region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the segment isn't currently open.
    pub fn with_region_file<T>(&self, frd: &FileRegionDescriptor, f: impl FnOnce(&DirectFile) -> Result<T>) -> Result<T> {
        self.with_file(&self.segment_filename(frd.segment_index), f)
    }

    /// Closes all cached open segment handles, preserving the last error seen.
    ///
    /// # Errors
    ///
    /// Returns the last error encountered while closing, if any.
    pub fn close(&self) -> Result<()> {
        let mut files = self.0.files.lock().expect("lock is poisoned");
        // `DirectFile` has no explicit close beyond `Drop`; draining forces it.
        files.drain();
        Ok(())
    }

    /// Returns the table directory this hashmap is rooted at.
    #[must_use]
    pub fn table_dir(&self) -> PathBuf {
        self.0.base.join(&self.0.table)
    }
}

/// A process-wide registry of open [`Hashmap`]s, ensuring a single owner per
/// `(base, table)` pair as the design notes require.
#[derive(Default)]
pub struct HashmapRegistry(RwLock<HashMap<(PathBuf, String), Hashmap>>);

impl HashmapRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing `Hashmap` for `(base, table)`, or opens a new one.
    pub fn get_or_open(&self, base: &Path, table: &str, hash_mod_value: u64) -> Hashmap {
        let key = (base.to_path_buf(), table.to_owned());

        if let Some(existing) = self.0.read().expect("lock is poisoned").get(&key) {
            return existing.clone();
        }

        let mut write = self.0.write().expect("lock is poisoned");
        write
            .entry(key)
            .or_insert_with(|| Hashmap::new(base, table, hash_mod_value))
            .clone()
    }
}
