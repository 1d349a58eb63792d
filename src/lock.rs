// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The L2 cache's capability set, consumed (not implemented) by this crate, plus
//! the lock-key/guard types built on top of it.

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::uuid::Uuid;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::time::{Duration, Instant};

/// Identifies a distributed lock: a string key plus the last-known holder's
/// transaction ID, surfaced in [`crate::Error::LockAcquisitionFailure`] so a
/// caller can drive stale-lock recovery via the priority log.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LockKey {
    /// The raw lock string, e.g. `"infs" + filename + blockOffset`.
    pub key: String,

    /// The transaction ID of whoever last held (or is believed to hold) this lock.
    pub lock_id: Uuid,
}

impl LockKey {
    /// Builds the lock key for a block-region lock: `"infs" + filename + blockOffset`.
    #[must_use]
    pub fn for_block_region(filename: &str, block_offset: u64) -> Self {
        Self {
            key: format!("infs{filename}{block_offset}"),
            lock_id: Uuid::NIL,
        }
    }

    /// Builds the lock key for a segment pre-allocate lock: `"infs_reg" + path`.
    #[must_use]
    pub fn for_segment_preallocate(path: &str) -> Self {
        Self {
            key: format!("infs_reg{path}"),
            lock_id: Uuid::NIL,
        }
    }

    /// Builds the lock key for a per-logical-id registry lock.
    #[must_use]
    pub fn for_logical_id(id: &Uuid) -> Self {
        Self {
            key: format!("infs_id{id}"),
            lock_id: Uuid::NIL,
        }
    }

    /// Returns a copy of this key with `lock_id` set.
    #[must_use]
    pub fn with_lock_id(mut self, lock_id: Uuid) -> Self {
        self.lock_id = lock_id;
        self
    }
}

/// The L2 cache capability set.
///
/// This crate only *consumes* this interface; a real L2 cache is an external
/// collaborator (out of scope). `mock::InMemoryL2Cache` provides an in-memory
/// stand-in so the crate's own tests can run standalone.
pub trait L2Cache: Clone + Send + Sync {
    /// Fetches and deserializes a struct stored at `key`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend itself errors (not if the key is
    /// simply absent — that's `Ok(None)`).
    fn get_struct<T: DeserializeOwned>(&self, key: &str) -> crate::Result<Option<T>>;

    /// Serializes and stores `value` at `key`, with an optional TTL.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn set_struct<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> crate::Result<()>;

    /// Removes `key` from the cache, if present.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn delete(&self, key: &str) -> crate::Result<()>;

    /// Returns `true` if the value cached at `key` is still within its freshness
    /// window (as opposed to stale and needing a disk re-read).
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn is_cache_ttl(&self, key: &str) -> crate::Result<bool>;

    /// Attempts to acquire a named lock for up to `ttl`. Returns `true` if this
    /// call obtained the lock, `false` if someone else already holds it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn try_lock(&self, key: &str, ttl: Duration) -> crate::Result<bool>;

    /// Releases a previously-acquired lock.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn unlock(&self, key: &str) -> crate::Result<()>;

    /// Returns `true` if `key` is currently locked (by anyone).
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors.
    fn is_locked(&self, key: &str) -> crate::Result<bool>;
}

/// A scoped lock acquisition: releases the underlying cache lock on every exit
/// path, including error returns, via `Drop`.
///
/// This is the "resource scoping" idiom called for by the design notes: every
/// acquisition is paired with an unlock, with no path that can leak the lock.
pub struct LockGuard<'a, C: L2Cache> {
    cache: &'a C,
    key: String,
    released: bool,
}

impl<'a, C: L2Cache> LockGuard<'a, C> {
    pub(crate) fn new(cache: &'a C, key: String) -> Self {
        Self {
            cache,
            key,
            released: false,
        }
    }

    /// Releases the lock early, surfacing any cache error.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cache backend errors while unlocking.
    pub fn release(mut self) -> crate::Result<()> {
        self.released = true;
        self.cache.unlock(&self.key)
    }
}

impl<C: L2Cache> Drop for LockGuard<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cache.unlock(&self.key) {
                log::warn!("Failed to release lock {:?} on drop: {e:?}", self.key);
            }
        }
    }
}

pub(crate) fn jittered_retry_interval() -> Duration {
    let millis = rand::thread_rng().gen_range(50..=250);
    Duration::from_millis(millis)
}

/// Acquires a plain named lock (no block-region double-check), retrying with
/// jitter until `retry_timeout` elapses.
///
/// Used for locks outside the block-region path, e.g. a segment's
/// pre-allocate lock.
///
/// # Errors
///
/// Returns the context's cancellation/deadline error if `ctx` expires first;
/// otherwise [`Error::LockAcquisitionFailure`] once the retry budget is spent.
pub fn acquire_named_lock<'a, C: L2Cache>(
    cache: &'a C,
    key: LockKey,
    hold_duration: Duration,
    retry_timeout: Duration,
    ctx: &Deadline,
) -> Result<LockGuard<'a, C>> {
    let deadline = Instant::now() + retry_timeout;

    loop {
        ctx.check()?;

        match cache.try_lock(&key.key, hold_duration) {
            Ok(true) => return Ok(LockGuard::new(cache, key.key)),
            Ok(false) => {}
            Err(e) => log::warn!("try_lock({}) errored, retrying: {e:?}", key.key),
        }

        if Instant::now() >= deadline {
            return Err(Error::LockAcquisitionFailure { key });
        }

        std::thread::sleep(jittered_retry_interval());
    }
}
