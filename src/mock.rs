// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory stand-ins for the external collaborators this crate only
//! consumes (the L2 cache) — used by this crate's own tests. A real L2 cache
//! is out of scope; this mock exists purely to exercise `lock.rs`,
//! `registry.rs`, and `replication.rs` without a live cache process.

use crate::error::{Error, Result};
use crate::lock::L2Cache;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

struct LockEntry {
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    locks: HashMap<String, LockEntry>,
}

/// An in-memory [`L2Cache`] implementation backed by a single shared mutex.
///
/// Suitable only for single-process tests: it has no cross-process visibility
/// and no persistence, unlike a real L2 cache.
#[derive(Clone, Default)]
pub struct InMemoryL2Cache(Arc<Mutex<Inner>>);

impl InMemoryL2Cache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.0.lock().expect("lock is poisoned")
    }
}

impl L2Cache for InMemoryL2Cache {
    fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut inner = self.lock_inner();

        let expired = matches!(inner.values.get(key), Some(entry) if matches!(entry.expires_at, Some(at) if Instant::now() >= at));
        if expired {
            inner.values.remove(key);
        }

        match inner.values.get(key) {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.bytes)?)),
            None => Ok(None),
        }
    }

    fn set_struct<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.lock_inner().values.insert(
            key.to_owned(),
            Entry {
                bytes,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock_inner().values.remove(key);
        Ok(())
    }

    fn is_cache_ttl(&self, key: &str) -> Result<bool> {
        let inner = self.lock_inner();
        Ok(match inner.values.get(key).and_then(|e| e.expires_at) {
            Some(at) => Instant::now() < at,
            None => inner.values.contains_key(key),
        })
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock_inner();

        if let Some(existing) = inner.locks.get(key) {
            if Instant::now() < existing.expires_at {
                return Ok(false);
            }
        }

        inner.locks.insert(
            key.to_owned(),
            LockEntry {
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        self.lock_inner().locks.remove(key);
        Ok(())
    }

    fn is_locked(&self, key: &str) -> Result<bool> {
        let inner = self.lock_inner();
        Ok(matches!(inner.locks.get(key), Some(entry) if Instant::now() < entry.expires_at))
    }
}

/// Forces the next cache operation on `cache` to fail, for exercising the
/// "cache errors are logged as warnings but never fatal" paths. Wraps a real
/// [`InMemoryL2Cache`] and fails exactly once.
#[derive(Clone)]
pub struct FlakyL2Cache {
    inner: InMemoryL2Cache,
    fail_next: Arc<Mutex<bool>>,
}

impl FlakyL2Cache {
    /// Wraps `inner`, ready to fail its next call.
    #[must_use]
    pub fn new(inner: InMemoryL2Cache) -> Self {
        Self {
            inner,
            fail_next: Arc::new(Mutex::new(true)),
        }
    }

    fn take_failure(&self) -> bool {
        let mut guard = self.fail_next.lock().expect("lock is poisoned");
        std::mem::replace(&mut *guard, false)
    }
}

impl L2Cache for FlakyL2Cache {
    fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if self.take_failure() {
            return Err(Error::Corrupt("mock cache failure"));
        }
        self.inner.get_struct(key)
    }

    fn set_struct<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        if self.take_failure() {
            return Err(Error::Corrupt("mock cache failure"));
        }
        self.inner.set_struct(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.take_failure() {
            return Err(Error::Corrupt("mock cache failure"));
        }
        self.inner.delete(key)
    }

    fn is_cache_ttl(&self, key: &str) -> Result<bool> {
        self.inner.is_cache_ttl(key)
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_lock(key, ttl)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        self.inner.unlock(key)
    }

    fn is_locked(&self, key: &str) -> Result<bool> {
        self.inner.is_locked(key)
    }
}
