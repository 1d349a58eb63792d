// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Registry configuration: a builder-style struct carrying every tunable the
//! rest of this crate reads, with validation/clamping on construction.
//! Loading configuration from a file or CLI flags is the caller's job; this
//! type only holds already-resolved values.

use std::time::Duration;

/// Lower bound of a valid `hash_mod_value`.
pub const MIN_HASH_MOD_VALUE: u64 = 250;

/// Upper bound of a valid `hash_mod_value`.
pub const MAX_HASH_MOD_VALUE: u64 = 750_000;

/// Default `hash_mod_value` used when construction receives `0` or an
/// out-of-range value.
pub const DEFAULT_HASH_MOD_VALUE: u64 = MIN_HASH_MOD_VALUE;

/// Default block-region lock hold duration.
pub const DEFAULT_LOCK_FILE_REGION_DURATION: Duration = Duration::from_secs(5 * 60);

/// Default priority-log minimum age.
pub const DEFAULT_PRIORITY_LOG_MIN_AGE: Duration = Duration::from_secs(5 * 60);

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) hash_mod_value: u64,
    pub(crate) lock_file_region_duration: Duration,
    pub(crate) age_limit: Duration,
    pub(crate) priority_log_min_age: Duration,
    pub(crate) replicate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_mod_value: DEFAULT_HASH_MOD_VALUE,
            lock_file_region_duration: DEFAULT_LOCK_FILE_REGION_DURATION,
            age_limit: Duration::ZERO,
            priority_log_min_age: DEFAULT_PRIORITY_LOG_MIN_AGE,
            replicate: false,
        }
    }
}

impl Config {
    /// Creates a new configuration builder with defaults for every field.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hash-mod value used to size and address segment files.
    ///
    /// A value of `0` or outside `250..=750_000` is clamped to
    /// [`DEFAULT_HASH_MOD_VALUE`], matching the spec's "rejected and clamped
    /// to default" rule.
    #[must_use]
    pub fn hash_mod_value(mut self, value: u64) -> Self {
        self.hash_mod_value = if value == 0 || !(MIN_HASH_MOD_VALUE..=MAX_HASH_MOD_VALUE).contains(&value) {
            DEFAULT_HASH_MOD_VALUE
        } else {
            value
        };
        self
    }

    /// Sets how long a block-region lock is held before it's considered
    /// abandoned.
    #[must_use]
    pub fn lock_file_region_duration(mut self, duration: Duration) -> Self {
        self.lock_file_region_duration = duration;
        self
    }

    /// Sets the age limit passed through to higher-level cleanup policy; this
    /// crate only carries the value, it doesn't interpret it.
    #[must_use]
    pub fn age_limit(mut self, duration: Duration) -> Self {
        self.age_limit = duration;
        self
    }

    /// Sets the minimum age before a priority-log entry is eligible for
    /// `get_batch` (absent `ContextPriorityLogIgnoreAge`).
    #[must_use]
    pub fn priority_log_min_age(mut self, duration: Duration) -> Self {
        self.priority_log_min_age = duration;
        self
    }

    /// Sets whether two-folder replication is enabled.
    #[must_use]
    pub fn replicate(mut self, replicate: bool) -> Self {
        self.replicate = replicate;
        self
    }

}
