// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::lock::LockKey;

/// Represents errors that can occur in the registry store
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Generic or transient I/O error.
    ///
    /// Surfaced after the filesystem gateway's retry budget is exhausted, or
    /// for I/O errors that are not classified as retryable.
    FileIo(std::io::Error),

    /// A block-region lock could not be acquired within the retry budget.
    ///
    /// Carries the lock key (file + block offset) with the last-known holder
    /// transaction ID, so the caller can drive stale-lock recovery via the
    /// priority log.
    LockAcquisitionFailure {
        /// The lock that could not be acquired
        key: LockKey,
    },

    /// An I/O error classified as warranting a replication failover.
    FailoverQualified(std::io::Error),

    /// Signals that rollback succeeded and no failover is required.
    RestoreRegistryFileSectorFailure,

    /// The targeted slot is empty; there is nothing to remove or fetch.
    NotFound,

    /// `RegistryMap::add` found a non-empty slot occupied by a different logical ID.
    AddMismatch,

    /// `RegistryMap::set`/`remove` found the target slot occupied by a different
    /// logical ID than requested.
    LogicalIdMismatch,

    /// `RegistryMap::remove` was asked to delete an already-empty slot.
    MissingItem,

    /// A registry table ran out of the 1000 allowed segment files.
    SegmentLimitExceeded,

    /// A claim marker (or other exclusively-created file) already exists.
    AlreadyExists,

    /// A blocking call's deadline elapsed before it could complete.
    DeadlineExceeded,

    /// A blocking call was explicitly cancelled by the caller.
    Cancelled,

    /// Invalid or corrupt on-disk data.
    Corrupt(&'static str),

    /// JSON (de)serialization failed.
    Json(serde_json::Error),

    /// Binary serialization failed.
    Encode(EncodeError),

    /// Binary deserialization failed.
    Decode(DecodeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegStoreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileIo(e) | Self::FailoverQualified(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::FileIo(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl Error {
    /// Returns `true` if this error is classified as warranting a replication failover.
    #[must_use]
    pub fn is_failover_qualified(&self) -> bool {
        matches!(self, Self::FailoverQualified(_))
    }
}

/// Registry store result
pub type Result<T> = std::result::Result<T, Error>;
