// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A minimal stand-in for the spec's ambient "cancellation/timeout context",
//! explicitly threaded through every blocking call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Why a [`Deadline`] is no longer usable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeadlineError {
    /// The deadline's wall-clock instant has passed.
    Exceeded,
    /// The deadline was explicitly cancelled.
    Cancelled,
}

/// A cancellable, optionally time-bounded context, passed explicitly to every
/// blocking operation (lock acquisition, direct I/O, cache calls, retries).
///
/// Unlike a thread-local or implicit ambient context, a `Deadline` is a plain
/// value: cheap to clone (it's an `Arc`-backed flag plus a `Copy` instant), and
/// safe to share across the retry loops that hold it.
#[derive(Clone)]
pub struct Deadline {
    at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl Deadline {
    /// A context with no deadline and no cancellation: never returns an error.
    #[must_use]
    pub fn none() -> Self {
        Self {
            at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context that expires after `duration` from now.
    #[must_use]
    pub fn after(duration: std::time::Duration) -> Self {
        Self {
            at: Some(Instant::now() + duration),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks this context (and every clone of it) as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `Err` if the deadline has elapsed or the context was cancelled.
    ///
    /// Cancellation is checked first, matching the spec's requirement that
    /// cancellation and deadline-exceeded are distinct, never-laundered errors.
    pub fn check(&self) -> Result<(), DeadlineError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DeadlineError::Cancelled);
        }

        if let Some(at) = self.at {
            if Instant::now() >= at {
                return Err(DeadlineError::Exceeded);
            }
        }

        Ok(())
    }

    /// Returns `true` if this context is already expired or cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }
}

impl From<DeadlineError> for crate::error::Error {
    fn from(value: DeadlineError) -> Self {
        match value {
            DeadlineError::Exceeded => Self::DeadlineExceeded,
            DeadlineError::Cancelled => Self::Cancelled,
        }
    }
}
