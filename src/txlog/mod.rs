// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Transaction logs, priority logs, and per-sector claim markers — the
//! append-only bookkeeping layer used for asynchronous cleanup and
//! cross-process rollback coordination.

mod base64_bytes;
pub mod claims;
pub mod priority_log;
pub mod translog;

pub use translog::TransactionRecord;
