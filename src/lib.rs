// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A replicated, filesystem-backed registry mapping 128-bit logical IDs to
//! small fixed-size handle records.
//!
//! The registry is a hash-addressed collection of segment files: a logical
//! ID's high 64 bits select a block within a segment (`high mod hashModValue`),
//! its low 64 bits select a slot within that block. Segments are pre-allocated,
//! block-aligned, and read/written through direct (unbuffered) I/O, with every
//! block update serialized behind a cache-backed distributed lock.
//!
//! On top of the registry sits two-folder active/passive replication: writes
//! land on the active folder; `Registry::replicate` mirrors them to the
//! passive folder, falling back to degraded commit-change logging when the
//! passive side is unreachable, and replaying that log during drive
//! reinstatement. Transaction logs and priority logs provide the
//! crash-recovery and prioritized-rollback bookkeeping that failover and
//! reinstatement rely on.
//!
//! # Example usage
//!
//! ```
//! use reg_store::{Deadline, Handle, InMemoryL2Cache, Registry, RegistryMap, ReplicationTracker, TablePayload, Uuid};
//! use std::time::Duration;
//!
//! # fn main() -> reg_store::Result<()> {
//! # let folder = tempfile::tempdir()?;
//! let active = folder.path().join("active");
//! let passive = folder.path().join("passive");
//!
//! let tracker = ReplicationTracker::new(active.clone(), passive.clone(), true)?;
//! let map = RegistryMap::new(active.clone(), 250, Duration::from_secs(5 * 60));
//! let cache = InMemoryL2Cache::new();
//! let registry = Registry::new(map, cache, tracker);
//! let ctx = Deadline::none();
//!
//! let id = Uuid::new(1, 2);
//! let handle = Handle { logical_id: id, version: 1, flags: 0, physical_id: Uuid::new(3, 4), physical_id_backup: Uuid::NIL };
//! let payload = vec![TablePayload { table: "regtest".to_owned(), handles: vec![handle] }];
//!
//! registry.add(&payload, &ctx)?;
//! let found = registry.get(&payload, &ctx)?;
//! assert_eq!(1, found[0].handles.len());
//! #
//! # Ok(())
//! # }
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/value-log/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/value-log/main/logo.png")]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod block;
mod block_region;
mod coding;
mod commit_log;
mod config;
mod deadline;
mod direct_io;
mod error;
mod fs_gateway;
mod handle;
mod hashmap;
mod lock;
#[doc(hidden)]
pub mod mock;
mod path;
mod registry;
mod registry_map;
mod replication;
mod store_repo;
mod txlog;
mod uuid;

pub use {
    commit_log::{
        delete_commit_change, list_commit_changes_oldest_first, read_commit_change, write_commit_change, CommitChangeRecord,
    },
    config::Config,
    deadline::{Deadline, DeadlineError},
    error::{Error, Result},
    handle::{Handle, HANDLE_SIZE_BYTES},
    hashmap::{FileRegionDescriptor, Hashmap, HashmapRegistry},
    lock::{L2Cache, LockGuard, LockKey},
    mock::{FlakyL2Cache, InMemoryL2Cache},
    path::{apply_4_level_hierarchy, block_offset_and_slot, default_to_file_path, DefaultPathMapper, PathMapper},
    registry::Registry,
    registry_map::{RegistryMap, TablePayload},
    replication::{ReplicationStatus, ReplicationTracker},
    store_repo::{StoreInfo, StoreRepository},
    txlog::{claims, priority_log, translog, TransactionRecord},
    uuid::Uuid,
};

#[doc(hidden)]
pub use block::{B, HANDLES_PER_BLOCK, MAX_HASH_MOD_VALUE, MAX_SEGMENTS_PER_TABLE, MIN_HASH_MOD_VALUE};

#[doc(hidden)]
pub use coding::{Decode, DecodeError, Encode, EncodeError};

#[doc(hidden)]
pub use fs_gateway::FsGateway;
