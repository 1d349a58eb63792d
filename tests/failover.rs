// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use reg_store::{Deadline, Error, Handle, InMemoryL2Cache, Registry, RegistryMap, ReplicationTracker, TablePayload, Uuid};
use std::time::Duration;

fn payload(table: &str, handles: Vec<Handle>) -> Vec<TablePayload> {
    vec![TablePayload {
        table: table.to_owned(),
        handles,
    }]
}

fn handle(id: Uuid) -> Handle {
    Handle {
        logical_id: id,
        version: 1,
        flags: 0,
        physical_id: Uuid::new(5, 5),
        physical_id_backup: Uuid::NIL,
    }
}

#[test]
fn qualifying_io_error_flips_the_active_folder() {
    let dir = tempfile::tempdir().unwrap();
    let cache = InMemoryL2Cache::new();
    let map = RegistryMap::new(dir.path().join("active"), 250, Duration::from_secs(60));
    let tracker = ReplicationTracker::new(dir.path().join("active"), dir.path().join("passive"), true).unwrap();
    let registry = Registry::new(map, cache.clone(), tracker);
    let ctx = Deadline::none();

    let id = Uuid::new(3, 4);
    registry.add(&payload("regtest", vec![handle(id)]), &ctx).unwrap();

    let toggler_before = registry.tracker().status().active_folder_toggler;
    assert!(!registry.tracker().status().failed_to_replicate);

    registry
        .tracker()
        .handle_replication_related_error(&cache, &Error::FailoverQualified(std::io::Error::other("disk offline")), false, &ctx)
        .unwrap();

    let status = registry.tracker().status();
    assert_ne!(toggler_before, status.active_folder_toggler);
    assert!(status.failed_to_replicate);
    assert!(registry.tracker().active_gateway().exists("replstat.txt"));
}
