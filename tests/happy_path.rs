// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use reg_store::{Deadline, Handle, InMemoryL2Cache, Registry, RegistryMap, ReplicationTracker, TablePayload, Uuid};
use std::time::Duration;

fn payload(table: &str, handles: Vec<Handle>) -> Vec<TablePayload> {
    vec![TablePayload {
        table: table.to_owned(),
        handles,
    }]
}

#[test]
fn add_get_remove_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let cache = InMemoryL2Cache::new();
    let map = RegistryMap::new(dir.path().join("active"), 250, Duration::from_secs(60));
    let tracker = ReplicationTracker::new(dir.path().join("active"), dir.path().join("passive"), false).unwrap();
    let registry = Registry::new(map, cache, tracker);
    let ctx = Deadline::none();

    let id = Uuid::parse("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
    let handle = Handle {
        logical_id: id,
        version: 1,
        flags: 0,
        physical_id: Uuid::new(42, 42),
        physical_id_backup: Uuid::NIL,
    };

    registry.add(&payload("regtest", vec![handle]), &ctx).unwrap();

    let found = registry.get(&payload("regtest", vec![handle]), &ctx).unwrap();
    assert_eq!(1, found[0].handles.len());
    assert_eq!(handle, found[0].handles[0]);

    registry.remove(&payload("regtest", vec![handle]), &ctx).unwrap();

    let found = registry.get(&payload("regtest", vec![handle]), &ctx).unwrap();
    assert!(found[0].handles.is_empty());
}
