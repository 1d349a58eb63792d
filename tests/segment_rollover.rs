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

fn handle(id: Uuid) -> Handle {
    Handle {
        logical_id: id,
        version: 1,
        flags: 0,
        physical_id: Uuid::new(9, 9),
        physical_id_backup: Uuid::NIL,
    }
}

#[test]
fn overflowing_a_block_allocates_a_second_segment() {
    let dir = tempfile::tempdir().unwrap();
    let cache = InMemoryL2Cache::new();
    let map = RegistryMap::new(dir.path().join("active"), 8, Duration::from_secs(60));
    let tracker = ReplicationTracker::new(dir.path().join("active"), dir.path().join("passive"), false).unwrap();
    let registry = Registry::new(map, cache, tracker);
    let ctx = Deadline::none();

    // 66 distinct ids, all with high % 8 == 0 (block 0) and low % 66 running
    // over every slot in that block, so the block is exactly full afterward.
    for i in 0..66u64 {
        let id = Uuid::new(0, i);
        registry.add(&payload("regtest", vec![handle(id)]), &ctx).unwrap();
    }

    let overflow_id = Uuid::new(8, 66);
    registry.add(&payload("regtest", vec![handle(overflow_id)]), &ctx).unwrap();

    let segment_2 = dir.path().join("active").join("regtest").join("regtest-2.reg");
    assert!(segment_2.exists());

    let found = registry.get(&payload("regtest", vec![handle(overflow_id)]), &ctx).unwrap();
    assert_eq!(overflow_id, found[0].handles[0].logical_id);
}
