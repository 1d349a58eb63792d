// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use reg_store::{CommitChangeRecord, Deadline, Handle, InMemoryL2Cache, Registry, RegistryMap, ReplicationTracker, TablePayload, Uuid};
use std::time::Duration;

fn payload(table: &str, handles: Vec<Handle>) -> Vec<TablePayload> {
    vec![TablePayload {
        table: table.to_owned(),
        handles,
    }]
}

fn handle(id: Uuid, version: u32) -> Handle {
    Handle {
        logical_id: id,
        version,
        flags: 0,
        physical_id: Uuid::new(11, 11),
        physical_id_backup: Uuid::NIL,
    }
}

#[test]
fn reinstatement_replays_commit_log_and_clears_degraded_flags() {
    let dir = tempfile::tempdir().unwrap();
    let active = dir.path().join("active");
    let passive = dir.path().join("passive");
    std::fs::create_dir_all(&active).unwrap();
    std::fs::create_dir_all(&passive).unwrap();

    // Seed a degraded status: folder index 0 (`active`) is serving, the
    // passive side has fallen behind, and commit changes are being logged.
    std::fs::write(
        active.join("replstat.txt"),
        serde_json::json!({
            "failed_to_replicate": true,
            "active_folder_toggler": true,
            "log_commit_changes": true,
        })
        .to_string(),
    )
    .unwrap();

    let cache = InMemoryL2Cache::new();
    let map = RegistryMap::new(active.clone(), 250, Duration::from_secs(60));
    let tracker = ReplicationTracker::new(active.clone(), passive.clone(), true).unwrap();
    let registry = Registry::new(map, cache.clone(), tracker);
    let ctx = Deadline::none();

    assert!(registry.tracker().status().failed_to_replicate);
    assert!(registry.tracker().status().log_commit_changes);

    let h1 = handle(Uuid::new(1, 1), 1);
    let h2_initial = handle(Uuid::new(2, 2), 1);
    let h2_updated = handle(Uuid::new(2, 2), 2);

    // The passive side already has h2's prior image from before degradation.
    let passive_map = RegistryMap::new(passive.clone(), 250, Duration::from_secs(60));
    passive_map.add(&cache, &payload("regtest", vec![h2_initial]), &ctx).unwrap();

    registry.add(&payload("regtest", vec![h1]), &ctx).unwrap();
    registry.update_no_locks(&payload("regtest", vec![h2_updated]), &ctx).unwrap();

    registry
        .tracker()
        .log_commit_changes(
            Uuid::new(99, 99),
            &CommitChangeRecord {
                stores: Some(vec!["regtest".to_owned()]),
                new_roots: vec![],
                added: payload("regtest", vec![h1]),
                updated: payload("regtest", vec![h2_updated]),
                removed: vec![],
            },
            &ctx,
        )
        .unwrap();

    assert!(active.join("commitlogs").read_dir().unwrap().next().is_some());

    registry.tracker().reinstate_failed_drives(&cache, &passive_map, &ctx).unwrap();

    assert!(active.join("commitlogs").read_dir().unwrap().next().is_none());

    let found_h1 = passive_map.fetch(&cache, &payload("regtest", vec![h1]), &ctx).unwrap();
    let found_h2 = passive_map.fetch(&cache, &payload("regtest", vec![h2_updated]), &ctx).unwrap();
    assert_eq!(h1, found_h1[0].handles[0]);
    assert_eq!(h2_updated, found_h2[0].handles[0]);

    let status = registry.tracker().status();
    assert!(!status.failed_to_replicate);
    assert!(!status.log_commit_changes);

    // The replayed commit record named "regtest" in `stores`, so reinstatement
    // must have ensured it's mirrored into the passive side's store list.
    assert!(passive.join("regtest").is_dir());
    let names: Vec<String> = serde_json::from_slice(&std::fs::read(passive.join("storelist.txt")).unwrap()).unwrap();
    assert!(names.iter().any(|n| n == "regtest"));
}
