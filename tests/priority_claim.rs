// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use reg_store::claims::{remove_registry_sector_claim, write_registry_sector_claim};
use reg_store::{Deadline, Error, FsGateway};

#[test]
fn only_one_of_two_concurrent_claims_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = FsGateway::new(dir.path());
    let ctx = Deadline::none();

    write_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();
    let contender = write_registry_sector_claim(&gateway, &ctx, 12, 35);
    assert!(matches!(contender.unwrap_err(), Error::AlreadyExists));

    remove_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();

    // Now that the holder released it, a third caller can acquire it.
    write_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();
}
