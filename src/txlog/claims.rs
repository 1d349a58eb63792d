// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Atomic per-sector claim markers: empty files whose creation (via
//! temp-file + hard-link) asserts exclusive ownership of a sector rollback.

use crate::deadline::Deadline;
use crate::error::Result;
use crate::fs_gateway::FsGateway;
use crate::uuid::Uuid;
use std::path::PathBuf;

const REGIONSIGNALS_DIR: &str = "regionsignals";

fn claim_relative(file_num: u32, sector_num: u32) -> PathBuf {
    PathBuf::from(REGIONSIGNALS_DIR).join(format!("r{file_num:04}{sector_num:06}.plg"))
}

/// Atomically creates the claim marker for `(file_num, sector_num)`.
///
/// # Errors
///
/// Returns [`crate::Error::AlreadyExists`] if another process already holds
/// this claim.
pub fn write_registry_sector_claim(gateway: &FsGateway, ctx: &Deadline, file_num: u32, sector_num: u32) -> Result<()> {
    let tmp_relative = PathBuf::from(REGIONSIGNALS_DIR).join(format!(".tmp-{}", Uuid::random()));
    gateway.write_atomic(ctx, &tmp_relative, b"")?;

    let result = gateway.hard_link(&tmp_relative, claim_relative(file_num, sector_num));

    if let Err(e) = gateway.remove(ctx, &tmp_relative) {
        log::warn!("failed to clean up claim tempfile {}: {e:?}", tmp_relative.display());
    }

    result
}

/// Releases a previously-written claim marker.
///
/// # Errors
///
/// Propagates a filesystem failure other than "already absent".
pub fn remove_registry_sector_claim(gateway: &FsGateway, ctx: &Deadline, file_num: u32, sector_num: u32) -> Result<()> {
    gateway.remove(ctx, claim_relative(file_num, sector_num))
}

/// Removes every claim marker under `regionsignals/`.
///
/// # Errors
///
/// Propagates a listing or removal failure.
pub fn clear_registry_sector_claims(gateway: &FsGateway, ctx: &Deadline) -> Result<()> {
    for entry in gateway.list(ctx, REGIONSIGNALS_DIR)? {
        if entry.extension().is_some_and(|ext| ext == "plg") {
            let relative = entry.strip_prefix(gateway.base()).unwrap_or(&entry);
            gateway.remove(ctx, relative)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use test_log::test;

    #[test]
    fn second_claim_is_rejected_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();

        write_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();
        let err = write_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));

        remove_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();
        write_registry_sector_claim(&gateway, &ctx, 12, 35).unwrap();
    }

    #[test]
    fn clear_removes_all_markers() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FsGateway::new(dir.path());
        let ctx = Deadline::none();

        write_registry_sector_claim(&gateway, &ctx, 1, 1).unwrap();
        write_registry_sector_claim(&gateway, &ctx, 2, 2).unwrap();

        clear_registry_sector_claims(&gateway, &ctx).unwrap();

        write_registry_sector_claim(&gateway, &ctx, 1, 1).unwrap();
    }
}
