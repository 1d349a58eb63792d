// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Maps logical IDs to filesystem paths and to block/slot addresses.

use crate::block::{B, HANDLES_PER_BLOCK};
use crate::handle::HANDLE_SIZE_BYTES;
use crate::uuid::Uuid;
use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

/// Returns the lowercase-hex, 4-level directory hierarchy (`"a/b/c/d"`) derived
/// from the first four bytes of a [`Uuid`].
#[must_use]
pub fn apply_4_level_hierarchy(id: &Uuid) -> String {
    let bytes = id.header_bytes();
    format!("{:02x}/{:02x}/{:02x}/{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// The default `id -> path` mapping function: `<base>/a/b/c/d`, with duplicate
/// path separators collapsed.
///
/// This is the default; callers that need a different on-disk layout may
/// substitute their own mapping function ([`PathMapper`]).
#[must_use]
pub fn default_to_file_path(base: &Path, id: &Uuid) -> PathBuf {
    let hierarchy = apply_4_level_hierarchy(id);
    let joined = base.join(hierarchy);
    // NOTE: `Absolutize` also normalizes away any duplicated separators that
    // joining introduced.
    joined
        .absolutize_from(base)
        .map(|p| p.into_owned())
        .unwrap_or(joined)
}

/// A swappable `id -> path` mapping function, overridable per process.
pub trait PathMapper: Send + Sync {
    /// Maps a logical ID to an absolute (or base-relative) path.
    fn map(&self, base: &Path, id: &Uuid) -> PathBuf;
}

/// The default [`PathMapper`], backed by [`default_to_file_path`].
#[derive(Clone, Copy, Default)]
pub struct DefaultPathMapper;

impl PathMapper for DefaultPathMapper {
    fn map(&self, base: &Path, id: &Uuid) -> PathBuf {
        default_to_file_path(base, id)
    }
}

/// Returns `(blockOffset, slotOffset)` for `id` under the given `hash_mod_value`.
///
/// `blockOffset = (high(id) mod hashModValue) * B`
/// `slotOffset  = (low(id) mod handlesPerBlock) * HandleSizeInBytes`
#[must_use]
pub fn block_offset_and_slot(id: &Uuid, hash_mod_value: u64) -> (u64, u64) {
    let block_offset = id.ideal_block_index(hash_mod_value) * B;
    let slot_offset = id.ideal_slot_index(HANDLES_PER_BLOCK) * HANDLE_SIZE_BYTES as u64;
    (block_offset, slot_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn hierarchy_is_four_lowercase_hex_levels() {
        let id = Uuid::new(0x0a0b_0c0d_0000_0000, 0);
        let hierarchy = apply_4_level_hierarchy(&id);
        let parts: Vec<_> = hierarchy.split('/').collect();
        assert_eq!(4, parts.len());
        assert_eq!(vec!["0a", "0b", "0c", "0d"], parts);
    }

    #[test]
    fn default_path_joins_under_base() {
        let base = Path::new("/tmp/registry");
        let id = Uuid::new(0x0102_0304_0000_0000, 0);
        let path = default_to_file_path(base, &id);
        assert!(path.starts_with(base));
        assert_eq!(Path::new("/tmp/registry/01/02/03/04"), path);
    }

    #[test]
    fn block_offset_and_slot_matches_spec_formula() {
        let id = Uuid::new(251, 67);
        let (block_offset, slot_offset) = block_offset_and_slot(&id, 250);
        assert_eq!(1 * B, block_offset);
        assert_eq!(1 * HANDLE_SIZE_BYTES as u64, slot_offset);
    }
}
