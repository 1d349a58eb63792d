// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::uuid::Uuid;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size in bytes of one marshaled [`Handle`].
///
/// Must stay well under the ~66-slots-per-4096-byte-block budget; the
/// `66 * HANDLE_SIZE_BYTES <= 4096` check lives in `block.rs`.
pub const HANDLE_SIZE_BYTES: usize = 56;

/// A fixed-size, on-disk record keyed by a [`Uuid`] logical ID.
///
/// The all-zero handle is reserved to mean "this slot is empty". The
/// `LogicalID` is always the first field in the marshaled form, so a reader
/// scanning a block for a matching ID only needs to decode the first 16 bytes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Handle {
    /// The logical key. All-zero means "empty slot".
    pub logical_id: Uuid,

    /// Monotonic version, bumped on every in-place update.
    pub version: u32,

    /// Flags (e.g. tombstone bits for higher layers); opaque to this crate.
    pub flags: u8,

    /// Primary physical location, e.g. an erasure-coded blob storage reference.
    pub physical_id: Uuid,

    /// Secondary/backup physical location, if any.
    pub physical_id_backup: Uuid,
}

impl Handle {
    /// Returns `true` if this is the all-zero handle, meaning "empty slot".
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reads just the `LogicalID` out of a marshaled handle, without decoding the
    /// rest of the record. Used when scanning a block for a matching or free slot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `bytes` is shorter than a `Uuid`.
    pub fn peek_logical_id(bytes: &[u8]) -> Result<Uuid, DecodeError> {
        let mut cursor = std::io::Cursor::new(bytes);
        Uuid::decode_from(&mut cursor)
    }

    /// Returns `true` if the `HANDLE_SIZE_BYTES` bytes at `bytes` are all zero.
    #[must_use]
    pub fn slot_is_empty(bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| b == 0)
    }
}

impl Encode for Handle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.logical_id.encode_into(writer)?;
        writer.write_u32::<BigEndian>(self.version)?;
        writer.write_u8(self.flags)?;
        self.physical_id.encode_into(writer)?;
        self.physical_id_backup.encode_into(writer)?;

        let written = 16 + 4 + 1 + 16 + 16;
        debug_assert!(written <= HANDLE_SIZE_BYTES);
        // Pad out to the fixed slot size so every handle occupies exactly
        // HANDLE_SIZE_BYTES on disk.
        writer.write_all(&vec![0u8; HANDLE_SIZE_BYTES - written])?;

        Ok(())
    }
}

impl Decode for Handle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let logical_id = Uuid::decode_from(reader)?;
        let version = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u8()?;
        let physical_id = Uuid::decode_from(reader)?;
        let physical_id_backup = Uuid::decode_from(reader)?;

        Ok(Self {
            logical_id,
            version,
            flags,
            physical_id,
            physical_id_backup,
        })
    }
}
