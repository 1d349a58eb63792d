// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A 128-bit logical identifier, split into a high and low 64-bit half.
///
/// `high` determines the ideal block within a segment file (`high mod hashModValue`);
/// `low` determines the ideal slot within that block (`low mod handlesPerBlock`).
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct Uuid {
    /// High 64 bits
    pub high: u64,

    /// Low 64 bits
    pub low: u64,
}

impl Uuid {
    /// The all-zero ID, reserved to mean "empty slot".
    pub const NIL: Self = Self { high: 0, low: 0 };

    /// Creates a new ID from its two halves.
    #[must_use]
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Returns `true` if this is the all-zero (empty-slot) ID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Generates a random (v4-ish) ID. Test/bootstrap use only; logical IDs are
    /// normally minted by the B-tree layer, which is out of scope for this crate.
    #[must_use]
    pub fn random() -> Self {
        Self {
            high: rand::random(),
            low: rand::random(),
        }
    }

    /// Returns the ideal block index for a given hash-mod value.
    #[must_use]
    pub fn ideal_block_index(&self, hash_mod_value: u64) -> u64 {
        self.high % hash_mod_value
    }

    /// Returns the ideal in-block slot index for the fixed slots-per-block count.
    #[must_use]
    pub fn ideal_slot_index(&self, handles_per_block: u64) -> u64 {
        self.low % handles_per_block
    }

    /// Formats this ID the canonical hyphenated way, e.g.
    /// `6ba7b810-9dad-11d1-80b4-00c04fd430c8`.
    #[must_use]
    pub fn to_hyphenated_string(&self) -> String {
        let hi = self.high.to_be_bytes();
        let lo = self.low.to_be_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            hi[0], hi[1], hi[2], hi[3], hi[4], hi[5], hi[6], hi[7],
            lo[0], lo[1], lo[2], lo[3], lo[4], lo[5], lo[6], lo[7],
        )
    }

    /// Parses a canonical hyphenated UUID string.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `s` is not a 36-character hyphenated hex UUID.
    pub fn parse(s: &str) -> Result<Self, &'static str> {
        let stripped: String = s.chars().filter(|c| *c != '-').collect();

        if stripped.len() != 32 {
            return Err("invalid UUID length");
        }

        let bytes = (0..32)
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&stripped[i..i + 2], 16).map_err(|_| "invalid UUID hex digit")
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[0..8]);
        lo.copy_from_slice(&bytes[8..16]);

        Ok(Self {
            high: u64::from_be_bytes(hi),
            low: u64::from_be_bytes(lo),
        })
    }

    /// The first byte of the ID, used to compute the 4-level directory hierarchy.
    #[must_use]
    pub fn header_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.high.to_be_bytes());
        out[8..].copy_from_slice(&self.low.to_be_bytes());
        out
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hyphenated_string())
    }
}

impl Encode for Uuid {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.high)?;
        writer.write_u64::<BigEndian>(self.low)?;
        Ok(())
    }
}

impl Decode for Uuid {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let high = reader.read_u64::<BigEndian>()?;
        let low = reader.read_u64::<BigEndian>()?;
        Ok(Self { high, low })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn nil_is_empty() {
        assert!(Uuid::NIL.is_nil());
        assert!(!Uuid::random().is_nil());
    }

    #[test]
    fn hyphenated_round_trip() {
        let s = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        let id = Uuid::parse(s).expect("should parse");
        assert_eq!(s, id.to_hyphenated_string());
    }

    #[test]
    fn encode_decode_round_trip() {
        let id = Uuid::new(0x1122_3344_5566_7788, 0x99aa_bbcc_ddee_ff00);
        let bytes = id.encode_into_vec().expect("should encode");
        let decoded = Uuid::decode_from_slice(&bytes).expect("should decode");
        assert_eq!(id, decoded);
    }

    #[test]
    fn ideal_block_and_slot() {
        let id = Uuid::new(250, 66);
        assert_eq!(0, id.ideal_block_index(250));
        assert_eq!(0, id.ideal_slot_index(66));

        let id = Uuid::new(251, 67);
        assert_eq!(1, id.ideal_block_index(250));
        assert_eq!(1, id.ideal_slot_index(66));
    }
}
