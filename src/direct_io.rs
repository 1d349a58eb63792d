// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block-aligned, unbuffered reads and writes against a segment file.
//!
//! On Unix, the file is opened with `O_DIRECT` where the platform honors it;
//! every read/write goes through a page-aligned [`AlignedBlock`] buffer
//! regardless, so behavior is identical even where `O_DIRECT` is unavailable
//! or silently ignored (e.g. inside some container overlay filesystems).

use crate::block::{AlignedBlock, B};
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// A single segment file opened for block-aligned direct I/O.
pub struct DirectFile {
    file: File,
}

impl DirectFile {
    /// Opens `path` for direct I/O, creating it if absent and `for_writing` is
    /// set. A read-only open (`for_writing: false`) requests `O_RDONLY` and
    /// never creates the file; a writing open requests `O_RDWR` and creates it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be opened (or, for a writing open,
    /// created).
    pub fn open(path: &Path, for_writing: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if for_writing {
            options.write(true).create(true);
        }

        #[cfg(unix)]
        options.custom_flags(libc::O_DIRECT);

        let file = match options.open(path) {
            Ok(file) => file,
            // Some filesystems (tmpfs, overlayfs, certain container mounts)
            // reject O_DIRECT outright; fall back to buffered I/O rather than
            // fail the whole registry open.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                log::warn!("O_DIRECT unsupported for {}, falling back to buffered I/O", path.display());
                let mut fallback = OpenOptions::new();
                fallback.read(true);
                if for_writing {
                    fallback.write(true).create(true);
                }
                fallback.open(path)?
            }
            Err(e) => return Err(Error::FileIo(e)),
        };

        Ok(Self { file })
    }

    /// Reads the `B`-byte block at `block_offset` (which must be a multiple of
    /// `B`) into a freshly allocated, page-aligned buffer.
    ///
    /// A segment file is always pre-allocated to a whole number of blocks
    /// before it's read from, so a short read here means the file was
    /// truncated out from under us, not that the block is merely unallocated.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the underlying read fails, or ends before filling
    /// the whole block (the file is shorter than `block_offset + B`).
    pub fn read_block(&self, block_offset: u64) -> Result<AlignedBlock> {
        debug_assert_eq!(0, block_offset % B, "block_offset must be block-aligned");

        let mut block = AlignedBlock::zeroed();
        let mut total_read = 0usize;
        loop {
            match self.file.read_at(&mut block.as_mut_slice()[total_read..], block_offset + total_read as u64) {
                Ok(0) => break,
                Ok(n) => {
                    total_read += n;
                    if total_read >= B as usize {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::FileIo(e)),
            }
        }

        if total_read < B as usize {
            return Err(Error::FileIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {block_offset}: expected {B} bytes, got {total_read}"),
            )));
        }

        Ok(block)
    }

    /// Writes an entire `B`-byte block at `block_offset` (which must be a
    /// multiple of `B`).
    ///
    /// # Errors
    ///
    /// Will return `Err` if the underlying write fails, or `block_offset` is
    /// not block-aligned.
    pub fn write_block(&self, block_offset: u64, block: &AlignedBlock) -> Result<()> {
        debug_assert_eq!(0, block_offset % B, "block_offset must be block-aligned");

        self.file.write_all_at(block.as_slice(), block_offset)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Returns the file's current length in bytes.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file's metadata cannot be read.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns `true` if the file is currently empty.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file's metadata cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn write_then_read_block_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        let file = DirectFile::open(&path, true).unwrap();

        let mut block = AlignedBlock::zeroed();
        block.as_mut_slice()[0] = 0xAB;
        block.as_mut_slice()[B as usize - 1] = 0xCD;

        file.write_block(0, &block).unwrap();
        let read_back = file.read_block(0).unwrap();
        assert_eq!(block.as_slice(), read_back.as_slice());
    }

    #[test]
    fn reading_past_eof_is_a_short_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        let file = DirectFile::open(&path, true).unwrap();

        let err = file.read_block(B * 3).unwrap_err();
        assert!(matches!(err, Error::FileIo(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn reading_unwritten_block_within_preallocated_file_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        let file = DirectFile::open(&path, true).unwrap();
        file.file.set_len(B * 4).unwrap();

        let block = file.read_block(B * 3).unwrap();
        assert!(block.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn read_only_open_does_not_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        let err = DirectFile::open(&path, false).unwrap_err();
        assert!(matches!(err, Error::FileIo(e) if e.kind() == std::io::ErrorKind::NotFound));
        assert!(!path.exists());
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        DirectFile::open(&path, true).unwrap().file.set_len(B).unwrap();

        let file = DirectFile::open(&path, false).unwrap();
        let block = AlignedBlock::zeroed();
        let err = file.write_block(0, &block).unwrap_err();
        assert!(matches!(err, Error::FileIo(_)));
    }

    #[test]
    fn second_block_independent_of_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-0.reg");
        let file = DirectFile::open(&path, true).unwrap();

        let mut first = AlignedBlock::zeroed();
        first.as_mut_slice()[0] = 1;
        file.write_block(0, &first).unwrap();

        let mut second = AlignedBlock::zeroed();
        second.as_mut_slice()[0] = 2;
        file.write_block(B, &second).unwrap();

        assert_eq!(1, file.read_block(0).unwrap().as_slice()[0]);
        assert_eq!(2, file.read_block(B).unwrap().as_slice()[0]);
    }
}
