// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A thin, retrying wrapper around ordinary (buffered) filesystem operations,
//! used for the JSON/JSONL side-files (storelist.txt, translog, priority log)
//! that don't need direct I/O.

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of attempts before a retried operation gives up and surfaces the
/// underlying I/O error.
const MAX_ATTEMPTS: u32 = 5;

/// Fibonacci backoff seed, in milliseconds. The sequence used is
/// `1s, 1s, 2s, 3s, 5s` (capped to 5 attempts), matching a scaled-down
/// Fibonacci series anchored at a 1-second initial delay.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

fn fibonacci_backoff(attempt: u32) -> Duration {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..attempt {
        let next = a + b;
        a = b;
        b = next;
    }
    INITIAL_BACKOFF * u32::try_from(a).unwrap_or(u32::MAX)
}

/// Returns `true` for an `io::Error` worth retrying (transient conditions
/// such as a momentary lock, interrupt, or resource exhaustion), `false` for
/// one that will not resolve by waiting (e.g. a parent path that is itself a
/// regular file, or a permission failure).
fn is_retryable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::NotFound
    )
}

/// Retries `op` with Fibonacci backoff, giving up after [`MAX_ATTEMPTS`] or
/// when `ctx` signals cancellation/expiry. An error classified as
/// non-retryable by [`is_retryable`] surfaces immediately, without consuming
/// the retry budget.
fn retry<T>(ctx: &Deadline, mut op: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        ctx.check()?;

        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(Error::FileIo(e)),
            Err(e) if attempt + 1 >= MAX_ATTEMPTS => return Err(Error::FileIo(e)),
            Err(e) => {
                log::warn!("fs_gateway operation failed (attempt {attempt}): {e}, retrying");
                std::thread::sleep(fibonacci_backoff(attempt));
                attempt += 1;
            }
        }
    }
}

fn write_atomic_attempt(dir: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(path).map_err(|e| e.error)
}

/// A filesystem gateway scoped to a single base directory.
///
/// Every path handed to the gateway is resolved relative to `base`; callers
/// never see (or need) an absolute path outside of it.
#[derive(Clone, Debug)]
pub struct FsGateway {
    base: PathBuf,
}

impl FsGateway {
    /// Creates a gateway rooted at `base`. Does not create `base` itself.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Returns the base directory this gateway is scoped to.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.base.join(relative)
    }

    /// Reads an entire file's contents.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be read after retrying, or if
    /// `ctx` is cancelled/expired.
    pub fn read(&self, ctx: &Deadline, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.resolve(relative);
        retry(ctx, || std::fs::read(&path))
    }

    /// Atomically writes `contents` to `relative`, via a tempfile-then-rename.
    ///
    /// Attempts the write directly first; only on a missing-parent failure
    /// does it create the parent directory and retry the write once. If that
    /// directory creation also fails, the original write error is surfaced
    /// rather than the `mkdir` failure.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the write cannot complete after retrying, or if
    /// `ctx` is cancelled/expired.
    pub fn write_atomic(&self, ctx: &Deadline, relative: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path = self.resolve(relative);
        retry(ctx, || {
            let dir = path.parent().unwrap_or(&self.base);
            match write_atomic_attempt(dir, &path, contents) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if std::fs::create_dir_all(dir).is_err() {
                        return Err(e);
                    }
                    write_atomic_attempt(dir, &path, contents)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Appends `contents` to `relative`, creating it (and its parent directory)
    /// if absent.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the append cannot complete after retrying, or if
    /// `ctx` is cancelled/expired.
    pub fn append(&self, ctx: &Deadline, relative: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path = self.resolve(relative);
        retry(ctx, || {
            let dir = path.parent().unwrap_or(&self.base);
            std::fs::create_dir_all(dir)?;
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(contents)
        })
    }

    /// Removes a file. Missing files are treated as success.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the removal cannot complete after retrying (other
    /// than "not found"), or if `ctx` is cancelled/expired.
    pub fn remove(&self, ctx: &Deadline, relative: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(relative);
        retry(ctx, || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
    }

    /// Creates `relative` (and any missing parents) as a directory.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the directory cannot be created after retrying, or
    /// if `ctx` is cancelled/expired.
    pub fn mkdir_all(&self, ctx: &Deadline, relative: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(relative);
        retry(ctx, || std::fs::create_dir_all(&path))
    }

    /// Lists the entries directly under `relative`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the directory cannot be listed after retrying, or
    /// if `ctx` is cancelled/expired. A missing directory yields an empty list.
    pub fn list(&self, ctx: &Deadline, relative: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let path = self.resolve(relative);
        retry(ctx, || match std::fs::read_dir(&path) {
            Ok(entries) => entries.map(|e| e.map(|e| e.path())).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        })
    }

    /// Creates a hard link from `target` to `link`, both relative to the
    /// gateway's base. Fails with [`Error::AlreadyExists`] if `link` exists.
    ///
    /// This is not retried: a hard link either atomically succeeds or fails
    /// because the link name is already claimed, and retrying an
    /// already-exists failure would defeat its purpose as a claim marker.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `link` already exists, or the underlying syscall fails.
    pub fn hard_link(&self, relative_target: impl AsRef<Path>, relative_link: impl AsRef<Path>) -> Result<()> {
        let target = self.resolve(relative_target);
        let link = self.resolve(relative_link);
        if let Some(dir) = link.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::hard_link(&target, &link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::AlreadyExists),
            Err(e) => Err(Error::FileIo(e)),
        }
    }

    /// Returns `true` if `relative` exists.
    ///
    /// Any `stat` outcome other than an explicit not-found counts as
    /// existing — a permission-denied error, for instance, still returns
    /// `true`, since `Path::exists` would otherwise mask it as `false`.
    #[must_use]
    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        match std::fs::metadata(self.resolve(relative)) {
            Ok(_) => true,
            Err(e) => e.kind() != std::io::ErrorKind::NotFound,
        }
    }
}
