// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

const ZERO_BLOCK_SIZE: usize = 4096;

/// How a newly created, writable file is sized before first use.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreallocationMode {
    None,
    #[default]
    Sparse,
    Full,
}

impl FromStr for PreallocationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(PreallocationMode::None),
            "sparse" => Ok(PreallocationMode::Sparse),
            "full" => Ok(PreallocationMode::Full),
            other => Err(format!(
                "unknown preallocation mode '{}', expected none, sparse or full",
                other
            )),
        }
    }
}

impl fmt::Display for PreallocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PreallocationMode::None => "none",
            PreallocationMode::Sparse => "sparse",
            PreallocationMode::Full => "full",
        };
        f.write_str(name)
    }
}

/// Sizes an already-open file to `length` without writing its contents.
///
/// Tries `ftruncate` first, which leaves a hole on every filesystem that
/// supports them, then falls back to writing a single zero byte at the end.
pub fn preallocate_sparse(file: &mut File, length: u64) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }

    // Seeking takes a signed offset.
    if length >= i64::MAX as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("preallocation length {} exceeds the seekable range", length),
        ));
    }

    match file.set_len(length) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                "Native sparse preallocation failed ({}), falling back to seek-and-write",
                e
            );
            seek_and_write(file, length)
        }
    }
}

// Reached on filesystems that refuse to grow a file with ftruncate but accept
// a write past the end. The file is already `length` bytes by the final
// truncate, so that call does not grow anything.
fn seek_and_write<F: Write + Seek + SetLen>(file: &mut F, length: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(length - 1))?;
    file.write_all(&[0])?;
    file.truncate_to(length)
}

trait SetLen {
    fn truncate_to(&mut self, length: u64) -> io::Result<()>;
}

impl SetLen for File {
    fn truncate_to(&mut self, length: u64) -> io::Result<()> {
        self.set_len(length)
    }
}

/// Creates `path` if needed and reserves `length` bytes of real disk space.
///
/// The handle opened here is never handed out; it is closed on every path.
pub fn preallocate_full(path: &Path, length: u64) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if length == 0 {
        return Ok(());
    }

    match file.allocate(length) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(
                "Native preallocation of {:?} failed ({}), writing zeros instead",
                path,
                e
            );
            file.seek(SeekFrom::Start(0))?;
            write_zero_blocks(&mut file, length)
        }
    }
}

fn write_zero_blocks<W: Write>(writer: &mut W, mut remaining: u64) -> io::Result<()> {
    let block = [0u8; ZERO_BLOCK_SIZE];
    while remaining > 0 {
        let this_pass = remaining.min(ZERO_BLOCK_SIZE as u64) as usize;
        let written = writer.write(&block[..this_pass])?;
        if written != this_pass {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write while zero-filling: {} of {}", written, this_pass),
            ));
        }
        remaining -= this_pass as u64;
    }
    Ok(())
}
