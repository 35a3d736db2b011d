// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::OpenError;
use crate::fd_cache::preallocate::{preallocate_full, preallocate_sparse, PreallocationMode};
use crate::fd_cache::{AccessTick, FileIndex, OwnerId};

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::time::SystemTime;

/// One entry of the file cache. While open it owns exactly one OS handle and
/// is bound to a single (owner, file index) pair; while closed the identity
/// fields are stale and ignored.
#[derive(Debug, Default)]
pub struct CachedFileSlot {
    handle: Option<File>,
    writable: bool,
    pub(crate) owner_id: OwnerId,
    pub(crate) file_index: FileIndex,
    pub(crate) last_used: AccessTick,
}

impl CachedFileSlot {
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn file_index(&self) -> FileIndex {
        self.file_index
    }

    pub fn last_used(&self) -> AccessTick {
        self.last_used
    }

    pub(crate) fn matches(&self, owner_id: OwnerId, file_index: FileIndex) -> bool {
        self.is_open() && self.owner_id == owner_id && self.file_index == file_index
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut File> {
        self.handle.as_mut()
    }

    /// Opens `path` into this slot.
    ///
    /// Creates missing parent directories for writable files, preallocates
    /// files this call creates, and shrinks an existing file that is larger
    /// than `expected_size`. Shrinking needs write access, so it upgrades a
    /// read-only request to writable.
    pub fn open(
        &mut self,
        path: &Path,
        writable: bool,
        preallocation: PreallocationMode,
        expected_size: u64,
    ) -> Result<(), OpenError> {
        debug_assert!(!self.is_open(), "opening a slot that is already open");
        self.ensure_open(path, writable, preallocation, expected_size)
            .map(|_| ())
    }

    /// Returns the open handle, opening `path` first if the slot is closed.
    pub(crate) fn ensure_open(
        &mut self,
        path: &Path,
        writable: bool,
        preallocation: PreallocationMode,
        expected_size: u64,
    ) -> Result<&mut File, OpenError> {
        let file = match self.handle.take() {
            Some(file) => file,
            None => {
                let (file, effective_writable) =
                    open_handle(path, writable, preallocation, expected_size)?;
                tracing::debug!("Opened {:?} writable {}", path, effective_writable);
                self.writable = effective_writable;
                file
            }
        };
        Ok(self.handle.insert(file))
    }

    /// Drops the handle without flushing. Used on eviction.
    pub fn close(&mut self) {
        debug_assert!(self.is_open(), "closing a slot that is not open");
        self.handle = None;
        self.writable = false;
    }

    /// Syncs writable handles so the file's mtime reflects the writes just
    /// made, then closes.
    pub fn flush_and_close(&mut self) {
        if self.writable {
            if let Some(file) = &self.handle {
                if let Err(e) = file.sync_all() {
                    tracing::warn!(
                        owner = %self.owner_id,
                        file = %self.file_index,
                        "Failed to flush file before closing: {}",
                        e
                    );
                }
            }
        }
        self.close();
    }

    pub fn modified_time(&self) -> Option<SystemTime> {
        self.handle.as_ref()?.metadata().ok()?.modified().ok()
    }
}

/// Opens the handle for a slot, returning it with the access mode actually
/// granted. Nothing is stored on failure; a handle opened before a failing
/// truncate is dropped on the way out.
fn open_handle(
    path: &Path,
    writable: bool,
    preallocation: PreallocationMode,
    expected_size: u64,
) -> Result<(File, bool), OpenError> {
    let mut writable = writable;

    if writable {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(source) = fs::create_dir_all(dir) {
                tracing::error!("Couldn't create {:?}: {}", dir, source);
                return Err(OpenError::DirectoryCreateFailed {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        }
    }

    let existing_size = fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len());
    let already_existed = existing_size.is_some();

    if writable && !already_existed && preallocation == PreallocationMode::Full {
        match preallocate_full(path, expected_size) {
            Ok(()) => tracing::debug!("Preallocated file {:?}", path),
            Err(e) => tracing::warn!("Couldn't preallocate {:?}: {}", path, e),
        }
    }

    // A torrent whose files shrank since the last run leaves oversized files
    // behind.
    let resize_needed = existing_size.is_some_and(|size| expected_size < size);
    writable |= resize_needed;

    let mut file = match OpenOptions::new()
        .read(true)
        .write(writable)
        .create(writable)
        .truncate(false)
        .open(path)
    {
        Ok(file) => file,
        Err(source) => {
            tracing::error!("Couldn't open {:?}: {}", path, source);
            return Err(OpenError::OpenFailed {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    advise_sequential(&file);

    if resize_needed {
        if let Err(source) = file.set_len(expected_size) {
            tracing::error!("Couldn't truncate {:?}: {}", path, source);
            return Err(OpenError::TruncateFailed {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    if writable && !already_existed && preallocation == PreallocationMode::Sparse {
        if let Err(e) = preallocate_sparse(&mut file, expected_size) {
            tracing::warn!("Couldn't sparse-preallocate {:?}: {}", path, e);
        }
    }

    Ok((file, writable))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives this call.
    let ret =
        unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
    if ret != 0 {
        tracing::trace!("posix_fadvise(SEQUENTIAL) returned {}", ret);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn advise_sequential(_file: &File) {}
