// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::GovernorError;
use crate::fd_cache::{FileIndex, OwnerId, PreallocationMode};
use crate::resource_manager::{FileRequest, GovernorClient};

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,            // The full path to the file on the disk.
    pub length: u64,              // The length of the file in bytes.
    pub global_start_offset: u64, // The starting offset of this file within the transfer's data stream.
}

/// One entry of a multi-file transfer: path components below the root, and
/// the final length.
#[derive(Debug, Clone)]
pub struct LayoutFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Where each file of a transfer lives and how large it will be. This is
/// what the governor is told when a file is checked out.
#[derive(Debug, Clone)]
pub struct FileLayout {
    pub owner_id: OwnerId,
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl FileLayout {
    /// Handles both single-file (`files` is `None`) and multi-file layouts.
    pub fn new(
        owner_id: OwnerId,
        root_dir: &Path,
        name: &str,
        files: Option<&[LayoutFile]>,
        length: Option<u64>,
    ) -> Self {
        if let Some(layout_files) = files {
            let mut files_vec = Vec::with_capacity(layout_files.len());
            let mut current_offset = 0;

            for f in layout_files {
                let mut full_path = root_dir.to_path_buf();
                for component in &f.path {
                    full_path.push(component);
                }

                files_vec.push(FileInfo {
                    path: full_path,
                    length: f.length,
                    global_start_offset: current_offset,
                });

                current_offset += f.length;
            }
            Self {
                owner_id,
                files: files_vec,
                total_size: current_offset,
            }
        } else {
            let total_size = length.unwrap_or(0);
            Self {
                owner_id,
                files: vec![FileInfo {
                    path: root_dir.join(name),
                    length: total_size,
                    global_start_offset: 0,
                }],
                total_size,
            }
        }
    }

    pub fn path_of(&self, index: FileIndex) -> Option<&Path> {
        self.files.get(index.0 as usize).map(|f| f.path.as_path())
    }

    pub fn size_of(&self, index: FileIndex) -> Option<u64> {
        self.files.get(index.0 as usize).map(|f| f.length)
    }

    fn request(
        &self,
        index: usize,
        writable: bool,
        preallocation: PreallocationMode,
    ) -> Result<FileRequest, GovernorError> {
        let file_index = file_index_of(index)?;
        let info = &self.files[index];
        Ok(FileRequest {
            owner_id: self.owner_id,
            file_index,
            path: info.path.clone(),
            writable,
            preallocation,
            expected_size: info.length,
        })
    }

    fn check_bounds(&self, global_offset: u64, len: usize) -> Result<(), GovernorError> {
        let in_bounds = global_offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.total_size);
        if in_bounds {
            Ok(())
        } else {
            Err(GovernorError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} is outside the {} byte transfer",
                    global_offset, len, self.total_size
                ),
            )))
        }
    }

    /// Splits a global range into (file index, local offset, length) pieces.
    fn spans(&self, global_offset: u64, len: usize) -> Vec<(usize, u64, usize)> {
        let mut spans = Vec::new();
        let mut done = 0usize;

        for (index, file_info) in self.files.iter().enumerate() {
            if done == len {
                break;
            }
            let file_start = file_info.global_start_offset;
            let file_end = file_start + file_info.length;
            let position = global_offset + done as u64;

            if position >= file_start && position < file_end {
                let local_offset = position - file_start;
                let in_this_file =
                    std::cmp::min((len - done) as u64, file_info.length - local_offset) as usize;
                spans.push((index, local_offset, in_this_file));
                done += in_this_file;
            }
        }
        spans
    }
}

fn file_index_of(index: usize) -> Result<FileIndex, GovernorError> {
    u32::try_from(index).map(FileIndex).map_err(|_| {
        GovernorError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file index {} does not fit in a u32", index),
        ))
    })
}

/// Writes `data` at `global_offset`, checking out each touched file writable.
pub async fn write_block(
    client: &GovernorClient,
    layout: &FileLayout,
    preallocation: PreallocationMode,
    global_offset: u64,
    data: &[u8],
) -> Result<(), GovernorError> {
    layout.check_bounds(global_offset, data.len())?;

    let mut written = 0;
    for (index, local_offset, len) in layout.spans(global_offset, data.len()) {
        let chunk = data[written..written + len].to_vec();
        client
            .with_file(layout.request(index, true, preallocation)?, move |file| {
                file.seek(SeekFrom::Start(local_offset))?;
                file.write_all(&chunk)
            })
            .await?;
        written += len;
    }
    Ok(())
}

/// Reads `bytes_to_read` bytes from `global_offset`. Files are checked out
/// read-only, so they must already exist.
pub async fn read_block(
    client: &GovernorClient,
    layout: &FileLayout,
    global_offset: u64,
    bytes_to_read: usize,
) -> Result<Vec<u8>, GovernorError> {
    layout.check_bounds(global_offset, bytes_to_read)?;

    let mut buffer = Vec::with_capacity(bytes_to_read);
    for (index, local_offset, len) in layout.spans(global_offset, bytes_to_read) {
        let chunk = client
            .with_file(
                layout.request(index, false, PreallocationMode::None)?,
                move |file| {
                    file.seek(SeekFrom::Start(local_offset))?;
                    let mut temp_buf = vec![0; len];
                    file.read_exact(&mut temp_buf)?;
                    Ok(temp_buf)
                },
            )
            .await?;
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{GovernorLimits, ResourceGovernor};
    use crate::resource_manager::GovernorActor;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    fn setup_client(file_cache_size: usize) -> GovernorClient {
        let (shutdown_tx, _) = broadcast::channel(1);
        let limits = GovernorLimits {
            file_cache_size,
            ..GovernorLimits::default()
        };
        let (actor, client) = GovernorActor::new(ResourceGovernor::new(limits), shutdown_tx);
        tokio::spawn(actor.run());
        client
    }

    fn setup_single_file() -> (tempfile::TempDir, FileLayout) {
        let dir = tempdir().unwrap();
        let layout = FileLayout::new(OwnerId(1), dir.path(), "single_file.txt", None, Some(100));
        (dir, layout)
    }

    fn setup_multi_file() -> (tempfile::TempDir, FileLayout) {
        let dir = tempdir().unwrap();
        let files = vec![
            LayoutFile {
                path: vec!["file_a.txt".to_string()],
                length: 50, // Ends at 49
            },
            LayoutFile {
                path: vec!["subdir".to_string(), "file_b.txt".to_string()],
                length: 70, // Starts at 50
            },
        ];
        let layout = FileLayout::new(OwnerId(2), dir.path(), "multi", Some(&files), None);
        (dir, layout)
    }

    #[test]
    fn test_layout_single() {
        let (dir, layout) = setup_single_file();
        assert_eq!(layout.files.len(), 1);
        assert_eq!(layout.total_size, 100);
        assert_eq!(layout.path_of(FileIndex(0)), Some(dir.path().join("single_file.txt").as_path()));
        assert_eq!(layout.size_of(FileIndex(0)), Some(100));
        assert_eq!(layout.size_of(FileIndex(1)), None);
    }

    #[test]
    fn test_layout_multi() {
        let (dir, layout) = setup_multi_file();
        assert_eq!(layout.total_size, 120);
        assert_eq!(layout.files[1].global_start_offset, 50);
        assert_eq!(
            layout.path_of(FileIndex(1)),
            Some(dir.path().join("subdir").join("file_b.txt").as_path())
        );
    }

    #[test]
    fn test_spans_cross_boundary() {
        let (_dir, layout) = setup_multi_file();
        assert_eq!(layout.spans(40, 30), vec![(0, 40, 10), (1, 0, 20)]);
        assert_eq!(layout.spans(50, 70), vec![(1, 0, 70)]);
    }

    #[test]
    fn test_file_index_conversion() {
        assert_eq!(file_index_of(7).unwrap(), FileIndex(7));
        assert_eq!(file_index_of(u32::MAX as usize).unwrap(), FileIndex(u32::MAX));
        if let Some(too_big) = (u32::MAX as usize).checked_add(1) {
            match file_index_of(too_big) {
                Err(GovernorError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
                other => panic!("Expected InvalidInput, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_write_read_single_file() {
        let (_dir, layout) = setup_single_file();
        let client = setup_client(4);

        let data: Vec<u8> = (0..20).collect();
        write_block(&client, &layout, PreallocationMode::Sparse, 10, &data)
            .await
            .unwrap();

        let read_back = read_block(&client, &layout, 10, 20).await.unwrap();
        assert_eq!(read_back, data);

        // The rest of the preallocated file reads as zeros.
        let empty = read_block(&client, &layout, 0, 10).await.unwrap();
        assert_eq!(empty, vec![0; 10]);
        assert_eq!(std::fs::metadata(&layout.files[0].path).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_write_read_across_files() {
        let (_dir, layout) = setup_multi_file();
        let client = setup_client(4);

        let data: Vec<u8> = (0..30).collect();
        write_block(&client, &layout, PreallocationMode::Full, 40, &data)
            .await
            .unwrap();

        let read_back = read_block(&client, &layout, 40, 30).await.unwrap();
        assert_eq!(read_back, data);

        let file_b = std::fs::read(&layout.files[1].path).unwrap();
        assert_eq!(file_b.len(), 70);
        assert_eq!(&file_b[..20], &data[10..30]);
    }

    #[tokio::test]
    async fn test_single_slot_cache_still_spans_files() {
        let (_dir, layout) = setup_multi_file();
        // Every file switch evicts the other file's handle.
        let client = setup_client(1);

        let data = vec![0xAB; 120];
        write_block(&client, &layout, PreallocationMode::Sparse, 0, &data)
            .await
            .unwrap();
        let read_back = read_block(&client, &layout, 0, 120).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_rejected_before_io() {
        let (_dir, layout) = setup_single_file();
        let client = setup_client(4);

        let res = write_block(&client, &layout, PreallocationMode::Sparse, 95, &[1; 10]).await;
        match res {
            Err(GovernorError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            other => panic!("Expected Io error, got {:?}", other),
        }
        assert!(!layout.files[0].path.exists());

        let res = read_block(&client, &layout, 95, 10).await;
        assert!(matches!(res, Err(GovernorError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_before_write_fails_to_open() {
        let (_dir, layout) = setup_single_file();
        let client = setup_client(4);

        let res = read_block(&client, &layout, 0, 10).await;
        assert!(matches!(res, Err(GovernorError::Open(_))));
    }
}
