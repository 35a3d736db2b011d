// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod fileset;
pub mod preallocate;
pub mod slot;

pub use fileset::{FileSlotCache, DEFAULT_FILE_CACHE_SIZE};
pub use preallocate::PreallocationMode;
pub use slot::CachedFileSlot;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the transfer that owns a cached file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OwnerId(pub i32);

/// Position of a file within its transfer's file list.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileIndex(pub u32);

/// Logical access time. Every checkout takes the next tick, so ordering by
/// tick is ordering by recency with no ties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessTick(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
