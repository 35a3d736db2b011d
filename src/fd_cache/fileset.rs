// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::OpenError;
use crate::fd_cache::preallocate::PreallocationMode;
use crate::fd_cache::slot::CachedFileSlot;
use crate::fd_cache::{AccessTick, FileIndex, OwnerId};

use std::fs::File;
use std::path::Path;

pub const DEFAULT_FILE_CACHE_SIZE: usize = 32;

/// A fixed pool of file slots with least-recently-used recycling.
///
/// Lookups and evictions are linear scans; the pool holds tens of entries.
#[derive(Debug)]
pub struct FileSlotCache {
    slots: Vec<CachedFileSlot>,
    clock: u64,
}

impl FileSlotCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, CachedFileSlot::default);
        Self { slots, clock: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_open()).count()
    }

    pub fn slots(&self) -> &[CachedFileSlot] {
        &self.slots
    }

    fn position(&self, owner_id: OwnerId, file_index: FileIndex) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.matches(owner_id, file_index))
    }

    /// The open slot holding this file, if any.
    pub fn lookup(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
    ) -> Option<&mut CachedFileSlot> {
        let index = self.position(owner_id, file_index)?;
        Some(&mut self.slots[index])
    }

    /// Returns a closed slot, evicting the least recently used one if the
    /// pool is full. The evicted handle is dropped without a flush.
    pub fn allocate_slot(&mut self) -> &mut CachedFileSlot {
        let index = self.allocate_position();
        &mut self.slots[index]
    }

    fn allocate_position(&mut self) -> usize {
        if let Some(free) = self.slots.iter().position(|slot| !slot.is_open()) {
            return free;
        }

        let mut cull = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.last_used < self.slots[cull].last_used {
                cull = i;
            }
        }

        let victim = &mut self.slots[cull];
        tracing::debug!(
            owner = %victim.owner_id,
            file = %victim.file_index,
            "Evicting least recently used file handle"
        );
        victim.close();
        cull
    }

    fn next_tick(&mut self) -> AccessTick {
        self.clock += 1;
        AccessTick(self.clock)
    }

    /// Finds or opens the handle for a file and marks it as just used.
    ///
    /// A read-only handle is reopened when write access is requested; a
    /// writable handle satisfies read-only requests as is.
    pub fn checkout(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
        path: &Path,
        writable: bool,
        preallocation: PreallocationMode,
        expected_size: u64,
    ) -> Result<&mut File, OpenError> {
        let index = match self.position(owner_id, file_index) {
            Some(i) if writable && !self.slots[i].is_writable() => {
                self.slots[i].close();
                i
            }
            Some(i) => i,
            None => self.allocate_position(),
        };

        let tick = self.next_tick();
        let slot = &mut self.slots[index];
        // Identity is ignored while the slot is closed.
        slot.owner_id = owner_id;
        slot.file_index = file_index;
        slot.last_used = tick;
        tracing::trace!("Checking out {:?}", path);
        slot.ensure_open(path, writable, preallocation, expected_size)
    }

    /// Returns an already open handle without opening anything. A read-only
    /// handle does not satisfy a writable request.
    pub fn get_cached(
        &mut self,
        owner_id: OwnerId,
        file_index: FileIndex,
        writable: bool,
    ) -> Option<&mut File> {
        let index = self.position(owner_id, file_index)?;
        if writable && !self.slots[index].is_writable() {
            return None;
        }
        let tick = self.next_tick();
        let slot = &mut self.slots[index];
        slot.last_used = tick;
        slot.handle_mut()
    }

    pub fn close_owner(&mut self, owner_id: OwnerId) {
        for slot in &mut self.slots {
            if slot.is_open() && slot.owner_id == owner_id {
                slot.close();
            }
        }
    }

    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            if slot.is_open() {
                slot.close();
            }
        }
    }
}

impl Default for FileSlotCache {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_CACHE_SIZE)
    }
}
