//! Byte-range allocation within a single block.
//!
//! A record-bearing block ends with a slot table:
//!
//! ```text
//! | slots and gaps ... | entry 0 | entry 1 | ... | entry N-1 | table start (u32) |
//! ^ 0                  ^ table start                                  block end ^
//! ```
//!
//! Entries are `[start, end)` byte ranges in use, ascending and disjoint.
//! Adjacent ranges are merged, so one entry may cover several allocations;
//! freeing from the middle of an entry splits it. The table grows toward the
//! start of the block, one entry at a time, and is itself not a slot.

use std::io::{ErrorKind, Result};

use crate::layout::*;

/// What freeing a slot released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Freed {
    Slot,
    /// The last slot is gone: the block goes back to the block allocator.
    Block,
}

/// The outcome of [SlotTable::reallocate].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resized {
    /// The allocation now starts at this offset.
    At(usize),
    /// The new length was zero.
    Freed(Freed),
}

pub(crate) struct SlotTable<'a> {
    bytes: &'a mut [u8],
}

/// Reads the slot table of a block.
pub(crate) fn read_entries(bytes: &[u8]) -> Result<Vec<SlotEntry>> {
    let trailer = bytes.len() - SLOT_TRAILER_SIZE;
    let start = read_u32(bytes, trailer) as usize;
    if start > trailer || (trailer - start) % SLOT_ENTRY_SIZE != 0 {
        return Err(crate::error::corrupted(format_args!(
            "bad slot table start {start}"
        )));
    }

    let mut entries = Vec::with_capacity((trailer - start) / SLOT_ENTRY_SIZE);
    let mut prev_end = 0;
    for pos in (start..trailer).step_by(SLOT_ENTRY_SIZE) {
        let entry: SlotEntry = read_pod(bytes, pos);
        if entry.start >= entry.end || entry.start < prev_end || entry.end as usize > start {
            return Err(crate::error::corrupted(format_args!(
                "bad slot table entry {entry:?}"
            )));
        }
        prev_end = entry.end;
        entries.push(entry);
    }

    Ok(entries)
}

// Sorts, then merges touching entries.
fn normalize(entries: &mut Vec<SlotEntry>) {
    entries.sort_by_key(|e| e.start);
    let mut merged: Vec<SlotEntry> = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.end == entry.start {
                last.end = entry.end;
                continue;
            }
        }
        merged.push(entry);
    }
    *entries = merged;
}

// Takes `[offset, offset + len)` out of the entry that covers it.
fn remove_range(entries: &mut Vec<SlotEntry>, offset: usize, len: usize) -> Result<()> {
    let end = offset + len;
    let Some(idx) = entries
        .iter()
        .position(|e| e.start as usize <= offset && end <= e.end as usize)
    else {
        return Err(crate::error::corrupted(format_args!(
            "freeing unallocated bytes [{offset}, {end})"
        )));
    };

    let old = entries[idx];
    match (old.start as usize == offset, old.end as usize == end) {
        (true, true) => {
            entries.remove(idx);
        }
        (true, false) => entries[idx].start = end as u32,
        (false, true) => entries[idx].end = offset as u32,
        (false, false) => {
            entries[idx].end = offset as u32;
            entries.insert(idx + 1, entry(end, old.end as usize));
        }
    }
    Ok(())
}

fn entry(start: usize, end: usize) -> SlotEntry {
    SlotEntry {
        start: start as u32,
        end: end as u32,
    }
}

impl<'a> SlotTable<'a> {
    /// Sets up an empty slot table in a fresh block.
    pub fn init(bytes: &'a mut [u8]) -> Self {
        let trailer = bytes.len() - SLOT_TRAILER_SIZE;
        write_u32(bytes, trailer, trailer as u32);
        Self { bytes }
    }

    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    fn trailer(&self) -> usize {
        self.bytes.len() - SLOT_TRAILER_SIZE
    }

    pub fn entries(&self) -> Result<Vec<SlotEntry>> {
        read_entries(&*self.bytes)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.is_empty())
    }

    // Would the table for these entries overlap live data?
    fn fits(&self, entries: &[SlotEntry]) -> bool {
        let table_size = entries.len() * SLOT_ENTRY_SIZE;
        let Some(table_start) = self.trailer().checked_sub(table_size) else {
            return false;
        };
        entries.last().map(|e| e.end as usize).unwrap_or(0) <= table_start
    }

    fn store(&mut self, entries: &[SlotEntry]) -> Result<()> {
        if !self.fits(entries) {
            return Err(ErrorKind::StorageFull.into());
        }

        let trailer = self.trailer();
        let table_start = trailer - entries.len() * SLOT_ENTRY_SIZE;
        for (idx, entry) in entries.iter().enumerate() {
            write_pod(self.bytes, table_start + idx * SLOT_ENTRY_SIZE, entry);
        }
        write_u32(self.bytes, trailer, table_start as u32);
        Ok(())
    }

    /// Allocates `len` bytes; returns the offset.
    ///
    /// Picks the largest gap that can hold `len` bytes: an exact fit is merged
    /// with its neighbors, otherwise the new range is centered in the gap to
    /// leave room for growth on both sides.
    pub fn allocate(&mut self, len: usize) -> Result<usize> {
        if len == 0 {
            return Err(ErrorKind::InvalidInput.into());
        }

        let entries = self.entries()?;
        let table_start = self.trailer() - entries.len() * SLOT_ENTRY_SIZE;

        let mut gaps = Vec::with_capacity(entries.len() + 1);
        let mut prev_end = 0;
        for entry in entries.iter() {
            if entry.start as usize > prev_end {
                gaps.push((prev_end, entry.start as usize));
            }
            prev_end = entry.end as usize;
        }
        if table_start > prev_end {
            gaps.push((prev_end, table_start));
        }
        gaps.sort_by_key(|(start, end)| core::cmp::Reverse(end - start));

        for (gap_start, gap_end) in gaps {
            if gap_end - gap_start < len {
                break;
            }

            let offset = if gap_end - gap_start == len {
                gap_start
            } else {
                // The gap next to the table gives up room for one more entry.
                let usable_end = if gap_end == table_start {
                    gap_end - SLOT_ENTRY_SIZE.min(gap_end)
                } else {
                    gap_end
                };
                if usable_end < gap_start + len {
                    continue;
                }
                gap_start + (usable_end - gap_start - len) / 2
            };

            let mut candidate = entries.clone();
            candidate.push(entry(offset, offset + len));
            normalize(&mut candidate);
            if self.fits(&candidate) {
                self.store(&candidate)?;
                return Ok(offset);
            }
        }

        Err(ErrorKind::StorageFull.into())
    }

    /// Frees `[offset, offset + len)`. Returns true if the table is now empty.
    pub fn free(&mut self, offset: usize, len: usize) -> Result<bool> {
        let mut entries = self.entries()?;
        remove_range(&mut entries, offset, len)?;
        self.store(&entries)?;
        Ok(entries.is_empty())
    }

    // Grows [offset, offset + old_len) in place if the bytes after it are free.
    fn grow_in_place(&mut self, offset: usize, old_len: usize, new_len: usize) -> Result<bool> {
        let mut entries = self.entries()?;
        let old_end = offset + old_len;
        let Some(idx) = entries
            .iter()
            .position(|e| e.start as usize <= offset && old_end <= e.end as usize)
        else {
            return Err(crate::error::corrupted(format_args!(
                "growing unallocated bytes [{offset}, {old_end})"
            )));
        };

        if entries[idx].end as usize != old_end {
            return Ok(false);
        }
        let limit = match entries.get(idx + 1) {
            Some(next) => next.start as usize,
            None => self.trailer() - entries.len() * SLOT_ENTRY_SIZE,
        };
        if offset + new_len > limit {
            return Ok(false);
        }

        entries[idx].end = (offset + new_len) as u32;
        normalize(&mut entries);
        self.store(&entries)?;
        Ok(true)
    }

    /// Resizes an allocation. A zero `new_len` frees it, and reports whether
    /// that emptied the block.
    ///
    /// StorageFull means the block has no room: the caller has to move
    /// the allocation to another block.
    pub fn reallocate(
        &mut self,
        offset: usize,
        old_len: usize,
        new_len: usize,
        copy: bool,
    ) -> Result<Resized> {
        if new_len == old_len {
            return Ok(Resized::At(offset));
        }
        if new_len == 0 {
            let freed = match self.free(offset, old_len)? {
                true => Freed::Block,
                false => Freed::Slot,
            };
            return Ok(Resized::Freed(freed));
        }
        if new_len < old_len {
            self.free(offset + new_len, old_len - new_len)?;
            return Ok(Resized::At(offset));
        }
        if self.grow_in_place(offset, old_len, new_len)? {
            return Ok(Resized::At(offset));
        }

        let before = self.entries()?;
        let new_offset = self.allocate(new_len)?;
        let mut entries = self.entries()?;
        remove_range(&mut entries, offset, old_len)?;
        if !self.fits(&entries) {
            // Releasing the old bytes would split an entry with no room left
            // for the table.
            self.store(&before)?;
            return Err(ErrorKind::StorageFull.into());
        }

        if copy {
            self.bytes
                .copy_within(offset..(offset + old_len), new_offset);
        }
        self.store(&entries)?;
        Ok(Resized::At(new_offset))
    }

    /// The largest allocation that could currently succeed.
    #[cfg(test)]
    pub fn largest_free(&self) -> Result<usize> {
        let entries = self.entries()?;
        let table_start = self.trailer() - entries.len() * SLOT_ENTRY_SIZE;
        let mut best = 0;
        let mut prev_end = 0;
        for entry in entries.iter() {
            best = best.max(entry.start as usize - prev_end);
            prev_end = entry.end as usize;
        }
        best = best.max(table_start.saturating_sub(prev_end + SLOT_ENTRY_SIZE));
        Ok(best)
    }
}
