//! Whole-block allocation.
//!
//! Block #1 holds the table of allocated block ranges: a header followed by
//! ascending, disjoint `[start, start + count)` ranges. Touching ranges are
//! kept merged. Everything not covered by the table is free; the free space
//! above the last allocated range is "the tail", and allocations prefer gaps
//! below it before growing into it.

use std::io::{ErrorKind, Result};

use crate::block_store::BlockStore;
use crate::layout::*;

const HEADER_SIZE: usize = core::mem::size_of::<RangeTableHeader>();
const RANGE_SIZE: usize = core::mem::size_of::<BlockRange>();

pub(crate) fn table_capacity(block_size: usize) -> usize {
    (block_size - HEADER_SIZE) / RANGE_SIZE
}

pub(crate) fn read_ranges(bytes: &[u8], num_blocks: u64) -> Result<Vec<BlockRange>> {
    let header: RangeTableHeader = read_pod(bytes, 0);
    if header.count as usize > table_capacity(bytes.len()) {
        return Err(crate::error::corrupted(format_args!(
            "block range table too long: {}",
            header.count
        )));
    }

    let mut ranges = Vec::with_capacity(header.count as usize);
    let mut prev_end = 0;
    for idx in 0..(header.count as usize) {
        let range: BlockRange = read_pod(bytes, HEADER_SIZE + idx * RANGE_SIZE);
        if range.count == 0 || (idx > 0 && range.start <= prev_end) || range.end() > num_blocks {
            return Err(crate::error::corrupted(format_args!(
                "bad block range {range:?}"
            )));
        }
        prev_end = range.end();
        ranges.push(range);
    }

    Ok(ranges)
}

pub(crate) fn write_ranges(bytes: &mut [u8], ranges: &[BlockRange]) -> Result<()> {
    if ranges.len() > table_capacity(bytes.len()) {
        log::debug!("Block range table is full.");
        return Err(ErrorKind::StorageFull.into());
    }

    let header = RangeTableHeader {
        count: ranges.len() as u64,
        _reserved: 0,
    };
    write_pod(bytes, 0, &header);
    for (idx, range) in ranges.iter().enumerate() {
        write_pod(bytes, HEADER_SIZE + idx * RANGE_SIZE, range);
    }
    Ok(())
}

/// Free runs, ascending; the last one may be the tail.
fn free_gaps(ranges: &[BlockRange], num_blocks: u64) -> Vec<BlockRange> {
    let mut gaps = Vec::with_capacity(ranges.len() + 1);
    let mut prev_end = 0;
    for range in ranges {
        if range.start > prev_end {
            gaps.push(BlockRange::new(prev_end, range.start - prev_end));
        }
        prev_end = range.end();
    }
    if num_blocks > prev_end {
        gaps.push(BlockRange::new(prev_end, num_blocks - prev_end));
    }
    gaps
}

fn mark_used(ranges: &mut Vec<BlockRange>, used: BlockRange) {
    let idx = ranges.partition_point(|r| r.start < used.start);
    let merge_left = idx > 0 && ranges[idx - 1].end() == used.start;
    let merge_right = idx < ranges.len() && ranges[idx].start == used.end();

    match (merge_left, merge_right) {
        (true, true) => {
            ranges[idx - 1].count += used.count + ranges[idx].count;
            ranges.remove(idx);
        }
        (true, false) => ranges[idx - 1].count += used.count,
        (false, true) => {
            ranges[idx].start = used.start;
            ranges[idx].count += used.count;
        }
        (false, false) => ranges.insert(idx, used),
    }
}

fn total_blocks(ranges: &[BlockRange]) -> u64 {
    ranges.iter().map(|r| r.count).sum()
}

// A single run of `count` blocks: the best-fitting gap below the tail, or the tail.
fn find_contiguous(ranges: &[BlockRange], num_blocks: u64, count: u64) -> Option<BlockRange> {
    let gaps = free_gaps(ranges, num_blocks);
    let tail_start = ranges.last().map(|r| r.end()).unwrap_or(0);

    gaps.iter()
        .filter(|g| g.start < tail_start && g.count >= count)
        .min_by_key(|g| g.count)
        .or_else(|| gaps.last().filter(|g| g.start >= tail_start && g.count >= count))
        .map(|g| BlockRange::new(g.start, count))
}

/// Allocates `count` blocks, possibly as several runs.
pub(crate) fn allocate_in(
    ranges: &mut Vec<BlockRange>,
    num_blocks: u64,
    count: u64,
) -> Result<Vec<BlockRange>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    if let Some(run) = find_contiguous(ranges, num_blocks, count) {
        mark_used(ranges, run);
        return Ok(vec![run]);
    }

    let gaps = free_gaps(ranges, num_blocks);
    if total_blocks(&gaps) < count {
        log::debug!("Out of blocks: need {count}.");
        return Err(ErrorKind::StorageFull.into());
    }

    let mut result = Vec::new();
    let mut needed = count;
    for gap in gaps {
        let take = gap.count.min(needed);
        let run = BlockRange::new(gap.start, take);
        mark_used(ranges, run);
        result.push(run);
        needed -= take;
        if needed == 0 {
            break;
        }
    }

    Ok(result)
}

/// Allocates exactly one run of `count` blocks.
pub(crate) fn allocate_contiguous_in(
    ranges: &mut Vec<BlockRange>,
    num_blocks: u64,
    count: u64,
) -> Result<BlockRange> {
    let Some(run) = find_contiguous(ranges, num_blocks, count.max(1)) else {
        log::debug!("No contiguous run of {count} blocks.");
        return Err(ErrorKind::StorageFull.into());
    };
    mark_used(ranges, run);
    Ok(run)
}

/// Marks `[range.end(), range.end() + extra)` as used if all of it is free.
pub(crate) fn try_extend_in(
    ranges: &mut Vec<BlockRange>,
    num_blocks: u64,
    range: BlockRange,
    extra: u64,
) -> bool {
    let wanted = BlockRange::new(range.end(), extra);
    if extra == 0 || wanted.end() > num_blocks {
        return false;
    }
    let overlaps = ranges
        .iter()
        .any(|r| r.start < wanted.end() && wanted.start < r.end());
    if overlaps {
        return false;
    }

    mark_used(ranges, wanted);
    true
}

/// Returns `range` to free space; it must lie within one allocated range.
pub(crate) fn free_in(ranges: &mut Vec<BlockRange>, range: BlockRange) -> Result<()> {
    if range.count == 0 {
        return Ok(());
    }
    let Some(idx) = ranges.iter().position(|r| r.contains(&range)) else {
        return Err(crate::error::corrupted(format_args!(
            "freeing unallocated blocks {range:?}"
        )));
    };

    let old = ranges[idx];
    match (old.start == range.start, old.end() == range.end()) {
        (true, true) => {
            ranges.remove(idx);
        }
        (true, false) => {
            ranges[idx].start = range.end();
            ranges[idx].count -= range.count;
        }
        (false, true) => ranges[idx].count -= range.count,
        (false, false) => {
            ranges[idx].count = range.start - old.start;
            ranges.insert(idx + 1, BlockRange::new(range.end(), old.end() - range.end()));
        }
    }
    Ok(())
}

/// The allocator, bound to the block store.
pub(crate) struct RangeAllocator<'a> {
    store: &'a BlockStore,
    num_blocks: u64,
}

impl<'a> RangeAllocator<'a> {
    pub fn new(store: &'a BlockStore, num_blocks: u64) -> Self {
        Self { store, num_blocks }
    }

    /// Sets up the table on a freshly formatted device: blocks
    /// `[0, reserved)` are in use.
    pub fn format(&self, reserved: u64) -> Result<()> {
        let mut block = self.store.pin_empty(RANGE_TABLE_NO)?;
        let mut bytes = block.bytes_mut();
        write_ranges(&mut bytes, &[BlockRange::new(0, reserved)])
    }

    // Loads the table, applies `f`, and stores the table if `f` succeeded.
    fn update<T>(&self, f: impl FnOnce(&mut Vec<BlockRange>) -> Result<T>) -> Result<T> {
        let mut block = self.store.pin(RANGE_TABLE_NO)?;
        let mut ranges = read_ranges(&block.bytes(), self.num_blocks)?;
        let result = f(&mut ranges)?;
        write_ranges(&mut block.bytes_mut(), &ranges)?;
        Ok(result)
    }

    pub fn allocate(&self, count: u64) -> Result<Vec<BlockRange>> {
        let num_blocks = self.num_blocks;
        let runs = self.update(|ranges| allocate_in(ranges, num_blocks, count))?;
        log::trace!("RangeAllocator: allocated {runs:?}");
        Ok(runs)
    }

    pub fn allocate_contiguous(&self, count: u64) -> Result<BlockRange> {
        let num_blocks = self.num_blocks;
        let run = self.update(|ranges| allocate_contiguous_in(ranges, num_blocks, count))?;
        log::trace!("RangeAllocator: allocated {run:?}");
        Ok(run)
    }

    /// A single block, e.g. for element records.
    pub fn allocate_block(&self) -> Result<u64> {
        Ok(self.allocate_contiguous(1)?.start)
    }

    pub fn try_extend(&self, range: BlockRange, extra: u64) -> Result<bool> {
        let num_blocks = self.num_blocks;
        self.update(|ranges| Ok(try_extend_in(ranges, num_blocks, range, extra)))
    }

    pub fn free(&self, range: BlockRange) -> Result<()> {
        log::trace!("RangeAllocator: freeing {range:?}");
        self.update(|ranges| free_in(ranges, range))
    }

    pub fn used_blocks(&self) -> Result<u64> {
        let block = self.store.pin(RANGE_TABLE_NO)?;
        let ranges = read_ranges(&block.bytes(), self.num_blocks)?;
        Ok(total_blocks(&ranges))
    }
}
