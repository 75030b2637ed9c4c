//! File content: a byte length plus the list of block runs (extents)
//! holding the bytes, in order.

use std::io::{ErrorKind, Result};

use crate::fs::Engine;
use crate::layout::*;
use crate::lock::{Forbid, LockToken};
use crate::record::{FileContent, Record};
use crate::Node;

/// A piece of a byte range that falls into one block.
struct Chunk {
    block_no: u64,
    block_offset: usize,
    /// Offset into the caller's buffer.
    pos: usize,
    len: usize,
}

impl Engine {
    // Splits [offset, offset + len) of the file into per-block chunks.
    fn map_range(&self, content: &FileContent, offset: u64, len: usize) -> Result<Vec<Chunk>> {
        let block_size = self.block_size as u64;
        let mut chunks = Vec::with_capacity(len / self.block_size + 2);
        let mut pos = 0;
        let mut extent_base = 0;

        for extent in &content.extents {
            if pos == len {
                break;
            }
            while pos < len {
                let file_offset = offset + pos as u64;
                let file_block = file_offset / block_size;
                if file_block >= extent_base + extent.count {
                    break;
                }
                let block_offset = (file_offset % block_size) as usize;
                let chunk_len = (self.block_size - block_offset).min(len - pos);
                chunks.push(Chunk {
                    block_no: extent.start + (file_block - extent_base),
                    block_offset,
                    pos,
                    len: chunk_len,
                });
                pos += chunk_len;
            }
            extent_base += extent.count;
        }

        if pos < len {
            return Err(crate::error::corrupted(format_args!(
                "file extents end before byte {}",
                offset + pos as u64
            )));
        }
        Ok(chunks)
    }

    pub(crate) fn read_content(
        &self,
        content: &FileContent,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        for chunk in self.map_range(content, offset, buf.len())? {
            let block = self.store.pin(chunk.block_no)?;
            let bytes = block.bytes();
            buf[chunk.pos..(chunk.pos + chunk.len)].copy_from_slice(
                &bytes[chunk.block_offset..(chunk.block_offset + chunk.len)],
            );
        }
        Ok(())
    }

    pub(crate) fn write_content(
        &self,
        content: &FileContent,
        offset: u64,
        buf: &[u8],
    ) -> Result<()> {
        for chunk in self.map_range(content, offset, buf.len())? {
            // Whole blocks are overwritten without reading them first.
            let mut block = if chunk.len == self.block_size {
                self.store.pin_empty(chunk.block_no)?
            } else {
                self.store.pin(chunk.block_no)?
            };
            let mut bytes = block.bytes_mut();
            bytes[chunk.block_offset..(chunk.block_offset + chunk.len)]
                .copy_from_slice(&buf[chunk.pos..(chunk.pos + chunk.len)]);
        }
        Ok(())
    }

    fn free_runs(&self, runs: &[BlockRange]) -> Result<()> {
        for run in runs.iter().rev() {
            self.ranges().free(*run)?;
        }
        Ok(())
    }

    /// Appends `buf` to the file, growing its extent list. Must be called
    /// under the structural lock.
    pub(crate) fn append_content(&self, record: &mut Record, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let block_size = self.block_size as u64;
        let saved = record.content()?.clone();
        let old_len = saved.length;
        let new_len = old_len + buf.len() as u64;
        let needed = new_len
            .div_ceil(block_size)
            .saturating_sub(saved.capacity_blocks());

        let mut added = Vec::new();
        if needed > 0 {
            let mut remaining = needed;
            if let Some(last) = saved.extents.last() {
                if self.ranges().try_extend(*last, remaining)? {
                    added.push(BlockRange::new(last.end(), remaining));
                    remaining = 0;
                }
            }
            if remaining > 0 {
                match self.ranges().allocate(remaining) {
                    Ok(runs) => added.extend(runs),
                    Err(err) => {
                        self.free_runs(&added)?;
                        return Err(err);
                    }
                }
            }
        }

        let content = record.content_mut()?;
        for run in added.iter() {
            content.push_extent(*run);
        }
        content.length = new_len;

        let written = self.write_content(record.content()?, old_len, buf);
        let saved_record = match written {
            Ok(()) => {
                record.touch(true);
                self.save(record)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = saved_record {
            log::debug!("File {}: append of {} bytes failed: {err:?}", record.id(), buf.len());
            *record.content_mut()? = saved;
            self.free_runs(&added)?;
            return Err(err);
        }
        Ok(())
    }

    /// Shrinks the file to `new_len` bytes, freeing blocks past the end.
    /// Must be called under the structural lock.
    pub(crate) fn truncate_content(&self, record: &mut Record, new_len: u64) -> Result<()> {
        let saved = record.content()?.clone();
        if new_len == saved.length {
            return Ok(());
        }
        if new_len > saved.length {
            return Err(ErrorKind::InvalidInput.into());
        }

        let keep_blocks = new_len.div_ceil(self.block_size as u64);
        let mut kept = Vec::new();
        let mut freed = Vec::new();
        let mut base = 0;
        for extent in saved.extents.iter() {
            if base >= keep_blocks {
                freed.push(*extent);
            } else if base + extent.count > keep_blocks {
                let keep = keep_blocks - base;
                kept.push(BlockRange::new(extent.start, keep));
                freed.push(BlockRange::new(extent.start + keep, extent.count - keep));
            } else {
                kept.push(*extent);
            }
            base += extent.count;
        }

        let content = record.content_mut()?;
        content.extents = kept;
        content.length = new_len;
        record.touch(true);
        if let Err(err) = self.save(record) {
            *record.content_mut()? = saved;
            return Err(err);
        }

        // The record no longer refers to these blocks.
        self.free_runs(&freed)
    }
}

/// A file handle.
#[derive(Clone)]
pub struct File {
    pub(crate) node: Node,
}

impl core::ops::Deref for File {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "File({})", self.node.id())
    }
}

impl File {
    /// The file size in bytes.
    pub fn length(&self) -> Result<u64> {
        self.engine()
            .with_record(self.id(), |_, record| Ok(record.content()?.length))
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn get_content(&self, offset: u64, buf: &mut [u8], lock: Option<LockToken>) -> Result<()> {
        self.engine().with_record(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            let content = record.content()?;
            if offset.checked_add(buf.len() as u64).is_none_or(|end| end > content.length) {
                return Err(crate::error::out_of_range());
            }
            engine.read_content(content, offset, buf)
        })
    }

    /// Overwrites `buf.len()` bytes at `offset`; the file does not grow.
    pub fn set_content(&self, offset: u64, buf: &[u8], lock: Option<LockToken>) -> Result<()> {
        self.engine().with_record(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::WRITE)?;
            let content = record.content()?;
            if offset.checked_add(buf.len() as u64).is_none_or(|end| end > content.length) {
                return Err(crate::error::out_of_range());
            }
            engine.write_content(content, offset, buf)?;
            record.touch(true);
            engine.write_header(record.loc, &record.header)
        })
    }

    /// Appends `buf` at the end of the file. Appending nothing does nothing.
    pub fn append_content(&self, buf: &[u8], lock: Option<LockToken>) -> Result<()> {
        if buf.is_empty() {
            return self.engine().check_open();
        }
        self.engine().with_structure(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::WRITE)?;
            engine.append_content(record, buf)
        })
    }

    /// Shrinks the file to `new_len` bytes. Truncating to the current length
    /// does nothing; growing the file this way is not possible.
    pub fn truncate(&self, new_len: u64, lock: Option<LockToken>) -> Result<()> {
        self.engine().with_structure(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::WRITE)?;
            engine.truncate_content(record, new_len)
        })
    }

    /// The file's block runs, in order.
    #[cfg(test)]
    pub(crate) fn extents(&self) -> Result<Vec<BlockRange>> {
        self.engine()
            .with_record(self.id(), |_, record| Ok(record.content()?.extents.clone()))
    }
}
