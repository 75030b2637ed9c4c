use std::io::{ErrorKind, Result};
use std::sync::{Arc, Mutex, PoisonError};

/// Synchronous Block Device.
pub trait BlockDevice: Send {
    /// The size of a single block in bytes.
    fn block_size(&self) -> usize;

    /// The number of blocks in this device.
    fn num_blocks(&self) -> u64;

    /// Read a single block into buf.
    /// buf must be of length block_size().
    fn read_block(&mut self, block_no: u64, buf: &mut [u8]) -> Result<()>;

    /// Write a single block. Same requirements as in read_block.
    fn write_block(&mut self, block_no: u64, buf: &[u8]) -> Result<()>;

    /// Flush written blocks to the underlying storage.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the device. No calls are made after this one.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// A block device backed by a shared in-memory buffer.
///
/// Clones share the same bytes, so a filesystem can be closed and
/// reopened on the "same" device.
#[derive(Clone)]
pub struct MemBlockDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    block_size: usize,
    num_blocks: u64,
}

impl MemBlockDevice {
    pub fn new(num_blocks: u64, block_size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; num_blocks as usize * block_size])),
            block_size,
            num_blocks,
        }
    }

    fn range(&self, block_no: u64, len: usize) -> Result<core::ops::Range<usize>> {
        if block_no >= self.num_blocks || len != self.block_size {
            log::debug!("MemBlockDevice: bad block {block_no} (buf len {len}).");
            return Err(ErrorKind::InvalidInput.into());
        }
        let start = block_no as usize * self.block_size;
        Ok(start..(start + self.block_size))
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&mut self, block_no: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(block_no, buf.len())?;
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_block(&mut self, block_no: u64, buf: &[u8]) -> Result<()> {
        let range = self.range(block_no, buf.len())?;
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[range].copy_from_slice(buf);
        Ok(())
    }
}
