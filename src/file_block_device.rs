use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Result, Seek, SeekFrom, Write},
    path::Path,
};

use crate::BlockDevice;

/// A block device backed by a host file.
pub struct FileBlockDevice {
    file: File,
    block_size: usize,
    num_blocks: u64,
}

impl FileBlockDevice {
    pub fn open(path: &Path, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(ErrorKind::InvalidInput.into());
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len & (block_size as u64 - 1) != 0 {
            return Err(ErrorKind::InvalidData.into());
        }

        Ok(Self {
            file,
            block_size,
            num_blocks: len >> block_size.ilog2(),
        })
    }

    pub fn create(path: &Path, num_blocks: u64, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(ErrorKind::InvalidInput.into());
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        file.set_len(num_blocks << block_size.ilog2())?;

        Ok(Self {
            file,
            block_size,
            num_blocks,
        })
    }

    fn seek_to(&mut self, block_no: u64, len: usize) -> Result<()> {
        if block_no >= self.num_blocks || len != self.block_size {
            log::debug!("Block number {block_no} out of range.");
            return Err(ErrorKind::InvalidInput.into());
        }

        self.file
            .seek(SeekFrom::Start(block_no * (self.block_size as u64)))
            .map(|_| ())
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&mut self, block_no: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_to(block_no, buf.len())?;
        self.file.read_exact(buf)
    }

    fn write_block(&mut self, block_no: u64, buf: &[u8]) -> Result<()> {
        self.seek_to(block_no, buf.len())?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()
    }
}
