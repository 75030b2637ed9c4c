//! The filesystem facade and the engine behind every handle.

use std::io::{ErrorKind, Result};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::block_store::BlockStore;
use crate::layout::*;
use crate::lock::{self, StructureGuard};
use crate::range_alloc::RangeAllocator;
use crate::record::{Body, FileContent, Record};
use crate::slot_alloc::SlotTable;
use crate::{BlockDevice, CACHE_SIZE, Element, Folder, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Runtime knobs for open_with() and format_with().
#[derive(Clone, Debug)]
pub struct FsOptions {
    /// How many unpinned blocks the cache keeps.
    pub cache_blocks: usize,
    /// When the session started; locks taken earlier are stale.
    /// Defaults to the time of opening.
    pub session_start: Option<Timestamp>,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache_blocks: CACHE_SIZE,
            session_start: None,
        }
    }
}

pub(crate) struct Engine {
    pub(crate) store: BlockStore,
    pub(crate) num_blocks: u64,
    pub(crate) block_size: usize,
    pub(crate) session_start: Timestamp,
    // Structural operations hold it exclusively, everything else shared.
    gate: RwLock<()>,
}

impl Engine {
    pub(crate) fn ranges(&self) -> RangeAllocator<'_> {
        RangeAllocator::new(&self.store, self.num_blocks)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.store.is_closed() {
            return Err(crate::error::closed());
        }
        Ok(())
    }

    pub(crate) fn lock_structure(&self) -> Result<StructureGuard<'_>> {
        self.check_open()?;
        lock::lock_structure(&self.gate, &self.store, self.session_start)
    }

    /// Runs `f` under the structural lock as one transaction: if `f` fails,
    /// every block it modified is restored.
    pub(crate) fn structural<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let _guard = self.lock_structure()?;
        self.store.begin_txn();
        match f(self) {
            Ok(val) => {
                self.store.commit_txn();
                Ok(val)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.abort_txn() {
                    log::error!("Rollback after {err:?} failed: {rollback_err:?}");
                }
                Err(err)
            }
        }
    }

    fn read_gate(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.check_open()?;
        Ok(self.gate.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs `f` on the record of `id` with the record's block pinned and its
    /// monitor held. Records do not move while `f` runs, so `f` may only
    /// change the record in place.
    pub(crate) fn with_record<T>(
        &self,
        id: ElementId,
        f: impl FnOnce(&Self, &mut Record) -> Result<T>,
    ) -> Result<T> {
        let _gate = self.read_gate()?;
        let loc = self.locate(id)?;
        let _pin = self.store.pin(loc.block_no)?;
        let monitor = self.store.monitor(loc.block_no);
        let _monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self.load(id)?;
        f(self, &mut record)
    }

    /// Runs `f` on the record of `id` as a structural transaction.
    pub(crate) fn with_structure<T>(
        &self,
        id: ElementId,
        f: impl FnOnce(&Self, &mut Record) -> Result<T>,
    ) -> Result<T> {
        self.structural(|engine| {
            let loc = engine.locate(id)?;
            let _pin = engine.store.pin(loc.block_no)?;

            let mut record = engine.load(id)?;
            f(engine, &mut record)
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.store.is_closed() {
            if let Err(err) = self.store.close() {
                log::error!("Failed to close the filesystem: {err:?}");
            }
        }
    }
}

fn validate_geometry(block_size: usize, block_count: u64, device_blocks: u64) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        log::debug!("Unsupported block size {block_size}.");
        return Err(ErrorKind::InvalidInput.into());
    }
    if block_count < 4 || block_count > device_blocks {
        log::debug!("Bad block count {block_count} (the device has {device_blocks}).");
        return Err(ErrorKind::InvalidInput.into());
    }
    Ok(())
}

/// A filesystem on a block device. Clones refer to the same filesystem.
#[derive(Clone)]
pub struct FileSystem {
    engine: Arc<Engine>,
}

impl FileSystem {
    /// Creates an empty filesystem using the first `block_count` blocks
    /// of `device`.
    pub fn format<D: BlockDevice + 'static>(device: D, block_count: u64) -> Result<Self> {
        Self::format_with(device, block_count, FsOptions::default())
    }

    pub fn format_with<D: BlockDevice + 'static>(
        device: D,
        block_count: u64,
        options: FsOptions,
    ) -> Result<Self> {
        let block_size = device.block_size();
        validate_geometry(block_size, block_count, device.num_blocks())?;

        let engine = Engine {
            store: BlockStore::new(Box::new(device), options.cache_blocks),
            num_blocks: block_count,
            block_size,
            session_start: options.session_start.unwrap_or_else(Timestamp::now),
            gate: RwLock::new(()),
        };

        // The superblock is written first and marked complete last.
        let mut sb = Superblock {
            magic: MAGIC,
            version: VERSION,
            num_blocks: block_count,
            block_size: block_size as u64,
            ..Default::default()
        };
        sb.set_crc32();
        write_pod(&mut engine.store.pin_empty(SUPERBLOCK_NO)?.bytes_mut(), 0, &sb);

        engine.ranges().format(FIRST_RECORD_BLOCK + 1)?;

        let root = Record::new_detached(
            RecordHeader::new(ElementId::ROOT, ElementId::ROOT, ElementFlags::FOLDER),
            Body::Folder {
                children: Vec::new(),
            },
        );
        let directory = Record::new_detached(
            RecordHeader::new(ElementId::DIRECTORY, ElementId::ROOT, ElementFlags::FILE),
            Body::File(FileContent::default()),
        );

        let mut records = [root, directory];
        {
            let mut block = engine.store.pin_empty(FIRST_RECORD_BLOCK)?;
            let mut bytes = block.bytes_mut();
            let mut slots = SlotTable::init(&mut bytes);
            for record in records.iter_mut() {
                record.disk_len = record.encoded_len();
                record.loc = Location::new(FIRST_RECORD_BLOCK, slots.allocate(record.disk_len)?);
            }
        }
        for record in records.iter() {
            engine.write_new_record(record)?;
        }

        let [root, directory] = &records;
        engine.update_superblock(|sb| {
            sb.root_block = root.loc.block_no;
            sb.root_offset = root.loc.offset as u32;
            sb.directory_block = directory.loc.block_no;
            sb.directory_offset = directory.loc.offset as u32;
            sb.formatted = FORMAT_COMPLETE;
        })?;
        engine.store.save_all()?;

        log::info!("Formatted a filesystem: {block_count} blocks of {block_size} bytes.");
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn open<D: BlockDevice + 'static>(device: D) -> Result<Self> {
        Self::open_with(device, FsOptions::default())
    }

    pub fn open_with<D: BlockDevice + 'static>(device: D, options: FsOptions) -> Result<Self> {
        let block_size = device.block_size();
        let device_blocks = device.num_blocks();
        let store = BlockStore::new(Box::new(device), options.cache_blocks);

        let sb: Superblock = read_pod(&store.pin(SUPERBLOCK_NO)?.bytes(), 0);
        sb.validate()?;
        if sb.block_size != block_size as u64 {
            log::error!(
                "Block size mismatch: the device has {block_size}, the filesystem {}.",
                sb.block_size
            );
            return Err(ErrorKind::InvalidData.into());
        }
        validate_geometry(block_size, sb.num_blocks, device_blocks)?;

        let engine = Engine {
            store,
            num_blocks: sb.num_blocks,
            block_size,
            session_start: options.session_start.unwrap_or_else(Timestamp::now),
            gate: RwLock::new(()),
        };
        log::info!(
            "Opened a filesystem: {} blocks of {block_size} bytes, {} in use.",
            engine.num_blocks,
            engine.ranges().used_blocks()?
        );
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn root(&self) -> Folder {
        self.engine.root()
    }

    /// The element with the given ID. The directory file is not accessible.
    pub fn from_id(&self, id: ElementId) -> Result<Element> {
        self.engine.element(id)
    }

    /// Resolves a '/'-separated path from the root. Links to folders are
    /// followed in the middle of the path; the last element is returned as is.
    pub fn lookup(&self, path: &str) -> Result<Element> {
        let mut current = Element::Folder(self.root());
        for name in path.split('/').filter(|c| !c.is_empty()) {
            let folder = match current {
                Element::Link(link) => link.target(None)?.into_folder()?,
                other => other.into_folder()?,
            };
            current = folder.get_element_by_name(name, None)?;
        }
        Ok(current)
    }

    pub fn block_count(&self) -> u64 {
        self.engine.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.engine.block_size
    }

    pub fn used_blocks(&self) -> Result<u64> {
        let _gate = self.engine.read_gate()?;
        self.engine.ranges().used_blocks()
    }

    pub fn free_blocks(&self) -> Result<u64> {
        Ok(self.engine.num_blocks - self.used_blocks()?)
    }

    pub fn session_start(&self) -> Timestamp {
        self.engine.session_start
    }

    /// Writes all cached changes to the device.
    pub fn flush(&self) -> Result<()> {
        self.engine.check_open()?;
        let _gate = self.engine.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.engine.store.save_all()
    }

    /// Flushes and closes the device. All handles fail from now on.
    pub fn close(&self) -> Result<()> {
        let _gate = self.engine.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.engine.store.close()?;
        log::info!("Closed the filesystem.");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}
