//! Block cache with pinning.
//!
//! All byte access to the device goes through here. A block is pinned
//! via BlockStore::pin(), which returns a PinnedBlock guard; when the guard
//! is dropped, the block is either unpinned as clean or marked dirty,
//! depending on whether its bytes were borrowed mutably.
//!
//! Unpinned blocks are kept in an LRU cache; dirty blocks are written
//! back when evicted, or on save_all().
//!
//! Structural changes run as a transaction (begin_txn()): the first time a
//! block is modified, its previous bytes are saved, and abort_txn() puts
//! them all back, so a failed operation leaves no partial changes behind.
//!
//! Never call into the store while holding the bytes of a pinned block:
//! write-back reads block bytes under the store lock.

use lru::LruCache;
use std::collections::HashMap;
use std::io::Result;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use crate::BlockDevice;

type BlockBuf = Arc<RwLock<Box<[u8]>>>;

struct PinnedEntry {
    buf: BlockBuf,
    pins: usize,
    dirty: bool,
}

struct CachedEntry {
    buf: BlockBuf,
    dirty: bool,
}

struct StoreState {
    device: Box<dyn BlockDevice>,
    pinned: HashMap<u64, PinnedEntry>,
    cache: LruCache<u64, CachedEntry>,
    capacity: usize,
    closed: bool,
}

impl StoreState {
    fn write_back(&mut self, block_no: u64, buf: &BlockBuf) -> Result<()> {
        log::trace!("BlockStore: writing block {block_no}");
        let bytes = buf.read().unwrap_or_else(PoisonError::into_inner);
        self.device.write_block(block_no, &bytes)
    }

    // Makes room for one more block in the LRU cache.
    fn evict(&mut self) -> Result<()> {
        while self.cache.len() >= self.capacity {
            let Some((block_no, entry)) = self.cache.pop_lru() else {
                break;
            };
            if entry.dirty {
                if let Err(err) = self.write_back(block_no, &entry.buf) {
                    self.cache.put(block_no, entry);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

pub(crate) struct BlockStore {
    block_size: usize,
    state: Mutex<StoreState>,
    monitors: Mutex<HashMap<u64, Weak<Mutex<()>>>>,
    // Block bytes as they were before the current transaction touched them.
    journal: Mutex<Option<HashMap<u64, Box<[u8]>>>>,
}

impl BlockStore {
    pub fn new(device: Box<dyn BlockDevice>, capacity: usize) -> Self {
        Self {
            block_size: device.block_size(),
            state: Mutex::new(StoreState {
                device,
                pinned: HashMap::new(),
                cache: LruCache::unbounded(),
                capacity: capacity.max(1),
                closed: false,
            }),
            monitors: Mutex::new(HashMap::new()),
            journal: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the block (or finds it already pinned) and increments its pin count.
    /// Must be matched by exactly one unget() or mark_dirty().
    fn get(&self, block_no: u64, zeroed: bool) -> Result<BlockBuf> {
        let mut state = self.state();
        if state.closed {
            return Err(crate::error::closed());
        }

        if let Some(entry) = state.pinned.get_mut(&block_no) {
            entry.pins += 1;
            if zeroed {
                entry.buf.write().unwrap_or_else(PoisonError::into_inner).fill(0);
            }
            return Ok(entry.buf.clone());
        }

        let (buf, dirty) = if let Some(entry) = state.cache.pop(&block_no) {
            if zeroed {
                entry.buf.write().unwrap_or_else(PoisonError::into_inner).fill(0);
            }
            (entry.buf, entry.dirty)
        } else {
            state.evict()?;
            let mut bytes = vec![0_u8; self.block_size].into_boxed_slice();
            if !zeroed {
                log::trace!("BlockStore: reading block {block_no}");
                state.device.read_block(block_no, &mut bytes)?;
            }
            (Arc::new(RwLock::new(bytes)), false)
        };

        state.pinned.insert(
            block_no,
            PinnedEntry {
                buf: buf.clone(),
                pins: 1,
                dirty,
            },
        );
        Ok(buf)
    }

    fn release(&self, block_no: u64, dirty: bool) {
        let mut state = self.state();
        let Some(entry) = state.pinned.get_mut(&block_no) else {
            debug_assert!(false, "Block {block_no} is not pinned.");
            log::error!("BlockStore: unbalanced unpin of block {block_no}");
            return;
        };

        entry.dirty |= dirty;
        entry.pins -= 1;
        if entry.pins == 0 {
            if let Some(entry) = state.pinned.remove(&block_no) {
                state.cache.put(
                    block_no,
                    CachedEntry {
                        buf: entry.buf,
                        dirty: entry.dirty,
                    },
                );
            }
        }
    }

    /// Unpins a block without requiring it to be persisted.
    pub fn unget(&self, block_no: u64) {
        self.release(block_no, false)
    }

    /// Unpins a block; it will be written back at or before eviction.
    pub fn mark_dirty(&self, block_no: u64) {
        self.release(block_no, true)
    }

    pub fn pin(&self, block_no: u64) -> Result<PinnedBlock<'_>> {
        let buf = self.get(block_no, false)?;
        Ok(PinnedBlock {
            store: self,
            block_no,
            buf,
            dirty: false,
        })
    }

    /// Pins a block without reading it: its bytes are zeroed. Use with caution:
    /// any previously stored data in the block will be lost.
    pub fn pin_empty(&self, block_no: u64) -> Result<PinnedBlock<'_>> {
        // A transaction needs the old bytes to roll back to.
        let in_txn = self.journal().is_some();
        let buf = self.get(block_no, !in_txn)?;
        let mut block = PinnedBlock {
            store: self,
            block_no,
            buf,
            dirty: true,
        };
        if in_txn {
            block.bytes_mut().fill(0);
        }
        Ok(block)
    }

    fn journal(&self) -> MutexGuard<'_, Option<HashMap<u64, Box<[u8]>>>> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Saves the bytes of a block about to be modified, once per transaction.
    fn record_old_bytes(&self, block_no: u64, buf: &BlockBuf) {
        if let Some(journal) = self.journal().as_mut() {
            journal
                .entry(block_no)
                .or_insert_with(|| buf.read().unwrap_or_else(PoisonError::into_inner).clone());
        }
    }

    /// Starts tracking modified blocks. Transactions do not nest.
    pub fn begin_txn(&self) {
        let mut journal = self.journal();
        debug_assert!(journal.is_none());
        *journal = Some(HashMap::new());
    }

    /// Keeps all changes made since begin_txn().
    pub fn commit_txn(&self) {
        self.journal().take();
    }

    /// Reverts every block modified since begin_txn().
    pub fn abort_txn(&self) -> Result<()> {
        let Some(journal) = self.journal().take() else {
            return Ok(());
        };
        log::debug!("BlockStore: rolling back {} blocks", journal.len());
        for (block_no, bytes) in journal {
            let mut block = self.pin(block_no)?;
            block.bytes_mut().copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Writes all dirty blocks, pinned or not, and flushes the device.
    pub fn save_all(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(crate::error::closed());
        }
        Self::save_locked(&mut state)
    }

    fn save_locked(state: &mut StoreState) -> Result<()> {
        let mut dirty = Vec::new();
        for (block_no, entry) in state.pinned.iter() {
            if entry.dirty {
                dirty.push((*block_no, entry.buf.clone()));
            }
        }
        for (block_no, entry) in state.cache.iter() {
            if entry.dirty {
                dirty.push((*block_no, entry.buf.clone()));
            }
        }
        dirty.sort_by_key(|(block_no, _)| *block_no);

        for (block_no, buf) in dirty.iter() {
            state.write_back(*block_no, buf)?;
            if let Some(entry) = state.pinned.get_mut(block_no) {
                entry.dirty = false;
            } else if let Some(entry) = state.cache.peek_mut(block_no) {
                entry.dirty = false;
            }
        }

        state.device.flush()
    }

    /// Drops all unpinned cached blocks, including unsaved changes.
    pub fn discard_all(&self) {
        let mut state = self.state();
        let lost = state.cache.iter().filter(|(_, e)| e.dirty).count();
        if lost > 0 {
            log::warn!("BlockStore: discarding {lost} dirty blocks.");
        }
        state.cache.clear();
        for entry in state.pinned.values_mut() {
            entry.dirty = false;
        }
    }

    /// Saves everything and closes the device. All later calls fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(crate::error::closed());
        }
        if !state.pinned.is_empty() {
            log::warn!("BlockStore: closing with {} pinned blocks.", state.pinned.len());
        }
        Self::save_locked(&mut state)?;
        state.closed = true;
        state.cache.clear();
        state.device.close()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// The mutex guarding a block against concurrent logical updates.
    pub fn monitor(&self, block_no: u64) -> Arc<Mutex<()>> {
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(monitor) = monitors.get(&block_no).and_then(Weak::upgrade) {
            return monitor;
        }

        if monitors.len() >= 64 {
            monitors.retain(|_, monitor| monitor.strong_count() > 0);
        }
        let monitor = Arc::new(Mutex::new(()));
        monitors.insert(block_no, Arc::downgrade(&monitor));
        monitor
    }

    #[cfg(test)]
    pub fn pin_count(&self, block_no: u64) -> usize {
        self.state().pinned.get(&block_no).map(|e| e.pins).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn monitor_count(&self) -> usize {
        let monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        monitors.values().filter(|m| m.strong_count() > 0).count()
    }
}

/// A pinned block. Unpinned on drop: as dirty if bytes_mut() was called.
pub(crate) struct PinnedBlock<'a> {
    store: &'a BlockStore,
    block_no: u64,
    buf: BlockBuf,
    dirty: bool,
}

impl PinnedBlock<'_> {
    pub fn bytes(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bytes_mut(&mut self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.store.record_old_bytes(self.block_no, &self.buf);
        self.dirty = true;
        self.buf.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PinnedBlock<'_> {
    fn drop(&mut self) {
        if self.dirty {
            self.store.mark_dirty(self.block_no);
        } else {
            self.store.unget(self.block_no);
        }
    }
}
