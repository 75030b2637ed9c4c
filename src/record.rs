//! Element records: one tagged type for folders, files and links.
//!
//! A record is loaded into memory, modified, and saved back. Saving a record
//! whose length changed resizes its slot in place when the block has room,
//! and otherwise relocates the record into a fresh block and points the
//! element directory at the new location.

use std::io::{ErrorKind, Result};

use crate::fs::Engine;
use crate::layout::*;
use crate::lock::{self, Forbid, LockToken, LockWord};
use crate::slot_alloc::{Freed, Resized, SlotTable};
use crate::{ElementKind, INLINE_EXTENTS};

const FOLDER_BODY_SIZE: usize = core::mem::size_of::<FolderBody>();
const FILE_BODY_SIZE: usize = core::mem::size_of::<FileBody>();
const LINK_BODY_SIZE: usize = core::mem::size_of::<LinkBody>();
const EXTENT_SIZE: usize = core::mem::size_of::<BlockRange>();

/// File length and the blocks holding its bytes.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileContent {
    pub length: u64,
    pub extents: Vec<BlockRange>,
    /// Extents past INLINE_EXTENTS are stored here.
    pub spill: BlockRange,
}

impl FileContent {
    pub fn capacity_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.count).sum()
    }

    /// Appends a run, merging it into the last extent when contiguous.
    pub fn push_extent(&mut self, run: BlockRange) {
        if let Some(last) = self.extents.last_mut() {
            if last.end() == run.start {
                last.count += run.count;
                return;
            }
        }
        self.extents.push(run);
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Body {
    Folder { children: Vec<ElementId> },
    File(FileContent),
    Link { target: ElementId, stamp: u64 },
}

#[derive(Clone, Debug)]
pub(crate) struct Record {
    pub loc: Location,
    /// The length of the record's slot.
    pub disk_len: usize,
    pub header: RecordHeader,
    pub body: Body,
}

impl Record {
    pub fn id(&self) -> ElementId {
        ElementId::from_u64(self.header.id)
    }

    pub fn parent(&self) -> ElementId {
        ElementId::from_u64(self.header.parent)
    }

    pub fn kind(&self) -> ElementKind {
        match self.body {
            Body::Folder { .. } => ElementKind::Folder,
            Body::File(_) => ElementKind::File,
            Body::Link { .. } => ElementKind::Link,
        }
    }

    pub fn children(&self) -> Result<&Vec<ElementId>> {
        match &self.body {
            Body::Folder { children } => Ok(children),
            _ => Err(ErrorKind::NotADirectory.into()),
        }
    }

    pub fn children_mut(&mut self) -> Result<&mut Vec<ElementId>> {
        match &mut self.body {
            Body::Folder { children } => Ok(children),
            _ => Err(ErrorKind::NotADirectory.into()),
        }
    }

    pub fn content(&self) -> Result<&FileContent> {
        match &self.body {
            Body::File(content) => Ok(content),
            Body::Folder { .. } => Err(ErrorKind::IsADirectory.into()),
            Body::Link { .. } => Err(ErrorKind::InvalidInput.into()),
        }
    }

    pub fn content_mut(&mut self) -> Result<&mut FileContent> {
        match &mut self.body {
            Body::File(content) => Ok(content),
            Body::Folder { .. } => Err(ErrorKind::IsADirectory.into()),
            Body::Link { .. } => Err(ErrorKind::InvalidInput.into()),
        }
    }

    /// The size reported in metadata: bytes for files, children for folders.
    pub fn size(&self) -> u64 {
        match &self.body {
            Body::Folder { children } => children.len() as u64,
            Body::File(content) => content.length,
            Body::Link { .. } => 0,
        }
    }

    pub fn touch(&mut self, content_changed: bool) {
        let now = Timestamp::now().as_nanos();
        if content_changed {
            self.header.modified = now;
        }
        self.header.meta_modified = now;
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE
            + match &self.body {
                Body::Folder { children } => FOLDER_BODY_SIZE + children.len() * 8,
                Body::File(content) => {
                    FILE_BODY_SIZE + content.extents.len().min(INLINE_EXTENTS) * EXTENT_SIZE
                }
                Body::Link { .. } => LINK_BODY_SIZE,
            }
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.encoded_len()];
        write_pod(&mut bytes, 0, &self.header);
        let pos = RECORD_HEADER_SIZE;

        match &self.body {
            Body::Folder { children } => {
                let body = FolderBody {
                    child_count: children.len() as u64,
                };
                write_pod(&mut bytes, pos, &body);
                for (idx, child) in children.iter().enumerate() {
                    write_u64(&mut bytes, pos + FOLDER_BODY_SIZE + idx * 8, child.as_u64());
                }
            }
            Body::File(content) => {
                let body = FileBody {
                    length: content.length,
                    extent_count: content.extents.len() as u64,
                    spill_start: content.spill.start,
                    spill_blocks: content.spill.count,
                };
                write_pod(&mut bytes, pos, &body);
                for (idx, extent) in content.extents.iter().take(INLINE_EXTENTS).enumerate() {
                    write_pod(&mut bytes, pos + FILE_BODY_SIZE + idx * EXTENT_SIZE, extent);
                }
            }
            Body::Link { target, stamp } => {
                let body = LinkBody {
                    target: target.as_u64(),
                    target_created: *stamp,
                };
                write_pod(&mut bytes, pos, &body);
            }
        }

        bytes
    }

    /// A record that is not stored anywhere yet.
    pub fn new_detached(header: RecordHeader, body: Body) -> Self {
        Self {
            loc: Location::new(0, 0),
            disk_len: 0,
            header,
            body,
        }
    }
}

/// The element kind encoded in header flags.
pub(crate) fn kind_of(flags: ElementFlags) -> Result<ElementKind> {
    if flags.contains(ElementFlags::LINK) {
        Ok(ElementKind::Link)
    } else if flags.contains(ElementFlags::FOLDER) {
        Ok(ElementKind::Folder)
    } else if flags.contains(ElementFlags::FILE) {
        Ok(ElementKind::File)
    } else {
        Err(crate::error::corrupted(format_args!(
            "record without a kind: {flags:?}"
        )))
    }
}

fn check_len(bytes: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset + len > bytes.len() - SLOT_TRAILER_SIZE {
        return Err(crate::error::corrupted(format_args!(
            "record at {offset} overruns its block"
        )));
    }
    Ok(())
}

impl Engine {
    /// Loads the record of `id`.
    pub(crate) fn load(&self, id: ElementId) -> Result<Record> {
        let loc = self.locate(id)?;
        let mut record = self.load_at(loc)?;
        if record.header.id != id.as_u64() {
            return Err(crate::error::corrupted(format_args!(
                "{id} resolves to a record of #{}",
                record.header.id
            )));
        }

        let spilled = match &record.body {
            Body::File(content) => content.spill.count > 0,
            _ => false,
        };
        if spilled {
            self.load_spill(&mut record)?;
        }
        Ok(record)
    }

    fn load_at(&self, loc: Location) -> Result<Record> {
        let block = self.store.pin(loc.block_no)?;
        let bytes = block.bytes();
        check_len(&bytes, loc.offset, RECORD_HEADER_SIZE)?;
        let header: RecordHeader = read_pod(&bytes, loc.offset);
        let pos = loc.offset + RECORD_HEADER_SIZE;

        let (body, body_len) = match kind_of(header.flags())? {
            ElementKind::Folder => {
                check_len(&bytes, pos, FOLDER_BODY_SIZE)?;
                let body: FolderBody = read_pod(&bytes, pos);
                let count = body.child_count as usize;
                check_len(&bytes, pos + FOLDER_BODY_SIZE, count * 8)?;
                let children = (0..count)
                    .map(|idx| {
                        ElementId::from_u64(read_u64(&bytes, pos + FOLDER_BODY_SIZE + idx * 8))
                    })
                    .collect();
                (Body::Folder { children }, FOLDER_BODY_SIZE + count * 8)
            }
            ElementKind::File => {
                check_len(&bytes, pos, FILE_BODY_SIZE)?;
                let body: FileBody = read_pod(&bytes, pos);
                let inline = (body.extent_count as usize).min(INLINE_EXTENTS);
                check_len(&bytes, pos + FILE_BODY_SIZE, inline * EXTENT_SIZE)?;
                let mut extents = Vec::with_capacity(body.extent_count as usize);
                for idx in 0..inline {
                    extents.push(read_pod(&bytes, pos + FILE_BODY_SIZE + idx * EXTENT_SIZE));
                }
                let content = FileContent {
                    length: body.length,
                    extents,
                    spill: BlockRange::new(body.spill_start, body.spill_blocks),
                };
                if body.extent_count as usize > INLINE_EXTENTS && content.spill.count == 0 {
                    return Err(crate::error::corrupted(format_args!(
                        "file with {} extents and no spill area",
                        body.extent_count
                    )));
                }
                (
                    Body::File(content),
                    FILE_BODY_SIZE + inline * EXTENT_SIZE,
                )
            }
            ElementKind::Link => {
                check_len(&bytes, pos, LINK_BODY_SIZE)?;
                let body: LinkBody = read_pod(&bytes, pos);
                (
                    Body::Link {
                        target: ElementId::from_u64(body.target),
                        stamp: body.target_created,
                    },
                    LINK_BODY_SIZE,
                )
            }
        };

        Ok(Record {
            loc,
            disk_len: RECORD_HEADER_SIZE + body_len,
            header,
            body,
        })
    }

    // The extent count is in the record; extents past INLINE_EXTENTS are
    // read from the spill run.
    fn load_spill(&self, record: &mut Record) -> Result<()> {
        let extent_count = {
            let block = self.store.pin(record.loc.block_no)?;
            let body: FileBody = read_pod(&block.bytes(), record.loc.offset + RECORD_HEADER_SIZE);
            body.extent_count as usize
        };
        let content = record.content_mut()?;
        let spilled = extent_count.saturating_sub(INLINE_EXTENTS);
        let per_block = self.block_size / EXTENT_SIZE;
        if spilled > content.spill.count as usize * per_block {
            return Err(crate::error::corrupted(format_args!(
                "spill area {:?} too small for {spilled} extents",
                content.spill
            )));
        }

        for idx in 0..spilled {
            let block_no = content.spill.start + (idx / per_block) as u64;
            let block = self.store.pin(block_no)?;
            let extent: BlockRange = read_pod(&block.bytes(), (idx % per_block) * EXTENT_SIZE);
            content.extents.push(extent);
        }
        Ok(())
    }

    /// Writes `record` back, resizing or relocating its slot as needed.
    pub(crate) fn save(&self, record: &mut Record) -> Result<()> {
        let id = record.id();
        let old_spill = self.store_spill(record)?;

        let bytes = record.encode();
        if bytes.len() != record.disk_len {
            match self.resize_record(id, record.loc, record.disk_len, bytes.len()) {
                Ok(loc) => {
                    record.loc = loc;
                    record.disk_len = bytes.len();
                }
                Err(err) => {
                    // Undo the spill update: the stored record still uses the old one.
                    if let Body::File(content) = &mut record.body {
                        if let Some(old) = old_spill {
                            if content.spill.count > 0 {
                                self.ranges().free(content.spill)?;
                            }
                            content.spill = old;
                        }
                    }
                    return Err(err);
                }
            }
        }

        {
            let mut block = self.store.pin(record.loc.block_no)?;
            let mut data = block.bytes_mut();
            data[record.loc.offset..(record.loc.offset + bytes.len())].copy_from_slice(&bytes);
        }

        if let Some(old) = old_spill {
            if old.count > 0 {
                self.ranges().free(old)?;
            }
        }
        Ok(())
    }

    // Writes extents past INLINE_EXTENTS to the spill run, moving to a bigger
    // (or no) run as needed. Returns the replaced run, if any; the caller
    // frees it once the record points at the new one.
    fn store_spill(&self, record: &mut Record) -> Result<Option<BlockRange>> {
        let block_size = self.block_size;
        let Body::File(content) = &mut record.body else {
            return Ok(None);
        };

        let spilled = content.extents.len().saturating_sub(INLINE_EXTENTS);
        let per_block = block_size / EXTENT_SIZE;
        let needed = spilled.div_ceil(per_block) as u64;

        let mut replaced = None;
        if needed == 0 {
            if content.spill.count > 0 {
                replaced = Some(content.spill);
                content.spill = BlockRange::default();
            }
            return Ok(replaced);
        }

        if needed > content.spill.count {
            // Leave room so that appends do not move the spill run every time.
            let run = self.ranges().allocate_contiguous(needed * 2)?;
            log::debug!(
                "File {}: spill area {:?} => {run:?}",
                record.header.id,
                content.spill
            );
            replaced = Some(content.spill);
            content.spill = run;
        }

        let spill = content.spill;
        for (block_idx, chunk) in content.extents[INLINE_EXTENTS..]
            .chunks(per_block)
            .enumerate()
        {
            let mut block = self.store.pin_empty(spill.start + block_idx as u64)?;
            let mut data = block.bytes_mut();
            for (idx, extent) in chunk.iter().enumerate() {
                write_pod(&mut data, idx * EXTENT_SIZE, extent);
            }
        }

        Ok(replaced)
    }

    /// Writes a record that has not been stored before into its slot.
    pub(crate) fn write_new_record(&self, record: &Record) -> Result<()> {
        let bytes = record.encode();
        debug_assert_eq!(bytes.len(), record.disk_len);
        let mut block = self.store.pin(record.loc.block_no)?;
        let mut data = block.bytes_mut();
        data[record.loc.offset..(record.loc.offset + bytes.len())].copy_from_slice(&bytes);
        Ok(())
    }

    /// Rewrites only the fixed-size header of a record.
    pub(crate) fn write_header(&self, loc: Location, header: &RecordHeader) -> Result<()> {
        let mut block = self.store.pin(loc.block_no)?;
        write_pod(&mut block.bytes_mut(), loc.offset, header);
        Ok(())
    }

    fn resize_record(
        &self,
        id: ElementId,
        loc: Location,
        old_len: usize,
        new_len: usize,
    ) -> Result<Location> {
        if new_len == 0 {
            return Err(ErrorKind::InvalidInput.into());
        }
        match self.resize_slot(loc, old_len, new_len) {
            Ok(Resized::At(offset)) => Ok(Location::new(loc.block_no, offset)),
            Ok(Resized::Freed(_)) => Err(crate::error::corrupted(format_args!(
                "{id}: record slot freed while resizing"
            ))),
            Err(err) if err.kind() == ErrorKind::StorageFull => {
                self.relocate(id, loc, old_len, new_len)
            }
            Err(err) => Err(err),
        }
    }

    /// Resizes a slot in place, copying its bytes if it moves within the
    /// block. Resizing to zero frees it; an emptied block goes back to the
    /// block allocator.
    pub(crate) fn resize_slot(
        &self,
        loc: Location,
        old_len: usize,
        new_len: usize,
    ) -> Result<Resized> {
        let resized = {
            let mut block = self.store.pin(loc.block_no)?;
            let mut data = block.bytes_mut();
            SlotTable::new(&mut data).reallocate(loc.offset, old_len, new_len, true)?
        };
        if resized == Resized::Freed(Freed::Block) {
            log::trace!("Block {} has no more slots.", loc.block_no);
            self.ranges().free(BlockRange::new(loc.block_no, 1))?;
        }
        Ok(resized)
    }

    // Moves a record into a fresh block. The bytes are not copied: the caller
    // writes the whole record afterwards.
    fn relocate(
        &self,
        id: ElementId,
        loc: Location,
        old_len: usize,
        new_len: usize,
    ) -> Result<Location> {
        let new_loc = self.alloc_in_fresh_block(new_len)?;
        if let Err(err) = self.set_location(id, new_loc) {
            self.free_slot(new_loc, new_len)?;
            return Err(err);
        }
        self.free_slot(loc, old_len)?;
        log::debug!("Relocated {id} from {loc:?} to {new_loc:?} ({new_len} bytes).");
        Ok(new_loc)
    }

    /// Allocates `len` bytes in block `hint` if it has room, else in a fresh block.
    pub(crate) fn alloc_slot_near(&self, hint: u64, len: usize) -> Result<Location> {
        let allocated = {
            let mut block = self.store.pin(hint)?;
            let mut data = block.bytes_mut();
            SlotTable::new(&mut data).allocate(len)
        };
        match allocated {
            Ok(offset) => Ok(Location::new(hint, offset)),
            Err(err) if err.kind() == ErrorKind::StorageFull => self.alloc_in_fresh_block(len),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn alloc_in_fresh_block(&self, len: usize) -> Result<Location> {
        if len > self.max_slot_len() {
            log::debug!("A {len} byte slot does not fit into a block.");
            return Err(ErrorKind::StorageFull.into());
        }

        let block_no = self.ranges().allocate_block()?;
        let allocated = {
            let mut block = self.store.pin_empty(block_no)?;
            let mut data = block.bytes_mut();
            SlotTable::init(&mut data).allocate(len)
        };
        match allocated {
            Ok(offset) => Ok(Location::new(block_no, offset)),
            Err(err) => {
                self.ranges().free(BlockRange::new(block_no, 1))?;
                Err(err)
            }
        }
    }

    /// The largest slot an empty block can hold.
    pub(crate) fn max_slot_len(&self) -> usize {
        self.block_size - SLOT_TRAILER_SIZE - SLOT_ENTRY_SIZE
    }

    /// Frees a slot; an emptied block goes back to the block allocator.
    pub(crate) fn free_slot(&self, loc: Location, len: usize) -> Result<Freed> {
        let emptied = {
            let mut block = self.store.pin(loc.block_no)?;
            let mut data = block.bytes_mut();
            SlotTable::new(&mut data).free(loc.offset, len)?
        };
        if emptied {
            log::trace!("Block {} has no more slots.", loc.block_no);
            self.ranges().free(BlockRange::new(loc.block_no, 1))?;
            return Ok(Freed::Block);
        }
        Ok(Freed::Slot)
    }

    pub(crate) fn write_name(&self, hint: u64, name: &str) -> Result<Location> {
        let bytes = encode_name(name);
        let loc = self.alloc_slot_near(hint, bytes.len())?;
        let mut block = self.store.pin(loc.block_no)?;
        let mut data = block.bytes_mut();
        data[loc.offset..(loc.offset + bytes.len())].copy_from_slice(&bytes);
        Ok(loc)
    }

    pub(crate) fn read_name(&self, header: &RecordHeader) -> Result<String> {
        let Some(loc) = header.name_location() else {
            return Ok(String::new());
        };
        let block = self.store.pin(loc.block_no)?;
        decode_name(&block.bytes(), loc.offset)
    }

    pub(crate) fn free_name(&self, loc: Option<Location>) -> Result<()> {
        let Some(loc) = loc else {
            return Ok(());
        };
        let len = {
            let block = self.store.pin(loc.block_no)?;
            (decode_name(&block.bytes(), loc.offset)?.encode_utf16().count() + 1) * 2
        };
        self.free_slot(loc, len)?;
        Ok(())
    }

    /// The record's lock, clearing it first if it is left over from a
    /// previous session.
    pub(crate) fn observe_lock(&self, record: &mut Record) -> Result<Option<LockWord>> {
        if record.header.lock != 0 && lock::is_stale(record.header.lock_ts, self.session_start) {
            log::info!(
                "Clearing a stale lock on {} (taken at {}).",
                record.id(),
                record.header.lock_ts
            );
            record.header.lock = 0;
            record.header.lock_ts = 0;
            self.write_header(record.loc, &record.header)?;
        }
        Ok(LockWord::unpack(record.header.lock))
    }

    pub(crate) fn ensure_access(
        &self,
        record: &mut Record,
        presented: Option<LockToken>,
        forbidden: Forbid,
    ) -> Result<()> {
        let current = self.observe_lock(record)?;
        lock::check_access(current, presented, forbidden).inspect_err(|_| {
            log::debug!("{}: access {forbidden:?} denied.", record.id());
        })
    }
}
