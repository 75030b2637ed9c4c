//! slotfs "on disk" layout.
//!
//! Key facts:
//! - block #0 is the superblock;
//! - block #1 is the block-range table (all blocks in use, as ranges);
//! - every other block either holds file bytes, or ends with a slot table
//!   (see slot_alloc.rs) and holds element records and names in its slots.
//!
//! All structures below are `#[repr(C)]` without padding and are copied
//! to/from block buffers via read_pod()/write_pod(): records live at
//! arbitrary byte offsets, so they are never referenced in place.

use bitflags::bitflags;
use crc::CRC_32_ISO_HDLC;
use std::io::{ErrorKind, Result};

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn crc32_hash(bytes: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(bytes);
    digest.finalize()
}

/// Just a random number.
pub(crate) const MAGIC: u64 = 0x5a0f_51a7_e11d_7c03;
pub(crate) const VERSION: u64 = 1;
/// Written into the superblock as the very last step of format().
pub(crate) const FORMAT_COMPLETE: u32 = 0x600d_f5f5;

pub(crate) const SUPERBLOCK_NO: u64 = 0;
pub(crate) const RANGE_TABLE_NO: u64 = 1;
/// The first block holding records (the root folder and the directory file).
pub(crate) const FIRST_RECORD_BLOCK: u64 = 2;

/// Stable identifier of a folder, file or link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    /// The root folder.
    pub const ROOT: ElementId = ElementId(0);
    /// The file holding the element directory itself.
    pub const DIRECTORY: ElementId = ElementId(1);
    pub(crate) const FIRST_DYNAMIC: u64 = 2;

    pub const fn from_u64(val: u64) -> Self {
        Self(val)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.0 < Self::FIRST_DYNAMIC
    }
}

impl core::fmt::Display for ElementId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let ts = std::time::UNIX_EPOCH.elapsed().unwrap_or_default();
        Self(ts.as_nanos() as u64)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl From<Timestamp> for std::time::SystemTime {
    fn from(ts: Timestamp) -> Self {
        std::time::UNIX_EPOCH + std::time::Duration::from_nanos(ts.0)
    }
}

bitflags! {
    /// Element flags, as stored in the record header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ElementFlags: u32 {
        const FOLDER = 1;
        const FILE = 2;
        const LINK = 4;
        const EXECUTABLE = 8;
        const HIDDEN = 16;
        const READ_ONLY = 32;
    }
}

impl ElementFlags {
    /// The flags a caller may change via set_flags().
    pub const USER: ElementFlags = ElementFlags::EXECUTABLE
        .union(ElementFlags::HIDDEN)
        .union(ElementFlags::READ_ONLY);

    /// The flags describing what kind of element this is.
    pub const KIND: ElementFlags = ElementFlags::FOLDER
        .union(ElementFlags::FILE)
        .union(ElementFlags::LINK);
}

/// Where a slot physically lives. Never leaves the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Location {
    pub block_no: u64,
    pub offset: usize,
}

impl Location {
    pub fn new(block_no: u64, offset: usize) -> Self {
        Self { block_no, offset }
    }
}

/// Superblock (block #0).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct Superblock {
    pub magic: u64,           // MAGIC.
    pub version: u64,         // 1 at the moment.
    pub num_blocks: u64,      // Num blocks (may be less than what the device has).
    pub block_size: u64,      // Bytes per block.
    pub root_block: u64,      // Root folder record.
    pub directory_block: u64, // Element directory file record.
    pub struct_lock: u64,     // Structural lock token, 0 => unlocked.
    pub struct_lock_ts: u64,  // When struct_lock was taken.
    pub root_offset: u32,
    pub directory_offset: u32,
    pub formatted: u32, // FORMAT_COMPLETE.
    pub crc32: u32,     // CRC32 of this data structure.
}

unsafe impl plain::Plain for Superblock {}
const _: () = assert!(core::mem::size_of::<Superblock>() == 80);

impl Superblock {
    fn crc_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; core::mem::size_of::<Self>()];
        write_pod(&mut bytes, 0, self);
        bytes.truncate(bytes.len() - 4);
        bytes
    }

    pub fn set_crc32(&mut self) {
        self.crc32 = crc32_hash(&self.crc_bytes());
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(ErrorKind::InvalidData.into());
        }
        if self.version != VERSION {
            return Err(ErrorKind::Unsupported.into());
        }
        if self.crc32 != crc32_hash(&self.crc_bytes()) {
            log::error!("Superblock CRC mismatch.");
            return Err(ErrorKind::InvalidData.into());
        }
        if self.formatted != FORMAT_COMPLETE {
            log::error!("The filesystem was not fully formatted.");
            return Err(ErrorKind::InvalidData.into());
        }
        Ok(())
    }

    pub fn root(&self) -> Location {
        Location::new(self.root_block, self.root_offset as usize)
    }

    pub fn directory(&self) -> Location {
        Location::new(self.directory_block, self.directory_offset as usize)
    }
}

/// Block-range table header (block #1, offset 0).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct RangeTableHeader {
    pub count: u64,
    pub _reserved: u64,
}

unsafe impl plain::Plain for RangeTableHeader {}

/// A half-open run of whole blocks: `[start, start + count)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BlockRange {
    pub start: u64,
    pub count: u64,
}

unsafe impl plain::Plain for BlockRange {}
const _: () = assert!(core::mem::size_of::<BlockRange>() == 16);

impl BlockRange {
    pub const fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    pub const fn end(&self) -> u64 {
        self.start + self.count
    }

    pub const fn contains(&self, other: &BlockRange) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }
}

/// One entry of a per-block slot table: `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct SlotEntry {
    pub start: u32,
    pub end: u32,
}

unsafe impl plain::Plain for SlotEntry {}

pub(crate) const SLOT_ENTRY_SIZE: usize = core::mem::size_of::<SlotEntry>();
/// The trailer (last 4 bytes of a block) holds the slot table start.
pub(crate) const SLOT_TRAILER_SIZE: usize = 4;

/// The header shared by all element records.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct RecordHeader {
    pub id: u64,
    pub parent: u64,
    pub name_block: u64, // 0 => no name (root, directory).
    pub created: u64,
    pub modified: u64,
    pub meta_modified: u64,
    pub lock: u64,
    pub lock_ts: u64,
    pub name_offset: u32,
    pub flags: u32,
}

unsafe impl plain::Plain for RecordHeader {}

pub(crate) const RECORD_HEADER_SIZE: usize = core::mem::size_of::<RecordHeader>();
const _: () = assert!(RECORD_HEADER_SIZE == 72);

impl RecordHeader {
    pub fn new(id: ElementId, parent: ElementId, flags: ElementFlags) -> Self {
        let now = Timestamp::now().as_nanos();
        Self {
            id: id.as_u64(),
            parent: parent.as_u64(),
            name_block: 0,
            created: now,
            modified: now,
            meta_modified: now,
            lock: 0,
            lock_ts: 0,
            name_offset: 0,
            flags: flags.bits(),
        }
    }

    pub fn flags(&self) -> ElementFlags {
        ElementFlags::from_bits_retain(self.flags)
    }

    pub fn name_location(&self) -> Option<Location> {
        if self.name_block == 0 {
            None
        } else {
            Some(Location::new(self.name_block, self.name_offset as usize))
        }
    }

    pub fn set_name_location(&mut self, loc: Option<Location>) {
        match loc {
            Some(loc) => {
                self.name_block = loc.block_no;
                self.name_offset = loc.offset as u32;
            }
            None => {
                self.name_block = 0;
                self.name_offset = 0;
            }
        }
    }
}

/// Folder payload; followed by `child_count` u64 child IDs.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct FolderBody {
    pub child_count: u64,
}

unsafe impl plain::Plain for FolderBody {}

/// File payload; followed by min(extent_count, INLINE_EXTENTS) BlockRanges.
/// Extents past INLINE_EXTENTS live in the spill run.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct FileBody {
    pub length: u64,
    pub extent_count: u64,
    pub spill_start: u64,
    pub spill_blocks: u64,
}

unsafe impl plain::Plain for FileBody {}

/// Link payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct LinkBody {
    pub target: u64,
    /// The target's creation time; a reused ID carries a different one.
    pub target_created: u64,
}

unsafe impl plain::Plain for LinkBody {}

/// An entry in the element directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct DirEntry {
    pub block_no: u64,
    pub offset: u64,
}

unsafe impl plain::Plain for DirEntry {}

pub(crate) const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

impl DirEntry {
    pub const TOMBSTONE: DirEntry = DirEntry {
        block_no: u64::MAX,
        offset: u64::MAX,
    };

    pub fn is_tombstone(&self) -> bool {
        self.block_no == u64::MAX
    }

    pub fn location(&self) -> Location {
        Location::new(self.block_no, self.offset as usize)
    }
}

impl From<Location> for DirEntry {
    fn from(loc: Location) -> Self {
        Self {
            block_no: loc.block_no,
            offset: loc.offset as u64,
        }
    }
}

/// Copies a T out of `bytes` at `offset`; no alignment requirements.
pub(crate) fn read_pod<T: plain::Plain + Default>(bytes: &[u8], offset: usize) -> T {
    let mut val = T::default();
    let end = offset + core::mem::size_of::<T>();
    plain::copy_from_bytes(&mut val, &bytes[offset..end]).expect("Sized slice");
    val
}

/// Copies `val` into `bytes` at `offset`.
pub(crate) fn write_pod<T: plain::Plain>(bytes: &mut [u8], offset: usize, val: &T) {
    // Safety: Plain types have no padding and no invalid bit patterns.
    let src = unsafe { plain::as_bytes(val) };
    bytes[offset..(offset + src.len())].copy_from_slice(src);
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..(offset + 8)].try_into().expect("Sized slice"))
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, val: u64) {
    bytes[offset..(offset + 8)].copy_from_slice(&val.to_ne_bytes());
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(bytes[offset..(offset + 4)].try_into().expect("Sized slice"))
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, val: u32) {
    bytes[offset..(offset + 4)].copy_from_slice(&val.to_ne_bytes());
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('\0')
        || name.contains('/')
        || name.encode_utf16().count() > crate::MAX_NAME_LEN
    {
        return Err(ErrorKind::InvalidInput.into());
    }

    Ok(())
}

/// UTF-16 code units plus a zero terminator.
pub(crate) fn encode_name(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((name.len() + 1) * 2);
    for unit in name.encode_utf16() {
        bytes.extend_from_slice(&unit.to_ne_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

/// Decodes a zero-terminated name starting at `offset`.
pub(crate) fn decode_name(bytes: &[u8], offset: usize) -> Result<String> {
    let mut units = Vec::new();
    let mut pos = offset;
    loop {
        if pos + 2 > bytes.len() {
            log::error!("Unterminated name at offset {offset}.");
            return Err(ErrorKind::InvalidData.into());
        }
        let unit = u16::from_ne_bytes([bytes[pos], bytes[pos + 1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
        pos += 2;
    }

    String::from_utf16(&units).map_err(|_| ErrorKind::InvalidData.into())
}
