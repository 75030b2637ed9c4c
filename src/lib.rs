//! Slot-allocated file system engine
//!
//! A hierarchical filesystem (folders, files, links) over a block device of
//! fixed-size blocks (see trait BlockDevice). Element records and names live
//! in byte slots inside blocks; file content lives in runs of whole blocks.
//! Elements are known by stable IDs, so records can move between blocks as
//! they grow without invalidating handles.
//!
//! Access goes through FileSystem: format a device, or open a formatted one,
//! then walk from FileSystem::root(). Elements can be locked (see Node::lock)
//! to keep other users from reading, writing, deleting or changing them;
//! locks left over from a previous session are released automatically.
//!
//! See src/tests.rs for usage examples.

pub mod file_block_device;

mod block_device;
mod block_store;
mod directory;
mod element;
mod error;
mod file;
mod folder;
mod fs;
mod layout;
mod link;
mod lock;
mod range_alloc;
mod record;
mod slot_alloc;
mod stream;

#[cfg(test)]
mod tests;

pub use block_device::*;
pub use element::{Element, ElementKind, Metadata, Node};
pub use file::File;
pub use folder::Folder;
pub use fs::{FileSystem, FsOptions};
pub use layout::{BlockRange, ElementFlags, ElementId, Timestamp};
pub use link::Link;
pub use lock::{Forbid, LockKind, LockToken, LockWord, MAX_SHARED_HOLDERS};
pub use stream::FileStream;

/// The default number of unpinned blocks kept in the block cache.
pub const CACHE_SIZE: usize = 512;

/// Names are at most this many UTF-16 code units long.
pub const MAX_NAME_LEN: usize = 255;

/// File records hold this many extents; the rest spill into whole blocks.
pub const INLINE_EXTENTS: usize = 16;

pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 65536;
