//! The element directory: stable element IDs to record locations.
//!
//! The directory is the content of a regular file record (ID 1), an array
//! of DirEntry values where entry `N` describes ID `N + 2`. The root folder
//! and the directory file itself are found via the superblock.

use std::io::{ErrorKind, Result};

use crate::fs::Engine;
use crate::layout::*;

fn entry_offset(id: ElementId) -> u64 {
    (id.as_u64() - ElementId::FIRST_DYNAMIC) * DIR_ENTRY_SIZE as u64
}

fn id_at(index: u64) -> ElementId {
    ElementId::from_u64(index + ElementId::FIRST_DYNAMIC)
}

impl Engine {
    pub(crate) fn read_superblock(&self) -> Result<Superblock> {
        let block = self.store.pin(SUPERBLOCK_NO)?;
        Ok(read_pod(&block.bytes(), 0))
    }

    pub(crate) fn update_superblock(&self, f: impl FnOnce(&mut Superblock)) -> Result<()> {
        let mut block = self.store.pin(SUPERBLOCK_NO)?;
        let mut sb: Superblock = read_pod(&block.bytes(), 0);
        f(&mut sb);
        sb.set_crc32();
        write_pod(&mut block.bytes_mut(), 0, &sb);
        Ok(())
    }

    /// Where the record of `id` currently lives.
    pub(crate) fn locate(&self, id: ElementId) -> Result<Location> {
        if id == ElementId::ROOT {
            return Ok(self.read_superblock()?.root());
        }
        if id == ElementId::DIRECTORY {
            return Ok(self.read_superblock()?.directory());
        }

        let directory = self.load(ElementId::DIRECTORY)?;
        let content = directory.content()?;
        let offset = entry_offset(id);
        if offset + DIR_ENTRY_SIZE as u64 > content.length {
            return Err(ErrorKind::NotFound.into());
        }

        let mut bytes = [0_u8; DIR_ENTRY_SIZE];
        self.read_content(content, offset, &mut bytes)?;
        let entry: DirEntry = read_pod(&bytes, 0);
        if entry.is_tombstone() {
            return Err(ErrorKind::NotFound.into());
        }
        Ok(entry.location())
    }

    /// Points `id` at a new location.
    pub(crate) fn set_location(&self, id: ElementId, loc: Location) -> Result<()> {
        if id == ElementId::ROOT {
            return self.update_superblock(|sb| {
                sb.root_block = loc.block_no;
                sb.root_offset = loc.offset as u32;
            });
        }
        if id == ElementId::DIRECTORY {
            return self.update_superblock(|sb| {
                sb.directory_block = loc.block_no;
                sb.directory_offset = loc.offset as u32;
            });
        }

        let directory = self.load(ElementId::DIRECTORY)?;
        let content = directory.content()?;
        let offset = entry_offset(id);
        if offset + DIR_ENTRY_SIZE as u64 > content.length {
            return Err(crate::error::corrupted(format_args!(
                "updating unknown element {id}"
            )));
        }

        let mut bytes = [0_u8; DIR_ENTRY_SIZE];
        write_pod(&mut bytes, 0, &DirEntry::from(loc));
        self.write_content(content, offset, &bytes)
    }

    /// Registers a new element at `loc`. Reuses the first free entry, or
    /// appends one. Must be called under the structural lock.
    pub(crate) fn generate(&self, loc: Location) -> Result<ElementId> {
        let mut directory = self.load(ElementId::DIRECTORY)?;
        let mut bytes = [0_u8; DIR_ENTRY_SIZE];
        write_pod(&mut bytes, 0, &DirEntry::from(loc));

        if let Some(index) = self.first_tombstone(directory.content()?)? {
            self.write_content(directory.content()?, index * DIR_ENTRY_SIZE as u64, &bytes)?;
            let id = id_at(index);
            log::trace!("ElementDirectory: reused {id}");
            return Ok(id);
        }

        let index = directory.content()?.length / DIR_ENTRY_SIZE as u64;
        self.append_content(&mut directory, &bytes)?;
        let id = id_at(index);
        log::trace!("ElementDirectory: new {id}");
        Ok(id)
    }

    fn first_tombstone(&self, content: &crate::record::FileContent) -> Result<Option<u64>> {
        let mut bytes = vec![0_u8; content.length as usize];
        self.read_content(content, 0, &mut bytes)?;
        Ok(bytes
            .chunks_exact(DIR_ENTRY_SIZE)
            .position(|chunk| read_pod::<DirEntry>(chunk, 0).is_tombstone())
            .map(|index| index as u64))
    }

    /// Tombstones the entry of `id`; trailing tombstones are dropped so the
    /// directory file shrinks back.
    pub(crate) fn remove(&self, id: ElementId) -> Result<()> {
        if id.is_reserved() {
            return Err(ErrorKind::InvalidInput.into());
        }

        let mut directory = self.load(ElementId::DIRECTORY)?;
        let content = directory.content()?;
        let offset = entry_offset(id);
        if offset + DIR_ENTRY_SIZE as u64 > content.length {
            return Err(crate::error::corrupted(format_args!(
                "removing unknown element {id}"
            )));
        }

        let mut bytes = vec![0_u8; content.length as usize];
        self.read_content(content, 0, &mut bytes)?;
        write_pod(&mut bytes, offset as usize, &DirEntry::TOMBSTONE);

        let live = bytes
            .chunks_exact(DIR_ENTRY_SIZE)
            .rposition(|chunk| !read_pod::<DirEntry>(chunk, 0).is_tombstone())
            .map(|index| index + 1)
            .unwrap_or(0);
        let new_len = (live * DIR_ENTRY_SIZE) as u64;

        if offset < new_len {
            let entry = &bytes[(offset as usize)..(offset as usize + DIR_ENTRY_SIZE)];
            self.write_content(content, offset, entry)?;
        }
        if new_len < content.length {
            self.truncate_content(&mut directory, new_len)?;
        }
        log::trace!("ElementDirectory: removed {id}");
        Ok(())
    }

    /// All registered IDs, ascending.
    #[cfg(test)]
    pub(crate) fn live_ids(&self) -> Result<Vec<ElementId>> {
        let directory = self.load(ElementId::DIRECTORY)?;
        let content = directory.content()?;
        let mut bytes = vec![0_u8; content.length as usize];
        self.read_content(content, 0, &mut bytes)?;
        Ok(bytes
            .chunks_exact(DIR_ENTRY_SIZE)
            .enumerate()
            .filter(|(_, chunk)| !read_pod::<DirEntry>(chunk, 0).is_tombstone())
            .map(|(index, _)| id_at(index as u64))
            .collect())
    }
}
