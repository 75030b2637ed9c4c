//! Element handles and the operations all elements share.

use std::io::{ErrorKind, Result};
use std::sync::Arc;

use crate::fs::Engine;
use crate::layout::*;
use crate::lock::{self, Forbid, LockKind, LockToken, LockWord};
use crate::record::{Body, Record};
use crate::{File, Folder, Link};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Folder,
    File,
    Link,
}

impl ElementKind {
    pub(crate) fn flag(&self) -> ElementFlags {
        match self {
            ElementKind::Folder => ElementFlags::FOLDER,
            ElementKind::File => ElementFlags::FILE,
            ElementKind::Link => ElementFlags::LINK,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: ElementKind,
    pub flags: ElementFlags,
    /// File length in bytes; the number of children for folders.
    pub size: u64,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub meta_modified: Timestamp,
}

/// A reference to an element by its stable ID.
///
/// Handles are cheap to clone and stay valid while the element moves around
/// the device; operations on a deleted element fail with NotFound.
#[derive(Clone)]
pub struct Node {
    engine: Arc<Engine>,
    id: ElementId,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Node({})", self.id)
    }
}

impl Node {
    pub(crate) fn new(engine: Arc<Engine>, id: ElementId) -> Self {
        Self { engine, id }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn kind(&self) -> Result<ElementKind> {
        self.engine.with_record(self.id, |_, record| Ok(record.kind()))
    }

    pub fn metadata(&self, lock: Option<LockToken>) -> Result<Metadata> {
        self.engine.with_record(self.id, |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            Ok(Metadata {
                kind: record.kind(),
                flags: record.header.flags(),
                size: record.size(),
                created: Timestamp::from_nanos(record.header.created),
                modified: Timestamp::from_nanos(record.header.modified),
                meta_modified: Timestamp::from_nanos(record.header.meta_modified),
            })
        })
    }

    /// The element's name; empty for the root folder.
    pub fn name(&self, lock: Option<LockToken>) -> Result<String> {
        self.engine.with_record(self.id, |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            engine.read_name(&record.header)
        })
    }

    /// The containing folder; None for the root folder.
    pub fn parent(&self) -> Result<Option<Folder>> {
        if self.id == ElementId::ROOT {
            return Ok(None);
        }
        let parent = self
            .engine
            .with_record(self.id, |_, record| Ok(record.parent()))?;
        Ok(Some(Folder::from_node(Node::new(self.engine.clone(), parent))))
    }

    /// Sets the executable/hidden/read-only flags; the kind is kept.
    pub fn set_flags(&self, flags: ElementFlags, lock: Option<LockToken>) -> Result<()> {
        self.engine.with_record(self.id, |engine, record| {
            engine.ensure_access(record, lock, Forbid::META)?;
            let kind = record.header.flags() & ElementFlags::KIND;
            record.header.flags = (kind | (flags & ElementFlags::USER)).bits();
            record.touch(false);
            engine.write_header(record.loc, &record.header)
        })
    }

    pub fn rename(&self, new_name: &str, lock: Option<LockToken>) -> Result<()> {
        let Some(parent) = self.parent()? else {
            return Err(ErrorKind::InvalidInput.into());
        };
        self.move_to(&parent, new_name, lock)
    }

    /// Moves the element into `new_parent` under `new_name`.
    pub fn move_to(
        &self,
        new_parent: &Folder,
        new_name: &str,
        lock: Option<LockToken>,
    ) -> Result<()> {
        if self.id.is_reserved() {
            return Err(ErrorKind::InvalidInput.into());
        }
        validate_name(new_name)?;

        let new_parent = new_parent.id();
        self.engine
            .structural(|engine| engine.move_element(self.id, new_parent, new_name, lock))
    }

    /// Deletes the element; folders must be empty. Needs the parent folder
    /// to allow writes.
    pub fn delete(&self, lock: Option<LockToken>) -> Result<()> {
        if self.id.is_reserved() {
            return Err(ErrorKind::InvalidInput.into());
        }

        self.engine.structural(|engine| {
            let mut record = engine.load(self.id)?;
            engine.ensure_access(&mut record, lock, Forbid::DELETE)?;
            if let Body::Folder { children } = &record.body {
                if !children.is_empty() {
                    return Err(ErrorKind::DirectoryNotEmpty.into());
                }
            }
            let mut parent = engine.load(record.parent())?;
            engine.ensure_access(&mut parent, None, Forbid::WRITE)?;

            engine.delete_record(record)
        })
    }

    /// Locks the element; the token is needed to access it in ways the lock
    /// forbids, and to unlock it.
    pub fn lock(&self, kind: LockKind, forbid: Forbid) -> Result<LockToken> {
        self.engine.with_record(self.id, |engine, record| {
            let current = engine.observe_lock(record)?;
            let word = lock::acquire(current, kind, forbid)?;
            record.header.lock = word.pack();
            record.header.lock_ts = lock::lock_time(engine.session_start).as_nanos();
            engine.write_header(record.loc, &record.header)?;
            Ok(word.token())
        })
    }

    pub fn unlock(&self, token: LockToken) -> Result<()> {
        self.engine.with_record(self.id, |engine, record| {
            let current = engine.observe_lock(record)?;
            match lock::release(current, token)? {
                Some(word) => record.header.lock = word.pack(),
                None => {
                    record.header.lock = 0;
                    record.header.lock_ts = 0;
                }
            }
            engine.write_header(record.loc, &record.header)
        })
    }

    /// The lock currently held on the element, if any.
    pub fn lock_state(&self) -> Result<Option<LockWord>> {
        self.engine
            .with_record(self.id, |engine, record| engine.observe_lock(record))
    }
}

/// Any element.
#[derive(Clone, Debug)]
pub enum Element {
    Folder(Folder),
    File(File),
    Link(Link),
}

impl core::ops::Deref for Element {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            Element::Folder(folder) => &**folder,
            Element::File(file) => &**file,
            Element::Link(link) => &**link,
        }
    }
}

impl Element {
    pub(crate) fn from_kind(node: Node, kind: ElementKind) -> Self {
        match kind {
            ElementKind::Folder => Element::Folder(Folder::from_node(node)),
            ElementKind::File => Element::File(File { node }),
            ElementKind::Link => Element::Link(Link { node }),
        }
    }

    pub fn element_kind(&self) -> ElementKind {
        match self {
            Element::Folder(_) => ElementKind::Folder,
            Element::File(_) => ElementKind::File,
            Element::Link(_) => ElementKind::Link,
        }
    }

    pub fn into_folder(self) -> Result<Folder> {
        match self {
            Element::Folder(folder) => Ok(folder),
            _ => Err(ErrorKind::NotADirectory.into()),
        }
    }

    pub fn into_file(self) -> Result<File> {
        match self {
            Element::File(file) => Ok(file),
            Element::Folder(_) => Err(ErrorKind::IsADirectory.into()),
            Element::Link(_) => Err(ErrorKind::InvalidInput.into()),
        }
    }

    pub fn into_link(self) -> Result<Link> {
        match self {
            Element::Link(link) => Ok(link),
            _ => Err(ErrorKind::InvalidInput.into()),
        }
    }
}

impl Engine {
    pub(crate) fn element(self: &Arc<Self>, id: ElementId) -> Result<Element> {
        if id == ElementId::DIRECTORY {
            return Err(ErrorKind::InvalidInput.into());
        }
        let kind = self.with_record(id, |_, record| Ok(record.kind()))?;
        Ok(Element::from_kind(Node::new(self.clone(), id), kind))
    }

    /// The child of `folder` named `name`.
    pub(crate) fn find_child(&self, folder: &Record, name: &str) -> Result<Option<ElementId>> {
        for child in folder.children()? {
            let record = self.load(*child)?;
            if self.read_name(&record.header)? == name {
                return Ok(Some(*child));
            }
        }
        Ok(None)
    }

    fn move_element(
        &self,
        id: ElementId,
        new_parent_id: ElementId,
        new_name: &str,
        lock: Option<LockToken>,
    ) -> Result<()> {
        let mut record = self.load(id)?;
        self.ensure_access(&mut record, lock, Forbid::META)?;
        let old_parent_id = record.parent();

        let mut new_parent = self.load(new_parent_id)?;
        new_parent.children()?;
        self.ensure_access(&mut new_parent, None, Forbid::WRITE)?;
        if old_parent_id != new_parent_id {
            let mut old_parent = self.load(old_parent_id)?;
            self.ensure_access(&mut old_parent, None, Forbid::WRITE)?;
        }

        // A folder cannot move into its own subtree.
        if record.kind() == ElementKind::Folder {
            let mut ancestor = new_parent_id;
            loop {
                if ancestor == id {
                    return Err(ErrorKind::InvalidInput.into());
                }
                if ancestor == ElementId::ROOT {
                    break;
                }
                ancestor = self.load(ancestor)?.parent();
            }
        }

        match self.find_child(&new_parent, new_name)? {
            Some(existing) if existing == id => return Ok(()),
            Some(_) => return Err(ErrorKind::AlreadyExists.into()),
            None => {}
        }

        let old_name = record.header.name_location();
        let name_loc = self.write_name(new_parent.loc.block_no, new_name)?;

        if old_parent_id != new_parent_id {
            let mut new_parent = self.load(new_parent_id)?;
            new_parent.children_mut()?.push(id);
            new_parent.touch(true);
            if let Err(err) = self.save(&mut new_parent) {
                self.free_name(Some(name_loc))?;
                return Err(err);
            }

            let mut old_parent = self.load(old_parent_id)?;
            old_parent.children_mut()?.retain(|child| *child != id);
            old_parent.touch(true);
            self.save(&mut old_parent)?;
        } else {
            // Only the listing changed.
            let mut parent = self.load(new_parent_id)?;
            parent.touch(true);
            self.write_header(parent.loc, &parent.header)?;
        }

        let mut record = self.load(id)?;
        record.header.parent = new_parent_id.as_u64();
        record.header.set_name_location(Some(name_loc));
        record.touch(false);
        self.write_header(record.loc, &record.header)?;
        self.free_name(old_name)?;

        log::debug!("Moved {id} to {new_parent_id}/{new_name}.");
        Ok(())
    }

    /// Removes an element whose access checks have passed: unlinks it from
    /// its parent, then frees its directory entry, record, name and content.
    pub(crate) fn delete_record(&self, record: Record) -> Result<()> {
        let id = record.id();
        if let Body::Folder { children } = &record.body {
            if !children.is_empty() {
                return Err(ErrorKind::DirectoryNotEmpty.into());
            }
        }

        let mut parent = self.load(record.parent())?;
        parent.children_mut()?.retain(|child| *child != id);
        parent.touch(true);
        self.save(&mut parent)?;

        self.remove(id)?;
        self.free_slot(record.loc, record.disk_len)?;
        self.free_name(record.header.name_location())?;

        if let Body::File(content) = &record.body {
            for extent in content.extents.iter() {
                self.ranges().free(*extent)?;
            }
            if content.spill.count > 0 {
                self.ranges().free(content.spill)?;
            }
        }

        log::debug!("Deleted {id}.");
        Ok(())
    }
}
