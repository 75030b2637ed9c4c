//! Folders: an inline array of child IDs.

use std::io::{ErrorKind, Result};
use std::sync::Arc;

use crate::fs::Engine;
use crate::layout::*;
use crate::lock::{Forbid, LockToken};
use crate::record::{Body, FileContent, Record};
use crate::{Element, ElementKind, File, Link, Node};

/// A folder handle.
#[derive(Clone)]
pub struct Folder {
    node: Node,
}

impl core::ops::Deref for Folder {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl core::fmt::Debug for Folder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Folder({})", self.node.id())
    }
}

impl Folder {
    pub(crate) fn from_node(node: Node) -> Self {
        Self { node }
    }

    fn element(&self, id: ElementId) -> Result<Element> {
        self.engine().element(id)
    }

    pub fn create_folder(&self, name: &str, lock: Option<LockToken>) -> Result<Folder> {
        self.add_child(name, ElementKind::Folder, None, lock)?
            .into_folder()
    }

    pub fn create_file(&self, name: &str, lock: Option<LockToken>) -> Result<File> {
        self.add_child(name, ElementKind::File, None, lock)?
            .into_file()
    }

    /// Creates a link to `target`, which must be a folder or a file.
    pub fn create_link(
        &self,
        name: &str,
        target: &Node,
        lock: Option<LockToken>,
    ) -> Result<Link> {
        self.add_child(name, ElementKind::Link, Some(target.id()), lock)?
            .into_link()
    }

    /// Creates a child element. Links need a target.
    pub fn add_child(
        &self,
        name: &str,
        kind: ElementKind,
        target: Option<ElementId>,
        lock: Option<LockToken>,
    ) -> Result<Element> {
        validate_name(name)?;
        let id = self
            .engine()
            .structural(|engine| engine.add_child(self.id(), name, kind, target, lock))?;
        self.element(id)
    }

    // Runs `f` on the folder's child IDs once READ access is granted.
    fn read_children<T>(
        &self,
        lock: Option<LockToken>,
        f: impl FnOnce(&Engine, &[ElementId]) -> Result<T>,
    ) -> Result<T> {
        self.engine().with_record(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            f(engine, record.children()?)
        })
    }

    /// The number of children.
    pub fn element_count(&self, lock: Option<LockToken>) -> Result<u64> {
        self.read_children(lock, |_, children| Ok(children.len() as u64))
    }

    /// The child at `index`, in creation order.
    pub fn get_element(&self, index: u64, lock: Option<LockToken>) -> Result<Element> {
        let id = self.read_children(lock, |_, children| {
            children
                .get(index as usize)
                .copied()
                .ok_or_else(|| ErrorKind::NotFound.into())
        })?;
        self.element(id)
    }

    pub fn get_element_by_name(&self, name: &str, lock: Option<LockToken>) -> Result<Element> {
        let id = self.engine().with_record(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            engine
                .find_child(record, name)?
                .ok_or_else(|| ErrorKind::NotFound.into())
        })?;
        self.element(id)
    }

    pub fn children(&self, lock: Option<LockToken>) -> Result<Vec<Element>> {
        let ids = self.read_children(lock, |_, children| Ok(children.to_vec()))?;
        ids.into_iter().map(|id| self.element(id)).collect()
    }

    /// Deletes the folder and everything in it.
    ///
    /// `resolver` supplies the lock token to present for each element
    /// visited. Access to every element is checked before anything is
    /// removed; if any check fails, nothing is. The filesystem is locked
    /// while `resolver` runs, so it must not call back into it.
    pub fn delete_tree(
        &self,
        mut resolver: impl FnMut(ElementId) -> Option<LockToken>,
    ) -> Result<()> {
        if self.id() == ElementId::ROOT {
            return Err(ErrorKind::InvalidInput.into());
        }
        self.engine()
            .structural(|engine| engine.delete_tree(self.id(), &mut resolver))
    }
}

impl Engine {
    fn delete_tree(
        &self,
        top: ElementId,
        resolver: &mut impl FnMut(ElementId) -> Option<LockToken>,
    ) -> Result<()> {
        let record = self.load(top)?;
        record.children()?;
        let mut parent = self.load(record.parent())?;
        self.ensure_access(&mut parent, None, Forbid::WRITE)?;

        // Post-order: children come before their folder.
        let mut order = Vec::new();
        let mut stack = vec![(top, false)];
        while let Some((id, visited)) = stack.pop() {
            let mut record = self.load(id)?;
            if visited {
                order.push(id);
                continue;
            }
            let token = resolver(id);
            self.ensure_access(&mut record, token, Forbid::DELETE)?;
            let children = match &record.body {
                Body::Folder { children } => children.clone(),
                _ => {
                    order.push(id);
                    continue;
                }
            };
            if !children.is_empty() {
                self.ensure_access(&mut record, token, Forbid::WRITE)?;
            }
            stack.push((id, true));
            stack.extend(children.iter().rev().map(|child| (*child, false)));
        }

        log::debug!("Deleting {} elements under {top}.", order.len());
        for id in order {
            let record = self.load(id)?;
            self.delete_record(record)?;
        }
        Ok(())
    }

    pub(crate) fn add_child(
        &self,
        folder_id: ElementId,
        name: &str,
        kind: ElementKind,
        target: Option<ElementId>,
        lock: Option<LockToken>,
    ) -> Result<ElementId> {
        let mut folder = self.load(folder_id)?;
        folder.children()?;
        self.ensure_access(&mut folder, lock, Forbid::WRITE)?;
        if self.find_child(&folder, name)?.is_some() {
            return Err(ErrorKind::AlreadyExists.into());
        }

        let (flags, body) = match (kind, target) {
            (ElementKind::Folder, None) => (
                ElementFlags::FOLDER,
                Body::Folder {
                    children: Vec::new(),
                },
            ),
            (ElementKind::File, None) => (ElementFlags::FILE, Body::File(FileContent::default())),
            (ElementKind::Link, Some(target)) => {
                let (kind, stamp) = self.link_kind(target)?;
                (ElementFlags::LINK | kind, Body::Link { target, stamp })
            }
            _ => return Err(ErrorKind::InvalidInput.into()),
        };

        // Placeholder ID until the directory hands out a real one.
        let mut header = RecordHeader::new(ElementId::from_u64(0), folder_id, flags);
        let name_loc = self.write_name(folder.loc.block_no, name)?;
        header.set_name_location(Some(name_loc));
        let mut record = Record::new_detached(header, body);
        let len = record.encoded_len();

        let loc = match self.alloc_slot_near(name_loc.block_no, len) {
            Ok(loc) => loc,
            Err(err) => {
                self.free_name(Some(name_loc))?;
                return Err(err);
            }
        };
        let id = match self.generate(loc) {
            Ok(id) => id,
            Err(err) => {
                self.free_slot(loc, len)?;
                self.free_name(Some(name_loc))?;
                return Err(err);
            }
        };

        record.header.id = id.as_u64();
        record.loc = loc;
        record.disk_len = len;
        self.write_new_record(&record)?;

        folder.children_mut()?.push(id);
        folder.touch(true);
        if let Err(err) = self.save(&mut folder) {
            self.remove(id)?;
            self.free_slot(loc, len)?;
            self.free_name(Some(name_loc))?;
            return Err(err);
        }

        log::debug!("Created {kind:?} {id} '{name}' in {folder_id}.");
        Ok(id)
    }

    /// The kind flag a link to `target` mirrors, and the target's creation
    /// stamp.
    pub(crate) fn link_kind(&self, target: ElementId) -> Result<(ElementFlags, u64)> {
        if target == ElementId::DIRECTORY {
            return Err(ErrorKind::InvalidInput.into());
        }
        let record = self.load(target)?;
        match record.kind() {
            ElementKind::Link => {
                log::debug!("Link target {target} is a link.");
                Err(ErrorKind::InvalidInput.into())
            }
            kind => Ok((kind.flag(), record.header.created)),
        }
    }

    pub(crate) fn root(self: &Arc<Self>) -> Folder {
        Folder::from_node(Node::new(self.clone(), ElementId::ROOT))
    }
}
