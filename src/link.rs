//! Links: a reference to another folder or file. Links to links are not
//! allowed, so a link resolves in one step.
//!
//! A link also stores its target's creation time. IDs of deleted elements
//! are handed out again, so a link whose stamp no longer matches the
//! element under that ID is dangling.

use std::io::{ErrorKind, Result};

use crate::layout::*;
use crate::lock::{Forbid, LockToken};
use crate::record::Body;
use crate::{Element, Node};

/// A link handle.
#[derive(Clone)]
pub struct Link {
    pub(crate) node: Node,
}

impl core::ops::Deref for Link {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl core::fmt::Debug for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Link({})", self.node.id())
    }
}

impl Link {
    /// The ID of the element the link points to; NotFound if that element
    /// has been deleted.
    pub fn target_id(&self, lock: Option<LockToken>) -> Result<ElementId> {
        self.engine().with_record(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::READ)?;
            let Body::Link { target, stamp } = &record.body else {
                return Err(crate::error::corrupted(format_args!(
                    "{} is not a link",
                    record.id()
                )));
            };
            match engine.load(*target) {
                Ok(found) if found.header.created == *stamp => Ok(*target),
                Ok(_) => {
                    log::debug!("Link {}: {target} was deleted and reused.", record.id());
                    Err(ErrorKind::NotFound.into())
                }
                Err(err) => Err(err),
            }
        })
    }

    /// The element the link points to; NotFound if it has been deleted.
    pub fn target(&self, lock: Option<LockToken>) -> Result<Element> {
        let target = self.target_id(lock)?;
        self.engine().element(target)
    }

    /// Points the link at `target` and mirrors its kind.
    pub fn set_target(&self, target: &Node, lock: Option<LockToken>) -> Result<()> {
        let target = target.id();
        self.engine().with_structure(self.id(), |engine, record| {
            engine.ensure_access(record, lock, Forbid::WRITE)?;
            let (kind, created) = engine.link_kind(target)?;
            let id = record.id();
            let Body::Link {
                target: current,
                stamp,
            } = &mut record.body
            else {
                return Err(crate::error::corrupted(format_args!("{id} is not a link")));
            };
            *current = target;
            *stamp = created;

            let user = record.header.flags() & ElementFlags::USER;
            record.header.flags = (ElementFlags::LINK | kind | user).bits();
            record.touch(true);
            engine.save(record)
        })
    }
}
