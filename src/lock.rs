//! Element locks and the filesystem-wide structural lock.
//!
//! An element's lock word is stored in its record header together with the
//! time it was taken. Layout of the packed word:
//!
//! ```text
//! bit 63      shared (1) / exclusive (0)
//! bit 62      present; a zero word means "unlocked"
//! bits 56..60 forbidden operations (Forbid)
//! bits 48..56 number of shared holders
//! bits 0..48  random
//! ```
//!
//! Any lock taken before the current session started is left over from an
//! unclean shutdown and is treated as released.

use bitflags::bitflags;
use std::io::{ErrorKind, Result};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use crate::block_store::BlockStore;
use crate::error::locked;
use crate::layout::*;

bitflags! {
    /// Operations a lock holder forbids.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Forbid: u8 {
        const READ = 1;
        const WRITE = 2;
        const DELETE = 4;
        const META = 8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    Exclusive,
    Shared,
}

pub const MAX_SHARED_HOLDERS: u8 = u8::MAX;

const SHARED_BIT: u64 = 1 << 63;
const PRESENT_BIT: u64 = 1 << 62;
const FORBID_SHIFT: u32 = 56;
const FORBID_MASK: u64 = 0xf;
const HOLDERS_SHIFT: u32 = 48;
const HOLDERS_MASK: u64 = 0xff;
const NONCE_MASK: u64 = (1 << HOLDERS_SHIFT) - 1;

/// The state of a held lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockWord {
    kind: LockKind,
    forbid: Forbid,
    holders: u8,
    nonce: u64,
}

/// What a lock holder presents to access or release a locked element.
/// All holders of a shared lock hold the same token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

impl LockToken {
    pub fn kind(&self) -> LockKind {
        if self.0 & SHARED_BIT != 0 {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        }
    }

    pub fn forbid(&self) -> Forbid {
        Forbid::from_bits_truncate(((self.0 >> FORBID_SHIFT) & FORBID_MASK) as u8)
    }
}

impl LockWord {
    fn new(kind: LockKind, forbid: Forbid) -> Self {
        Self {
            kind,
            forbid,
            holders: match kind {
                LockKind::Exclusive => 0,
                LockKind::Shared => 1,
            },
            nonce: rand::random::<u64>() & NONCE_MASK,
        }
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn forbid(&self) -> Forbid {
        self.forbid
    }

    /// The number of shared holders; zero for exclusive locks.
    pub fn holders(&self) -> u8 {
        self.holders
    }

    pub(crate) fn pack(&self) -> u64 {
        let shared = match self.kind {
            LockKind::Exclusive => 0,
            LockKind::Shared => SHARED_BIT,
        };
        shared
            | PRESENT_BIT
            | ((self.forbid.bits() as u64) << FORBID_SHIFT)
            | ((self.holders as u64) << HOLDERS_SHIFT)
            | self.nonce
    }

    pub(crate) fn unpack(raw: u64) -> Option<Self> {
        if raw & PRESENT_BIT == 0 {
            return None;
        }
        let kind = if raw & SHARED_BIT != 0 {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        };
        Some(Self {
            kind,
            forbid: Forbid::from_bits_truncate(((raw >> FORBID_SHIFT) & FORBID_MASK) as u8),
            holders: ((raw >> HOLDERS_SHIFT) & HOLDERS_MASK) as u8,
            nonce: raw & NONCE_MASK,
        })
    }

    pub fn token(&self) -> LockToken {
        LockToken(self.pack() & !(HOLDERS_MASK << HOLDERS_SHIFT))
    }
}

/// unlocked => exclusive | shared(1); shared(n) => shared(n + 1) for
/// identical forbidden bits. Everything else is refused.
pub(crate) fn acquire(
    current: Option<LockWord>,
    kind: LockKind,
    forbid: Forbid,
) -> Result<LockWord> {
    let Some(mut word) = current else {
        return Ok(LockWord::new(kind, forbid));
    };

    if kind == LockKind::Shared && word.kind == LockKind::Shared && word.forbid == forbid {
        if word.holders == MAX_SHARED_HOLDERS {
            log::debug!("Too many shared lock holders.");
            return Err(locked());
        }
        word.holders += 1;
        return Ok(word);
    }

    Err(locked())
}

/// Returns the lock word after `token` is released.
pub(crate) fn release(current: Option<LockWord>, token: LockToken) -> Result<Option<LockWord>> {
    let Some(mut word) = current else {
        return Err(locked());
    };
    if word.token() != token {
        return Err(locked());
    }

    if word.kind == LockKind::Shared && word.holders > 1 {
        word.holders -= 1;
        Ok(Some(word))
    } else {
        Ok(None)
    }
}

/// May an operation that `forbidden` describes proceed?
pub(crate) fn check_access(
    current: Option<LockWord>,
    presented: Option<LockToken>,
    forbidden: Forbid,
) -> Result<()> {
    match (current, presented) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(locked()),
        (Some(word), None) => {
            if word.forbid.intersects(forbidden) {
                Err(locked())
            } else {
                Ok(())
            }
        }
        (Some(word), Some(token)) => {
            if word.token() != token {
                return Err(locked());
            }
            // Shared locks bind their holders, too.
            if word.kind == LockKind::Shared && word.forbid.intersects(forbidden) {
                return Err(locked());
            }
            Ok(())
        }
    }
}

pub(crate) fn is_stale(lock_ts: u64, session_start: Timestamp) -> bool {
    lock_ts < session_start.as_nanos()
}

/// The timestamp stored with a lock taken now. Never earlier than the
/// session start, so that fresh locks are never stale.
pub(crate) fn lock_time(session_start: Timestamp) -> Timestamp {
    Timestamp::now().max(session_start)
}

/// Holds the structural lock: the in-process gate exclusively, and the
/// superblock lock word.
pub(crate) struct StructureGuard<'a> {
    store: &'a BlockStore,
    token: u64,
    _gate: RwLockWriteGuard<'a, ()>,
}

pub(crate) fn lock_structure<'a>(
    gate: &'a RwLock<()>,
    store: &'a BlockStore,
    session_start: Timestamp,
) -> Result<StructureGuard<'a>> {
    let gate = gate.write().unwrap_or_else(PoisonError::into_inner);
    let token = rand::random::<u64>() | 1;

    loop {
        {
            let mut block = store.pin(SUPERBLOCK_NO)?;
            let mut sb: Superblock = read_pod(&block.bytes(), 0);
            if sb.struct_lock == 0 || is_stale(sb.struct_lock_ts, session_start) {
                if sb.struct_lock != 0 {
                    log::info!("Clearing a stale structural lock.");
                }
                sb.struct_lock = token;
                sb.struct_lock_ts = lock_time(session_start).as_nanos();
                sb.set_crc32();
                write_pod(&mut block.bytes_mut(), 0, &sb);

                return Ok(StructureGuard {
                    store,
                    token,
                    _gate: gate,
                });
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl StructureGuard<'_> {
    fn unlock(&self) -> Result<()> {
        let mut block = self.store.pin(SUPERBLOCK_NO)?;
        let mut sb: Superblock = read_pod(&block.bytes(), 0);
        if sb.struct_lock != self.token {
            return Err(ErrorKind::InvalidData.into());
        }
        sb.struct_lock = 0;
        sb.struct_lock_ts = 0;
        sb.set_crc32();
        write_pod(&mut block.bytes_mut(), 0, &sb);
        Ok(())
    }
}

impl Drop for StructureGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            log::error!("Failed to release the structural lock: {err:?}");
        }
    }
}
