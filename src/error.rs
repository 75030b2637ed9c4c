//! The error conditions of the engine, as std::io errors.
//!
//! Most conditions map directly onto an ErrorKind and are created inline
//! (e.g. `ErrorKind::AlreadyExists.into()`); the helpers below cover the
//! ones whose kind is not obvious from the name.

use std::io::{Error, ErrorKind};

/// The filesystem (or its block store) has been closed.
pub(crate) fn closed() -> Error {
    Error::new(ErrorKind::NotConnected, "filesystem closed")
}

/// A lock protocol violation.
pub(crate) fn locked() -> Error {
    ErrorKind::ResourceBusy.into()
}

/// `offset + len` past the end of a file.
pub(crate) fn out_of_range() -> Error {
    ErrorKind::UnexpectedEof.into()
}

/// An internal invariant does not hold: the on-disk state is corrupted.
pub(crate) fn corrupted(what: core::fmt::Arguments<'_>) -> Error {
    log::error!("Consistency error: {what}");
    Error::new(ErrorKind::InvalidData, what.to_string())
}
