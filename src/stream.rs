//! Sequential access to file content via std::io traits.

use std::io::{ErrorKind, Read, Result, Seek, SeekFrom, Write};

use crate::lock::{Forbid, LockKind, LockToken};
use crate::File;

/// A cursor over a file's content.
///
/// Writes past the end of the file grow it. A stream created by
/// File::open_stream() holds its own lock and releases it when dropped.
pub struct FileStream {
    file: File,
    token: Option<LockToken>,
    owns_lock: bool,
    pos: u64,
}

impl File {
    /// A stream that presents `lock` (if any) on every access.
    pub fn stream(&self, lock: Option<LockToken>) -> FileStream {
        FileStream {
            file: self.clone(),
            token: lock,
            owns_lock: false,
            pos: 0,
        }
    }

    /// Locks the file and returns a stream holding the lock.
    pub fn open_stream(&self, kind: LockKind, forbid: Forbid) -> Result<FileStream> {
        let token = self.lock(kind, forbid)?;
        Ok(FileStream {
            file: self.clone(),
            token: Some(token),
            owns_lock: true,
            pos: 0,
        })
    }
}

impl FileStream {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn token(&self) -> Option<LockToken> {
        self.token
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.file.length()?;
        if self.pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let n = (len - self.pos).min(buf.len() as u64) as usize;
        self.file.get_content(self.pos, &mut buf[..n], self.token)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let len = self.file.length()?;
        if self.pos > len {
            // Fill the hole with zeroes.
            let zeroes = vec![0_u8; (self.pos - len) as usize];
            self.file.append_content(&zeroes, self.token)?;
        }

        let len = len.max(self.pos);
        let overlap = (len - self.pos).min(buf.len() as u64) as usize;
        if overlap > 0 {
            self.file
                .set_content(self.pos, &buf[..overlap], self.token)?;
        }
        if overlap < buf.len() {
            self.file.append_content(&buf[overlap..], self.token)?;
        }

        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.file.length()?.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let Some(new_pos) = new_pos else {
            return Err(ErrorKind::InvalidInput.into());
        };
        self.pos = new_pos;
        Ok(new_pos)
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        if !self.owns_lock {
            return;
        }
        if let Some(token) = self.token.take() {
            if let Err(err) = self.file.unlock(token) {
                log::warn!("{:?}: failed to release the stream lock: {err:?}", self.file);
            }
        }
    }
}
