use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::abi::{self, DIRENT_SIZE, Dirent, ENTRY_OUT_SIZE, EntryOut, align8};
use crate::errno::{Errno, Result};

/// One entry to be listed by READDIR or READDIRPLUS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    /// Full `st_mode`; only the file type bits are sent.
    pub mode: u32,
}

/// Builder for a READDIR/READDIRPLUS reply body.
///
/// Entries are appended until the declared capacity would be exceeded; a
/// rejected entry leaves the list untouched so the caller can stop and
/// resume from [`DirEntryList::offset`] on the next call.
pub struct DirEntryList {
    buf: Vec<u8>,
    len: usize,
    size: usize,
    offset: u64,
}

/// Reserved `EntryOut` slot preceding a READDIRPLUS dirent.
pub struct LookupSlot<'a> {
    bytes: &'a mut [u8],
}

impl LookupSlot<'_> {
    pub fn set(self, entry: &EntryOut) {
        // The slot is exactly ENTRY_OUT_SIZE bytes.
        let _ = abi::encode_into(entry, self.bytes);
    }
}

impl DirEntryList {
    /// Wrap `buf`; its length is the capacity of the list. `offset` is the
    /// directory offset the kernel asked to start from.
    pub fn new(mut buf: Vec<u8>, offset: u64) -> Self {
        let size = buf.len();
        buf.fill(0);
        DirEntryList {
            buf,
            len: 0,
            size,
            offset,
        }
    }

    pub fn add_dir_entry(&mut self, entry: &DirEntry) -> bool {
        self.add(&entry.name, entry.ino, entry.mode)
    }

    /// Append a plain dirent. Returns false, without changing anything, when
    /// the entry does not fit.
    pub fn add(&mut self, name: &OsStr, ino: u64, mode: u32) -> bool {
        self.push(0, name, ino, mode).is_some()
    }

    /// Append a dirent preceded by a zeroed lookup record, as READDIRPLUS
    /// expects. Returns `None` when the pair does not fit.
    pub fn add_dir_lookup_entry(&mut self, entry: &DirEntry) -> Option<LookupSlot<'_>> {
        let start = self.push(ENTRY_OUT_SIZE, &entry.name, entry.ino, entry.mode)?;
        Some(LookupSlot {
            bytes: &mut self.buf[start..start + ENTRY_OUT_SIZE],
        })
    }

    fn push(&mut self, prefix: usize, name: &OsStr, ino: u64, mode: u32) -> Option<usize> {
        let name = name.as_bytes();
        let start = self.len;
        let delta = prefix + align8(DIRENT_SIZE + name.len());
        if start + delta > self.size {
            return None;
        }

        let dirent = Dirent {
            ino,
            off: self.offset + 1,
            namelen: name.len() as u32,
            typ: (mode & libc::S_IFMT as u32) >> 12,
        };
        let mut at = start;
        self.buf[at..at + prefix].fill(0);
        at += prefix;
        abi::encode_into(&dirent, &mut self.buf[at..]).ok()?;
        at += DIRENT_SIZE;
        self.buf[at..at + name.len()].copy_from_slice(name);
        at += name.len();
        self.buf[at..start + delta].fill(0);

        self.len = start + delta;
        self.offset = dirent.off;
        Some(start)
    }

    /// Offset of the last entry added.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Give back the backing buffer and the number of bytes written.
    pub fn into_buffer(self) -> (Vec<u8>, usize) {
        (self.buf, self.len)
    }
}

/// Split a READDIR reply body back into its entries.
pub fn decode_dirents(mut buf: &[u8]) -> Result<Vec<(Dirent, OsString)>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        let dirent: Dirent = abi::decode(buf)?;
        let namelen = dirent.namelen as usize;
        let total = align8(DIRENT_SIZE + namelen);
        if buf.len() < total {
            return Err(Errno::EIO);
        }
        let name = buf[DIRENT_SIZE..DIRENT_SIZE + namelen].to_vec();
        entries.push((dirent, OsString::from_vec(name)));
        buf = &buf[total..];
    }
    Ok(entries)
}
