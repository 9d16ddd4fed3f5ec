use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;

use crate::errno::Result;

/// Payload of a READ reply.
///
/// A result is either materialized into a byte slice with [`bytes`], or,
/// when it exposes a [`splice_source`], moved straight from its file
/// descriptor into the kernel channel. [`done`] runs once the reply has
/// been written, whichever path was taken.
///
/// [`bytes`]: ReadResult::bytes
/// [`splice_source`]: ReadResult::splice_source
/// [`done`]: ReadResult::done
pub trait ReadResult: Send + Sync {
    /// Number of payload bytes.
    fn size(&self) -> usize;

    /// Return the payload, using `buf` as scratch space if needed.
    fn bytes<'a>(&'a self, buf: &'a mut [u8]) -> Result<&'a [u8]>;

    fn splice_source(&self) -> Option<SpliceSource<'_>> {
        None
    }

    fn done(&mut self) {}
}

/// A file range that can be spliced into the channel.
#[derive(Debug)]
pub struct SpliceSource<'a> {
    pub fd: BorrowedFd<'a>,
    /// Absolute read position; the descriptor's own offset is never used.
    pub offset: u64,
    pub len: usize,
}

/// In-memory read result.
#[derive(Debug, Clone, Default)]
pub struct ReadResultData(pub Bytes);

impl From<Vec<u8>> for ReadResultData {
    fn from(data: Vec<u8>) -> Self {
        ReadResultData(Bytes::from(data))
    }
}

impl From<Bytes> for ReadResultData {
    fn from(data: Bytes) -> Self {
        ReadResultData(data)
    }
}

impl ReadResult for ReadResultData {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn bytes<'a>(&'a self, _buf: &'a mut [u8]) -> Result<&'a [u8]> {
        Ok(&self.0)
    }
}

/// Read result backed by a file range, eligible for splicing.
///
/// Both the splice and the copy path read positionally, so a failed splice
/// can be retried by copy without losing data.
#[derive(Debug, Clone)]
pub struct ReadResultFd {
    pub file: Arc<File>,
    pub offset: u64,
    pub size: usize,
}

impl ReadResultFd {
    pub fn new(file: Arc<File>, offset: u64, size: usize) -> Self {
        ReadResultFd { file, offset, size }
    }
}

impl ReadResult for ReadResultFd {
    fn size(&self) -> usize {
        self.size
    }

    fn bytes<'a>(&'a self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        let want = self.size.min(buf.len());
        let mut n = 0;
        while n < want {
            match self.file.read_at(&mut buf[n..want], self.offset + n as u64) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(&buf[..n])
    }

    fn splice_source(&self) -> Option<SpliceSource<'_>> {
        Some(SpliceSource {
            fd: self.file.as_fd(),
            offset: self.offset,
            len: self.size,
        })
    }
}
