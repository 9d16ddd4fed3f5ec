//! Zero-copy READ replies on Linux.
//!
//! The reply header is written into a pipe, the file range is spliced in
//! behind it, and the whole pipe content is spliced into the channel in a
//! single call, since the kernel expects every reply in one write.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::buffer_pool::page_size;
use crate::read_result::SpliceSource;

const PIPE_MAX_SIZE: &str = "/proc/sys/fs/pipe-max-size";

/// Whether the running kernel lets us resize pipes for splicing.
pub(crate) fn available() -> bool {
    std::fs::read_to_string(PIPE_MAX_SIZE).is_ok()
}

/// Why a zero-copy reply did not go out.
#[derive(Debug)]
pub(crate) enum SpliceError {
    /// Nothing reached the channel; the reply can still be written by copy.
    Unsent(io::Error),
    /// Part of the reply is already in the channel.
    Partial { sent: usize, total: usize },
}

impl fmt::Display for SpliceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpliceError::Unsent(err) => write!(f, "{err}"),
            SpliceError::Partial { sent, total } => {
                write!(f, "spliced {sent} of {total} bytes into channel")
            }
        }
    }
}

impl From<io::Error> for SpliceError {
    fn from(err: io::Error) -> Self {
        SpliceError::Unsent(err)
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: fds points to two writable c_ints.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, so both descriptors are open and ours.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Pipe { read, write })
    }

    /// Make room for a header plus `len` spliced bytes. Each pipe slot holds
    /// one page; the header takes a slot of its own and an unaligned range
    /// touches one page more than its length suggests.
    fn reserve(&self, len: usize) -> io::Result<()> {
        let page = page_size();
        let want = (len.div_ceil(page) + 2) * page;

        // SAFETY: plain fcntl on a descriptor we own.
        let have = unsafe { libc::fcntl(self.write.as_raw_fd(), libc::F_GETPIPE_SZ) };
        if have < 0 {
            return Err(io::Error::last_os_error());
        }
        if have as usize >= want {
            return Ok(());
        }

        // SAFETY: as above.
        let got = unsafe { libc::fcntl(self.write.as_raw_fd(), libc::F_SETPIPE_SZ, want as libc::c_int) };
        if got < 0 {
            return Err(io::Error::last_os_error());
        }
        if (got as usize) < want {
            return Err(io::Error::other(format!("pipe holds {got} bytes, need {want}")));
        }
        Ok(())
    }
}

fn splice(
    from: RawFd,
    off_from: Option<&mut libc::loff_t>,
    to: RawFd,
    len: usize,
    flags: libc::c_uint,
) -> io::Result<usize> {
    let off_ptr = off_from.map_or(ptr::null_mut(), |off| off as *mut libc::loff_t);
    loop {
        // SAFETY: off_ptr is null or points to a live loff_t.
        let n = unsafe { libc::splice(from, off_ptr, to, ptr::null_mut(), len, flags) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: buf is a valid readable slice.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Send `header` followed by `src` to `channel` without copying the file
/// data through userspace.
///
/// Filling the pipe never blocks: a full pipe or a source shorter than
/// announced yields [`SpliceError::Unsent`] and the channel is untouched.
/// Only a short splice into the channel itself yields
/// [`SpliceError::Partial`], after which the reply must not be resent.
pub(crate) fn splice_reply(
    channel: BorrowedFd<'_>,
    header: &[u8],
    src: &SpliceSource<'_>,
) -> Result<(), SpliceError> {
    let total = header.len() + src.len;
    let pipe = Pipe::new()?;
    pipe.reserve(src.len)?;

    write_all(pipe.write.as_raw_fd(), header)?;

    let mut offset = src.offset as libc::loff_t;
    let mut moved = 0;
    while moved < src.len {
        let n = splice(
            src.fd.as_raw_fd(),
            Some(&mut offset),
            pipe.write.as_raw_fd(),
            src.len - moved,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )?;
        if n == 0 {
            return Err(SpliceError::Unsent(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {moved} of {} bytes", src.len),
            )));
        }
        moved += n;
    }

    let n = splice(pipe.read.as_raw_fd(), None, channel.as_raw_fd(), total, libc::SPLICE_F_MOVE)?;
    if n != total {
        return Err(SpliceError::Partial { sent: n, total });
    }
    Ok(())
}
