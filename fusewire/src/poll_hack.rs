//! Forces the kernel to send one POLL so it can be answered with ENOSYS.
//!
//! Until the kernel has seen POLL fail it keeps issuing poll requests for
//! files on the mount, which can starve a runtime whose own I/O polling
//! holds the last free worker. At mount time a reserved file is created
//! and polled once; requests for it never reach the filesystem.

use std::path::Path;

use crate::abi::{
    Attr, CreateOut, EntryOut, FUSE_CREATE, FUSE_LOOKUP, FUSE_POLL, OpenOut, ROOT_ID,
};
use crate::errno::Errno;
use crate::request::{Request, Status};

pub(crate) const POLL_HACK_NAME: &str = ".fusewire-epoll-hack";
pub(crate) const POLL_HACK_INODE: u64 = u64::MAX;

/// Answer `req` locally if it targets the reserved name or inode.
/// Returns false when the request is for the filesystem.
pub(crate) fn intercept(req: &mut Request) -> bool {
    if req.in_header.nodeid == POLL_HACK_INODE {
        // EIO rather than ENOSYS, so the kernel does not switch the
        // operation off for the whole mount.
        req.status = if req.opcode() == FUSE_POLL {
            Status::Err(Errno::ENOSYS)
        } else {
            Status::Err(Errno::EIO)
        };
        return true;
    }

    if req.in_header.nodeid != ROOT_ID
        || req.filename_count() == 0
        || req.filename(0) != POLL_HACK_NAME
    {
        return false;
    }

    match req.opcode() {
        FUSE_CREATE => {
            let attr = Attr {
                ino: POLL_HACK_INODE,
                mode: libc::S_IFREG as u32 | 0o644,
                nlink: 1,
                ..Default::default()
            };
            req.reply(Ok(CreateOut {
                entry: EntryOut {
                    nodeid: POLL_HACK_INODE,
                    attr,
                    ..Default::default()
                },
                open: OpenOut {
                    fh: POLL_HACK_INODE,
                    ..Default::default()
                },
            }));
        }
        FUSE_LOOKUP => req.status = Status::Err(Errno::ENOENT),
        _ => req.status = Status::Err(Errno::EIO),
    }
    true
}

/// Create the reserved file under `mount_point` and poll it once.
#[cfg(target_os = "linux")]
pub(crate) fn trigger(mount_point: &Path) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(mount_point.join(POLL_HACK_NAME))?;

    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN | libc::POLLPRI | libc::POLLOUT,
        revents: 0,
    };
    // Only the POLL request matters; the result is ignored.
    // SAFETY: pfd is a single valid pollfd.
    unsafe { libc::poll(&mut pfd, 1, 0) };
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn trigger(_mount_point: &Path) -> std::io::Result<()> {
    Ok(())
}
