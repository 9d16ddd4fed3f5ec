use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use tracing::debug;

use super::{Mounted, Transport};
use crate::error::Error;
use crate::mount_options::MountOptions;
use crate::poll_hack;

/// Descriptor number under which `fusermount` expects its socket.
const COMM_FD: RawFd = 3;

const FALLBACK_FUSERMOUNT: &str = "/bin/fusermount";

/// Mounts through the setuid `fusermount` helper, which opens `/dev/fuse`,
/// performs the mount and passes the descriptor back over a socket.
#[derive(Debug, Default, Clone)]
pub struct FusermountTransport {
    binary: Option<PathBuf>,
}

impl FusermountTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `binary` instead of searching for the helper.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        FusermountTransport {
            binary: Some(binary.into()),
        }
    }

    fn binary(&self) -> Result<PathBuf, Error> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => find_fusermount(),
        }
    }
}

fn find_fusermount() -> Result<PathBuf, Error> {
    #[cfg(feature = "unprivileged")]
    for name in ["fusermount3", "fusermount"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    let fallback = Path::new(FALLBACK_FUSERMOUNT);
    if fallback.exists() {
        return Ok(fallback.to_path_buf());
    }
    Err(Error::HelperNotFound("fusermount".to_string()))
}

impl Transport for FusermountTransport {
    fn mount(&self, mount_point: &Path, options: &MountOptions) -> Result<Mounted, Error> {
        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        let binary = self.binary()?;
        let mut cmd = Command::new(&binary);
        cmd.arg(mount_point);
        let opts = options.options_strings();
        if !opts.is_empty() {
            cmd.arg("-o").arg(opts.join(","));
        }
        cmd.env_clear()
            .env("_FUSE_COMMFD", COMM_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let remote_fd = remote.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if remote_fd == COMM_FD {
                    let flags = libc::fcntl(COMM_FD, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(COMM_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(remote_fd, COMM_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!("running {} {} -o {}", binary.display(), mount_point.display(), opts.join(","));
        let output = cmd.output()?;
        drop(remote);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(Error::HelperFailed {
                helper: binary.display().to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!("{}: {stderr}", binary.display());
        }

        let channel = receive_fd(&local)?;
        Ok(Mounted::ready_now(channel))
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), Error> {
        let binary = self.binary()?;
        let output = Command::new(&binary)
            .arg("-u")
            .arg(mount_point)
            .stdin(Stdio::null())
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::HelperFailed {
            helper: binary.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn supports_splice(&self) -> bool {
        true
    }

    fn poll_hack(&self, mount_point: &Path) -> Result<(), Error> {
        poll_hack::trigger(mount_point)?;
        Ok(())
    }
}

/// Receive the descriptor `fusermount` sends as SCM_RIGHTS ancillary data.
fn receive_fd(sock: &OwnedFd) -> Result<OwnedFd, Error> {
    let mut data = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let fd_size = size_of::<libc::c_int>() as libc::c_uint;
    // SAFETY: CMSG_SPACE and CMSG_LEN only compute sizes.
    let (space, want_len) = unsafe { (libc::CMSG_SPACE(fd_size) as usize, libc::CMSG_LEN(fd_size) as usize) };
    let mut control = vec![0u8; space];

    // SAFETY: msghdr is plain data for which all-zero is valid.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    loop {
        // SAFETY: msg points at live buffers for the duration of the call.
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
        if n >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(Error::BadControlMessage("control message truncated".to_string()));
    }
    // SAFETY: msg was filled in by recvmsg.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(Error::BadControlMessage(
            "mount helper sent no descriptor".to_string(),
        ));
    }
    // SAFETY: cmsg is non-null and lies within `control`.
    let (level, typ, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len as usize) };
    if level != libc::SOL_SOCKET || typ != libc::SCM_RIGHTS {
        return Err(Error::BadControlMessage(format!(
            "unexpected control message level {level} type {typ}"
        )));
    }
    if len != want_len {
        return Err(Error::BadControlMessage(format!(
            "control message length {len}, want {want_len}"
        )));
    }
    // SAFETY: the length check guarantees one c_int of payload.
    let fd: RawFd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };
    if fd < 0 {
        return Err(Error::BadControlMessage(format!("bad descriptor {fd}")));
    }

    // SAFETY: the kernel installed this descriptor for us alone.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(fd)
}
