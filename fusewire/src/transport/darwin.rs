use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use futures_channel::oneshot;
use tracing::{debug, warn};

use super::{Mounted, Transport};
use crate::error::Error;
use crate::mount_options::MountOptions;

const MOUNT_BINARY: &str = "/Library/Filesystems/osxfuse.fs/Contents/Resources/mount_osxfuse";
const MOUNT_BINARY_OLD: &str = "/Library/Filesystems/osxfusefs.fs/Support/mount_osxfusefs";
const LOAD_BINARY: &str = "/Library/Filesystems/osxfuse.fs/Contents/Resources/load_osxfuse";
const LOAD_BINARY_OLD: &str = "/Library/Filesystems/osxfusefs.fs/Support/load_osxfusefs";

/// Descriptor number under which the mount helper expects the device.
const DEVICE_FD: RawFd = 3;

/// Mounts through the osxfuse helper. The device is opened here and handed
/// to the helper, which completes the mount only after INIT was answered,
/// so readiness is reported from a background thread.
#[derive(Debug, Default, Clone)]
pub struct OsxfuseTransport;

impl OsxfuseTransport {
    pub fn new() -> Self {
        OsxfuseTransport
    }
}

fn first_existing(new: &str, old: &str) -> PathBuf {
    if Path::new(new).exists() {
        PathBuf::from(new)
    } else {
        PathBuf::from(old)
    }
}

fn device_candidates() -> io::Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir("/dev")?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().as_bytes().starts_with(b"osxfuse"))
        .map(|entry| entry.path())
        .collect();
    found.sort();
    Ok(found)
}

fn open_device() -> Result<File, Error> {
    let mut candidates = device_candidates()?;
    if candidates.is_empty() {
        let load = first_existing(LOAD_BINARY, LOAD_BINARY_OLD);
        debug!("no osxfuse device, running {}", load.display());
        let status = Command::new(&load).status()?;
        if !status.success() {
            return Err(Error::HelperFailed {
                helper: load.display().to_string(),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        candidates = device_candidates()?;
    }

    for candidate in &candidates {
        match OpenOptions::new().read(true).write(true).open(candidate) {
            Ok(file) => return Ok(file),
            Err(e) => debug!("open {}: {e}", candidate.display()),
        }
    }
    Err(Error::HelperNotFound("osxfuse device".to_string()))
}

impl Transport for OsxfuseTransport {
    fn mount(&self, mount_point: &Path, options: &MountOptions) -> Result<Mounted, Error> {
        let device = open_device()?;
        let binary = first_existing(MOUNT_BINARY, MOUNT_BINARY_OLD);
        let daemon = std::env::args_os().next().unwrap_or_default();

        let mut cmd = Command::new(&binary);
        cmd.arg("-o")
            .arg(options.options_strings().join(","))
            .arg("-o")
            .arg(format!("iosize={}", options.max_write_size()))
            .arg(DEVICE_FD.to_string())
            .arg(mount_point)
            .env("MOUNT_FUSEFS_CALL_BY_LIB", "")
            .env("MOUNT_OSXFUSE_CALL_BY_LIB", "")
            .env("MOUNT_OSXFUSE_DAEMON_PATH", &daemon)
            .env("MOUNT_FUSEFS_DAEMON_PATH", &daemon)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let device_fd = device.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if device_fd == DEVICE_FD {
                    let flags = libc::fcntl(DEVICE_FD, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(DEVICE_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(device_fd, DEVICE_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        // try_clone duplicates with close-on-exec set.
        let channel = OwnedFd::from(device.try_clone()?);
        drop(device);

        let (tx, ready) = oneshot::channel();
        let helper = binary.display().to_string();
        std::thread::spawn(move || {
            let result = match child.wait_with_output() {
                Ok(output) if output.status.success() => Ok(()),
                Ok(output) => Err(Error::HelperFailed {
                    helper,
                    status: output.status.to_string(),
                    stderr: format!(
                        "{} (stdout: {})",
                        String::from_utf8_lossy(&output.stderr).trim(),
                        String::from_utf8_lossy(&output.stdout).trim()
                    ),
                }),
                Err(e) => Err(Error::Io(e)),
            };
            if let Err(err) = &result {
                warn!("mount helper failed: {err}");
            }
            let _ = tx.send(result);
        });

        Ok(Mounted {
            channel,
            ready,
        })
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), Error> {
        let path = CString::new(mount_point.as_os_str().as_bytes())
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: path is a valid NUL-terminated string.
        if unsafe { libc::unmount(path.as_ptr(), 0) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}
