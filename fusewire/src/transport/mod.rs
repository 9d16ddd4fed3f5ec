//! Platform mount and unmount.
//!
//! A [`Transport`] turns a mount point into an open kernel channel and
//! later tears the mount down. The server only ever talks to the trait, so
//! tests can substitute an in-process channel.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use futures_channel::oneshot;

use crate::error::Error;
use crate::mount_options::MountOptions;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
pub use darwin::OsxfuseTransport;
#[cfg(target_os = "linux")]
pub use linux::FusermountTransport;

/// Result of a successful mount call.
pub struct Mounted {
    /// The kernel channel, already open.
    pub channel: OwnedFd,
    /// Resolves once the mount is usable. On Linux this is immediate; on
    /// macOS the helper only finishes after INIT has been answered.
    pub ready: oneshot::Receiver<Result<(), Error>>,
}

impl Mounted {
    /// A mount that is usable as soon as the channel is open.
    pub fn ready_now(channel: OwnedFd) -> Self {
        let (tx, ready) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Mounted { channel, ready }
    }
}

pub trait Transport: Send + Sync {
    /// Mount at `mount_point` and return the open channel. Blocking.
    fn mount(&self, mount_point: &Path, options: &MountOptions) -> Result<Mounted, Error>;

    /// Detach the mount. Blocking; may fail while files are still open.
    fn unmount(&self, mount_point: &Path) -> Result<(), Error>;

    /// Whether replies may be spliced into the channel.
    fn supports_splice(&self) -> bool {
        false
    }

    /// Make the kernel issue one POLL against the mount. Called once the
    /// mount is ready.
    fn poll_hack(&self, _mount_point: &Path) -> Result<(), Error> {
        Ok(())
    }
}

/// The transport for the platform this crate was built for.
pub fn default_transport() -> Arc<dyn Transport> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(FusermountTransport::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(OsxfuseTransport::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Arc::new(Unsupported)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
struct Unsupported;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl Transport for Unsupported {
    fn mount(&self, _mount_point: &Path, _options: &MountOptions) -> Result<Mounted, Error> {
        Err(Error::Io(std::io::Error::from(std::io::ErrorKind::Unsupported)))
    }

    fn unmount(&self, _mount_point: &Path) -> Result<(), Error> {
        Err(Error::Io(std::io::Error::from(std::io::ErrorKind::Unsupported)))
    }
}
