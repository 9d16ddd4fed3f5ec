use std::fmt::{self, Display, Formatter};
use std::io;

/// A POSIX error number returned to the kernel.
///
/// A successful operation is expressed as `Ok(..)`; an `Errno` is always a
/// failure and is written to the kernel as `-errno` in the reply header.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EACCES: Errno = Errno(libc::EACCES);
    #[cfg(target_os = "linux")]
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    #[cfg(not(target_os = "linux"))]
    pub const ENODATA: Errno = Errno(libc::ENOATTR);

    /// Construct from a raw errno value.
    pub const fn from_raw(errno: i32) -> Self {
        Errno(errno)
    }

    /// The raw, positive errno value.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl From<i32> for Errno {
    fn from(errno: i32) -> Self {
        Errno(errno)
    }
}

impl From<Errno> for i32 {
    fn from(errno: Errno) -> Self {
        errno.0
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Self {
        Errno(err as i32)
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> Self {
        io::Error::from_raw_os_error(errno.0)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, nix::errno::Errno::from_raw(self.0).desc())
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", nix::errno::Errno::from_raw(self.0).desc())
    }
}

impl std::error::Error for Errno {}

/// Result of a filesystem callback or notification.
pub type Result<T> = std::result::Result<T, Errno>;
