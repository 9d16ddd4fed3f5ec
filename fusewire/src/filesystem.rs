use std::ffi::OsStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::abi::{
    AccessIn, AttrOut, CopyFileRangeIn, CreateIn, CreateOut, EntryOut, FallocateIn, FlushIn,
    FsyncIn, GetAttrIn, InHeader, LinkIn, LkIn, LkOut, LseekIn, LseekOut, MkdirIn, MknodIn,
    OpenIn, OpenOut, ReadIn, ReleaseIn, Rename2In, SetAttrIn, SetXAttrIn, StatfsOut, WriteIn,
    WriteOut,
};
use crate::dirent::DirEntryList;
use crate::errno::{Errno, Result};
use crate::notify::Notifier;
use crate::read_result::ReadResult;

/// Callbacks invoked for kernel requests, one per opcode.
///
/// Every method has a default that answers `ENOSYS`, so an implementation
/// only overrides what it supports. `header` is the request header: it
/// carries the node id the operation applies to and the caller's
/// uid/gid/pid.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    /// Short name, used as the mount subtype when none is configured.
    fn name(&self) -> String {
        "fusewire".to_string()
    }

    /// Called once INIT has been answered, before any other request is read.
    async fn init(&self, _notifier: Notifier) {}

    async fn destroy(&self) {}

    async fn lookup(&self, _header: &InHeader, _name: &OsStr) -> Result<EntryOut> {
        Err(Errno::ENOSYS)
    }

    async fn forget(&self, _nodeid: u64, _nlookup: u64) {}

    async fn getattr(&self, _header: &InHeader, _input: &GetAttrIn) -> Result<AttrOut> {
        Err(Errno::ENOSYS)
    }

    async fn setattr(&self, _header: &InHeader, _input: &SetAttrIn) -> Result<AttrOut> {
        Err(Errno::ENOSYS)
    }

    async fn mknod(&self, _header: &InHeader, _input: &MknodIn, _name: &OsStr) -> Result<EntryOut> {
        Err(Errno::ENOSYS)
    }

    async fn mkdir(&self, _header: &InHeader, _input: &MkdirIn, _name: &OsStr) -> Result<EntryOut> {
        Err(Errno::ENOSYS)
    }

    async fn unlink(&self, _header: &InHeader, _name: &OsStr) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn rmdir(&self, _header: &InHeader, _name: &OsStr) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// RENAME and RENAME2. Plain RENAME arrives with `flags == 0`.
    async fn rename(
        &self,
        _header: &InHeader,
        _input: &Rename2In,
        _old_name: &OsStr,
        _new_name: &OsStr,
    ) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn link(&self, _header: &InHeader, _input: &LinkIn, _name: &OsStr) -> Result<EntryOut> {
        Err(Errno::ENOSYS)
    }

    async fn symlink(&self, _header: &InHeader, _target: &OsStr, _name: &OsStr) -> Result<EntryOut> {
        Err(Errno::ENOSYS)
    }

    async fn readlink(&self, _header: &InHeader) -> Result<Bytes> {
        Err(Errno::ENOSYS)
    }

    async fn access(&self, _header: &InHeader, _input: &AccessIn) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Size of an attribute value, for GETXATTR size probes.
    async fn getxattr_size(&self, header: &InHeader, name: &OsStr) -> Result<usize> {
        self.getxattr(header, name).await.map(|value| value.len())
    }

    async fn getxattr(&self, _header: &InHeader, _name: &OsStr) -> Result<Bytes> {
        Err(Errno::ENOSYS)
    }

    /// NUL-separated attribute names.
    async fn listxattr(&self, _header: &InHeader) -> Result<Bytes> {
        Err(Errno::ENOSYS)
    }

    async fn setxattr(
        &self,
        _header: &InHeader,
        _input: &SetXAttrIn,
        _name: &OsStr,
        _value: &[u8],
    ) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn removexattr(&self, _header: &InHeader, _name: &OsStr) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn create(&self, _header: &InHeader, _input: &CreateIn, _name: &OsStr) -> Result<CreateOut> {
        Err(Errno::ENOSYS)
    }

    async fn open(&self, _header: &InHeader, _input: &OpenIn) -> Result<OpenOut> {
        Err(Errno::ENOSYS)
    }

    /// The reply never carries more than `input.size` bytes.
    async fn read(&self, _header: &InHeader, _input: &ReadIn) -> Result<Box<dyn ReadResult>> {
        Err(Errno::ENOSYS)
    }

    /// Returns the number of bytes written.
    async fn write(&self, _header: &InHeader, _input: &WriteIn, _data: &[u8]) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    async fn flush(&self, _header: &InHeader, _input: &FlushIn) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn release(&self, _header: &InHeader, _input: &ReleaseIn) {}

    async fn fsync(&self, _header: &InHeader, _input: &FsyncIn) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn fallocate(&self, _header: &InHeader, _input: &FallocateIn) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn opendir(&self, _header: &InHeader, _input: &OpenIn) -> Result<OpenOut> {
        Err(Errno::ENOSYS)
    }

    async fn readdir(&self, _header: &InHeader, _input: &ReadIn, _out: &mut DirEntryList) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn readdirplus(
        &self,
        _header: &InHeader,
        _input: &ReadIn,
        _out: &mut DirEntryList,
    ) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn releasedir(&self, _header: &InHeader, _input: &ReleaseIn) {}

    async fn fsyncdir(&self, _header: &InHeader, _input: &FsyncIn) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn statfs(&self, _header: &InHeader) -> Result<StatfsOut> {
        Err(Errno::ENOSYS)
    }

    async fn getlk(&self, _header: &InHeader, _input: &LkIn) -> Result<LkOut> {
        Err(Errno::ENOSYS)
    }

    /// SETLK and SETLKW; `block` is set for the latter.
    async fn setlk(&self, _header: &InHeader, _input: &LkIn, _block: bool) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    async fn lseek(&self, _header: &InHeader, _input: &LseekIn) -> Result<LseekOut> {
        Err(Errno::ENOSYS)
    }

    async fn copy_file_range(&self, _header: &InHeader, _input: &CopyFileRangeIn) -> Result<WriteOut> {
        Err(Errno::ENOSYS)
    }
}

/// Sink for per-operation latencies.
pub trait LatencyMap: Send + Sync {
    fn add(&self, name: &str, elapsed: Duration);
}
