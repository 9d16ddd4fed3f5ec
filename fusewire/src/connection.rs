use std::fs::File;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::abi::{FUSE_BATCH_FORGET, FUSE_FORGET, FUSE_NOTIFY_REPLY, InitIn};
use crate::buffer_pool::BufferPool;
use crate::errno::{Errno, Result};
use crate::mount_options::MountOptions;
use crate::notify::RetrieveTable;
use crate::request::Request;
#[cfg(target_os = "linux")]
use crate::splice::SpliceError;

/// Lifecycle of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Serving,
    Draining,
    Closed,
}

/// The kernel end of a mount: a descriptor read and written whole-message
/// at a time.
pub(crate) struct Channel {
    file: File,
}

impl Channel {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Channel {
            file: File::from(fd),
        }
    }

    /// Read one request. Interrupted reads are retried.
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.file).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Write one reply made of `parts`.
    pub(crate) fn write_parts(&self, parts: &[&[u8]]) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let written = if let [single] = parts {
            (&self.file).write(single)
        } else {
            let slices: Vec<IoSlice<'_>> = parts.iter().map(|p| IoSlice::new(p)).collect();
            (&self.file).write_vectored(&slices)
        };
        match written {
            Ok(n) if n == total => Ok(()),
            Ok(n) => {
                warn!("short write to fuse channel: {n} of {total} bytes");
                Err(Errno::EIO)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// State shared by everything talking to one mounted kernel channel.
pub(crate) struct Connection {
    channel: RwLock<Option<Arc<Channel>>>,
    kernel_settings: Mutex<InitIn>,
    can_splice: AtomicBool,
    transport_splices: bool,
    mount_point: PathBuf,
    state: watch::Sender<MountState>,
    /// Serializes notify writes against closing the channel.
    write_mu: Mutex<()>,
    retrieves: RetrieveTable,
    opts: MountOptions,
    buffers: Arc<dyn BufferPool>,
}

impl Connection {
    pub(crate) fn new(mount_point: PathBuf, opts: MountOptions, transport_splices: bool) -> Self {
        let buffers = opts.buffers();
        let (state, _) = watch::channel(MountState::Unmounted);
        Connection {
            channel: RwLock::new(None),
            kernel_settings: Mutex::new(InitIn::default()),
            can_splice: AtomicBool::new(false),
            transport_splices,
            mount_point,
            state,
            write_mu: Mutex::new(()),
            retrieves: RetrieveTable::default(),
            opts,
            buffers,
        }
    }

    pub(crate) fn attach(&self, fd: OwnedFd) {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Channel::new(fd)));
    }

    pub(crate) fn channel(&self) -> Result<Arc<Channel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Errno::EBADF)
    }

    /// Drop our reference to the channel. In-flight writers keep it alive
    /// until they finish.
    pub(crate) fn close(&self) {
        let _guard = self.write_mu.lock().unwrap_or_else(PoisonError::into_inner);
        self.channel.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub(crate) fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub(crate) fn opts(&self) -> &MountOptions {
        &self.opts
    }

    pub(crate) fn buffers(&self) -> &dyn BufferPool {
        &*self.buffers
    }

    pub(crate) fn retrieves(&self) -> &RetrieveTable {
        &self.retrieves
    }

    pub(crate) fn kernel_settings(&self) -> InitIn {
        *self.kernel_settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_kernel_settings(&self, settings: InitIn) {
        *self.kernel_settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Enable zero-copy replies if both the transport and the platform can.
    pub(crate) fn set_splice(&self) {
        let available = self.transport_splices && splice_available();
        self.can_splice.store(available, Ordering::Release);
    }

    pub(crate) fn can_splice(&self) -> bool {
        self.can_splice.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> MountState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: MountState) {
        self.state.send_replace(state);
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<MountState> {
        self.state.subscribe()
    }

    /// Write the reply for `req`, if its opcode expects one.
    pub(crate) fn write(&self, req: &mut Request) -> Result<()> {
        if matches!(req.opcode(), FUSE_FORGET | FUSE_BATCH_FORGET | FUSE_NOTIFY_REPLY) {
            return Ok(());
        }

        req.serialize_header(req.flat_size());
        if self.opts.debug {
            debug!("{}", req.output_debug());
        }
        self.system_write(req)
    }

    /// Write a server-initiated message, serialized against `close`.
    pub(crate) fn write_notify(&self, req: &mut Request) -> Result<()> {
        let _guard = self.write_mu.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(req)
    }

    fn system_write(&self, req: &mut Request) -> Result<()> {
        let channel = match self.channel() {
            Ok(channel) => channel,
            Err(errno) => {
                req.finish_read();
                return Err(errno);
            }
        };

        if req.has_read_payload() {
            #[cfg(target_os = "linux")]
            if self.can_splice() {
                if let Some((header, src)) = req.splice_view() {
                    match crate::splice::splice_reply(channel.as_fd(), header, &src) {
                        Ok(()) => {
                            req.finish_read();
                            return Ok(());
                        }
                        Err(SpliceError::Unsent(e)) => warn!("splice failed, falling back to copy: {e}"),
                        Err(e @ SpliceError::Partial { .. }) => {
                            error!("splice: {e}");
                            req.finish_read();
                            return Err(Errno::EIO);
                        }
                    }
                }
            }
            return req.write_read_reply(self.buffers(), |parts| channel.write_parts(parts));
        }

        let flat = req.flat_bytes();
        if flat.is_empty() {
            channel.write_parts(&[req.header_bytes()])
        } else {
            channel.write_parts(&[req.header_bytes(), flat])
        }
    }
}

#[cfg(target_os = "linux")]
fn splice_available() -> bool {
    crate::splice::available()
}

#[cfg(not(target_os = "linux"))]
fn splice_available() -> bool {
    false
}
