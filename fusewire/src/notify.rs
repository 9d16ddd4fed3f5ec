//! Server-initiated cache notifications.
//!
//! Invalidate and store notifications are fire-and-forget writes.
//! Retrieve is a round trip: the request carries a locally generated id,
//! and the kernel answers later with a NOTIFY_REPLY carrying the same id.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_channel::oneshot;
use tracing::{debug, warn};

use crate::abi::{
    FUSE_NOTIFY_DELETE, FUSE_NOTIFY_INVAL_ENTRY, FUSE_NOTIFY_INVAL_INODE, FUSE_NOTIFY_RETRIEVE,
    FUSE_NOTIFY_STORE, NotifyInvalDeleteOut, NotifyInvalEntryOut, NotifyInvalInodeOut, NotifyKind,
    NotifyRetrieveOut, NotifyStoreOut, OP_NOTIFY_DELETE, OP_NOTIFY_INVAL_ENTRY,
    OP_NOTIFY_INVAL_INODE, OP_NOTIFY_RETRIEVE_CACHE, OP_NOTIFY_STORE_CACHE,
};
use crate::connection::Connection;
use crate::errno::{Errno, Result};
use crate::request::{Payload, Request};

/// Largest chunk carried by one store or retrieve; the wire size field is
/// 32 bits and we stay within the positive i32 range.
const MAX_NOTIFY_CHUNK: usize = i32::MAX as usize;

struct Pending {
    nodeid: u64,
    offset: u64,
    capacity: usize,
    done: oneshot::Sender<Result<Bytes>>,
}

#[derive(Default)]
struct RetrieveState {
    next: u64,
    pending: HashMap<u64, Pending>,
}

/// In-flight retrieve requests keyed by notify id.
#[derive(Default)]
pub(crate) struct RetrieveTable {
    state: Mutex<RetrieveState>,
}

impl RetrieveTable {
    /// Register a retrieve and return its id and completion.
    fn insert(&self, nodeid: u64, offset: u64, capacity: usize) -> (u64, oneshot::Receiver<Result<Bytes>>) {
        let (done, rx) = oneshot::channel();
        let mut state = self.lock();
        let id = state.next;
        state.next += 1;
        state.pending.insert(
            id,
            Pending {
                nodeid,
                offset,
                capacity,
                done,
            },
        );
        (id, rx)
    }

    /// Drop a pending entry whose request never reached the kernel. It may
    /// already be gone if the connection shut down meanwhile.
    fn remove(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    /// Resolve the entry answered by a NOTIFY_REPLY.
    pub(crate) fn complete(&self, id: u64, nodeid: u64, offset: u64, data: &[u8]) {
        let Some(pending) = self.lock().pending.remove(&id) else {
            warn!("notify reply: unexpected unique {id} - ignoring");
            return;
        };

        let result = if pending.nodeid != nodeid {
            warn!(
                "notify reply: inode mismatch: expected {}, got {}",
                pending.nodeid, nodeid
            );
            Err(Errno::EIO)
        } else if pending.offset != offset {
            warn!(
                "notify reply: offset mismatch: expected @{}, got @{}",
                pending.offset, offset
            );
            Err(Errno::EIO)
        } else {
            if data.len() > pending.capacity {
                warn!(
                    "notify reply: too much data: requested {}b, got {}b (will use only {}b)",
                    pending.capacity,
                    data.len(),
                    pending.capacity
                );
            }
            Ok(Bytes::copy_from_slice(&data[..data.len().min(pending.capacity)]))
        };
        let _ = pending.done.send(result);
    }

    /// Fail every pending retrieve with ENODEV.
    pub(crate) fn shutdown(&self) {
        let pending = std::mem::take(&mut self.lock().pending);
        for (_, entry) in pending {
            let _ = entry.done.send(Err(Errno::ENODEV));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetrieveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for sending cache notifications to the kernel.
///
/// Cheap to clone; handed to [`FileSystem::init`](crate::FileSystem::init)
/// and available from [`Server::notifier`](crate::Server::notifier).
#[derive(Clone)]
pub struct Notifier {
    conn: Arc<Connection>,
}

impl Notifier {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Notifier { conn }
    }

    fn supports(&self, kind: NotifyKind) -> bool {
        self.conn.kernel_settings().supports_notify(kind)
    }

    fn send(&self, req: &mut Request, what: &str) -> Result<()> {
        let result = self.conn.write_notify(req);
        if self.conn.opts().is_debug() {
            debug!("Response: {what}: {result:?}");
        }
        result
    }

    /// Invalidate cached data and attributes of `node`. A negative `off`
    /// invalidates attributes only; `length` 0 means to the end of file.
    pub fn inode_notify(&self, node: u64, off: i64, length: i64) -> Result<()> {
        if !self.supports(NotifyKind::InvalInode) {
            return Err(Errno::ENOSYS);
        }
        let mut req = Request::notify(OP_NOTIFY_INVAL_INODE, FUSE_NOTIFY_INVAL_INODE);
        req.set_out(&NotifyInvalInodeOut {
            ino: node,
            off,
            length,
        });
        self.send(&mut req, "INODE_NOTIFY")
    }

    /// Invalidate the dentry `name` under `parent`.
    pub fn entry_notify(&self, parent: u64, name: &OsStr) -> Result<()> {
        if !self.supports(NotifyKind::InvalEntry) {
            return Err(Errno::ENOSYS);
        }
        let mut req = Request::notify(OP_NOTIFY_INVAL_ENTRY, FUSE_NOTIFY_INVAL_ENTRY);
        req.set_out(&NotifyInvalEntryOut {
            parent,
            namelen: name.len() as u32,
            padding: 0,
        });
        req.payload = Payload::Bytes(nul_terminated(name));
        self.send(&mut req, "ENTRY_NOTIFY")
    }

    /// Tell the kernel `name` was removed from `parent`.
    ///
    /// Kernels older than 7.18 lack this notification; there it falls back
    /// to [`entry_notify`](Self::entry_notify) and `child` is not sent.
    pub fn delete_notify(&self, parent: u64, child: u64, name: &OsStr) -> Result<()> {
        if self.conn.kernel_settings().minor < 18 {
            return self.entry_notify(parent, name);
        }
        let mut req = Request::notify(OP_NOTIFY_DELETE, FUSE_NOTIFY_DELETE);
        req.set_out(&NotifyInvalDeleteOut {
            parent,
            child,
            namelen: name.len() as u32,
            padding: 0,
        });
        req.payload = Payload::Bytes(nul_terminated(name));
        self.send(&mut req, "DELETE_NOTIFY")
    }

    /// Push `data` into the kernel page cache of `node` at `offset`.
    pub fn inode_notify_store_cache(&self, node: u64, mut offset: i64, data: &[u8]) -> Result<()> {
        if !self.supports(NotifyKind::StoreCache) {
            return Err(Errno::ENOSYS);
        }
        for chunk in data.chunks(MAX_NOTIFY_CHUNK) {
            let mut req = Request::notify(OP_NOTIFY_STORE_CACHE, FUSE_NOTIFY_STORE);
            req.set_out(&NotifyStoreOut {
                nodeid: node,
                offset: offset as u64,
                size: chunk.len() as u32,
                padding: 0,
            });
            req.payload = Payload::Bytes(Bytes::copy_from_slice(chunk));
            self.send(&mut req, "INODE_NOTIFY_STORE_CACHE")?;
            offset += chunk.len() as i64;
        }
        Ok(())
    }

    /// Fetch cached data of `node` starting at `offset` into `dest`.
    ///
    /// The range is requested in chunks of at most max-write bytes. Returns
    /// the number of bytes retrieved; stops at the first empty or failed
    /// chunk, and reports success if anything was retrieved at all.
    pub async fn inode_retrieve_cache(&self, node: u64, mut offset: i64, dest: &mut [u8]) -> Result<usize> {
        let max_chunk = (self.conn.opts().max_write_size() as usize).max(1);
        let mut total = 0;
        let mut status = Ok(());
        while total < dest.len() {
            let end = dest.len().min(total + max_chunk);
            match self.retrieve_chunk(node, offset, &mut dest[total..end]).await {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    offset += n as i64;
                }
                Err(errno) => {
                    status = Err(errno);
                    break;
                }
            }
        }
        if total > 0 {
            return Ok(total);
        }
        status.map(|()| 0)
    }

    async fn retrieve_chunk(&self, node: u64, offset: i64, dest: &mut [u8]) -> Result<usize> {
        if !self.supports(NotifyKind::RetrieveCache) {
            return Err(Errno::ENOSYS);
        }
        let size = dest.len().min(MAX_NOTIFY_CHUNK);
        let retrieves = self.conn.retrieves();
        let (id, done) = retrieves.insert(node, offset as u64, size);

        let mut req = Request::notify(OP_NOTIFY_RETRIEVE_CACHE, FUSE_NOTIFY_RETRIEVE);
        req.set_out(&NotifyRetrieveOut {
            notify_unique: id,
            nodeid: node,
            offset: offset as u64,
            size: size as u32,
            padding: 0,
        });
        if let Err(errno) = self.send(&mut req, "NOTIFY_RETRIEVE_CACHE") {
            retrieves.remove(id);
            return Err(errno);
        }

        match done.await {
            Ok(Ok(data)) => {
                let n = data.len().min(size);
                dest[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(Err(errno)) => Err(errno),
            Err(oneshot::Canceled) => Err(Errno::ENODEV),
        }
    }
}

fn nul_terminated(name: &OsStr) -> Bytes {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    Bytes::from(bytes)
}
