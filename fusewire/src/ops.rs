//! Per-opcode glue between parsed requests and [`FileSystem`] callbacks.

use bytes::Bytes;
use tracing::warn;

use crate::abi::{
    self, AccessIn, BatchForgetIn, COMPAT_22_INIT_OUT_SIZE, CopyFileRangeIn, CreateIn,
    FUSE_GETXATTR, FallocateIn, FlushIn, ForgetIn, ForgetOne, FsyncIn, GetAttrIn, GetXAttrIn,
    GetXAttrOut, InitFlags, InitIn, InitOut, KERNEL_VERSION, LinkIn, LkIn, LseekIn,
    MINIMUM_MINOR_VERSION, MkdirIn, MknodIn, NotifyRetrieveIn, OUR_MINOR_VERSION, OpenIn, ReadIn,
    ReleaseIn, Rename2In, RenameIn, SetAttrIn, SetXAttrIn, WriteIn, WriteOut,
};
use crate::dirent::DirEntryList;
use crate::errno::{Errno, Result};
use crate::filesystem::FileSystem;
use crate::opcode::Operation;
use crate::request::{Payload, Request, Status};
use crate::server::ServerInner;

/// Attributes that are answered with ENODATA when security labels are
/// ignored.
const SECURITY_LABELS: [&str; 3] = [
    "security.capability",
    "system.posix_acl_access",
    "system.posix_acl_default",
];

/// Decode the fixed input or fail the request with the decode error.
macro_rules! input {
    ($req:expr) => {
        match $req.decode_in() {
            Ok(input) => input,
            Err(errno) => {
                $req.status = Status::Err(errno);
                return;
            }
        }
    };
}

impl<F: FileSystem> ServerInner<F> {
    pub(crate) async fn dispatch(&self, op: Operation, req: &mut Request) {
        let _guard = if self.conn.opts().single_threaded {
            Some(self.fs_lock.lock().await)
        } else {
            None
        };

        let header = req.in_header;
        match op {
            Operation::Init => self.do_init(req),
            Operation::Destroy => {
                self.fs.destroy().await;
                req.status = Status::Ok;
            }

            Operation::Lookup => {
                let res = self.fs.lookup(&header, req.filename(0)).await;
                req.reply(res);
            }
            Operation::Forget => {
                let input: ForgetIn = input!(req);
                if !self.conn.opts().remember_inodes {
                    self.fs.forget(header.nodeid, input.nlookup).await;
                }
            }
            Operation::BatchForget => self.do_batch_forget(req).await,
            Operation::GetAttr => {
                let input: GetAttrIn = input!(req);
                let res = self.fs.getattr(&header, &input).await;
                req.reply(res);
            }
            Operation::SetAttr => {
                let input: SetAttrIn = input!(req);
                let res = self.fs.setattr(&header, &input).await;
                req.reply(res);
            }
            Operation::Readlink => {
                let res = self.fs.readlink(&header).await;
                set_bytes(req, res);
            }
            Operation::Symlink => {
                // The link target comes second on the wire.
                let res = self.fs.symlink(&header, req.filename(1), req.filename(0)).await;
                req.reply(res);
            }
            Operation::Mknod => {
                let input: MknodIn = input!(req);
                let res = self.fs.mknod(&header, &input, req.filename(0)).await;
                req.reply(res);
            }
            Operation::Mkdir => {
                let input: MkdirIn = input!(req);
                let res = self.fs.mkdir(&header, &input, req.filename(0)).await;
                req.reply(res);
            }
            Operation::Unlink => {
                let res = self.fs.unlink(&header, req.filename(0)).await;
                req.set_status(res);
            }
            Operation::Rmdir => {
                let res = self.fs.rmdir(&header, req.filename(0)).await;
                req.set_status(res);
            }
            Operation::Rename => {
                let input: RenameIn = input!(req);
                let input = Rename2In {
                    newdir: input.newdir,
                    flags: 0,
                    padding: 0,
                };
                let res = self
                    .fs
                    .rename(&header, &input, req.filename(0), req.filename(1))
                    .await;
                req.set_status(res);
            }
            Operation::Rename2 => {
                let input: Rename2In = input!(req);
                let res = self
                    .fs
                    .rename(&header, &input, req.filename(0), req.filename(1))
                    .await;
                req.set_status(res);
            }
            Operation::Link => {
                let input: LinkIn = input!(req);
                let res = self.fs.link(&header, &input, req.filename(0)).await;
                req.reply(res);
            }
            Operation::Access => {
                let input: AccessIn = input!(req);
                let res = self.fs.access(&header, &input).await;
                req.set_status(res);
            }

            Operation::GetXAttr => self.do_getxattr(req).await,
            Operation::SetXAttr => {
                if self.conn.opts().disable_xattrs {
                    req.status = Status::Err(Errno::ENOSYS);
                    return;
                }
                let input: SetXAttrIn = input!(req);
                let res = self
                    .fs
                    .setxattr(&header, &input, req.filename(0), req.arg())
                    .await;
                req.set_status(res);
            }
            Operation::RemoveXAttr => {
                if self.conn.opts().disable_xattrs {
                    req.status = Status::Err(Errno::ENOSYS);
                    return;
                }
                let res = self.fs.removexattr(&header, req.filename(0)).await;
                req.set_status(res);
            }

            Operation::Create => {
                let input: CreateIn = input!(req);
                let res = self.fs.create(&header, &input, req.filename(0)).await;
                req.reply(res);
            }
            Operation::Open => {
                let input: OpenIn = input!(req);
                let res = self.fs.open(&header, &input).await;
                req.reply(res);
            }
            Operation::Read => {
                let input: ReadIn = input!(req);
                match self.fs.read(&header, &input).await {
                    Ok(result) => {
                        req.payload = Payload::Read {
                            result,
                            limit: input.size as usize,
                        };
                        req.status = Status::Ok;
                    }
                    Err(errno) => req.status = Status::Err(errno),
                }
            }
            Operation::Write => {
                let input: WriteIn = input!(req);
                let res = self
                    .fs
                    .write(&header, &input, req.arg())
                    .await
                    .map(|size| WriteOut { size, padding: 0 });
                req.reply(res);
            }
            Operation::Flush => {
                let input: FlushIn = input!(req);
                let res = self.fs.flush(&header, &input).await;
                req.set_status(res);
            }
            Operation::Release => {
                let input: ReleaseIn = input!(req);
                self.fs.release(&header, &input).await;
                req.status = Status::Ok;
            }
            Operation::Fsync => {
                let input: FsyncIn = input!(req);
                let res = self.fs.fsync(&header, &input).await;
                req.set_status(res);
            }
            Operation::Fallocate => {
                let input: FallocateIn = input!(req);
                let res = self.fs.fallocate(&header, &input).await;
                req.set_status(res);
            }
            Operation::Lseek => {
                let input: LseekIn = input!(req);
                let res = self.fs.lseek(&header, &input).await;
                req.reply(res);
            }
            Operation::CopyFileRange => {
                let input: CopyFileRangeIn = input!(req);
                let res = self.fs.copy_file_range(&header, &input).await;
                req.reply(res);
            }

            Operation::OpenDir => {
                let input: OpenIn = input!(req);
                let res = self.fs.opendir(&header, &input).await;
                req.reply(res);
            }
            Operation::ReadDir | Operation::ReadDirPlus => {
                self.do_readdir(req, op == Operation::ReadDirPlus).await
            }
            Operation::ReleaseDir => {
                let input: ReleaseIn = input!(req);
                self.fs.releasedir(&header, &input).await;
                req.status = Status::Ok;
            }
            Operation::FsyncDir => {
                let input: FsyncIn = input!(req);
                let res = self.fs.fsyncdir(&header, &input).await;
                req.set_status(res);
            }

            Operation::StatFs => {
                let res = self.fs.statfs(&header).await;
                // The macOS mount fails unless STATFS succeeds.
                #[cfg(target_os = "macos")]
                let res = match res {
                    Err(Errno::ENOSYS) => Ok(abi::StatfsOut::default()),
                    other => other,
                };
                req.reply(res);
            }
            Operation::GetLk => {
                let input: LkIn = input!(req);
                let res = self.fs.getlk(&header, &input).await;
                req.reply(res);
            }
            Operation::SetLk | Operation::SetLkW => {
                let input: LkIn = input!(req);
                let res = self.fs.setlk(&header, &input, op == Operation::SetLkW).await;
                req.set_status(res);
            }
            Operation::Ioctl => req.status = Status::Err(Errno::ENOSYS),

            Operation::NotifyReply => {
                let input: NotifyRetrieveIn = input!(req);
                let data = req.arg();
                let data = &data[..data.len().min(input.size as usize)];
                self.conn
                    .retrieves()
                    .complete(header.unique, header.nodeid, input.offset, data);
            }
        }
    }

    fn do_init(&self, req: &mut Request) {
        let input: InitIn = input!(req);
        if input.major != KERNEL_VERSION || input.minor < MINIMUM_MINOR_VERSION {
            warn!(
                "Minimum kernel protocol version is {}.{}, kernel offers {}.{}",
                KERNEL_VERSION, MINIMUM_MINOR_VERSION, input.major, input.minor
            );
            req.status = Status::Err(Errno::EIO);
            return;
        }

        let accepted = input.init_flags() & InitFlags::SUPPORTED;
        self.conn.set_kernel_settings(InitIn {
            flags: accepted.bits(),
            ..input
        });
        if input.minor >= 13 {
            self.conn.set_splice();
        }

        let opts = self.conn.opts();
        req.reply(Ok(InitOut {
            major: KERNEL_VERSION,
            minor: input.minor.min(OUR_MINOR_VERSION),
            max_readahead: input.max_readahead,
            flags: accepted.bits(),
            max_background: opts.max_background,
            congestion_threshold: (opts.max_background as u32 * 3 / 4) as u16,
            max_write: opts.max_write_size(),
            ..Default::default()
        }));
        if input.minor <= 22 {
            req.out_size = COMPAT_22_INIT_OUT_SIZE;
        }
    }

    async fn do_batch_forget(&self, req: &mut Request) {
        let input: BatchForgetIn = input!(req);
        let record = size_of::<ForgetOne>();
        let arg = req.arg();
        let wanted = input.count as usize * record;
        if arg.len() < wanted {
            warn!(
                "Too few bytes for batch forget. Got {} bytes, want {} ({} entries)",
                arg.len(),
                wanted,
                input.count
            );
        }
        if self.conn.opts().remember_inodes {
            return;
        }

        let forgets: Vec<ForgetOne> = arg[..arg.len().min(wanted)]
            .chunks_exact(record)
            .filter_map(|chunk| abi::decode(chunk).ok())
            .collect();
        for forget in forgets {
            self.fs.forget(forget.nodeid, forget.nlookup).await;
        }
    }

    /// GETXATTR and LISTXATTR. A zero size is a probe answered with the
    /// attribute length; otherwise the value itself is sent.
    async fn do_getxattr(&self, req: &mut Request) {
        if self.conn.opts().disable_xattrs {
            req.status = Status::Err(Errno::ENOSYS);
            return;
        }
        let header = req.in_header;
        let is_get = req.opcode() == FUSE_GETXATTR;
        if is_get
            && self.conn.opts().ignore_security_labels
            && SECURITY_LABELS.iter().any(|label| req.filename(0) == *label)
        {
            req.status = Status::Err(Errno::ENODATA);
            return;
        }

        let input: GetXAttrIn = input!(req);
        if input.size == 0 {
            let res = if is_get {
                self.fs.getxattr_size(&header, req.filename(0)).await
            } else {
                self.fs.listxattr(&header).await.map(|names| names.len())
            };
            req.reply(res.map(|size| GetXAttrOut {
                size: size as u32,
                padding: 0,
            }));
            return;
        }

        let res = if is_get {
            self.fs.getxattr(&header, req.filename(0)).await
        } else {
            self.fs.listxattr(&header).await
        };
        match res {
            Ok(value) if value.len() > input.size as usize => req.status = Status::Err(Errno::ERANGE),
            res => set_bytes(req, res),
        }
    }

    async fn do_readdir(&self, req: &mut Request, plus: bool) {
        let input: ReadIn = input!(req);
        let header = req.in_header;
        let size = input.size as usize;

        let buffers = self.conn.buffers();
        let buf = match req.output_buf.take() {
            Some(mut buf) if buf.capacity() >= size => {
                buf.resize(size, 0);
                buf
            }
            Some(small) => {
                buffers.free_buffer(small);
                buffers.alloc_buffer(size)
            }
            None => buffers.alloc_buffer(size),
        };

        let mut list = DirEntryList::new(buf, input.offset);
        let res = if plus {
            self.fs.readdirplus(&header, &input, &mut list).await
        } else {
            self.fs.readdir(&header, &input, &mut list).await
        };
        let (buf, len) = list.into_buffer();
        req.output_buf = Some(buf);
        req.set_status(res);
        if req.status.is_ok() {
            req.payload = Payload::Output(len);
        }
    }
}

fn set_bytes(req: &mut Request, res: Result<Bytes>) {
    match res {
        Ok(bytes) => {
            req.payload = Payload::Bytes(bytes);
            req.status = Status::Ok;
        }
        Err(errno) => req.status = Status::Err(errno),
    }
}
