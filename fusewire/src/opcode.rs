//! Static, opcode-indexed handler table.

use std::mem::size_of;
use std::sync::LazyLock;

use crate::abi::*;

/// Which dispatch routine serves an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Lookup,
    Forget,
    GetAttr,
    SetAttr,
    Readlink,
    Symlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Rename2,
    Link,
    Open,
    Read,
    Write,
    StatFs,
    Release,
    Fsync,
    SetXAttr,
    GetXAttr,
    RemoveXAttr,
    Flush,
    Init,
    OpenDir,
    ReadDir,
    ReleaseDir,
    FsyncDir,
    GetLk,
    SetLk,
    SetLkW,
    Access,
    Create,
    Destroy,
    Ioctl,
    NotifyReply,
    BatchForget,
    Fallocate,
    ReadDirPlus,
    Lseek,
    CopyFileRange,
}

/// Contract for one opcode: its fixed input and output sizes, how many
/// NUL-terminated names trail the input, and the routine bound to it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperationHandler {
    pub name: &'static str,
    pub op: Option<Operation>,
    pub input_size: usize,
    pub output_size: usize,
    pub file_names: usize,
}

const fn entry(name: &'static str) -> OperationHandler {
    OperationHandler {
        name,
        op: None,
        input_size: 0,
        output_size: 0,
        file_names: 0,
    }
}

/// Largest structured output of any handler.
pub(crate) const MAX_OUTPUT_SIZE: usize = 160;

static HANDLERS: LazyLock<Vec<Option<OperationHandler>>> = LazyLock::new(build_table);

fn build_table() -> Vec<Option<OperationHandler>> {
    use Operation::*;

    let mut table = vec![None; OPCODE_COUNT as usize];
    let mut set = |opcode: u32,
                   name: &'static str,
                   op: Option<Operation>,
                   input_size: usize,
                   output_size: usize,
                   file_names: usize| {
        table[opcode as usize] = Some(OperationHandler {
            op,
            input_size,
            output_size,
            file_names,
            ..entry(name)
        });
    };

    set(FUSE_LOOKUP, "LOOKUP", Some(Lookup), 0, size_of::<EntryOut>(), 1);
    set(FUSE_FORGET, "FORGET", Some(Forget), size_of::<ForgetIn>(), 0, 0);
    set(FUSE_GETATTR, "GETATTR", Some(GetAttr), size_of::<GetAttrIn>(), size_of::<AttrOut>(), 0);
    set(FUSE_SETATTR, "SETATTR", Some(SetAttr), size_of::<SetAttrIn>(), size_of::<AttrOut>(), 0);
    set(FUSE_READLINK, "READLINK", Some(Readlink), 0, 0, 0);
    set(FUSE_SYMLINK, "SYMLINK", Some(Symlink), 0, size_of::<EntryOut>(), 2);
    set(FUSE_MKNOD, "MKNOD", Some(Mknod), size_of::<MknodIn>(), size_of::<EntryOut>(), 1);
    set(FUSE_MKDIR, "MKDIR", Some(Mkdir), size_of::<MkdirIn>(), size_of::<EntryOut>(), 1);
    set(FUSE_UNLINK, "UNLINK", Some(Unlink), 0, 0, 1);
    set(FUSE_RMDIR, "RMDIR", Some(Rmdir), 0, 0, 1);
    set(FUSE_RENAME, "RENAME", Some(Rename), size_of::<RenameIn>(), 0, 2);
    set(FUSE_LINK, "LINK", Some(Link), size_of::<LinkIn>(), size_of::<EntryOut>(), 1);
    set(FUSE_OPEN, "OPEN", Some(Open), size_of::<OpenIn>(), size_of::<OpenOut>(), 0);
    set(FUSE_READ, "READ", Some(Read), size_of::<ReadIn>(), 0, 0);
    set(FUSE_WRITE, "WRITE", Some(Write), size_of::<WriteIn>(), size_of::<WriteOut>(), 0);
    set(FUSE_STATFS, "STATFS", Some(StatFs), 0, size_of::<StatfsOut>(), 0);
    set(FUSE_RELEASE, "RELEASE", Some(Release), size_of::<ReleaseIn>(), 0, 0);
    set(FUSE_FSYNC, "FSYNC", Some(Fsync), size_of::<FsyncIn>(), 0, 0);
    // Name NUL value: only the name is split off, the value stays in the argument.
    set(FUSE_SETXATTR, "SETXATTR", Some(SetXAttr), size_of::<SetXAttrIn>(), 0, 1);
    set(FUSE_GETXATTR, "GETXATTR", Some(GetXAttr), size_of::<GetXAttrIn>(), size_of::<GetXAttrOut>(), 1);
    set(FUSE_LISTXATTR, "LISTXATTR", Some(GetXAttr), size_of::<GetXAttrIn>(), size_of::<GetXAttrOut>(), 0);
    set(FUSE_REMOVEXATTR, "REMOVEXATTR", Some(RemoveXAttr), 0, 0, 1);
    set(FUSE_FLUSH, "FLUSH", Some(Flush), size_of::<FlushIn>(), 0, 0);
    set(FUSE_INIT, "INIT", Some(Init), size_of::<InitIn>(), size_of::<InitOut>(), 0);
    set(FUSE_OPENDIR, "OPENDIR", Some(OpenDir), size_of::<OpenIn>(), size_of::<OpenOut>(), 0);
    set(FUSE_READDIR, "READDIR", Some(ReadDir), size_of::<ReadIn>(), 0, 0);
    set(FUSE_RELEASEDIR, "RELEASEDIR", Some(ReleaseDir), size_of::<ReleaseIn>(), 0, 0);
    set(FUSE_FSYNCDIR, "FSYNCDIR", Some(FsyncDir), size_of::<FsyncIn>(), 0, 0);
    set(FUSE_GETLK, "GETLK", Some(GetLk), size_of::<LkIn>(), size_of::<LkOut>(), 0);
    set(FUSE_SETLK, "SETLK", Some(SetLk), size_of::<LkIn>(), 0, 0);
    set(FUSE_SETLKW, "SETLKW", Some(SetLkW), size_of::<LkIn>(), 0, 0);
    set(FUSE_ACCESS, "ACCESS", Some(Access), size_of::<AccessIn>(), 0, 0);
    set(FUSE_CREATE, "CREATE", Some(Create), size_of::<CreateIn>(), size_of::<CreateOut>(), 1);
    set(FUSE_INTERRUPT, "INTERRUPT", None, size_of::<InterruptIn>(), 0, 0);
    set(FUSE_BMAP, "BMAP", None, size_of::<BmapIn>(), size_of::<BmapOut>(), 0);
    set(FUSE_DESTROY, "DESTROY", Some(Destroy), 0, 0, 0);
    set(FUSE_IOCTL, "IOCTL", Some(Ioctl), size_of::<IoctlIn>(), size_of::<IoctlOut>(), 0);
    set(FUSE_POLL, "POLL", None, size_of::<PollIn>(), size_of::<PollOut>(), 0);
    set(FUSE_NOTIFY_REPLY, "NOTIFY_REPLY", Some(NotifyReply), size_of::<NotifyRetrieveIn>(), 0, 0);
    set(FUSE_BATCH_FORGET, "BATCH_FORGET", Some(BatchForget), size_of::<BatchForgetIn>(), 0, 0);
    set(FUSE_FALLOCATE, "FALLOCATE", Some(Fallocate), size_of::<FallocateIn>(), 0, 0);
    set(FUSE_READDIRPLUS, "READDIRPLUS", Some(ReadDirPlus), size_of::<ReadIn>(), 0, 0);
    set(FUSE_RENAME2, "RENAME2", Some(Rename2), size_of::<Rename2In>(), 0, 2);
    set(FUSE_LSEEK, "LSEEK", Some(Lseek), size_of::<LseekIn>(), size_of::<LseekOut>(), 0);
    set(FUSE_COPY_FILE_RANGE, "COPY_FILE_RANGE", Some(CopyFileRange), size_of::<CopyFileRangeIn>(), size_of::<WriteOut>(), 0);

    set(OP_NOTIFY_INVAL_ENTRY, "NOTIFY_INVAL_ENTRY", None, 0, size_of::<NotifyInvalEntryOut>(), 0);
    set(OP_NOTIFY_INVAL_INODE, "NOTIFY_INVAL_INODE", None, 0, size_of::<NotifyInvalInodeOut>(), 0);
    set(OP_NOTIFY_DELETE, "NOTIFY_DELETE", None, 0, size_of::<NotifyInvalDeleteOut>(), 0);
    set(OP_NOTIFY_STORE_CACHE, "NOTIFY_STORE_CACHE", None, 0, size_of::<NotifyStoreOut>(), 0);
    set(OP_NOTIFY_RETRIEVE_CACHE, "NOTIFY_RETRIEVE_CACHE", None, 0, size_of::<NotifyRetrieveOut>(), 0);

    table
}

/// Look up the handler for `opcode`; `None` for opcodes we do not know.
pub(crate) fn handler(opcode: u32) -> Option<&'static OperationHandler> {
    HANDLERS.get(opcode as usize)?.as_ref()
}

pub(crate) fn operation_name(opcode: u32) -> &'static str {
    handler(opcode).map_or("UNKNOWN", |h| h.name)
}
