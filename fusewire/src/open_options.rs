use bitflags::bitflags;

// Flags carried in `OpenOut::open_flags` of OPEN, OPENDIR and CREATE replies.
const FOPEN_DIRECT_IO: u32 = 1;
const FOPEN_KEEP_CACHE: u32 = 2;
const FOPEN_NONSEEKABLE: u32 = 4;
const FOPEN_CACHE_DIR: u32 = 8;
const FOPEN_STREAM: u32 = 16;
const FOPEN_NOFLUSH: u32 = 32;
const FOPEN_PARALLEL_DIRECT_WRITES: u32 = 64;
const FOPEN_PASSTHROUGH: u32 = 128;

bitflags! {
    /// Options the filesystem hands back to the kernel for an opened file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenOptions: u32 {
        /// Bypass page cache for this open file.
        const DIRECT_IO = FOPEN_DIRECT_IO;
        /// Don't invalidate the data cache on open.
        const KEEP_CACHE = FOPEN_KEEP_CACHE;
        /// The file is not seekable.
        const NONSEEKABLE = FOPEN_NONSEEKABLE;
        /// allow caching this directory
        const CACHE_DIR = FOPEN_CACHE_DIR;
        /// the file is stream-like (no file position at all)
        const STREAM = FOPEN_STREAM;
        /// No implicit FLUSH when the last handle is closed.
        const NOFLUSH = FOPEN_NOFLUSH;
        const PARALLEL_DIRECT_WRITES = FOPEN_PARALLEL_DIRECT_WRITES;
        const PASSTHROUGH = FOPEN_PASSTHROUGH;
    }
}

impl OpenOptions {
    /// Build the `OPEN`/`OPENDIR` reply body for handle `fh`.
    pub fn reply(self, fh: u64) -> crate::abi::OpenOut {
        crate::abi::OpenOut {
            fh,
            open_flags: self.bits(),
            padding: 0,
        }
    }
}
