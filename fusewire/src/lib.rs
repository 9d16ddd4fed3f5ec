//! A userspace FUSE protocol server.
//!
//! `fusewire` speaks the kernel side of the FUSE wire protocol: it mounts a
//! filesystem through the platform helper, negotiates INIT, reads requests
//! from the channel with a small pool of reader loops, dispatches them to a
//! [`FileSystem`] implementation and writes the replies back, splicing file
//! data into the channel where the kernel allows it. A [`Notifier`] lets the
//! filesystem invalidate, store or retrieve kernel cache contents.
//!
//! ```no_run
//! use fusewire::{FileSystem, MountOptions, Server};
//!
//! struct Empty;
//!
//! impl FileSystem for Empty {}
//!
//! # async fn run() -> Result<(), fusewire::Error> {
//! let mut options = MountOptions::default();
//! options.fs_name("empty");
//! let server = Server::mount(Empty, "/mnt/empty", options).await?;
//! let handle = server.spawn();
//! server.wait_mount().await?;
//! handle.await
//! # }
//! ```

pub mod abi;
mod buffer_pool;
mod connection;
mod dirent;
mod errno;
mod error;
mod filesystem;
mod mount_options;
mod notify;
mod opcode;
mod open_options;
mod ops;
mod poll_hack;
mod read_result;
mod request;
mod server;
#[cfg(target_os = "linux")]
mod splice;
pub mod transport;

pub use buffer_pool::{BufferPool, GcBufferPool, PageBufferPool, page_size};
pub use connection::MountState;
pub use dirent::{DirEntry, DirEntryList, LookupSlot, decode_dirents};
pub use errno::{Errno, Result};
pub use error::Error;
pub use filesystem::{FileSystem, LatencyMap};
pub use mount_options::MountOptions;
pub use notify::Notifier;
pub use open_options::OpenOptions;
pub use read_result::{ReadResult, ReadResultData, ReadResultFd, SpliceSource};
pub use server::{MountHandle, Server};
pub use transport::{Mounted, Transport, default_transport};
