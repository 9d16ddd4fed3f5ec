use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::errno::Errno;

/// Failures while establishing, running or tearing down a mount.
///
/// Per-request failures never surface here; they travel to the kernel as
/// [`Errno`] values.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("mount helper {0} not found")]
    HelperNotFound(String),

    #[error("{helper} exited with {status}: {stderr}")]
    HelperFailed {
        helper: String,
        status: String,
        stderr: String,
    },

    #[error("bad control message from mount helper: {0}")]
    BadControlMessage(String),

    #[error("invalid mount option: {0}")]
    InvalidOption(String),

    #[error("init: {0}")]
    Init(Errno),

    #[error("unmount {}: {reason}", mount_point.display())]
    Unmount { mount_point: PathBuf, reason: String },

    #[error("background task failed: {0}")]
    Task(String),
}
