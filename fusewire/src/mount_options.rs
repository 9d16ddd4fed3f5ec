use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use serde::Deserialize;

use crate::abi::{DEFAULT_BACKGROUND_TASKS, DEFAULT_MAX_WRITE, MAX_KERNEL_WRITE};
use crate::buffer_pool::{BufferPool, PageBufferPool};
use crate::error::Error;

const MAX_NAME_LEN: usize = 20;

/// Mount configuration.
///
/// Setters take `&mut self` so options can be chained on a default value;
/// the struct can also be deserialized from a config file.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub(crate) allow_other: bool,
    pub(crate) options: Vec<String>,
    pub(crate) fs_name: String,
    pub(crate) name: String,
    pub(crate) max_write: u32,
    pub(crate) max_background: u16,
    pub(crate) debug: bool,
    pub(crate) single_threaded: bool,
    pub(crate) remember_inodes: bool,
    pub(crate) disable_xattrs: bool,
    pub(crate) ignore_security_labels: bool,
    #[serde(skip)]
    pub(crate) buffer_pool: Option<Arc<dyn BufferPool>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            options: Vec::new(),
            fs_name: String::new(),
            name: String::new(),
            max_write: 0,
            max_background: DEFAULT_BACKGROUND_TASKS,
            debug: false,
            single_threaded: false,
            remember_inodes: false,
            disable_xattrs: false,
            ignore_security_labels: false,
            buffer_pool: None,
        }
    }
}

impl Debug for MountOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("allow_other", &self.allow_other)
            .field("options", &self.options)
            .field("fs_name", &self.fs_name)
            .field("name", &self.name)
            .field("max_write", &self.max_write)
            .field("max_background", &self.max_background)
            .field("debug", &self.debug)
            .field("single_threaded", &self.single_threaded)
            .field("remember_inodes", &self.remember_inodes)
            .field("disable_xattrs", &self.disable_xattrs)
            .field("ignore_security_labels", &self.ignore_security_labels)
            .field("buffer_pool", &self.buffer_pool.is_some())
            .finish()
    }
}

impl MountOptions {
    /// Let users other than the mounting user access the filesystem.
    pub fn allow_other(&mut self, allow_other: bool) -> &mut Self {
        self.allow_other = allow_other;
        self
    }

    /// Add a raw `-o` option passed through to the mount helper.
    pub fn option(&mut self, option: impl Into<String>) -> &mut Self {
        self.options.push(option.into());
        self
    }

    /// Source name shown in `/proc/mounts`.
    pub fn fs_name(&mut self, fs_name: impl Into<String>) -> &mut Self {
        self.fs_name = fs_name.into();
        self
    }

    /// Filesystem subtype. Defaults to the filesystem's own name.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Largest WRITE the kernel may send. 0 selects the default; larger
    /// values are clamped to the kernel cap.
    pub fn max_write(&mut self, max_write: u32) -> &mut Self {
        self.max_write = max_write;
        self
    }

    pub fn max_background(&mut self, max_background: u16) -> &mut Self {
        self.max_background = max_background;
        self
    }

    /// Log every request and reply at debug level.
    pub fn debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    /// Run at most one filesystem callback at a time.
    pub fn single_threaded(&mut self, single_threaded: bool) -> &mut Self {
        self.single_threaded = single_threaded;
        self
    }

    /// Swallow FORGET requests instead of passing them to the filesystem.
    pub fn remember_inodes(&mut self, remember_inodes: bool) -> &mut Self {
        self.remember_inodes = remember_inodes;
        self
    }

    pub fn disable_xattrs(&mut self, disable_xattrs: bool) -> &mut Self {
        self.disable_xattrs = disable_xattrs;
        self
    }

    /// Answer ENODATA for capability and ACL attributes without asking the
    /// filesystem.
    pub fn ignore_security_labels(&mut self, ignore: bool) -> &mut Self {
        self.ignore_security_labels = ignore;
        self
    }

    pub fn buffer_pool(&mut self, pool: Arc<dyn BufferPool>) -> &mut Self {
        self.buffer_pool = Some(pool);
        self
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Negotiated maximum write size, valid after normalization.
    pub fn max_write_size(&self) -> u32 {
        self.max_write
    }

    /// Fill in defaults and validate, using `fs_name` for an empty subtype.
    pub(crate) fn normalize(&mut self, fs_name: &str) -> Result<(), Error> {
        if self.max_write == 0 {
            self.max_write = DEFAULT_MAX_WRITE;
        }
        self.max_write = self.max_write.min(MAX_KERNEL_WRITE);
        if self.max_background == 0 {
            self.max_background = DEFAULT_BACKGROUND_TASKS;
        }

        if self.name.is_empty() {
            let mut end = fs_name.len().min(MAX_NAME_LEN);
            while !fs_name.is_char_boundary(end) {
                end -= 1;
            }
            self.name = fs_name[..end].replace(',', ";");
        }

        if let Some(bad) = self.options_strings().into_iter().find(|s| s.contains(',')) {
            return Err(Error::InvalidOption(format!("found ',' in option string {bad:?}")));
        }

        if self.buffer_pool.is_none() {
            self.buffer_pool = Some(Arc::new(PageBufferPool::new()));
        }
        Ok(())
    }

    /// Options handed to the mount helper, one per `-o` entry.
    pub fn options_strings(&self) -> Vec<String> {
        let mut opts = self.options.clone();
        if self.allow_other {
            opts.push("allow_other".to_string());
        }
        if !self.fs_name.is_empty() {
            opts.push(format!("fsname={}", self.fs_name));
        }
        if !self.name.is_empty() {
            opts.push(format!("subtype={}", self.name));
        }
        opts
    }

    pub(crate) fn buffers(&self) -> Arc<dyn BufferPool> {
        match &self.buffer_pool {
            Some(pool) => Arc::clone(pool),
            None => Arc::new(PageBufferPool::new()),
        }
    }
}
