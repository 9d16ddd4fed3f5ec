use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::abi::{FUSE_INIT, InitIn};
use crate::buffer_pool::{FreeList, page_size};
use crate::connection::{Connection, MountState};
use crate::errno::{Errno, Result};
use crate::error::Error;
use crate::filesystem::{FileSystem, LatencyMap};
use crate::mount_options::MountOptions;
use crate::notify::Notifier;
use crate::opcode::operation_name;
use crate::poll_hack;
use crate::request::{Request, Status};
use crate::transport::{self, Transport};

/// Most reader loops blocked on the channel at once.
const MAX_READERS: usize = 2;

const UNMOUNT_TRIES: usize = 5;

/// Shared state behind a [`Server`].
pub(crate) struct ServerInner<F> {
    pub(crate) fs: F,
    pub(crate) conn: Arc<Connection>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    /// Reads currently blocked on the channel.
    readers: Mutex<usize>,
    /// Live reader loops.
    loops: watch::Sender<usize>,
    /// Darwin loses wakeups on unmount with concurrent readers.
    single_reader: bool,
    /// Held around every callback in single-threaded mode.
    pub(crate) fs_lock: tokio::sync::Mutex<()>,
    latencies: RwLock<Option<Arc<dyn LatencyMap>>>,
    ready: Mutex<Option<oneshot::Receiver<std::result::Result<(), Error>>>>,
    requests: FreeList<Box<Request>>,
    read_buffers: FreeList<Vec<u8>>,
}

/// A mounted filesystem served over a FUSE channel.
///
/// Created with [`Server::mount`], which performs the INIT exchange before
/// returning. Requests are processed once [`Server::serve`] runs.
pub struct Server<F: FileSystem> {
    inner: Arc<ServerInner<F>>,
}

impl<F: FileSystem> Clone for Server<F> {
    fn clone(&self) -> Self {
        Server {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: FileSystem> Server<F> {
    /// Mount `fs` at `mount_point` with the platform's default transport.
    pub async fn mount(fs: F, mount_point: impl AsRef<Path>, options: MountOptions) -> std::result::Result<Self, Error> {
        Self::mount_with_transport(fs, mount_point, options, transport::default_transport()).await
    }

    /// Mount through an explicit transport.
    pub async fn mount_with_transport(
        fs: F,
        mount_point: impl AsRef<Path>,
        mut options: MountOptions,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Self, Error> {
        options.normalize(&fs.name())?;
        let mount_point = absolute(mount_point.as_ref())?;

        let conn = Arc::new(Connection::new(
            mount_point.clone(),
            options.clone(),
            transport.supports_splice(),
        ));
        conn.set_state(MountState::Mounting);

        let mounted = {
            let transport = Arc::clone(&transport);
            let mount_point = mount_point.clone();
            tokio::task::spawn_blocking(move || transport.mount(&mount_point, &options))
                .await
                .map_err(|e| Error::Task(e.to_string()))??
        };
        conn.attach(mounted.channel);
        info!("mounted {} at {}", fs.name(), mount_point.display());

        let (loops, _) = watch::channel(0);
        let server = Server {
            inner: Arc::new(ServerInner {
                fs,
                conn,
                transport,
                runtime: Handle::current(),
                readers: Mutex::new(0),
                loops,
                single_reader: cfg!(target_os = "macos"),
                fs_lock: tokio::sync::Mutex::new(()),
                latencies: RwLock::new(None),
                ready: Mutex::new(Some(mounted.ready)),
                requests: FreeList::new(64),
                read_buffers: FreeList::new(MAX_READERS + 2),
            }),
        };

        if let Err(err) = server.inner.handle_init().await {
            server.inner.conn.close();
            server.inner.conn.set_state(MountState::Closed);
            return Err(err);
        }
        Ok(server)
    }

    /// Serve requests until the filesystem is unmounted.
    ///
    /// When every reader loop has exited the channel is closed and pending
    /// cache retrieves fail with ENODEV.
    pub async fn serve(&self) -> std::result::Result<(), Error> {
        let inner = &self.inner;
        inner.conn.set_state(MountState::Serving);
        ServerInner::spawn_loop(inner, false);

        let mut loops = inner.loops.subscribe();
        loops
            .wait_for(|n| *n == 0)
            .await
            .map_err(|e| Error::Task(e.to_string()))?;

        inner.conn.close();
        inner.conn.set_state(MountState::Closed);
        inner.conn.retrieves().shutdown();
        debug!("serve loop for {} finished", inner.conn.mount_point().display());
        Ok(())
    }

    /// Run [`serve`](Self::serve) in the background.
    pub fn spawn(&self) -> MountHandle<F> {
        let server = self.clone();
        let task = self.inner.runtime.spawn(async move { server.serve().await });
        MountHandle {
            server: self.clone(),
            task,
        }
    }

    /// Unmount, retrying while the kernel still sees open files, then wait
    /// for the reader loops to exit.
    pub async fn unmount(&self) -> std::result::Result<(), Error> {
        let conn = &self.inner.conn;
        let previous = conn.state();
        if matches!(previous, MountState::Unmounted | MountState::Closed) && conn.channel().is_err() {
            return Ok(());
        }
        conn.set_state(MountState::Draining);

        let mut delay = Duration::ZERO;
        let mut last_err = None;
        for _ in 0..UNMOUNT_TRIES {
            let transport = Arc::clone(&self.inner.transport);
            let mount_point = conn.mount_point().to_path_buf();
            let res = tokio::task::spawn_blocking(move || transport.unmount(&mount_point))
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
            match res {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("unmount {}: {err}", conn.mount_point().display());
                    last_err = Some(err);
                    delay = 2 * delay + Duration::from_millis(5);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        if let Some(err) = last_err {
            conn.set_state(previous);
            return Err(Error::Unmount {
                mount_point: conn.mount_point().to_path_buf(),
                reason: err.to_string(),
            });
        }

        if previous == MountState::Serving {
            let mut state = conn.watch_state();
            state
                .wait_for(|s| *s == MountState::Closed)
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
        } else {
            conn.close();
            conn.set_state(MountState::Closed);
            conn.retrieves().shutdown();
        }
        Ok(())
    }

    /// Wait for the mount helper to report success, then provoke the one
    /// POLL the kernel needs to see refused.
    pub async fn wait_mount(&self) -> std::result::Result<(), Error> {
        let ready = self
            .inner
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ready) = ready {
            match ready.await {
                Ok(res) => res?,
                Err(oneshot::Canceled) => return Err(Error::Task("mount helper vanished".into())),
            }
        }

        let transport = Arc::clone(&self.inner.transport);
        let mount_point = self.inner.conn.mount_point().to_path_buf();
        tokio::task::spawn_blocking(move || transport.poll_hack(&mount_point))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    /// The INIT message received from the kernel, with flags reduced to the
    /// capabilities we accepted.
    pub fn kernel_settings(&self) -> InitIn {
        self.inner.conn.kernel_settings()
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(Arc::clone(&self.inner.conn))
    }

    /// Record the duration of every request from now on; `None` stops.
    pub fn record_latencies(&self, latencies: Option<Arc<dyn LatencyMap>>) {
        *self
            .inner
            .latencies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = latencies;
    }

    /// Reader loops blocked on the channel and cache retrieves still
    /// waiting for the kernel.
    pub fn debug_data(&self) -> String {
        format!(
            "readers: {}, retrieves: {}",
            self.inner.readers(),
            self.inner.conn.retrieves().len()
        )
    }

    pub fn state(&self) -> MountState {
        self.inner.conn.state()
    }

    pub fn mount_point(&self) -> &Path {
        self.inner.conn.mount_point()
    }

    pub fn filesystem(&self) -> &F {
        &self.inner.fs
    }
}

impl<F: FileSystem> ServerInner<F> {
    fn readers(&self) -> usize {
        *self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_size(&self) -> usize {
        self.conn.opts().max_write_size() as usize + page_size()
    }

    fn spawn_loop(this: &Arc<Self>, exit_idle: bool) {
        this.loops.send_modify(|n| *n += 1);
        let inner = Arc::clone(this);
        this.runtime.spawn_blocking(move || {
            inner.reader_loop(exit_idle);
            inner.loops.send_modify(|n| *n -= 1);
        });
    }

    /// Blocking loop: read, then handle inline, or on a task when only one
    /// reader is allowed.
    fn reader_loop(self: &Arc<Self>, exit_idle: bool) {
        loop {
            let req = match self.read_request(exit_idle, true) {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(Errno::ENOENT) => continue,
                Err(Errno::ENODEV) => {
                    if self.conn.opts().is_debug() {
                        debug!("received ENODEV (unmount request), thread exiting");
                    }
                    break;
                }
                Err(errno) => {
                    error!("Failed to read from fuse conn: {errno}");
                    break;
                }
            };

            if self.single_reader {
                let inner = Arc::clone(self);
                self.runtime.spawn(async move {
                    let _ = inner.handle_request(req).await;
                });
            } else {
                let _ = self.runtime.block_on(self.handle_request(req));
            }
        }
        if exit_idle && self.conn.opts().is_debug() {
            debug!("idle reader loop exiting");
        }
    }

    /// Read one request. `Ok(None)` means an idle loop found enough readers
    /// already waiting and should exit.
    fn read_request(self: &Arc<Self>, exit_idle: bool, spawn_more: bool) -> Result<Option<Box<Request>>> {
        {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            if exit_idle && *readers > MAX_READERS {
                return Ok(None);
            }
            *readers += 1;
        }

        let mut req = self.requests.take().unwrap_or_else(|| Box::new(Request::new()));
        let mut dest = self
            .read_buffers
            .take()
            .unwrap_or_else(|| vec![0u8; self.read_size()]);

        let read = self.conn.channel().and_then(|ch| ch.read(&mut dest).map_err(Errno::from));
        let n = match read {
            Ok(0) => Err(Errno::ENODEV),
            other => other,
        };
        let n = match n {
            Ok(n) => n,
            Err(errno) => {
                self.requests.give(req);
                self.read_buffers.give(dest);
                *self.readers.lock().unwrap_or_else(PoisonError::into_inner) -= 1;
                return Err(errno);
            }
        };

        if self.latencies.read().unwrap_or_else(PoisonError::into_inner).is_some() {
            req.start = Some(Instant::now());
        }
        if let Some(buf) = req.set_input(dest, n) {
            self.read_buffers.give(buf);
        }

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        *readers -= 1;
        if spawn_more && !self.single_reader && *readers == 0 {
            ServerInner::spawn_loop(self, true);
        }
        Ok(Some(req))
    }

    /// The first request must be INIT. It is read without starting any
    /// reader loop, and the filesystem's `init` runs before anything else
    /// is read.
    async fn handle_init(self: &Arc<Self>) -> std::result::Result<(), Error> {
        let inner = Arc::clone(self);
        let mut req = tokio::task::spawn_blocking(move || inner.read_request(false, false))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
            .map_err(Error::Init)?
            .ok_or(Error::Init(Errno::EIO))?;

        if !req.parse() || req.opcode() != FUSE_INIT {
            warn!("expected INIT, got opcode {}", req.opcode());
            self.return_request(req);
            return Err(Error::Init(Errno::EIO));
        }
        self.process(req).await.map_err(Error::Init)?;

        let settings = self.conn.kernel_settings();
        info!(
            "kernel protocol {}.{}, flags {:?}",
            settings.major,
            settings.minor,
            settings.init_flags()
        );
        self.fs.init(Notifier::new(Arc::clone(&self.conn))).await;
        Ok(())
    }

    async fn handle_request(&self, mut req: Box<Request>) -> Result<()> {
        if !req.parse() {
            // Without a header there is no unique id to answer.
            self.return_request(req);
            return Err(Errno::EIO);
        }
        self.process(req).await
    }

    /// Dispatch a parsed request and write its reply. Returns the write
    /// error, or the request's own error status.
    async fn process(&self, mut req: Box<Request>) -> Result<()> {
        if req.status.is_ok() && self.conn.opts().is_debug() {
            debug!("{}", req.input_debug());
        }

        if !poll_hack::intercept(&mut req) && req.status.is_ok() {
            match req.handler.and_then(|h| h.op) {
                Some(op) => self.dispatch(op, &mut req).await,
                None => {
                    warn!("Unimplemented opcode {}", req.name());
                    req.status = Status::Err(Errno::ENOSYS);
                }
            }
        }

        let written = self.conn.write(&mut req);
        if let Err(errno) = written {
            error!(
                "writer: Write/Writev failed, err: {errno}. opcode: {}",
                operation_name(req.opcode())
            );
        }
        let status = req.status;
        self.return_request(req);

        written?;
        match status {
            Status::Err(errno) => Err(errno),
            _ => Ok(()),
        }
    }

    fn return_request(&self, mut req: Box<Request>) {
        if let Some(start) = req.start {
            if let Some(latencies) = self.latencies.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
                latencies.add(operation_name(req.opcode()), start.elapsed());
            }
        }
        if let Some(buf) = req.output_buf.take() {
            self.conn.buffers().free_buffer(buf);
        }
        req.finish_read();
        if let Some(buf) = req.take_input_buf() {
            self.read_buffers.give(buf);
        }
        req.clear();
        self.requests.give(req);
    }
}

/// A background [`Server::serve`] task.
///
/// Awaiting the handle waits for serving to end; [`MountHandle::unmount`]
/// ends it.
pub struct MountHandle<F: FileSystem> {
    server: Server<F>,
    task: JoinHandle<std::result::Result<(), Error>>,
}

impl<F: FileSystem> MountHandle<F> {
    pub fn server(&self) -> &Server<F> {
        &self.server
    }

    /// Unmount and wait for the serve task to finish.
    pub async fn unmount(self) -> std::result::Result<(), Error> {
        self.server.unmount().await?;
        self.task.await.map_err(|e| Error::Task(e.to_string()))?
    }
}

impl<F: FileSystem> Future for MountHandle<F> {
    type Output = std::result::Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task
            .poll_unpin(cx)
            .map(|res| res.map_err(|e| Error::Task(e.to_string())).and_then(|r| r))
    }
}

fn absolute(path: &Path) -> std::result::Result<PathBuf, Error> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
