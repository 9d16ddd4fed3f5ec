mod common;

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fusewire::abi::{
    self, Attr, AttrOut, BatchForgetIn, EntryOut, FUSE_BATCH_FORGET, FUSE_DESTROY, FUSE_FORGET,
    FUSE_GETATTR, FUSE_GETXATTR, FUSE_INTERRUPT, FUSE_LOOKUP, FUSE_POLL, FUSE_READ,
    FUSE_READDIR, ForgetIn, ForgetOne, GetAttrIn, GetXAttrIn, GetXAttrOut, InHeader, InitFlags,
    InitOut, InterruptIn, PollIn, ROOT_ID, ReadIn,
};
use fusewire::{
    DirEntryList, Errno, Error, FileSystem, LatencyMap, MountOptions, MountState, ReadResult,
    ReadResultData, Result, Server, decode_dirents,
};

use common::{FakeKernel, PairTransport, Reply, eventually, init_tracing, with_names};

const CONTENT: &[u8] = b"hello, world\n";
const HELLO_INO: u64 = 2;
/// GETATTR on this inode waits until the test opens `TestFs::gate`.
const BLOCKED_INO: u64 = 9;

#[derive(Default)]
struct TestFs {
    lookups: AtomicUsize,
    reads: AtomicUsize,
    forgotten: AtomicU64,
    destroyed: AtomicBool,
    gate: tokio::sync::Notify,
}

fn attr(ino: u64) -> Attr {
    if ino == ROOT_ID {
        Attr {
            ino,
            mode: libc::S_IFDIR as u32 | 0o755,
            nlink: 2,
            ..Default::default()
        }
    } else {
        Attr {
            ino,
            size: CONTENT.len() as u64,
            mode: libc::S_IFREG as u32 | 0o644,
            nlink: 1,
            ..Default::default()
        }
    }
}

#[async_trait]
impl FileSystem for TestFs {
    fn name(&self) -> String {
        "testfs".to_string()
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    async fn lookup(&self, header: &InHeader, name: &OsStr) -> Result<EntryOut> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if header.nodeid != ROOT_ID || name != "hello" {
            return Err(Errno::ENOENT);
        }
        Ok(EntryOut {
            nodeid: HELLO_INO,
            attr: attr(HELLO_INO),
            entry_valid: 1,
            attr_valid: 1,
            ..Default::default()
        })
    }

    async fn forget(&self, _nodeid: u64, nlookup: u64) {
        self.forgotten.fetch_add(nlookup, Ordering::SeqCst);
    }

    async fn getattr(&self, header: &InHeader, _input: &GetAttrIn) -> Result<AttrOut> {
        if header.nodeid == BLOCKED_INO {
            self.gate.notified().await;
        }
        Ok(AttrOut {
            attr_valid: 1,
            attr: attr(header.nodeid),
            ..Default::default()
        })
    }

    async fn getxattr(&self, _header: &InHeader, name: &OsStr) -> Result<Bytes> {
        if name == "user.color" {
            Ok(Bytes::from_static(b"green"))
        } else if name == "security.capability" {
            Ok(Bytes::from_static(b"cap"))
        } else {
            Err(Errno::ENODATA)
        }
    }

    async fn read(&self, _header: &InHeader, input: &ReadIn) -> Result<Box<dyn ReadResult>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let start = (input.offset as usize).min(CONTENT.len());
        Ok(Box::new(ReadResultData::from(Bytes::from_static(&CONTENT[start..]))))
    }

    async fn readdir(&self, _header: &InHeader, input: &ReadIn, out: &mut DirEntryList) -> Result<()> {
        let entries = [
            (".", ROOT_ID, libc::S_IFDIR as u32),
            ("..", ROOT_ID, libc::S_IFDIR as u32),
            ("hello", HELLO_INO, libc::S_IFREG as u32),
        ];
        for (name, ino, mode) in entries.iter().skip(input.offset as usize) {
            if !out.add(OsStr::new(name), *ino, *mode) {
                break;
            }
        }
        Ok(())
    }
}

struct Mounted {
    server: Server<TestFs>,
    transport: Arc<PairTransport>,
    kernel: FakeKernel,
    init: Reply,
}

async fn mount(minor: u32, options: MountOptions) -> Mounted {
    init_tracing();
    let (transport, kernel) = PairTransport::new();
    kernel.send_init(
        minor,
        InitFlags::ASYNC_READ | InitFlags::POSIX_LOCKS | InitFlags::READDIRPLUS,
    );
    let server = Server::mount_with_transport(TestFs::default(), "/mnt/test", options, transport.clone())
        .await
        .unwrap();
    let init = kernel.recv();
    Mounted {
        server,
        transport,
        kernel,
        init,
    }
}

fn expect_error(reply: &Reply, errno: Errno) {
    assert_eq!(reply.header.error, -errno.raw(), "reply: {reply:?}");
    assert!(reply.body.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn init_negotiates_version_and_flags() {
    let m = mount(28, MountOptions::default()).await;
    assert_eq!(m.init.header.error, 0);
    assert_eq!(m.init.body.len(), size_of::<InitOut>());

    let out: InitOut = m.init.decode();
    assert_eq!(out.major, 7);
    assert_eq!(out.minor, 28);
    assert_eq!(out.max_readahead, 128 * 1024);
    assert_eq!(
        InitFlags::from_bits_truncate(out.flags),
        InitFlags::ASYNC_READ | InitFlags::READDIRPLUS
    );
    assert_eq!(out.max_write, 64 * 1024);
    assert_eq!(out.max_background, 12);
    assert_eq!(out.congestion_threshold, 9);
    // Zero leaves the kernel's default timestamp granularity alone.
    assert_eq!(out.time_gran, 0);

    let settings = m.server.kernel_settings();
    assert_eq!(settings.minor, 28);
    assert!(!settings.init_flags().contains(InitFlags::POSIX_LOCKS));
    assert_eq!(m.server.state(), MountState::Mounting);

    m.server.unmount().await.unwrap();
    assert_eq!(m.server.state(), MountState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn old_kernels_get_the_short_init_reply() {
    let m = mount(22, MountOptions::default()).await;
    assert_eq!(m.init.header.error, 0);
    assert_eq!(m.init.body.len(), abi::COMPAT_22_INIT_OUT_SIZE);
    assert_eq!(m.server.kernel_settings().minor, 22);
    m.server.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_kernel_fails_the_mount() {
    init_tracing();
    let (transport, kernel) = PairTransport::new();
    kernel.send_init(12, InitFlags::empty());
    let res = Server::mount_with_transport(TestFs::default(), "/mnt/test", MountOptions::default(), transport).await;
    assert!(matches!(res, Err(Error::Init(errno)) if errno == Errno::EIO));
    expect_error(&kernel.recv(), Errno::EIO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_request_must_be_init() {
    init_tracing();
    let (transport, kernel) = PairTransport::new();
    kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    let res = Server::mount_with_transport(TestFs::default(), "/mnt/test", MountOptions::default(), transport).await;
    assert!(matches!(res, Err(Error::Init(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn comma_in_option_is_rejected_before_mounting() {
    init_tracing();
    let (transport, _kernel) = PairTransport::new();
    let mut options = MountOptions::default();
    options.option("ro,nosuid");
    let res = Server::mount_with_transport(TestFs::default(), "/mnt/test", options, transport.clone()).await;
    assert!(matches!(res, Err(Error::InvalidOption(_))));
    assert_eq!(transport.mount_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lookup_and_getattr_round_trip() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let unique = m.kernel.send(FUSE_LOOKUP, ROOT_ID, &with_names::<()>(None, &["hello"]));
    let reply = m.kernel.recv();
    assert_eq!(reply.header.unique, unique);
    assert_eq!(reply.header.error, 0);
    let entry: EntryOut = reply.decode();
    assert_eq!(entry.nodeid, HELLO_INO);
    assert_eq!(entry.attr.size, CONTENT.len() as u64);

    m.kernel.send(FUSE_LOOKUP, ROOT_ID, &with_names::<()>(None, &["missing"]));
    expect_error(&m.kernel.recv(), Errno::ENOENT);

    m.kernel.send(FUSE_GETATTR, HELLO_INO, &abi::encode(&GetAttrIn::default()));
    let out: AttrOut = m.kernel.recv().decode();
    assert_eq!(out.attr.ino, HELLO_INO);

    assert!(eventually(|| m.server.state() == MountState::Serving).await);
    handle.unmount().await.unwrap();
    assert_eq!(m.server.state(), MountState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_unbound_opcodes_are_enosys() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let unique = m.kernel.send(99, ROOT_ID, &[]);
    let reply = m.kernel.recv();
    assert_eq!(reply.header.unique, unique);
    expect_error(&reply, Errno::ENOSYS);

    m.kernel.send(FUSE_INTERRUPT, ROOT_ID, &abi::encode(&InterruptIn { unique: 1 }));
    expect_error(&m.kernel.recv(), Errno::ENOSYS);

    m.kernel.send(FUSE_POLL, HELLO_INO, &abi::encode(&PollIn::default()));
    expect_error(&m.kernel.recv(), Errno::ENOSYS);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_fixed_input_never_reaches_the_filesystem() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let unique = m.kernel.send(FUSE_READ, HELLO_INO, &[0u8; 10]);
    let reply = m.kernel.recv();
    assert_eq!(reply.header.unique, unique);
    expect_error(&reply, Errno::EIO);
    assert_eq!(m.server.filesystem().reads.load(Ordering::SeqCst), 0);

    // A message too short for a header cannot be answered; the next one is.
    m.kernel.send_raw(&[0u8; 12]);
    m.kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    assert_eq!(m.kernel.recv().header.error, 0);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_reply_is_capped_at_requested_size() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let input = ReadIn {
        fh: 1,
        offset: 7,
        size: 4,
        ..Default::default()
    };
    m.kernel.send(FUSE_READ, HELLO_INO, &abi::encode(&input));
    let reply = m.kernel.recv();
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.body, b"worl");
    assert_eq!(m.server.filesystem().reads.load(Ordering::SeqCst), 1);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readdir_fills_the_requested_size() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let input = ReadIn {
        size: 4096,
        ..Default::default()
    };
    m.kernel.send(FUSE_READDIR, ROOT_ID, &abi::encode(&input));
    let reply = m.kernel.recv();
    let entries = decode_dirents(&reply.body).unwrap();
    let names: Vec<_> = entries.iter().map(|(_, name)| name.clone()).collect();
    assert_eq!(names, [".", "..", "hello"]);
    assert_eq!(entries[2].0.off, 3);
    assert_eq!(entries[2].0.typ, libc::DT_REG as u32);

    // Room for a single entry only; the listing resumes from its offset.
    let input = ReadIn {
        size: 40,
        offset: 1,
        ..Default::default()
    };
    m.kernel.send(FUSE_READDIR, ROOT_ID, &abi::encode(&input));
    let entries = decode_dirents(&m.kernel.recv().body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, "..");
    assert_eq!(entries[0].0.off, 2);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forgets_are_forwarded_without_reply() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    m.kernel.send(FUSE_FORGET, HELLO_INO, &abi::encode(&ForgetIn { nlookup: 3 }));
    let mut batch = abi::encode(&BatchForgetIn { count: 2, dummy: 0 });
    batch.extend(abi::encode(&ForgetOne { nodeid: 5, nlookup: 4 }));
    batch.extend(abi::encode(&ForgetOne { nodeid: 6, nlookup: 1 }));
    m.kernel.send(FUSE_BATCH_FORGET, 0, &batch);

    let unique = m.kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    assert_eq!(m.kernel.recv().header.unique, unique);
    assert!(eventually(|| m.server.filesystem().forgotten.load(Ordering::SeqCst) == 8).await);
    assert!(m.kernel.try_recv(Duration::from_millis(100)).is_none());

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remember_inodes_swallows_forgets() {
    let mut options = MountOptions::default();
    options.remember_inodes(true);
    let m = mount(28, options).await;
    let handle = m.server.spawn();

    m.kernel.send(FUSE_FORGET, HELLO_INO, &abi::encode(&ForgetIn { nlookup: 3 }));
    let unique = m.kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    assert_eq!(m.kernel.recv().header.unique, unique);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.server.filesystem().forgotten.load(Ordering::SeqCst), 0);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn getxattr_probe_and_range_check() {
    let mut options = MountOptions::default();
    options.ignore_security_labels(true);
    let m = mount(28, options).await;
    let handle = m.server.spawn();

    let probe = with_names(Some(&GetXAttrIn { size: 0, padding: 0 }), &["user.color"]);
    m.kernel.send(FUSE_GETXATTR, HELLO_INO, &probe);
    let out: GetXAttrOut = m.kernel.recv().decode();
    assert_eq!(out.size, 5);

    let small = with_names(Some(&GetXAttrIn { size: 2, padding: 0 }), &["user.color"]);
    m.kernel.send(FUSE_GETXATTR, HELLO_INO, &small);
    expect_error(&m.kernel.recv(), Errno::ERANGE);

    let full = with_names(Some(&GetXAttrIn { size: 64, padding: 0 }), &["user.color"]);
    m.kernel.send(FUSE_GETXATTR, HELLO_INO, &full);
    let reply = m.kernel.recv();
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.body, b"green");

    let label = with_names(Some(&GetXAttrIn { size: 64, padding: 0 }), &["security.capability"]);
    m.kernel.send(FUSE_GETXATTR, HELLO_INO, &label);
    expect_error(&m.kernel.recv(), Errno::ENODATA);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserved_poll_probe_is_intercepted() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    m.kernel.send(FUSE_LOOKUP, ROOT_ID, &with_names::<()>(None, &[".fusewire-epoll-hack"]));
    expect_error(&m.kernel.recv(), Errno::ENOENT);
    assert_eq!(m.server.filesystem().lookups.load(Ordering::SeqCst), 0);

    m.kernel.send(FUSE_GETATTR, u64::MAX, &abi::encode(&GetAttrIn::default()));
    expect_error(&m.kernel.recv(), Errno::EIO);

    m.kernel.send(FUSE_POLL, u64::MAX, &abi::encode(&PollIn::default()));
    expect_error(&m.kernel.recv(), Errno::ENOSYS);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_is_acknowledged() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    m.kernel.send(FUSE_DESTROY, 0, &[]);
    assert_eq!(m.kernel.recv().header.error, 0);
    assert!(m.server.filesystem().destroyed.load(Ordering::SeqCst));

    handle.unmount().await.unwrap();
}

#[derive(Default)]
struct Recorded(Mutex<Vec<String>>);

impl LatencyMap for Recorded {
    fn add(&self, name: &str, _elapsed: Duration) {
        self.0.lock().unwrap().push(name.to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn latencies_are_recorded_per_operation() {
    let m = mount(28, MountOptions::default()).await;
    let recorded = Arc::new(Recorded::default());
    m.server.record_latencies(Some(recorded.clone()));
    let handle = m.server.spawn();

    m.kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    m.kernel.recv();
    assert!(eventually(|| recorded.0.lock().unwrap().iter().any(|n| n == "GETATTR")).await);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmount_retries_busy_mounts() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();
    assert!(eventually(|| m.server.state() == MountState::Serving).await);

    m.transport.fail_unmounts(2);
    m.server.unmount().await.unwrap();
    assert_eq!(m.transport.unmount_calls(), 3);
    assert_eq!(m.server.state(), MountState::Closed);
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmount_gives_up_after_five_attempts() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();
    assert!(eventually(|| m.server.state() == MountState::Serving).await);

    m.transport.fail_unmounts(usize::MAX);
    let err = m.server.unmount().await.unwrap_err();
    assert!(matches!(err, Error::Unmount { .. }), "{err}");
    assert_eq!(m.transport.unmount_calls(), 5);
    assert_eq!(m.server.state(), MountState::Serving);

    // Still serving.
    m.kernel.send(FUSE_GETATTR, ROOT_ID, &abi::encode(&GetAttrIn::default()));
    assert_eq!(m.kernel.recv().header.error, 0);

    m.transport.fail_unmounts(0);
    handle.unmount().await.unwrap();
    assert_eq!(m.server.debug_data(), "readers: 0, retrieves: 0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_reader_serves_while_a_handler_blocks() {
    let m = mount(28, MountOptions::default()).await;
    let handle = m.server.spawn();

    let slow = m.kernel.send(FUSE_GETATTR, BLOCKED_INO, &abi::encode(&GetAttrIn::default()));
    let fast = m.kernel.send(FUSE_LOOKUP, ROOT_ID, &with_names::<()>(None, &["hello"]));

    // The loop stuck in GETATTR left no reader behind, so another was started.
    let reply = m.kernel.recv();
    assert_eq!(reply.header.unique, fast);
    assert_eq!(reply.header.error, 0);

    m.server.filesystem().gate.notify_one();
    let reply = m.kernel.recv();
    assert_eq!(reply.header.unique, slow);
    assert_eq!(reply.header.error, 0);
    let out: AttrOut = reply.decode();
    assert_eq!(out.attr.ino, BLOCKED_INO);

    handle.unmount().await.unwrap();
}
