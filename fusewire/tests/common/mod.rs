#![allow(dead_code)]

use std::io;
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fusewire::abi::{self, FUSE_INIT, IN_HEADER_SIZE, InHeader, InitFlags, InitIn, OUT_HEADER_SIZE, OutHeader};
use fusewire::{Error, MountOptions, Mounted, Transport};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use serde::Serialize;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport whose "kernel" is the other end of a socket pair.
pub struct PairTransport {
    channel: Mutex<Option<OwnedFd>>,
    kernel: UnixDatagram,
    failures: AtomicUsize,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    splice: bool,
}

impl PairTransport {
    pub fn new() -> (Arc<PairTransport>, FakeKernel) {
        Self::build(false)
    }

    /// Like [`PairTransport::new`], but READ replies may be spliced.
    pub fn splicing() -> (Arc<PairTransport>, FakeKernel) {
        Self::build(true)
    }

    fn build(splice: bool) -> (Arc<PairTransport>, FakeKernel) {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let kernel = UnixDatagram::from(theirs);
        kernel
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let transport = Arc::new(PairTransport {
            channel: Mutex::new(Some(ours)),
            kernel: kernel.try_clone().unwrap(),
            failures: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            splice,
        });
        (
            transport,
            FakeKernel {
                sock: kernel,
                unique: AtomicU64::new(1),
            },
        )
    }

    /// Make the next `n` unmount attempts fail as if the mount were busy.
    pub fn fail_unmounts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn mount_calls(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }
}

impl Transport for PairTransport {
    fn mount(&self, _mount_point: &Path, _options: &MountOptions) -> Result<Mounted, Error> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        let channel = self
            .channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::AlreadyExists)))?;
        Ok(Mounted::ready_now(channel))
    }

    fn unmount(&self, _mount_point: &Path) -> Result<(), Error> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(Error::HelperFailed {
                helper: "fake".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "Device or resource busy".to_string(),
            });
        }
        self.kernel.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn supports_splice(&self) -> bool {
        self.splice
    }
}

/// A decoded reply or notification.
#[derive(Debug)]
pub struct Reply {
    pub header: OutHeader,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> T {
        abi::decode(&self.body).unwrap()
    }
}

/// The kernel side of a [`PairTransport`].
pub struct FakeKernel {
    sock: UnixDatagram,
    unique: AtomicU64,
}

impl FakeKernel {
    /// Send a request; returns its unique id.
    pub fn send(&self, opcode: u32, nodeid: u64, body: &[u8]) -> u64 {
        let unique = self.unique.fetch_add(1, Ordering::SeqCst);
        self.send_with_unique(opcode, unique, nodeid, body);
        unique
    }

    pub fn send_with_unique(&self, opcode: u32, unique: u64, nodeid: u64, body: &[u8]) {
        let mut msg = abi::encode(&InHeader {
            len: (IN_HEADER_SIZE + body.len()) as u32,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 42,
            padding: 0,
        });
        msg.extend_from_slice(body);
        self.sock.send(&msg).unwrap();
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        self.sock.send(bytes).unwrap();
    }

    /// Queue the INIT request the server reads while mounting.
    pub fn send_init(&self, minor: u32, flags: InitFlags) -> u64 {
        self.send(
            FUSE_INIT,
            0,
            &abi::encode(&InitIn {
                major: abi::KERNEL_VERSION,
                minor,
                max_readahead: 128 * 1024,
                flags: flags.bits(),
            }),
        )
    }

    pub fn recv(&self) -> Reply {
        let mut buf = vec![0u8; 256 * 1024];
        let n = self.sock.recv(&mut buf).expect("no reply from server");
        assert!(n >= OUT_HEADER_SIZE, "reply shorter than a header: {n} bytes");
        let header: OutHeader = abi::decode(&buf[..n]).unwrap();
        assert_eq!(header.len as usize, n, "header length disagrees with message");
        Reply {
            header,
            body: buf[OUT_HEADER_SIZE..n].to_vec(),
        }
    }

    /// Wait up to `wait` for a message; `None` if nothing arrives.
    pub fn try_recv(&self, wait: Duration) -> Option<Reply> {
        self.sock.set_read_timeout(Some(wait)).unwrap();
        let mut buf = vec![0u8; 256 * 1024];
        let got = self.sock.recv(&mut buf);
        self.sock
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let n = got.ok()?;
        let header: OutHeader = abi::decode(&buf[..n]).ok()?;
        Some(Reply {
            header,
            body: buf[OUT_HEADER_SIZE..n].to_vec(),
        })
    }
}

/// Encode `fixed` followed by NUL-terminated `names`.
pub fn with_names<T: Serialize>(fixed: Option<&T>, names: &[&str]) -> Vec<u8> {
    let mut body = fixed.map(abi::encode).unwrap_or_default();
    for name in names {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
    }
    body
}

/// Poll `cond` until it holds or a few seconds have passed.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
