#![cfg(target_os = "linux")]

mod common;

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use fusewire::abi::{self, FUSE_READ, InHeader, InitFlags, ReadIn};
use fusewire::{
    FileSystem, MountHandle, MountOptions, ReadResult, ReadResultFd, Result, Server, SpliceSource,
    page_size,
};

use common::{FakeKernel, PairTransport, init_tracing};

const FILE_INO: u64 = 2;

/// Counts how often a READ payload had to be copied through userspace.
struct Counted {
    inner: ReadResultFd,
    copies: Arc<AtomicUsize>,
}

impl ReadResult for Counted {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn bytes<'a>(&'a self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.inner.bytes(buf)
    }

    fn splice_source(&self) -> Option<SpliceSource<'_>> {
        self.inner.splice_source()
    }

    fn done(&mut self) {
        self.inner.done()
    }
}

/// Serves every READ from one backing file, claiming the full requested size.
struct FileFs {
    file: Arc<File>,
    copies: Arc<AtomicUsize>,
}

impl FileFs {
    fn new(content: &[u8]) -> Self {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        FileFs {
            file: Arc::new(file),
            copies: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl FileSystem for FileFs {
    async fn read(&self, _header: &InHeader, input: &ReadIn) -> Result<Box<dyn ReadResult>> {
        Ok(Box::new(Counted {
            inner: ReadResultFd::new(Arc::clone(&self.file), input.offset, input.size as usize),
            copies: Arc::clone(&self.copies),
        }))
    }
}

async fn serve(content: &[u8]) -> (Server<FileFs>, MountHandle<FileFs>, FakeKernel) {
    init_tracing();
    let (transport, kernel) = PairTransport::splicing();
    kernel.send_init(28, InitFlags::ASYNC_READ | InitFlags::BIG_WRITES);
    let server = Server::mount_with_transport(
        FileFs::new(content),
        "/mnt/splice",
        MountOptions::default(),
        transport,
    )
    .await
    .unwrap();
    assert_eq!(kernel.recv().header.error, 0);
    let handle = server.spawn();
    (server, handle, kernel)
}

fn read_in(offset: u64, size: u32) -> Vec<u8> {
    abi::encode(&ReadIn {
        offset,
        size,
        ..Default::default()
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sub_page_read_is_spliced() {
    let content = b"0123456789abcdef";
    let (server, handle, kernel) = serve(content).await;

    let unique = kernel.send(FUSE_READ, FILE_INO, &read_in(3, 10));
    let reply = kernel.recv();
    assert_eq!(reply.header.unique, unique);
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.body, &content[3..13]);
    assert_eq!(server.filesystem().copies.load(Ordering::SeqCst), 0);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unaligned_multi_page_read_is_spliced() {
    let page = page_size();
    let content = pattern(4 * page);
    let (server, handle, kernel) = serve(&content).await;

    let (offset, size) = (100, 2 * page + 321);
    kernel.send(FUSE_READ, FILE_INO, &read_in(offset as u64, size as u32));
    let reply = kernel.recv();
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.body.len(), size);
    assert_eq!(reply.body, &content[offset..offset + size]);
    assert_eq!(server.filesystem().copies.load(Ordering::SeqCst), 0);

    handle.unmount().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_file_falls_back_to_copy_without_losing_data() {
    let (server, handle, kernel) = serve(b"abc").await;

    // The result announces 10 bytes but the file holds 3, so the splice
    // gives up and the copy path answers with what is there.
    kernel.send(FUSE_READ, FILE_INO, &read_in(0, 10));
    let reply = kernel.recv();
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.body, b"abc");
    assert_eq!(server.filesystem().copies.load(Ordering::SeqCst), 1);

    // Nothing was consumed from the file by the failed attempt.
    kernel.send(FUSE_READ, FILE_INO, &read_in(0, 10));
    assert_eq!(kernel.recv().body, b"abc");

    handle.unmount().await.unwrap();
}
