// Mounts a read-only filesystem holding a single file, `hello`.
//
//   cargo run --example hello -- --mountpoint /tmp/hello
//   cat /tmp/hello/hello

use std::ffi::OsStr;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use fusewire::abi::{
    Attr, AttrOut, EntryOut, GetAttrIn, InHeader, OpenIn, OpenOut, ROOT_ID, ReadIn,
};
use fusewire::{
    DirEntryList, Errno, FileSystem, MountOptions, OpenOptions, ReadResult, ReadResultData,
    Result, Server,
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

const HELLO_INO: u64 = 2;
const HELLO_TEXT: &[u8] = b"Hello from fusewire!\n";
const TTL_SECS: u64 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-file read-only FUSE example")]
struct Args {
    /// Mount point path
    #[arg(long)]
    mountpoint: String,
    /// Log every request and reply
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Let other users access the mount
    #[arg(long, default_value_t = false)]
    allow_other: bool,
}

struct HelloFs;

fn attr(ino: u64) -> Attr {
    match ino {
        ROOT_ID => Attr {
            ino,
            mode: libc::S_IFDIR as u32 | 0o755,
            nlink: 2,
            ..Default::default()
        },
        _ => Attr {
            ino,
            size: HELLO_TEXT.len() as u64,
            blocks: 1,
            mode: libc::S_IFREG as u32 | 0o444,
            nlink: 1,
            ..Default::default()
        },
    }
}

#[async_trait]
impl FileSystem for HelloFs {
    fn name(&self) -> String {
        "hellofs".to_string()
    }

    async fn lookup(&self, header: &InHeader, name: &OsStr) -> Result<EntryOut> {
        if header.nodeid != ROOT_ID || name != "hello" {
            return Err(Errno::ENOENT);
        }
        Ok(EntryOut {
            nodeid: HELLO_INO,
            entry_valid: TTL_SECS,
            attr_valid: TTL_SECS,
            attr: attr(HELLO_INO),
            ..Default::default()
        })
    }

    async fn getattr(&self, header: &InHeader, _input: &GetAttrIn) -> Result<AttrOut> {
        match header.nodeid {
            ROOT_ID | HELLO_INO => Ok(AttrOut {
                attr_valid: TTL_SECS,
                attr: attr(header.nodeid),
                ..Default::default()
            }),
            _ => Err(Errno::ENOENT),
        }
    }

    async fn open(&self, header: &InHeader, input: &OpenIn) -> Result<OpenOut> {
        if header.nodeid != HELLO_INO {
            return Err(Errno::EISDIR);
        }
        if input.flags & libc::O_ACCMODE as u32 != libc::O_RDONLY as u32 {
            return Err(Errno::EACCES);
        }
        Ok(OpenOptions::KEEP_CACHE.reply(0))
    }

    async fn read(&self, _header: &InHeader, input: &ReadIn) -> Result<Box<dyn ReadResult>> {
        let start = (input.offset as usize).min(HELLO_TEXT.len());
        Ok(Box::new(ReadResultData(Bytes::from_static(&HELLO_TEXT[start..]))))
    }

    async fn opendir(&self, header: &InHeader, _input: &OpenIn) -> Result<OpenOut> {
        if header.nodeid != ROOT_ID {
            return Err(Errno::ENOTDIR);
        }
        Ok(OpenOptions::empty().reply(0))
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

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut options = MountOptions::default();
    options
        .fs_name("hello")
        .option("ro")
        .allow_other(args.allow_other)
        .debug(args.debug);

    let server = Server::mount(HelloFs, &args.mountpoint, options)
        .await
        .unwrap();
    let mut mount_handle = server.spawn();
    server.wait_mount().await.unwrap();

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.unwrap(),
        _ = signal::ctrl_c() => {
            mount_handle.unmount().await.unwrap();
        }
    }
}
