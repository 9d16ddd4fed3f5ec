use std::ffi::OsStr;
use std::fmt::Write as _;
use std::mem;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::abi::{
    self, FUSE_GETXATTR, FUSE_LISTXATTR, FUSE_SETXATTR, GetXAttrIn, IN_HEADER_SIZE, InHeader,
    OUT_HEADER_SIZE, OutHeader,
};
use crate::buffer_pool::BufferPool;
use crate::errno::{Errno, Result};
use crate::opcode::{self, MAX_OUTPUT_SIZE, OperationHandler};
use crate::read_result::{ReadResult, SpliceSource};

/// Inputs shorter than this are copied out of the read buffer so the
/// buffer can go straight back to its pool.
pub(crate) const SMALL_INPUT_SIZE: usize = 128;

const OUT_BUF_SIZE: usize = OUT_HEADER_SIZE + MAX_OUTPUT_SIZE;

/// Outcome of a request as written into the reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Err(Errno),
    /// A server-initiated notification with the given code.
    Notify(i32),
}

impl Status {
    pub(crate) fn is_ok(self) -> bool {
        !matches!(self, Status::Err(_))
    }

    fn wire(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Err(errno) => -errno.raw(),
            Status::Notify(code) => code,
        }
    }
}

impl From<Result<()>> for Status {
    fn from(res: Result<()>) -> Self {
        match res {
            Ok(()) => Status::Ok,
            Err(errno) => Status::Err(errno),
        }
    }
}

/// Variable-length part of a reply, sent after the structured output.
pub(crate) enum Payload {
    None,
    /// The first `n` bytes of the request's pooled output buffer.
    Output(usize),
    Bytes(Bytes),
    /// A READ result, capped at the size the kernel asked for.
    Read {
        result: Box<dyn ReadResult>,
        limit: usize,
    },
}

/// One kernel request and the reply being built for it.
///
/// Requests are pooled: [`Request::clear`] resets every field before the
/// record is reused.
pub(crate) struct Request {
    small_input: [u8; SMALL_INPUT_SIZE],
    input_buf: Option<Vec<u8>>,
    input_len: usize,

    pub(crate) in_header: InHeader,
    pub(crate) handler: Option<&'static OperationHandler>,
    pub(crate) status: Status,
    in_data: Range<usize>,
    arg: Range<usize>,
    filenames: Vec<Range<usize>>,

    out_buf: [u8; OUT_BUF_SIZE],
    /// Size of the structured output; may be shortened for old kernels.
    pub(crate) out_size: usize,
    header_len: usize,
    pub(crate) payload: Payload,
    pub(crate) output_buf: Option<Vec<u8>>,

    pub(crate) start: Option<Instant>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Request {
            small_input: [0; SMALL_INPUT_SIZE],
            input_buf: None,
            input_len: 0,
            in_header: InHeader::default(),
            handler: None,
            status: Status::Ok,
            in_data: 0..0,
            arg: 0..0,
            filenames: Vec::with_capacity(2),
            out_buf: [0; OUT_BUF_SIZE],
            out_size: 0,
            header_len: 0,
            payload: Payload::None,
            output_buf: None,
            start: None,
        }
    }

    /// A locally built notification; it has no kernel unique id.
    pub(crate) fn notify(opcode: u32, code: i32) -> Self {
        let mut req = Request::new();
        req.in_header.opcode = opcode;
        req.handler = opcode::handler(opcode);
        req.out_size = req.handler.map_or(0, |h| h.output_size);
        req.status = Status::Notify(code);
        req
    }

    /// Reset for reuse. Pooled buffers must have been taken out already.
    pub(crate) fn clear(&mut self) {
        self.input_buf = None;
        self.input_len = 0;
        self.in_header = InHeader::default();
        self.handler = None;
        self.status = Status::Ok;
        self.in_data = 0..0;
        self.arg = 0..0;
        self.filenames.clear();
        self.out_size = 0;
        self.header_len = 0;
        self.payload = Payload::None;
        self.output_buf = None;
        self.start = None;
    }

    /// Attach `n` bytes read into `buf`. Returns the buffer when the input
    /// was small enough to copy, so the caller can recycle it at once.
    pub(crate) fn set_input(&mut self, buf: Vec<u8>, n: usize) -> Option<Vec<u8>> {
        self.input_len = n;
        if n < SMALL_INPUT_SIZE {
            self.small_input[..n].copy_from_slice(&buf[..n]);
            self.input_buf = None;
            Some(buf)
        } else {
            self.input_buf = Some(buf);
            None
        }
    }

    pub(crate) fn take_input_buf(&mut self) -> Option<Vec<u8>> {
        self.input_buf.take()
    }

    fn input(&self) -> &[u8] {
        match &self.input_buf {
            Some(buf) => &buf[..self.input_len],
            None => &self.small_input[..self.input_len],
        }
    }

    /// Decode the header, resolve the handler and split the input.
    ///
    /// Returns false when not even the header could be read; such a request
    /// cannot be answered. Otherwise `status` says whether dispatch may go
    /// ahead.
    pub(crate) fn parse(&mut self) -> bool {
        let len = self.input_len;
        self.in_header = match abi::decode::<InHeader>(self.input()) {
            Ok(header) => header,
            Err(_) => {
                warn!("Short read for request header: {len} bytes");
                self.status = Status::Err(Errno::EIO);
                return false;
            }
        };

        let Some(handler) = opcode::handler(self.in_header.opcode) else {
            warn!("Unknown opcode {}", self.in_header.opcode);
            self.status = Status::Err(Errno::ENOSYS);
            return true;
        };
        self.handler = Some(handler);

        let data_end = IN_HEADER_SIZE + handler.input_size;
        if len < data_end {
            warn!(
                "Short read for {}: {} < {} bytes",
                handler.name, len, data_end
            );
            self.status = Status::Err(Errno::EIO);
            return true;
        }
        self.in_data = IN_HEADER_SIZE..data_end;
        self.arg = data_end..len;

        if handler.file_names > 0 && !self.split_names(handler.file_names) {
            warn!("{}: missing NUL terminator in file name", handler.name);
            self.status = Status::Err(Errno::EIO);
            return true;
        }

        self.out_size = handler.output_size;
        self.out_buf[..OUT_HEADER_SIZE + self.out_size].fill(0);
        true
    }

    fn split_names(&mut self, count: usize) -> bool {
        let mut pos = self.arg.start;
        for _ in 0..count {
            let rest = &self.input()[pos..self.arg.end];
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return false;
            };
            self.filenames.push(pos..pos + nul);
            pos += nul + 1;
        }
        if self.in_header.opcode == FUSE_SETXATTR {
            // The value follows the name.
            self.arg = pos..self.arg.end;
        }
        true
    }

    pub(crate) fn opcode(&self) -> u32 {
        self.in_header.opcode
    }

    pub(crate) fn name(&self) -> &'static str {
        self.handler.map_or("UNKNOWN", |h| h.name)
    }

    pub(crate) fn decode_in<T: DeserializeOwned>(&self) -> Result<T> {
        abi::decode(&self.input()[self.in_data.clone()])
    }

    /// Bytes after the fixed input: write data, batch-forget records, or the
    /// SETXATTR value.
    pub(crate) fn arg(&self) -> &[u8] {
        &self.input()[self.arg.clone()]
    }

    pub(crate) fn filename(&self, i: usize) -> &OsStr {
        match self.filenames.get(i) {
            Some(range) => OsStr::from_bytes(&self.input()[range.clone()]),
            None => OsStr::new(""),
        }
    }

    pub(crate) fn filename_count(&self) -> usize {
        self.filenames.len()
    }

    /// Place `value` in the structured output.
    pub(crate) fn set_out<T: Serialize>(&mut self, value: &T) {
        // Every handler's output fits the buffer.
        let _ = abi::encode_into(value, &mut self.out_buf[OUT_HEADER_SIZE..]);
    }

    pub(crate) fn reply<T: Serialize>(&mut self, res: Result<T>) {
        match res {
            Ok(value) => {
                self.set_out(&value);
                self.status = Status::Ok;
            }
            Err(errno) => self.status = Status::Err(errno),
        }
    }

    pub(crate) fn set_status(&mut self, res: Result<()>) {
        self.status = res.into();
    }

    pub(crate) fn flat_size(&self) -> usize {
        match &self.payload {
            Payload::None => 0,
            Payload::Output(n) => *n,
            Payload::Bytes(bytes) => bytes.len(),
            Payload::Read { result, limit } => result.size().min(*limit),
        }
    }

    /// Length of the structured output that goes on the wire.
    fn structured_size(&self) -> usize {
        if !self.status.is_ok() {
            return 0;
        }
        let opcode = self.opcode();
        if opcode == FUSE_GETXATTR || opcode == FUSE_LISTXATTR {
            // Only a size probe (size == 0) is answered with GetXAttrOut.
            if let Ok(input) = self.decode_in::<GetXAttrIn>() {
                if input.size != 0 {
                    return 0;
                }
            }
        }
        self.out_size
    }

    pub(crate) fn serialize_header(&mut self, flat_size: usize) {
        let data_size = self.structured_size();
        self.header_len = encode_header(
            &mut self.out_buf,
            self.in_header.unique,
            self.status,
            data_size,
            flat_size,
        );
    }

    pub(crate) fn header_bytes(&self) -> &[u8] {
        &self.out_buf[..self.header_len]
    }

    /// The flat payload, when it is already in memory.
    pub(crate) fn flat_bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Output(n) => self
                .output_buf
                .as_deref()
                .map_or(&[][..], |buf| &buf[..(*n).min(buf.len())]),
            Payload::Bytes(bytes) => bytes,
            Payload::None | Payload::Read { .. } => &[],
        }
    }

    pub(crate) fn has_read_payload(&self) -> bool {
        matches!(self.payload, Payload::Read { .. })
    }

    /// Header and file range for a zero-copy reply, if the read result is
    /// backed by a descriptor.
    pub(crate) fn splice_view(&self) -> Option<(&[u8], SpliceSource<'_>)> {
        let Payload::Read { result, limit } = &self.payload else {
            return None;
        };
        let mut src = result.splice_source()?;
        src.len = src.len.min(*limit);
        Some((self.header_bytes(), src))
    }

    /// Run the read result's completion hook and drop it.
    pub(crate) fn finish_read(&mut self) {
        if let Payload::Read { mut result, .. } = mem::replace(&mut self.payload, Payload::None) {
            result.done();
        }
    }

    /// Materialize a READ payload into a pooled buffer and hand header plus
    /// data to `write`. The header is rewritten with the number of bytes the
    /// result actually produced.
    pub(crate) fn write_read_reply(
        &mut self,
        buffers: &dyn BufferPool,
        write: impl FnOnce(&[&[u8]]) -> Result<()>,
    ) -> Result<()> {
        let data_size = self.structured_size();
        let Request {
            out_buf,
            in_header,
            status,
            header_len,
            payload,
            output_buf,
            ..
        } = self;
        let Payload::Read { result, limit } = payload else {
            return Ok(());
        };

        let size = result.size().min(*limit);
        let mut scratch = match output_buf.take() {
            Some(buf) if buf.capacity() >= size => buf,
            Some(small) => {
                buffers.free_buffer(small);
                buffers.alloc_buffer(size)
            }
            None => buffers.alloc_buffer(size),
        };
        if scratch.len() < size {
            scratch.resize(size, 0);
        }

        let written = match result.bytes(&mut scratch[..size]) {
            Ok(data) => {
                let data = &data[..data.len().min(size)];
                *header_len = encode_header(out_buf, in_header.unique, *status, data_size, data.len());
                write(&[&out_buf[..*header_len], data])
            }
            Err(errno) => {
                *status = Status::Err(errno);
                *header_len = encode_header(out_buf, in_header.unique, *status, 0, 0);
                write(&[&out_buf[..*header_len]])
            }
        };

        result.done();
        *output_buf = Some(scratch);
        *payload = Payload::None;
        written
    }

    pub(crate) fn input_debug(&self) -> String {
        let mut s = format!(
            "Dispatch {}: {}, NodeId: {}.",
            self.in_header.unique,
            self.name(),
            self.in_header.nodeid
        );
        if !self.filenames.is_empty() {
            let names: Vec<_> = (0..self.filenames.len()).map(|i| self.filename(i)).collect();
            let _ = write!(s, " names: {names:?}");
        }
        let _ = write!(s, " {} bytes", self.arg.len());
        s
    }

    pub(crate) fn output_debug(&self) -> String {
        let code = match self.status {
            Status::Ok => "OK".to_string(),
            Status::Err(errno) => format!("{errno} ({})", errno.raw()),
            Status::Notify(code) => format!("notify {code}"),
        };
        format!(
            "Serialized {}: {} code: {} value: {} bytes, {} bytes data",
            self.in_header.unique,
            self.name(),
            code,
            self.structured_size(),
            self.flat_size()
        )
    }
}

fn encode_header(
    out_buf: &mut [u8; OUT_BUF_SIZE],
    unique: u64,
    status: Status,
    data_size: usize,
    flat_size: usize,
) -> usize {
    let header = OutHeader {
        len: (OUT_HEADER_SIZE + data_size + flat_size) as u32,
        error: status.wire(),
        unique,
    };
    let _ = abi::encode_into(&header, &mut out_buf[..OUT_HEADER_SIZE]);
    OUT_HEADER_SIZE + data_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::*;
    use crate::buffer_pool::PageBufferPool;
    use crate::read_result::ReadResultData;

    fn raw(opcode: u32, body: &[u8]) -> Vec<u8> {
        let header = InHeader {
            len: (IN_HEADER_SIZE + body.len()) as u32,
            opcode,
            unique: 42,
            nodeid: ROOT_ID,
            ..Default::default()
        };
        let mut buf = encode(&header);
        buf.extend_from_slice(body);
        buf
    }

    fn parsed(bytes: Vec<u8>) -> Request {
        let n = bytes.len();
        let mut req = Request::new();
        req.set_input(bytes, n);
        assert!(req.parse());
        req
    }

    #[test]
    fn small_inputs_release_the_buffer() {
        let mut req = Request::new();
        let bytes = raw(FUSE_LOOKUP, b"name\0");
        let n = bytes.len();
        assert!(req.set_input(bytes, n).is_some());

        let big = raw(FUSE_WRITE, &[0u8; 200]);
        let n = big.len();
        assert!(req.set_input(big, n).is_none());
        assert!(req.take_input_buf().is_some());
    }

    #[test]
    fn lookup_name_is_extracted() {
        let req = parsed(raw(FUSE_LOOKUP, b"hello.txt\0"));
        assert_eq!(req.status, Status::Ok);
        assert_eq!(req.filename_count(), 1);
        assert_eq!(req.filename(0), "hello.txt");
    }

    #[test]
    fn rename_has_two_names() {
        let mut body = encode(&RenameIn { newdir: 5 });
        body.extend_from_slice(b"old\0new\0");
        let req = parsed(raw(FUSE_RENAME, &body));
        assert_eq!(req.decode_in::<RenameIn>().unwrap().newdir, 5);
        assert_eq!(req.filename(0), "old");
        assert_eq!(req.filename(1), "new");
    }

    #[test]
    fn setxattr_splits_name_and_value() {
        let mut body = encode(&SetXAttrIn { size: 3, flags: 0 });
        body.extend_from_slice(b"user.k\0v\0x");
        let req = parsed(raw(FUSE_SETXATTR, &body));
        assert_eq!(req.filename(0), "user.k");
        assert_eq!(req.arg(), b"v\0x");
    }

    #[test]
    fn short_fixed_input_is_eio() {
        let req = parsed(raw(FUSE_READ, &[0u8; 10]));
        assert_eq!(req.status, Status::Err(Errno::EIO));
    }

    #[test]
    fn unknown_opcode_is_enosys() {
        let req = parsed(raw(77, &[]));
        assert!(req.handler.is_none());
        assert_eq!(req.status, Status::Err(Errno::ENOSYS));
    }

    #[test]
    fn truncated_header_cannot_be_parsed() {
        let mut req = Request::new();
        req.set_input(vec![0u8; 12], 12);
        assert!(!req.parse());
    }

    #[test]
    fn error_reply_has_no_structured_output() {
        let mut req = parsed(raw(FUSE_LOOKUP, b"x\0"));
        req.reply::<EntryOut>(Err(Errno::ENOENT));
        req.serialize_header(0);
        let header: OutHeader = decode(req.header_bytes()).unwrap();
        assert_eq!(header.len, 16);
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.unique, 42);
    }

    #[test]
    fn xattr_data_request_drops_structured_output() {
        let mut body = encode(&GetXAttrIn { size: 64, padding: 0 });
        body.extend_from_slice(b"user.a\0");
        let mut req = parsed(raw(FUSE_GETXATTR, &body));
        req.payload = Payload::Bytes(Bytes::from_static(b"value"));
        req.serialize_header(req.flat_size());
        assert_eq!(req.header_bytes().len(), OUT_HEADER_SIZE);
        let header: OutHeader = decode(req.header_bytes()).unwrap();
        assert_eq!(header.len as usize, OUT_HEADER_SIZE + 5);

        let mut body = encode(&GetXAttrIn { size: 0, padding: 0 });
        body.extend_from_slice(b"user.a\0");
        let mut probe = parsed(raw(FUSE_GETXATTR, &body));
        probe.reply(Ok(GetXAttrOut { size: 5, padding: 0 }));
        probe.serialize_header(0);
        assert_eq!(probe.header_bytes().len(), OUT_HEADER_SIZE + 8);
    }

    #[test]
    fn read_reply_is_capped_and_materialized() {
        let mut body = encode(&ReadIn { size: 4, ..Default::default() });
        body.resize(40, 0);
        let mut req = parsed(raw(FUSE_READ, &body));
        req.payload = Payload::Read {
            result: Box::new(ReadResultData::from(b"0123456789".to_vec())),
            limit: 4,
        };
        assert_eq!(req.flat_size(), 4);
        req.serialize_header(req.flat_size());

        let pool = PageBufferPool::new();
        let mut sent = Vec::new();
        req.write_read_reply(&pool, |parts| {
            for part in parts {
                sent.extend_from_slice(part);
            }
            Ok(())
        })
        .unwrap();

        let header: OutHeader = decode(&sent).unwrap();
        assert_eq!(header.len, 20);
        assert_eq!(&sent[16..], b"0123");
        assert!(!req.has_read_payload());
        assert!(req.output_buf.is_some());
    }

    #[test]
    fn notify_status_is_positive_on_the_wire() {
        let mut req = Request::notify(OP_NOTIFY_INVAL_INODE, FUSE_NOTIFY_INVAL_INODE);
        req.set_out(&NotifyInvalInodeOut { ino: 3, off: 0, length: -1 });
        req.serialize_header(0);
        let header: OutHeader = decode(req.header_bytes()).unwrap();
        assert_eq!(header.error, FUSE_NOTIFY_INVAL_INODE);
        assert_eq!(header.unique, 0);
        assert_eq!(header.len, 40);
    }
}
