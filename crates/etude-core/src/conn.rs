// src/conn.rs
use std::ffi::OsString;
use std::fs::{self, File};
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use arrayvec::ArrayVec;
use tracing::{debug, trace, warn};

use crate::metrics::ServerMetrics;
use crate::parser::{
    Line, LineStatus, ParseState, Progress, RequestHead, body_complete, parse_line, transition,
};
use crate::response::{EMPTY_DOCUMENT, Overflow, ResponseBuilder, Status};
use crate::syscalls::{self, Epoll, FileMapping, Interest};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;
/// Document root plus url must stay strictly below this many bytes.
pub const MAX_PATH_LEN: usize = 200;

/// Verdict of one pass over the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Incomplete,
    Malformed,
    Complete(RequestHead),
}

/// What a complete request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Mapped (or empty) regular file of the given size.
    FileReady(usize),
    Malformed,
    NotFound,
    Forbidden,
    InternalError,
}

impl Outcome {
    fn status(self) -> Status {
        match self {
            Outcome::FileReady(_) => Status::Ok,
            Outcome::Malformed => Status::BadRequest,
            Outcome::NotFound => Status::NotFound,
            Outcome::Forbidden => Status::Forbidden,
            Outcome::InternalError => Status::InternalError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    WriteBuffer,
    Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    source: Source,
    offset: usize,
    len: usize,
}

/// Ordered segments still owed to the peer: the header block, then
/// optionally the mapped file.
#[derive(Debug, Default)]
struct Staged {
    segments: ArrayVec<Segment, 2>,
}

impl Staged {
    fn clear(&mut self) {
        self.segments.clear();
    }

    /// At most two pushes follow each `clear`.
    fn push(&mut self, source: Source, offset: usize, len: usize) {
        if len > 0 {
            self.segments.push(Segment { source, offset, len });
        }
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn remaining(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Drop `n` sent bytes off the front.
    fn advance(&mut self, mut n: usize) {
        for seg in self.segments.iter_mut() {
            let take = n.min(seg.len);
            seg.offset += take;
            seg.len -= take;
            n -= take;
            if n == 0 {
                break;
            }
        }
        self.segments.retain(|s| s.len > 0);
    }
}

/// One client connection: its buffers, parse cursors and the file being served.
///
/// Owned by the reactor thread while reading or writing and moved to a worker
/// for [`Connection::process`]. Never shared.
pub struct Connection {
    fd: RawFd,
    token: u64,

    read_buf: [u8; READ_BUF_SIZE],
    /// End of received data.
    read_index: usize,
    /// End of data already scanned for line ends.
    checked_index: usize,
    /// Start of the line being interpreted.
    start_line: usize,
    state: ParseState,

    write_buf: [u8; WRITE_BUF_SIZE],
    write_index: usize,
    staged: Staged,

    real_file: PathBuf,
    file: Option<FileMapping>,

    /// Keep the socket open after this response.
    linger: bool,
    /// Assembly failed outright; close on the next write readiness.
    close_pending: bool,
}

impl Connection {
    /// A fresh unused connection slot
    pub fn new() -> Self {
        Self {
            fd: -1,
            token: 0,
            read_buf: [0; READ_BUF_SIZE],
            read_index: 0,
            checked_index: 0,
            start_line: 0,
            state: ParseState::RequestLine,
            write_buf: [0; WRITE_BUF_SIZE],
            write_index: 0,
            staged: Staged::default(),
            real_file: PathBuf::new(),
            file: None,
            linger: false,
            close_pending: false,
        }
    }

    /// Bind this slot to a freshly accepted socket.
    pub fn init(&mut self, fd: RawFd, token: u64) {
        self.fd = fd;
        self.token = token;
        self.reset();
    }

    /// Forget the previous request cycle. Buffers are not cleared; the
    /// cursors guarantee stale bytes are never read.
    fn reset(&mut self) {
        self.release_mapping();
        self.read_index = 0;
        self.checked_index = 0;
        self.start_line = 0;
        self.state = ParseState::RequestLine;
        self.write_index = 0;
        self.staged.clear();
        self.real_file = PathBuf::new();
        self.linger = false;
        self.close_pending = false;
    }

    /// Detach from the socket. Called by the reactor on teardown.
    pub fn clear(&mut self) {
        self.reset();
        self.fd = -1;
        self.token = 0;
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn release_mapping(&mut self) {
        self.file = None;
    }

    // ---- Reactor side: socket reads ----

    /// Drain the socket into the read buffer until it would block.
    ///
    /// Edge-triggered readiness fires once per transition, so anything left
    /// unread now might never be announced again. Returns `false` on a read
    /// error, on EOF, or when the buffer was already full on entry. A buffer
    /// that fills up during this call returns `true` and lets the parser
    /// decide.
    pub fn read_available(&mut self) -> bool {
        if self.read_index >= READ_BUF_SIZE {
            return false;
        }

        loop {
            if self.read_index == READ_BUF_SIZE {
                return true;
            }
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_index..]) {
                Ok(None) => return true,
                Ok(Some(0)) => {
                    trace!(fd = self.fd, "peer closed");
                    return false;
                }
                Ok(Some(n)) => self.read_index += n,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    // ---- Worker side: parse, resolve, assemble ----

    /// Parse what has been read, resolve it against `doc_root` and stage the
    /// response. Performs no socket I/O.
    ///
    /// Returns the readiness to re-arm: `Read` when the request is still
    /// incomplete, `Write` once a response (or a pending close) is staged.
    pub fn process(&mut self, doc_root: &Path) -> Interest {
        let outcome = match self.process_read() {
            ReadOutcome::Incomplete => return Interest::Read,
            ReadOutcome::Malformed => {
                self.linger = self.state.head().is_some_and(|h| h.keep_alive);
                Outcome::Malformed
            }
            ReadOutcome::Complete(head) => {
                self.linger = head.keep_alive;
                self.resolve(doc_root, &head)
            }
        };

        if self.assemble(outcome).is_err() {
            warn!(fd = self.fd, ?outcome, "response does not fit the write buffer");
            self.release_mapping();
            self.linger = false;
            if self.assemble(Outcome::InternalError).is_err() {
                self.close_pending = true;
            }
        }
        Interest::Write
    }

    /// Run the line and request state machines over the unscanned bytes.
    pub(crate) fn process_read(&mut self) -> ReadOutcome {
        loop {
            if let ParseState::Body(head) = self.state {
                // The body is never scanned as lines.
                return if body_complete(self.read_index, self.checked_index, head.content_length)
                {
                    ReadOutcome::Complete(head)
                } else {
                    ReadOutcome::Incomplete
                };
            }

            let received = &self.read_buf[..self.read_index];
            match parse_line(received, &mut self.checked_index) {
                LineStatus::Incomplete => return ReadOutcome::Incomplete,
                LineStatus::Malformed => return ReadOutcome::Malformed,
                LineStatus::Complete => {}
            }

            let line_end = (self.checked_index - 2).max(self.start_line);
            let line = Line::new(self.start_line, &received[self.start_line..line_end]);
            self.start_line = self.checked_index;
            trace!(fd = self.fd, line = %String::from_utf8_lossy(line.bytes), "got http line");

            let (next, progress) = transition(self.state, line);
            self.state = next;
            match progress {
                Progress::NeedMore => {}
                Progress::Complete(head) => return ReadOutcome::Complete(head),
                Progress::Malformed => return ReadOutcome::Malformed,
            }
        }
    }

    /// Map the request path onto the filesystem.
    ///
    /// The url is appended verbatim; `..` segments are not normalized away.
    pub(crate) fn resolve(&mut self, doc_root: &Path, head: &RequestHead) -> Outcome {
        let root = doc_root.as_os_str().as_bytes();
        let url = head.url.slice(&self.read_buf[..self.read_index]);
        if root.len() + url.len() >= MAX_PATH_LEN {
            return Outcome::Malformed;
        }

        let mut joined = Vec::with_capacity(root.len() + url.len());
        joined.extend_from_slice(root);
        joined.extend_from_slice(url);
        self.real_file = PathBuf::from(OsString::from_vec(joined));

        let meta = match fs::metadata(&self.real_file) {
            Ok(meta) => meta,
            Err(_) => return Outcome::NotFound,
        };
        if meta.permissions().mode() & libc::S_IROTH as u32 == 0 {
            return Outcome::Forbidden;
        }
        if meta.is_dir() {
            return Outcome::Malformed;
        }

        let size = meta.len() as usize;
        if size == 0 {
            return Outcome::FileReady(0);
        }

        // The handle closes at the end of this scope; the mapping outlives it.
        let file = match File::open(&self.real_file) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.real_file.display(), error = %e, "open failed");
                return Outcome::InternalError;
            }
        };
        match FileMapping::map(&file, size) {
            Ok(mapping) => {
                let mapped = mapping.len();
                self.file = Some(mapping);
                Outcome::FileReady(mapped)
            }
            Err(e) => {
                warn!(path = %self.real_file.display(), error = %e, "mmap failed");
                Outcome::InternalError
            }
        }
    }

    /// Serialize the response for `outcome` and stage the write segments.
    pub(crate) fn assemble(&mut self, outcome: Outcome) -> Result<(), Overflow> {
        self.staged.clear();
        self.write_index = 0;

        let written = match outcome {
            Outcome::FileReady(size) if size > 0 => {
                let n = ResponseBuilder::new(Status::Ok)
                    .keep_alive(self.linger)
                    .content_length(size)
                    .write_into(&mut self.write_buf)?;
                self.write_index = n;
                self.staged.push(Source::WriteBuffer, 0, n);
                self.staged.push(Source::Mapping, 0, size);
                return Ok(());
            }
            Outcome::FileReady(_) => ResponseBuilder::new(Status::Ok)
                .keep_alive(self.linger)
                .body(EMPTY_DOCUMENT)
                .write_into(&mut self.write_buf)?,
            other => ResponseBuilder::error(other.status(), self.linger)
                .write_into(&mut self.write_buf)?,
        };

        self.write_index = written;
        self.staged.push(Source::WriteBuffer, 0, written);
        Ok(())
    }

    // ---- Reactor side: socket writes ----

    /// Push staged bytes out with vectored writes until done or the socket
    /// is full.
    ///
    /// Returns `false` when the connection must be torn down: a write error,
    /// a pending close, or a completed response without keep-alive. A full
    /// socket re-arms for writability and returns `true`; a completed
    /// keep-alive response resets the slot and re-arms for reading.
    pub fn write_available(&mut self, poller: &Epoll, metrics: &ServerMetrics) -> bool {
        if self.close_pending {
            self.release_mapping();
            return false;
        }

        if self.staged.is_empty() {
            self.reset();
            return self.rearm(poller, Interest::Read);
        }

        loop {
            let result = {
                let slices = self.staged_slices();
                syscalls::writev_nonblocking(self.fd, &slices)
            };

            match result {
                Ok(None) | Ok(Some(0)) => return self.rearm(poller, Interest::Write),
                Ok(Some(n)) => {
                    metrics.add_bytes(n);
                    self.staged.advance(n);
                    if !self.staged.is_empty() {
                        continue;
                    }

                    self.release_mapping();
                    if self.linger {
                        self.reset();
                        return self.rearm(poller, Interest::Read);
                    }
                    return false;
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, remaining = self.staged.remaining(), "write failed");
                    self.release_mapping();
                    return false;
                }
            }
        }
    }

    fn staged_slices(&self) -> ArrayVec<&[u8], 2> {
        let mut slices = ArrayVec::new();
        for seg in &self.staged.segments {
            let bytes = match seg.source {
                Source::WriteBuffer => &self.write_buf[..self.write_index],
                Source::Mapping => match &self.file {
                    Some(mapping) => mapping.as_slice(),
                    None => continue,
                },
            };
            slices.push(&bytes[seg.offset..seg.offset + seg.len]);
        }
        slices
    }

    fn rearm(&self, poller: &Epoll, interest: Interest) -> bool {
        match poller.rearm(self.fd, self.token, interest) {
            Ok(()) => true,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "re-arm failed");
                false
            }
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Connection {
    fn feed(&mut self, bytes: &[u8]) {
        self.read_buf[self.read_index..self.read_index + bytes.len()].copy_from_slice(bytes);
        self.read_index += bytes.len();
    }

    fn staged_bytes(&self) -> Vec<u8> {
        self.staged_slices().concat()
    }
}
