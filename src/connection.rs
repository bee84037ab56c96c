// Copyright 2024 Happensit
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-connection record.
//!
//! Records are allocated once at worker startup and reused for the lifetime
//! of the process; see [`crate::pool`]. All buffers are fixed-size and
//! inline so a record is a single contiguous allocation.

use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use bff_parser::h1::request::{H1Request, MAX_TARGET_LEN};

use crate::timer::TimerHandle;

/// Ceiling on buffered request-head bytes. A head that has not terminated
/// within this many bytes closes the connection.
pub const MAX_REQUEST_BYTES: usize = 8192;

/// Size of the per-connection scratch the response head is formatted into.
pub const HEADER_SCRATCH_BYTES: usize = 512;

/// Lifecycle state of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// In the pool, no descriptor attached.
    Free,
    /// Waiting for (more of) a request head.
    Reading,
    /// Draining the response scatter list.
    Writing,
    /// Response sent; idle until the next request or the idle timer.
    KeepAlive,
    /// Being torn down; stale readiness events are dropped.
    Closing,
}

/// Outcome of draining the socket into the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FillOutcome {
    /// The peer closed its end.
    Closed,
    /// Read `n` new bytes (possibly zero when the socket had nothing more
    /// or the buffer is at capacity).
    Data(usize),
}

/// Outcome of flushing the response scatter list.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every byte of both segments is on the wire.
    Drained,
    /// The socket stopped accepting bytes; write interest must be re-armed.
    Blocked,
}

/// A pooled connection record.
///
/// Holds the socket, the incremental parser, both fixed buffers, and the
/// response scatter state. The reactor owns the record through its token;
/// the record itself never registers or arms anything on its own.
pub struct Conn {
    pub(crate) stream: Option<TcpStream>,
    pub(crate) state: State,
    /// Tenancy tag assigned by the pool on acquire and carried in the
    /// token's high bits; events addressed to an earlier occupant of a
    /// reused slot fail to match it.
    pub(crate) generation: u32,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) parser: H1Request,
    pub(crate) keep_alive: bool,
    pub(crate) read_buf: [u8; MAX_REQUEST_BYTES],
    pub(crate) read_len: usize,
    /// Where the next end-of-headers scan resumes, so bytes are not
    /// rescanned across partial reads.
    scan_from: usize,
    pub(crate) hdr_buf: [u8; HEADER_SCRATCH_BYTES],
    pub(crate) hdr_len: usize,
    /// Second scatter segment: the static route body.
    pub(crate) body: &'static [u8],
    pub(crate) bytes_sent: usize,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) last_active: Instant,
    target: [u8; MAX_TARGET_LEN],
    target_len: u8,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("peer", &self.peer)
            .field("target", &self.target_str())
            .field("keep_alive", &self.keep_alive)
            .field("read_len", &self.read_len)
            .field("hdr_len", &self.hdr_len)
            .field("body_len", &self.body.len())
            .field("bytes_sent", &self.bytes_sent)
            .field("timer", &self.timer)
            .finish()
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

impl Conn {
    /// Creates a record in the [`State::Free`] state.
    pub fn new() -> Self {
        Self {
            stream: None,
            state: State::Free,
            generation: 0,
            peer: None,
            parser: H1Request::new(),
            keep_alive: false,
            read_buf: [0; MAX_REQUEST_BYTES],
            read_len: 0,
            scan_from: 0,
            hdr_buf: [0; HEADER_SCRATCH_BYTES],
            hdr_len: 0,
            body: &[],
            bytes_sent: 0,
            timer: None,
            last_active: Instant::now(),
            target: [0; MAX_TARGET_LEN],
            target_len: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Acquire-time scrub: counters zeroed, parser reinitialized, state set
    /// to Reading. The backing buffer memory is reused as-is.
    pub(crate) fn scrub(&mut self) {
        self.stream = None;
        self.state = State::Reading;
        self.peer = None;
        self.parser.reset();
        self.keep_alive = false;
        self.read_len = 0;
        self.scan_from = 0;
        self.hdr_len = 0;
        self.body = &[];
        self.bytes_sent = 0;
        self.timer = None;
        self.last_active = Instant::now();
        self.target_len = 0;
    }

    /// Associates a freshly accepted socket.
    pub(crate) fn attach(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.last_active = Instant::now();
    }

    /// Detaches the socket for closing; dropping it closes the descriptor.
    pub(crate) fn detach(&mut self) -> Option<TcpStream> {
        self.peer = None;
        self.stream.take()
    }

    /// The target of the request currently (or last) served, for logging.
    pub(crate) fn target_str(&self) -> &str {
        // SAFETY: copied verbatim from the parser, which admits only ASCII.
        unsafe { std::str::from_utf8_unchecked(&self.target[..self.target_len as usize]) }
    }

    /// Copies the parsed target out of the parser so it survives the
    /// parser's reset on keep-alive reuse.
    pub(crate) fn remember_target(&mut self) {
        let len = match self.parser.target() {
            Some(t) => {
                let bytes = t.as_bytes();
                self.target[..bytes.len()].copy_from_slice(bytes);
                bytes.len() as u8
            }
            None => 0,
        };
        self.target_len = len;
    }

    /// Reads into the tail of the read buffer, at most `attempts` times,
    /// stopping on `WouldBlock` or when the buffer reaches its ceiling.
    pub(crate) fn fill(&mut self, attempts: usize) -> io::Result<FillOutcome> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket attached"))?;

        let mut total = 0;
        for _ in 0..attempts {
            if self.read_len == MAX_REQUEST_BYTES {
                break;
            }

            match stream.read(&mut self.read_buf[self.read_len..]) {
                Ok(0) => return Ok(FillOutcome::Closed),
                Ok(n) => {
                    self.read_len += n;
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        self.last_active = Instant::now();
        Ok(FillOutcome::Data(total))
    }

    /// Looks for the end-of-headers sentinel, resuming where the previous
    /// scan left off. Returns the length of the head including the
    /// terminator.
    pub(crate) fn head_end(&mut self) -> Option<usize> {
        let start = self.scan_from.saturating_sub(3);
        match memchr::memmem::find(&self.read_buf[start..self.read_len], b"\r\n\r\n") {
            Some(at) => Some(start + at + 4),
            None => {
                self.scan_from = self.read_len;
                None
            }
        }
    }

    /// Scans bytes `[from, read_len)` for control characters that have no
    /// business in a request head. CR, LF, and HTAB pass.
    pub(crate) fn has_forbidden_ctl(&self, from: usize) -> bool {
        self.read_buf[from..self.read_len]
            .iter()
            .any(|&b| (b < 0x20 && b != b'\r' && b != b'\n' && b != b'\t') || b == 0x7f)
    }

    /// Flushes the unsent suffix of the two-segment scatter list,
    /// reassembling it from `bytes_sent` on every attempt. Degenerates to a
    /// plain write when only one segment remains.
    pub(crate) fn write_pending(&mut self) -> io::Result<WriteOutcome> {
        loop {
            let (head, body) = unsent_parts(&self.hdr_buf[..self.hdr_len], self.body, self.bytes_sent);
            if head.is_empty() && body.is_empty() {
                self.last_active = Instant::now();
                return Ok(WriteOutcome::Drained);
            }

            let stream = self.stream.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "no socket attached")
            })?;

            let written = if head.is_empty() {
                stream.write(body)
            } else if body.is_empty() {
                stream.write(head)
            } else {
                stream.write_vectored(&[IoSlice::new(head), IoSlice::new(body)])
            };

            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.bytes_sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.last_active = Instant::now();
                    return Ok(WriteOutcome::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Rearms the record for the next request on the same socket.
    pub(crate) fn reset_for_keep_alive(&mut self) {
        self.state = State::KeepAlive;
        self.parser.reset();
        self.keep_alive = false;
        self.read_len = 0;
        self.scan_from = 0;
        self.hdr_len = 0;
        self.body = &[];
        self.bytes_sent = 0;
        self.target_len = 0;
        self.last_active = Instant::now();
    }

    pub(crate) fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket attached"))?;
        registry.register(stream, token, interest)
    }

    pub(crate) fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket attached"))?;
        registry.reregister(stream, token, interest)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket attached"))?;
        registry.deregister(stream)
    }
}

/// Splits the scatter list into its unsent suffix. The first element is the
/// remaining header bytes, the second the remaining body bytes; a fully
/// sent segment comes back empty so callers can collapse the vectored write
/// into a single-entry one.
fn unsent_parts<'a>(
    head: &'a [u8],
    body: &'static [u8],
    sent: usize,
) -> (&'a [u8], &'static [u8]) {
    if sent < head.len() {
        (&head[sent..], body)
    } else {
        (&[], &body[sent - head.len()..])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsent_parts_covers_both_segments() {
        let head = b"HTTP/1.1 200 OK\r\n\r\n";
        let body: &'static [u8] = b"{\"status\":\"OK\"}";

        let (h, b) = unsent_parts(head, body, 0);
        assert_eq!(head, h);
        assert_eq!(body, b);

        let (h, b) = unsent_parts(head, body, 5);
        assert_eq!(&head[5..], h);
        assert_eq!(body, b);
    }

    #[test]
    fn unsent_parts_collapses_to_body_only() {
        let head = b"HT";
        let body: &'static [u8] = b"xyz";

        let (h, b) = unsent_parts(head, body, 2);
        assert!(h.is_empty());
        assert_eq!(b"xyz", b);

        let (h, b) = unsent_parts(head, body, 4);
        assert!(h.is_empty());
        assert_eq!(b"z", b);

        let (h, b) = unsent_parts(head, body, 5);
        assert!(h.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn scrub_restores_acquire_state() {
        let mut conn = Conn::new();
        conn.read_len = 100;
        conn.hdr_len = 32;
        conn.bytes_sent = 7;
        conn.keep_alive = true;
        conn.body = b"tail";
        conn.state = State::Writing;

        conn.scrub();

        assert_eq!(State::Reading, conn.state);
        assert_eq!(0, conn.read_len);
        assert_eq!(0, conn.hdr_len);
        assert_eq!(0, conn.bytes_sent);
        assert!(conn.body.is_empty());
        assert!(!conn.keep_alive);
        assert!(conn.timer.is_none());
        assert!(conn.stream.is_none());
    }

    #[test]
    fn keep_alive_reset_matches_acquire_observables() {
        let mut conn = Conn::new();
        conn.parser
            .parse(b"GET /health HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        conn.remember_target();
        conn.read_len = 33;
        conn.hdr_len = 64;
        conn.bytes_sent = 79;
        conn.keep_alive = true;
        conn.body = b"{}";

        conn.reset_for_keep_alive();

        assert_eq!(State::KeepAlive, conn.state);
        assert_eq!(0, conn.read_len);
        assert_eq!(0, conn.hdr_len);
        assert_eq!(0, conn.bytes_sent);
        assert!(conn.body.is_empty());
        assert_eq!(None, conn.parser.target());
        assert_eq!("", conn.target_str());
    }

    #[test]
    fn head_end_scan_resumes_across_partial_reads() {
        let mut conn = Conn::new();
        conn.scrub();

        let part1 = b"GET / HTTP/1.1\r\nHost: x\r";
        conn.read_buf[..part1.len()].copy_from_slice(part1);
        conn.read_len = part1.len();
        assert_eq!(None, conn.head_end());

        let part2 = b"\n\r\n";
        conn.read_buf[part1.len()..part1.len() + part2.len()].copy_from_slice(part2);
        conn.read_len += part2.len();
        assert_eq!(Some(part1.len() + part2.len()), conn.head_end());
    }

    #[test]
    fn forbidden_ctl_scan_allows_crlf_and_tab() {
        let mut conn = Conn::new();
        conn.scrub();

        let ok = b"GET / HTTP/1.1\r\nA:\tb\r\n\r\n";
        conn.read_buf[..ok.len()].copy_from_slice(ok);
        conn.read_len = ok.len();
        assert!(!conn.has_forbidden_ctl(0));

        conn.read_buf[4] = 0x00;
        assert!(conn.has_forbidden_ctl(0));
        assert!(!conn.has_forbidden_ctl(5));
    }
}
