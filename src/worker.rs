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

//! The per-worker event loop.
//!
//! Each worker is one thread around one `Poll` instance: it owns its
//! listener, its connection records, and its timer heap, and shares nothing
//! mutable with other workers apart from the fallback record pool. All
//! registrations use edge semantics with explicit re-arming — every
//! readiness delivery hands the connection to exactly this loop iteration,
//! which must either re-register interest or close.
//!
//! Ready connections are not processed in event order but deferred into
//! small read/write batches flushed once per loop iteration, keeping the
//! per-state code hot in the instruction cache. A connection that completes
//! a request while its read batch flushes is appended to the write batch of
//! the same iteration, so the response goes out without another poll round
//! trip.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use bff_parser::h1::{ParseError, Status as ParseStatus};

use crate::config::Config;
use crate::connection::{FillOutcome, State, WriteOutcome, MAX_REQUEST_BYTES};
use crate::dispatch::{dispatch, DispatchCtx};
use crate::error::CloseReason;
use crate::listener;
use crate::metrics::Metrics;
use crate::pool::{ConnPool, FallbackPool};
use crate::response::Status;
use crate::timer::TimerHeap;

/// Token of the worker's listener. Connection tokens carry the slot index
/// in their low bits and the tenancy generation above it, and their slot
/// indices stay far below the pool capacities, so neither sentinel can
/// collide with one.
const LISTENER: Token = Token(usize::MAX);
/// Token of the cross-thread waker used for shutdown.
const WAKE: Token = Token(usize::MAX - 1);

/// Readiness events collected per poll call.
const EVENT_CAPACITY: usize = 2048;
/// Accepts taken per listener event before returning to dispatch.
const ACCEPT_BATCH: usize = 128;
/// Capacity of the read-ready and write-ready micro-batches.
const IO_BATCH: usize = 32;
/// Socket reads attempted per readable connection before re-arming.
const RECV_ATTEMPTS: usize = 8;

/// Prefix inspected by the repeated-byte guard.
const REPEAT_WINDOW: usize = 256;
/// Longest identical-byte run tolerated within the window.
const REPEAT_LIMIT: usize = 128;

/// A single-threaded reactor driving every connection it accepts from its
/// own `SO_REUSEPORT` listener.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    conns: ConnPool,
    timers: TimerHeap,
    ctx: DispatchCtx,
    shutdown: Arc<AtomicBool>,
    request_timeout: Duration,
    keepalive_timeout: Duration,
    repeat_guard: bool,
    metrics: Metrics,
}

impl Worker {
    /// Builds a worker around `listener`. Also returns the waker the
    /// bootstrap uses to knock the worker out of its poll on shutdown.
    pub fn new(
        id: usize,
        cfg: &Config,
        mut listener: TcpListener,
        ctx: DispatchCtx,
        shared: Arc<FallbackPool>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<(Self, Waker)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let worker = Self {
            id,
            poll,
            listener,
            conns: ConnPool::new(cfg.connections, shared),
            timers: TimerHeap::with_capacity(cfg.connections + cfg.fallback_connections),
            ctx,
            shutdown,
            request_timeout: cfg.request_timeout(),
            keepalive_timeout: cfg.keepalive_timeout(),
            repeat_guard: cfg.repeat_guard,
            metrics: Metrics::default(),
        };

        Ok((worker, waker))
    }

    /// Runs the event loop until the shutdown flag is observed, then closes
    /// every live connection and reports metrics.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut read_batch: Vec<Token> = Vec::with_capacity(IO_BATCH);
        let mut write_batch: Vec<Token> = Vec::with_capacity(IO_BATCH);
        let mut expired: Vec<Token> = Vec::with_capacity(64);

        info!(worker = self.id, "worker started");

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = self.timers.next_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            self.timers.pop_expired(Instant::now(), &mut expired);
            for token in expired.drain(..) {
                if let Some(conn) = self.conns.get_mut(token) {
                    // The heap entry is already gone; drop the handle so the
                    // close path does not cancel a reused node.
                    conn.timer = None;
                }
                self.close(token, CloseReason::Timeout);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_batch(),
                    WAKE => {}
                    _ => self.defer_event(event, &mut read_batch, &mut write_batch),
                }
            }

            self.flush_read(&mut read_batch, &mut write_batch);
            self.flush_write(&mut write_batch);
        }

        self.teardown();
        Ok(())
    }

    /// Sorts a connection event into the read or write batch, flushing a
    /// batch early when it is full. Stale deliveries are dropped silently:
    /// the pool lookup rejects tokens whose slot has been released and
    /// reacquired since the event was captured (generation mismatch), and
    /// records still in the Free or Closing state are skipped here. Without
    /// the generation check, a hangup event for a connection timed out
    /// earlier in this same iteration could tear down a fresh connection
    /// admitted into the reused slot.
    fn defer_event(
        &mut self,
        event: &Event,
        read_batch: &mut Vec<Token>,
        write_batch: &mut Vec<Token>,
    ) {
        let token = event.token();
        let state = match self.conns.get_mut(token) {
            Some(conn) => conn.state,
            None => return,
        };
        if matches!(state, State::Free | State::Closing) {
            return;
        }

        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            self.close(token, CloseReason::ClientDisconnect);
            return;
        }

        if event.is_readable() && matches!(state, State::Reading | State::KeepAlive) {
            if read_batch.len() == IO_BATCH {
                self.flush_read(read_batch, write_batch);
            }
            read_batch.push(token);
        }

        if event.is_writable() && state == State::Writing {
            if write_batch.len() == IO_BATCH {
                self.flush_write(write_batch);
            }
            write_batch.push(token);
        }
    }

    fn flush_read(&mut self, read_batch: &mut Vec<Token>, write_batch: &mut Vec<Token>) {
        for token in read_batch.drain(..) {
            if self.process_read(token) {
                if write_batch.len() == IO_BATCH {
                    self.flush_write(write_batch);
                }
                write_batch.push(token);
            }
        }
    }

    fn flush_write(&mut self, write_batch: &mut Vec<Token>) {
        for token in write_batch.drain(..) {
            self.process_write(token);
        }
    }

    /// Drives a readable connection. Returns true when a complete request
    /// was dispatched and the connection now has a response to write.
    fn process_read(&mut self, token: Token) -> bool {
        let now = Instant::now();

        let state = match self.conns.get_mut(token) {
            Some(conn) => conn.state,
            None => return false,
        };

        match state {
            State::KeepAlive => {
                // First bytes of the next request: swap the idle timer for
                // a request timer.
                if let Some(conn) = self.conns.get_mut(token) {
                    if let Some(handle) = conn.timer.take() {
                        self.timers.cancel(handle);
                    }
                    conn.state = State::Reading;
                }
                match self.timers.add(token, now + self.request_timeout) {
                    Some(handle) => {
                        if let Some(conn) = self.conns.get_mut(token) {
                            conn.timer = Some(handle);
                        }
                    }
                    None => {
                        self.close(token, CloseReason::Exhausted);
                        return false;
                    }
                }
            }
            State::Reading => {}
            _ => return false,
        }

        let prev_len;
        let outcome = match self.conns.get_mut(token) {
            Some(conn) => {
                prev_len = conn.read_len;
                conn.fill(RECV_ATTEMPTS)
            }
            None => return false,
        };

        match outcome {
            Ok(FillOutcome::Closed) => {
                self.close(token, CloseReason::ClientDisconnect);
                false
            }
            Ok(FillOutcome::Data(_)) => self.advance_read(token, prev_len),
            Err(e) => {
                self.close(token, CloseReason::Io(e));
                false
            }
        }
    }

    /// Validates newly read bytes and, once the end-of-headers sentinel is
    /// present, parses and dispatches the request.
    fn advance_read(&mut self, token: Token, prev_len: usize) -> bool {
        enum Action {
            Close(CloseReason),
            Rearm,
            Dispatch,
        }

        let action = match self.conns.get_mut(token) {
            None => return false,
            Some(conn) => {
                if conn.has_forbidden_ctl(prev_len) {
                    Action::Close(CloseReason::ForbiddenByte)
                } else if self.repeat_guard
                    && longest_repeat(&conn.read_buf[..conn.read_len.min(REPEAT_WINDOW)])
                        > REPEAT_LIMIT
                {
                    Action::Close(CloseReason::RepeatFlood)
                } else {
                    match conn.head_end() {
                        Some(head_len) if conn.read_len > head_len => {
                            Action::Close(CloseReason::Pipelined)
                        }
                        Some(head_len) => {
                            match conn.parser.parse(&conn.read_buf[..head_len]) {
                                Ok(ParseStatus::Complete(consumed)) if consumed == head_len => {
                                    Action::Dispatch
                                }
                                // The sentinel was present, so anything
                                // short of a full parse is malformed.
                                Ok(_) => Action::Close(CloseReason::Protocol(ParseError::NewLine)),
                                Err(e) => Action::Close(CloseReason::Protocol(e)),
                            }
                        }
                        None if conn.read_len >= MAX_REQUEST_BYTES => {
                            Action::Close(CloseReason::Oversized)
                        }
                        None => Action::Rearm,
                    }
                }
            }
        };

        match action {
            Action::Close(reason) => {
                self.close(token, reason);
                false
            }
            Action::Rearm => {
                self.rearm(token, Interest::READABLE);
                false
            }
            Action::Dispatch => {
                if let Some(conn) = self.conns.get_mut(token) {
                    if let Some(handle) = conn.timer.take() {
                        self.timers.cancel(handle);
                    }
                }

                let status = match self.conns.get_mut(token) {
                    Some(conn) => dispatch(conn, &self.ctx),
                    None => return false,
                };
                self.metrics.requests += 1;
                if status == Status::InternalServerError {
                    self.metrics.overflows += 1;
                }

                if let Some(conn) = self.conns.get_mut(token) {
                    trace!(
                        worker = self.id,
                        peer = ?conn.peer,
                        path = conn.target_str(),
                        status = status.code(),
                        "request dispatched"
                    );
                }
                true
            }
        }
    }

    /// Drives a writable connection until its scatter list drains or the
    /// socket pushes back.
    fn process_write(&mut self, token: Token) {
        let result = match self.conns.get_mut(token) {
            Some(conn) if conn.state == State::Writing => conn.write_pending(),
            _ => return,
        };

        match result {
            Ok(WriteOutcome::Drained) => self.finish_response(token),
            Ok(WriteOutcome::Blocked) => self.rearm(token, Interest::WRITABLE),
            Err(e) => self.close(token, CloseReason::Io(e)),
        }
    }

    /// Response fully on the wire: either rearm for the next request or
    /// close, per the keep-alive decision made at dispatch.
    fn finish_response(&mut self, token: Token) {
        let keep_alive = match self.conns.get_mut(token) {
            Some(conn) => conn.keep_alive,
            None => return,
        };

        if !keep_alive {
            self.close(token, CloseReason::Done);
            return;
        }

        if let Some(conn) = self.conns.get_mut(token) {
            conn.reset_for_keep_alive();
        }
        match self.timers.add(token, Instant::now() + self.keepalive_timeout) {
            Some(handle) => {
                if let Some(conn) = self.conns.get_mut(token) {
                    conn.timer = Some(handle);
                }
            }
            None => {
                self.close(token, CloseReason::Exhausted);
                return;
            }
        }
        self.rearm(token, Interest::READABLE);
    }

    /// Accepts up to a batch of connections, configuring and registering
    /// each. Pool exhaustion drops the descriptor on the floor rather than
    /// queueing it.
    fn accept_batch(&mut self) {
        let now = Instant::now();

        for _ in 0..ACCEPT_BATCH {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, now),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "accept failed");
                    return;
                }
            }
        }

        // Batch limit hit without draining the queue. Edge semantics mean
        // no further event until a new connection arrives, so re-arm the
        // listener to get the remainder redelivered.
        let registry = self.poll.registry();
        if let Err(e) = registry.reregister(&mut self.listener, LISTENER, Interest::READABLE) {
            warn!(worker = self.id, error = %e, "listener re-arm failed");
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        if let Err(e) = listener::configure_accepted(&stream) {
            debug!(worker = self.id, peer = %peer, error = %e, "socket setup failed");
            return;
        }

        let Some(token) = self.conns.acquire() else {
            self.metrics.exhausted += 1;
            debug!(worker = self.id, peer = %peer, "connection pool exhausted, dropping accept");
            return;
        };

        let registry = self.poll.registry();
        let register_err = {
            let conn = match self.conns.get_mut(token) {
                Some(conn) => conn,
                None => return,
            };
            conn.attach(stream, peer);
            conn.register(registry, token, Interest::READABLE).err()
        };
        if let Some(e) = register_err {
            self.close(token, CloseReason::Io(e));
            return;
        }

        match self.timers.add(token, now + self.request_timeout) {
            Some(handle) => {
                if let Some(conn) = self.conns.get_mut(token) {
                    conn.timer = Some(handle);
                }
            }
            None => {
                self.close(token, CloseReason::Exhausted);
                return;
            }
        }

        self.metrics.accepted += 1;
        trace!(worker = self.id, peer = %peer, token = token.0, "accepted connection");
    }

    /// Re-arms readiness interest; a failed re-arm orphans the connection,
    /// so it is closed instead.
    fn rearm(&mut self, token: Token, interest: Interest) {
        let registry = self.poll.registry();
        let err = match self.conns.get_mut(token) {
            Some(conn) => conn.reregister(registry, token, interest).err(),
            None => None,
        };
        if let Some(e) = err {
            self.close(token, CloseReason::Io(e));
        }
    }

    /// Tears a connection down: cancel its timer, deregister, close the
    /// descriptor, and return the record to the pool. Safe to call with a
    /// stale token.
    fn close(&mut self, token: Token, reason: CloseReason) {
        let registry = self.poll.registry();
        let peer = {
            let Some(conn) = self.conns.get_mut(token) else {
                return;
            };
            if conn.state == State::Free {
                return;
            }
            let peer = conn.peer;
            conn.state = State::Closing;
            if let Some(handle) = conn.timer.take() {
                self.timers.cancel(handle);
            }
            let _ = conn.deregister(registry);
            drop(conn.detach());
            peer
        };

        match &reason {
            CloseReason::Done | CloseReason::ClientDisconnect | CloseReason::Shutdown => {
                trace!(worker = self.id, peer = ?peer, reason = %reason, "closing connection");
            }
            _ => {
                debug!(worker = self.id, peer = ?peer, reason = %reason, "closing connection");
            }
        }

        self.metrics.record_close(&reason);
        self.conns.release(token);
    }

    fn teardown(&mut self) {
        for token in self.conns.live_tokens() {
            self.close(token, CloseReason::Shutdown);
        }
        self.metrics.report(self.id);
    }
}

/// Length of the longest run of one repeated byte in `buf`.
fn longest_repeat(buf: &[u8]) -> usize {
    let mut longest = 0;
    let mut run = 0;
    let mut prev = None;

    for &b in buf {
        if Some(b) == prev {
            run += 1;
        } else {
            prev = Some(b);
            run = 1;
        }
        longest = longest.max(run);
    }

    longest
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longest_repeat_finds_the_maximum_run() {
        assert_eq!(0, longest_repeat(b""));
        assert_eq!(1, longest_repeat(b"abc"));
        assert_eq!(3, longest_repeat(b"abbbca"));
        assert_eq!(4, longest_repeat(b"aaaabbb"));
    }

    #[test]
    fn repeat_window_tolerates_ordinary_requests() {
        let head = b"GET /health HTTP/1.1\r\nHost: h\r\nUser-Agent: wrk/4.2.0\r\n\r\n";
        assert!(longest_repeat(head) <= REPEAT_LIMIT);
    }

    #[test]
    fn repeat_guard_threshold_catches_floods() {
        let mut flood = Vec::new();
        flood.extend_from_slice(b"GET /");
        flood.extend(std::iter::repeat(b'a').take(200));
        assert!(longest_repeat(&flood[..flood.len().min(REPEAT_WINDOW)]) > REPEAT_LIMIT);
    }
}
