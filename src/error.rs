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

//! Why a connection is being closed.
//!
//! Every failure in the event loop is local to one connection and resolves
//! to a close; nothing here is fatal to the worker.

use std::io;

use bff_parser::h1::ParseError;
use thiserror::Error;

/// The reason a connection was torn down. Fed to the metrics sink and the
/// per-close log line.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// Response fully written on a connection that did not negotiate
    /// keep-alive.
    #[error("request complete")]
    Done,
    /// The peer closed its end (zero-byte read or hangup event).
    #[error("client disconnected")]
    ClientDisconnect,
    /// A socket operation failed with something other than `WouldBlock`.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The request head failed to parse.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    /// Bytes followed the end-of-headers sentinel within one read;
    /// pipelining is unsupported.
    #[error("trailing bytes after request head")]
    Pipelined,
    /// The head did not terminate within the request size ceiling.
    #[error("request head too large")]
    Oversized,
    /// A control byte with no business in a request head arrived.
    #[error("control byte in request head")]
    ForbiddenByte,
    /// The repeated-byte guard tripped (optional policy).
    #[error("repeated-byte flood")]
    RepeatFlood,
    /// A request or keep-alive deadline expired.
    #[error("deadline expired")]
    Timeout,
    /// Connection records or timer nodes ran out; the descriptor is
    /// dropped rather than queued.
    #[error("resources exhausted")]
    Exhausted,
    /// The worker is shutting down.
    #[error("worker shutting down")]
    Shutdown,
}
