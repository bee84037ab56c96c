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

//! Listening and accepted-socket setup.
//!
//! Every worker binds its own listener to the same address with
//! `SO_REUSEPORT`, giving it a private accept queue that the kernel load
//! balances across; a new connection wakes exactly one worker and no
//! user-space coordination is involved.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Requested listen backlog; the kernel clamps it to its own maximum.
const LISTEN_BACKLOG: i32 = 65_535;

/// Send buffer for accepted sockets: large enough that a full response
/// never blocks mid-write under normal conditions.
const SEND_BUFFER_BYTES: usize = 64 * 1024;

/// Receive buffer for accepted sockets; request heads are small.
const RECV_BUFFER_BYTES: usize = 32 * 1024;

/// Binds a non-blocking listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Applies the per-connection socket options to a freshly accepted stream.
/// Non-blocking and close-on-exec are already set by the accept path.
pub fn configure_accepted(stream: &TcpStream) -> io::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let sock = SockRef::from(&fd);
    sock.set_nodelay(true)?;
    sock.set_send_buffer_size(SEND_BUFFER_BYTES)?;
    sock.set_recv_buffer_size(RECV_BUFFER_BYTES)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_resolves_ephemeral_ports() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(0, addr.port());
    }

    #[cfg(unix)]
    #[test]
    fn reuseport_allows_parallel_binds() {
        let first = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind(addr).expect("second bind to the same port should succeed");
        assert_eq!(addr.port(), second.local_addr().unwrap().port());
    }
}
