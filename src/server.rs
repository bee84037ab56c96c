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

//! Process bootstrap: spawn the workers, hand out shared state, tear
//! everything down on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatch::DispatchCtx;
use crate::listener;
use crate::pool::FallbackPool;
use crate::route::RouteTable;
use crate::worker::Worker;

/// A running server: N pinned worker threads, each with its own listener
/// on the same address.
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Waker>,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds the listeners and spawns the workers.
    ///
    /// The first listener is bound before any worker starts so that a
    /// configured port of 0 resolves to one ephemeral port shared by every
    /// worker.
    pub fn start(cfg: Config) -> io::Result<Self> {
        let routes = Arc::new(RouteTable::new());
        let shared = Arc::new(FallbackPool::new(cfg.fallback_connections));
        let shutdown = Arc::new(AtomicBool::new(false));

        let first = listener::bind(cfg.addr())?;
        let addr = first.local_addr()?;
        let mut first = Some(first);

        let worker_count = cfg.effective_workers();
        let mut handles = Vec::with_capacity(worker_count);
        let mut wakers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let listener = match first.take() {
                Some(listener) => listener,
                None => listener::bind(addr)?,
            };

            let ctx = DispatchCtx {
                routes: Arc::clone(&routes),
                keep_alive_timeout_secs: cfg.keepalive_timeout_ms / 1000,
            };
            let (mut worker, waker) = Worker::new(
                id,
                &cfg,
                listener,
                ctx,
                Arc::clone(&shared),
                Arc::clone(&shutdown),
            )?;
            wakers.push(waker);

            let handle = thread::Builder::new()
                .name(format!("bff-worker-{id}"))
                .spawn(move || {
                    pin_to_cpu(id);
                    if let Err(e) = worker.run() {
                        error!(worker = id, error = %e, "worker failed");
                    }
                })?;
            handles.push(handle);
        }

        info!(addr = %addr, workers = worker_count, "server started");

        Ok(Self {
            addr,
            shutdown,
            wakers,
            handles,
        })
    }

    /// The address the workers are actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Raises the shutdown flag, wakes every worker out of its poll, and
    /// joins the threads. Live connections are closed by the workers on
    /// their way out.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for waker in &self.wakers {
            let _ = waker.wake();
        }
        for handle in self.handles {
            let _ = handle.join();
        }
        info!("server stopped");
    }
}

/// Blocks the calling thread until INT or TERM arrives. PIPE is already
/// ignored by the Rust runtime, so a dying peer never kills the process.
pub fn wait_for_termination() -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    signals.forever().next();
    Ok(())
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(index: usize) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(index % cpus, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::debug!(worker = index, "could not pin worker thread");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_index: usize) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_and_stops_on_an_ephemeral_port() {
        let cfg = Config {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            workers: 1,
            connections: 8,
            fallback_connections: 2,
            ..Config::default()
        };

        let server = Server::start(cfg).unwrap();
        assert_ne!(0, server.local_addr().port());
        server.shutdown();
    }
}
