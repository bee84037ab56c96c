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

//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

/// Runtime configuration, settable from the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "bff", about = "HTTP/1.1 front-end serving fixed JSON endpoints")]
pub struct Config {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// TCP port to listen on; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Worker threads; 0 means one per available CPU.
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Connection records preallocated per worker.
    #[arg(long, default_value_t = 1024)]
    pub connections: usize,

    /// Connection records in the shared fallback pool, drawn on when a
    /// worker's own records run out.
    #[arg(long, default_value_t = 256)]
    pub fallback_connections: usize,

    /// How long a client may take to deliver a complete request head.
    #[arg(long, default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// How long an idle keep-alive connection is kept around.
    #[arg(long, default_value_t = 10_000)]
    pub keepalive_timeout_ms: u64,

    /// Reject heads consisting mostly of one repeated byte. Heuristic, not
    /// part of HTTP; off by default.
    #[arg(long)]
    pub repeat_guard: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            workers: 0,
            connections: 1024,
            fallback_connections: 256,
            request_timeout_ms: 5_000,
            keepalive_timeout_ms: 10_000,
            repeat_guard: false,
        }
    }
}

impl Config {
    /// The socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Worker count with the CPU-count default applied.
    pub fn effective_workers(&self) -> usize {
        if self.workers != 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Request-phase deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Keep-alive idle deadline.
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_deadlines() {
        let cfg = Config::default();
        assert_eq!(8080, cfg.port);
        assert_eq!(Duration::from_secs(5), cfg.request_timeout());
        assert_eq!(Duration::from_secs(10), cfg.keepalive_timeout());
        assert!(!cfg.repeat_guard);
    }

    #[test]
    fn effective_workers_defaults_to_parallelism() {
        let cfg = Config::default();
        assert!(cfg.effective_workers() >= 1);

        let cfg = Config {
            workers: 3,
            ..Config::default()
        };
        assert_eq!(3, cfg.effective_workers());
    }
}
