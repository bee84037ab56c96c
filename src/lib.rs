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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! bff is a high-throughput HTTP/1.1 front-end serving a small, fixed set
//! of JSON endpoints.
//!
//! The payloads are static byte strings; the engineering lives in the
//! event-driven core. Each worker thread is a self-contained reactor — its
//! own `SO_REUSEPORT` listener, readiness poll, connection record pool,
//! and timer heap — so the hot path shares no mutable state between
//! threads. See [`worker`] for the loop itself and [`server`] for the
//! bootstrap.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod response;
pub mod route;
pub mod server;
pub mod timer;
pub mod worker;
