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

//! Per-worker counters.
//!
//! Workers are single-threaded, so plain integers suffice; the sink is a
//! structured log line emitted when the worker exits.

use tracing::info;

use crate::error::CloseReason;

/// Event counters owned by one worker.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Connections accepted.
    pub accepted: u64,
    /// Requests dispatched to the route table.
    pub requests: u64,
    /// Connections closed, for any reason.
    pub closed: u64,
    /// Closes due to the peer going away.
    pub client_disconnects: u64,
    /// Closes due to a fatal socket error.
    pub io_errors: u64,
    /// Closes due to a malformed or unsupported request.
    pub protocol_errors: u64,
    /// Closes due to an expired request or keep-alive deadline.
    pub timeouts: u64,
    /// Accepts dropped or connections closed for lack of records or timer
    /// nodes.
    pub exhausted: u64,
    /// Responses replaced by the canned 500 because the head overflowed
    /// the scratch buffer.
    pub overflows: u64,
}

impl Metrics {
    /// Attributes a close to its reason.
    pub fn record_close(&mut self, reason: &CloseReason) {
        self.closed += 1;
        match reason {
            CloseReason::Done | CloseReason::Shutdown => {}
            CloseReason::ClientDisconnect => self.client_disconnects += 1,
            CloseReason::Io(_) => self.io_errors += 1,
            CloseReason::Protocol(_)
            | CloseReason::Pipelined
            | CloseReason::Oversized
            | CloseReason::ForbiddenByte
            | CloseReason::RepeatFlood => self.protocol_errors += 1,
            CloseReason::Timeout => self.timeouts += 1,
            CloseReason::Exhausted => self.exhausted += 1,
        }
    }

    /// Emits the final tally.
    pub fn report(&self, worker: usize) {
        info!(
            worker,
            accepted = self.accepted,
            requests = self.requests,
            closed = self.closed,
            client_disconnects = self.client_disconnects,
            io_errors = self.io_errors,
            protocol_errors = self.protocol_errors,
            timeouts = self.timeouts,
            exhausted = self.exhausted,
            overflows = self.overflows,
            "worker exiting"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bff_parser::h1::ParseError;

    #[test]
    fn closes_are_attributed_by_reason() {
        let mut metrics = Metrics::default();

        metrics.record_close(&CloseReason::Done);
        metrics.record_close(&CloseReason::ClientDisconnect);
        metrics.record_close(&CloseReason::Protocol(ParseError::Target));
        metrics.record_close(&CloseReason::Oversized);
        metrics.record_close(&CloseReason::Timeout);

        assert_eq!(5, metrics.closed);
        assert_eq!(1, metrics.client_disconnects);
        assert_eq!(2, metrics.protocol_errors);
        assert_eq!(1, metrics.timeouts);
        assert_eq!(0, metrics.io_errors);
    }
}
