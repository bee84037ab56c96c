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

//! The fixed route table.
//!
//! Built once at startup and handed to every worker behind an `Arc`; never
//! mutated afterwards, so lookups need no synchronization. Matching is
//! case-sensitive and exact, after the query string has been stripped by
//! the dispatcher.

/// Immutable mapping from path to static JSON body.
#[derive(Debug)]
pub struct RouteTable {
    routes: &'static [(&'static str, &'static [u8])],
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    /// Builds the table with the fixed BFF endpoint set.
    pub fn new() -> Self {
        Self {
            routes: &[
                ("/bonuses", br#"{"bonuses":[10,20,30]}"#),
                ("/settings", br#"{"settings":{"theme":"dark"}}"#),
                ("/games", br#"{"games":["chess","poker"]}"#),
                ("/health", br#"{"status":"OK"}"#),
            ],
        }
    }

    /// Exact-match lookup. The handful of routes makes a linear scan
    /// cheaper than any hashing.
    pub fn lookup(&self, path: &[u8]) -> Option<&'static [u8]> {
        self.routes
            .iter()
            .find(|(route, _)| route.as_bytes() == path)
            .map(|&(_, body)| body)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_routes_resolve_to_their_bodies() {
        let table = RouteTable::new();
        assert_eq!(
            Some(br#"{"status":"OK"}"# as &[u8]),
            table.lookup(b"/health")
        );
        assert_eq!(
            Some(br#"{"bonuses":[10,20,30]}"# as &[u8]),
            table.lookup(b"/bonuses")
        );
        assert_eq!(
            Some(br#"{"settings":{"theme":"dark"}}"# as &[u8]),
            table.lookup(b"/settings")
        );
        assert_eq!(
            Some(br#"{"games":["chess","poker"]}"# as &[u8]),
            table.lookup(b"/games")
        );
    }

    #[test]
    fn lookup_is_case_sensitive_and_exact() {
        let table = RouteTable::new();
        assert_eq!(None, table.lookup(b"/Health"));
        assert_eq!(None, table.lookup(b"/health/"));
        assert_eq!(None, table.lookup(b"/"));
        assert_eq!(None, table.lookup(b""));
    }
}
