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

//! Request dispatch: route lookup and response preparation.

use std::sync::Arc;

use bff_parser::h1::request::MAX_TARGET_LEN;
use bff_parser::Method;

use crate::connection::{Conn, State};
use crate::response::{
    format_head, Status, BAD_REQUEST_BODY, CANNED_500, METHOD_NOT_ALLOWED_BODY, NOT_FOUND_BODY,
};
use crate::route::RouteTable;

/// Shared dispatch inputs, one per worker.
#[derive(Debug, Clone)]
pub struct DispatchCtx {
    /// Immutable route table shared across workers.
    pub routes: Arc<RouteTable>,
    /// Advertised in the `Keep-Alive: timeout=` response header.
    pub keep_alive_timeout_secs: u64,
}

/// Decides status, body, and whether keep-alive is permitted for a parsed
/// request. Error responses always close.
fn route_decision(
    method: Option<Method>,
    path: &[u8],
    routes: &RouteTable,
) -> (Status, &'static [u8], bool) {
    if path.is_empty() || path[0] != b'/' {
        return (Status::BadRequest, BAD_REQUEST_BODY, false);
    }

    if method != Some(Method::Get) {
        return (Status::MethodNotAllowed, METHOD_NOT_ALLOWED_BODY, false);
    }

    match routes.lookup(path) {
        Some(body) => (Status::Ok, body, true),
        None => (Status::NotFound, NOT_FOUND_BODY, false),
    }
}

/// Prepares the response for the request held in `conn`'s parser and moves
/// the connection to [`State::Writing`].
///
/// The target is copied locally and truncated at `?` before routing. If
/// the head does not fit the connection's scratch, the pre-rendered 500 is
/// substituted and keep-alive disabled. Returns the chosen status for
/// logging and metrics.
pub fn dispatch(conn: &mut Conn, ctx: &DispatchCtx) -> Status {
    conn.remember_target();

    let mut path_buf = [0u8; MAX_TARGET_LEN];
    let target = conn.target_str().as_bytes();
    let path_len = memchr::memchr(b'?', target).unwrap_or(target.len());
    path_buf[..path_len].copy_from_slice(&target[..path_len]);
    let path = &path_buf[..path_len];

    let (mut status, body, keep_alive_allowed) =
        route_decision(conn.parser.method, path, &ctx.routes);
    let mut keep_alive = keep_alive_allowed && conn.parser.keep_alive();

    match format_head(
        &mut conn.hdr_buf,
        status,
        body.len(),
        keep_alive,
        ctx.keep_alive_timeout_secs,
    ) {
        Some(len) => {
            conn.hdr_len = len;
            conn.body = body;
        }
        None => {
            status = Status::InternalServerError;
            keep_alive = false;
            conn.hdr_buf[..CANNED_500.len()].copy_from_slice(CANNED_500);
            conn.hdr_len = CANNED_500.len();
            conn.body = &[];
        }
    }

    conn.keep_alive = keep_alive;
    conn.bytes_sent = 0;
    conn.state = State::Writing;

    status
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx() -> DispatchCtx {
        DispatchCtx {
            routes: Arc::new(RouteTable::new()),
            keep_alive_timeout_secs: 10,
        }
    }

    fn conn_with_request(head: &[u8]) -> Conn {
        let mut conn = Conn::new();
        conn.scrub();
        conn.parser.parse(head).expect("test request must parse");
        conn
    }

    fn head_str(conn: &Conn) -> &str {
        std::str::from_utf8(&conn.hdr_buf[..conn.hdr_len]).unwrap()
    }

    #[test]
    fn health_request_prepares_the_documented_response() {
        let mut conn = conn_with_request(b"GET /health HTTP/1.1\r\nHost: h\r\n\r\n");
        let status = dispatch(&mut conn, &ctx());

        assert_eq!(Status::Ok, status);
        assert_eq!(State::Writing, conn.state);
        assert_eq!(0, conn.bytes_sent);
        assert!(conn.keep_alive);
        assert_eq!(br#"{"status":"OK"}"# as &[u8], conn.body);
        assert_eq!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: 15\r\n\
             Server: BFF/1.0\r\n\
             X-Content-Type-Options: nosniff\r\n\
             X-Frame-Options: DENY\r\n\
             Connection: keep-alive\r\n\
             Keep-Alive: timeout=10\r\n\
             \r\n",
            head_str(&conn)
        );
    }

    #[test]
    fn query_string_is_stripped_before_routing() {
        let mut conn = conn_with_request(b"GET /games?sort=name HTTP/1.1\r\n\r\n");
        let status = dispatch(&mut conn, &ctx());
        assert_eq!(Status::Ok, status);
        assert_eq!(br#"{"games":["chess","poker"]}"# as &[u8], conn.body);
    }

    #[test]
    fn unknown_route_is_404_and_closes() {
        let mut conn =
            conn_with_request(b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        let status = dispatch(&mut conn, &ctx());

        assert_eq!(Status::NotFound, status);
        assert!(!conn.keep_alive);
        assert_eq!(br#"{"error":"Not Found"}"# as &[u8], conn.body);
        assert!(head_str(&conn).contains("Connection: close\r\n"));
    }

    #[test]
    fn non_get_method_is_405_and_closes() {
        let mut conn =
            conn_with_request(b"POST /health HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        let status = dispatch(&mut conn, &ctx());

        assert_eq!(Status::MethodNotAllowed, status);
        assert!(!conn.keep_alive);
        assert_eq!(br#"{"error":"Method Not Allowed"}"# as &[u8], conn.body);
        assert!(head_str(&conn).contains("Connection: close\r\n"));
    }

    #[test]
    fn keep_alive_respects_the_request_preference() {
        let mut conn =
            conn_with_request(b"GET /health HTTP/1.1\r\nConnection: close\r\n\r\n");
        dispatch(&mut conn, &ctx());
        assert!(!conn.keep_alive);

        let mut conn = conn_with_request(b"GET /health HTTP/1.0\r\n\r\n");
        dispatch(&mut conn, &ctx());
        assert!(!conn.keep_alive);
    }

    #[test]
    fn invalid_revalidated_target_is_400() {
        let routes = RouteTable::new();
        let (status, body, keep_alive) = route_decision(Some(Method::Get), b"", &routes);
        assert_eq!(Status::BadRequest, status);
        assert_eq!(BAD_REQUEST_BODY, body);
        assert!(!keep_alive);

        let (status, _, _) = route_decision(Some(Method::Get), b"health", &routes);
        assert_eq!(Status::BadRequest, status);
    }
}
