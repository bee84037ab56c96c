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

//! Response status codes and head formatting.

use std::fmt::Display;
use std::io::{Cursor, Write};

/// Http Status Codes served by the BFF
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.5
    NotFound = 404,
    /// 15.5.6
    MethodNotAllowed = 405,
    /// 15.6.1
    InternalServerError = 500,
}

impl Status {
    /// Numeric status code.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Canonical reason phrase.
    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Body served with 400 responses.
pub const BAD_REQUEST_BODY: &[u8] = br#"{"error":"Bad Request"}"#;
/// Body served with 404 responses.
pub const NOT_FOUND_BODY: &[u8] = br#"{"error":"Not Found"}"#;
/// Body served with 405 responses.
pub const METHOD_NOT_ALLOWED_BODY: &[u8] = br#"{"error":"Method Not Allowed"}"#;
/// Body served with 500 responses.
pub const INTERNAL_ERROR_BODY: &[u8] = br#"{"error":"Internal Server Error"}"#;

/// Complete pre-rendered 500 response, substituted when formatting a head
/// into the connection scratch fails. Always closes the connection.
pub const CANNED_500: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Type: application/json\r\n\
Content-Length: 33\r\n\
Server: BFF/1.0\r\n\
X-Content-Type-Options: nosniff\r\n\
X-Frame-Options: DENY\r\n\
Connection: close\r\n\
\r\n\
{\"error\":\"Internal Server Error\"}";

/// Formats a response head into `scratch` and returns its length, or
/// `None` when the head does not fit (the caller substitutes
/// [`CANNED_500`]).
///
/// The head is always spoken as HTTP/1.1; 1.0 clients negotiated
/// keep-alive explicitly or get `Connection: close`.
pub fn format_head(
    scratch: &mut [u8],
    status: Status,
    content_length: usize,
    keep_alive: bool,
    keep_alive_timeout_secs: u64,
) -> Option<usize> {
    let mut cur = Cursor::new(scratch);

    write!(
        cur,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Server: BFF/1.0\r\n\
         X-Content-Type-Options: nosniff\r\n\
         X-Frame-Options: DENY\r\n",
        status.code(),
        status.reason(),
        content_length
    )
    .ok()?;

    if keep_alive {
        write!(
            cur,
            "Connection: keep-alive\r\nKeep-Alive: timeout={keep_alive_timeout_secs}\r\n\r\n"
        )
        .ok()?;
    } else {
        write!(cur, "Connection: close\r\n\r\n").ok()?;
    }

    Some(cur.position() as usize)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::HEADER_SCRATCH_BYTES;

    #[test]
    fn formats_the_documented_health_head() {
        let mut scratch = [0u8; HEADER_SCRATCH_BYTES];
        let len = format_head(&mut scratch, Status::Ok, 15, true, 10).unwrap();
        assert_eq!(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: application/json\r\n\
              Content-Length: 15\r\n\
              Server: BFF/1.0\r\n\
              X-Content-Type-Options: nosniff\r\n\
              X-Frame-Options: DENY\r\n\
              Connection: keep-alive\r\n\
              Keep-Alive: timeout=10\r\n\
              \r\n" as &[u8],
            &scratch[..len]
        );
    }

    #[test]
    fn close_variant_omits_keep_alive_header() {
        let mut scratch = [0u8; HEADER_SCRATCH_BYTES];
        let len = format_head(&mut scratch, Status::NotFound, 21, false, 10).unwrap();
        let head = std::str::from_utf8(&scratch[..len]).unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Keep-Alive"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn overflowing_scratch_reports_none() {
        let mut scratch = [0u8; 32];
        assert_eq!(None, format_head(&mut scratch, Status::Ok, 15, true, 10));
    }

    #[test]
    fn canned_500_is_internally_consistent() {
        let head_end = CANNED_500
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        let body = &CANNED_500[head_end..];
        assert_eq!(INTERNAL_ERROR_BODY, body);

        let head = std::str::from_utf8(&CANNED_500[..head_end]).unwrap();
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(head.contains("Connection: close\r\n"));
        assert!(CANNED_500.len() <= HEADER_SCRATCH_BYTES);
    }
}
