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

//! HTTP/1.1 request head parsing
//! IETF RFC 9112

use core::fmt;
use core::str::from_utf8_unchecked;

use super::tokens::{is_header_name_token, is_header_value_token, is_request_target_token};
use super::{ParseError, ParseResult, Status};
use crate::raw_request::RawRequest;
use crate::{Method, Version};

/// Upper bound on the request target, in bytes.
pub const MAX_TARGET_LEN: usize = 255;

/// A reusable HTTP/1.1 request-head parser.
///
/// The parser owns its output: the target is copied into a fixed internal
/// buffer so the instance can outlive the read buffer it was fed from and be
/// embedded in a pooled connection record. [`reset`](H1Request::reset)
/// rearms it for the next request on a keep-alive connection.
///
/// A parse that returns [`Status::Partial`] leaves no state behind; the next
/// invocation restarts from the beginning of the buffer. Callers are
/// expected to gate invocations on the `\r\n\r\n` sentinel, so the restart
/// never happens more than once per request in practice.
///
/// # Example
/// ```
/// # use bff_parser::{Method, Version};
/// # use bff_parser::h1::{ParseError, Status};
/// # use bff_parser::h1::request::H1Request;
/// # fn main() -> Result<(), ParseError> {
/// let mut req = H1Request::new();
/// let status = req.parse(b"GET /health HTTP/1.1\r\nHost: h\r\n\r\n")?;
/// assert_eq!(Status::Complete(33), status);
/// assert_eq!(Some(Method::Get), req.method);
/// assert_eq!(Some("/health"), req.target());
/// assert_eq!(Some(Version::H1_1), req.version);
/// assert!(req.keep_alive());
/// # Ok(())
/// # }
/// ```
pub struct H1Request {
    /// Parsed request method.
    pub method: Option<Method>,
    /// Parsed protocol version.
    pub version: Option<Version>,
    target: [u8; MAX_TARGET_LEN],
    target_len: u8,
    keep_alive: bool,
}

impl Default for H1Request {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for H1Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H1Request")
            .field("method", &self.method)
            .field("target", &self.target())
            .field("version", &self.version)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl H1Request {
    /// Creates an empty parser.
    pub fn new() -> Self {
        H1Request {
            method: None,
            version: None,
            target: [0; MAX_TARGET_LEN],
            target_len: 0,
            keep_alive: false,
        }
    }

    /// Clears parsed state so the instance can take the next request.
    /// The target buffer's bytes are reused as-is.
    pub fn reset(&mut self) {
        self.method = None;
        self.version = None;
        self.target_len = 0;
        self.keep_alive = false;
    }

    /// The request target, available once the request line has parsed.
    #[inline]
    pub fn target(&self) -> Option<&str> {
        if self.target_len == 0 {
            return None;
        }

        let bytes = &self.target[..self.target_len as usize];
        // SAFETY: every byte was checked against the target token table,
        // which only admits ASCII, so this is valid UTF-8.
        Some(unsafe { from_utf8_unchecked(bytes) })
    }

    /// Whether the connection should be kept open after the response,
    /// derived per RFC 7230: HTTP/1.1 defaults on unless `Connection:
    /// close`; HTTP/1.0 defaults off unless `Connection: keep-alive`.
    ///
    /// Meaningful only after a [`Status::Complete`] parse.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Parses a request head from `buf`.
    ///
    /// On success returns [`Status::Complete`] with the number of bytes
    /// consumed, up to and including the terminating empty line. Bytes past
    /// that boundary are left untouched; the server treats their presence
    /// within a single read as a protocol error.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Status> {
        self.reset();

        let mut cur = RawRequest::new(buf);
        if !self.set_method(&mut cur)? {
            return Ok(Status::Partial);
        }
        if !self.set_target(&mut cur)? {
            return Ok(Status::Partial);
        }
        if !self.set_version(&mut cur)? {
            return Ok(Status::Partial);
        }
        if !self.set_headers(&mut cur)? {
            return Ok(Status::Partial);
        }

        Ok(Status::Complete(buf.len() - cur.len()))
    }

    fn set_method(&mut self, cur: &mut RawRequest<'_>) -> ParseResult<bool> {
        loop {
            match cur.next() {
                Some(&b' ') => break,
                Some(&b) if b.is_ascii_uppercase() => {}
                Some(_) => return Err(ParseError::Method),
                None => return Ok(false),
            }
        }

        let slice = cur.slice_skip(1).map_err(|_| ParseError::Method)?;
        self.method = Some(match slice {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            _ => return Err(ParseError::Method),
        });

        Ok(true)
    }

    fn set_target(&mut self, cur: &mut RawRequest<'_>) -> ParseResult<bool> {
        match cur.peek() {
            Some(b'/') => {}
            Some(_) => return Err(ParseError::Target),
            None => return Ok(false),
        }

        let mut prev = 0u8;
        let mut len = 0usize;
        loop {
            match cur.next() {
                Some(&b' ') => break,
                Some(&b) if is_request_target_token(b) => {
                    if (b == b'.' && prev == b'.') || (b == b'/' && prev == b'/') {
                        return Err(ParseError::Target);
                    }
                    len += 1;
                    if len > MAX_TARGET_LEN {
                        return Err(ParseError::Target);
                    }
                    prev = b;
                }
                Some(_) => return Err(ParseError::Target),
                None => return Ok(false),
            }
        }

        let slice = cur.slice_skip(1).map_err(|_| ParseError::Target)?;
        self.target[..slice.len()].copy_from_slice(slice);
        self.target_len = slice.len() as u8;

        Ok(true)
    }

    fn set_version(&mut self, cur: &mut RawRequest<'_>) -> ParseResult<bool> {
        for &want in b"HTTP/1." {
            match cur.next() {
                Some(&b) if b == want => {}
                Some(_) => return Err(ParseError::Version),
                None => return Ok(false),
            }
        }

        let version = match cur.next() {
            Some(&b'0') => Version::H1_0,
            Some(&b'1') => Version::H1_1,
            Some(_) => return Err(ParseError::Version),
            None => return Ok(false),
        };

        match cur.next() {
            Some(&b'\r') => {}
            Some(_) => return Err(ParseError::NewLine),
            None => return Ok(false),
        }
        match cur.next() {
            Some(&b'\n') => {}
            Some(_) => return Err(ParseError::NewLine),
            None => return Ok(false),
        }

        cur.slice();
        self.version = Some(version);

        Ok(true)
    }

    fn set_headers(&mut self, cur: &mut RawRequest<'_>) -> ParseResult<bool> {
        let mut saw_close = false;
        let mut saw_keep_alive = false;

        loop {
            if cur.peek() == Some(b'\r') {
                cur.next();
                match cur.next() {
                    Some(&b'\n') => {
                        cur.slice();
                        break;
                    }
                    Some(_) => return Err(ParseError::NewLine),
                    None => return Ok(false),
                }
            }

            let name = loop {
                match cur.next() {
                    Some(&b':') => {
                        break cur.slice_skip(1).map_err(|_| ParseError::HeaderName)?
                    }
                    Some(&b) if is_header_name_token(b) => {}
                    Some(_) => return Err(ParseError::HeaderName),
                    None => return Ok(false),
                }
            };
            if name.is_empty() {
                return Err(ParseError::HeaderName);
            }

            while matches!(cur.peek(), Some(b' ') | Some(b'\t')) {
                cur.next();
            }
            cur.slice();

            let value = loop {
                match cur.next() {
                    Some(&b'\r') => {
                        break cur.slice_skip(1).map_err(|_| ParseError::HeaderValue)?
                    }
                    Some(&b) if is_header_value_token(b) => {}
                    Some(_) => return Err(ParseError::HeaderValue),
                    None => return Ok(false),
                }
            };
            match cur.next() {
                Some(&b'\n') => {
                    cur.slice();
                }
                Some(_) => return Err(ParseError::NewLine),
                None => return Ok(false),
            }

            self.inspect_header(name, trim_ows(value), &mut saw_close, &mut saw_keep_alive)?;
        }

        self.keep_alive = match self.version {
            Some(Version::H1_1) => !saw_close,
            Some(Version::H1_0) => saw_keep_alive && !saw_close,
            None => false,
        };

        Ok(true)
    }

    fn inspect_header(
        &mut self,
        name: &[u8],
        value: &[u8],
        saw_close: &mut bool,
        saw_keep_alive: &mut bool,
    ) -> ParseResult<()> {
        if name.eq_ignore_ascii_case(b"content-length") {
            let length = parse_decimal(value).ok_or(ParseError::Body)?;
            if length != 0 {
                return Err(ParseError::Body);
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            return Err(ParseError::Body);
        } else if name.eq_ignore_ascii_case(b"upgrade") {
            return Err(ParseError::Upgrade);
        } else if name.eq_ignore_ascii_case(b"connection") {
            for token in value.split(|&b| b == b',') {
                let token = trim_ows(token);
                if token.eq_ignore_ascii_case(b"close") {
                    *saw_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    *saw_keep_alive = true;
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    return Err(ParseError::Upgrade);
                }
            }
        }

        Ok(())
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_decimal(value: &[u8]) -> Option<u64> {
    if value.is_empty() {
        return None;
    }

    let mut n: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(n)
}
