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

//! H1 request parser implementation

use core::fmt::Display;

pub mod request;
mod tokens;

/// Represents possible failures while parsing.
///
/// Every variant closes the connection; none of them produce a wire
/// response on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method.
    Method,
    /// Invalid byte in target, target too long, or a forbidden `..` / `//`
    /// sequence.
    Target,
    /// HTTP version other than 1.0 or 1.1.
    Version,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
    /// The request declares a body; bodies are unsupported.
    Body,
    /// The request asks for a protocol upgrade; upgrades are unsupported.
    Upgrade,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid request target",
            ParseError::Version => "Unsupported HTTP version",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::NewLine => "Invalid or missing new line",
            ParseError::Body => "Request bodies are not supported",
            ParseError::Upgrade => "Protocol upgrades are not supported",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Outcome of a successful parser invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The full request head was parsed; the payload is the number of bytes
    /// consumed, up to and including the final empty line.
    Complete(usize),
    /// The buffer ends before the request head does. Parsing restarts from
    /// the beginning on the next invocation, so callers should wait for the
    /// end-of-headers sentinel before retrying.
    Partial,
}
