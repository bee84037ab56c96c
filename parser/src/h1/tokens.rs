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

//! Byte classification tables for the hot parsing loops.

/// Bytes permitted in a request target.
///
/// Deliberately narrower than RFC 3986: the BFF routes are plain ASCII
/// paths with optional query strings, so everything outside
/// `[A-Za-z0-9/\-_.?=&]` is rejected.
static TARGET_MAP: [bool; 256] = build_target_map();

/// Bytes permitted in a header field name (RFC 9110 `tchar`).
static HEADER_NAME_MAP: [bool; 256] = build_header_name_map();

/// Bytes permitted in a header field value: visible ASCII, SP, HTAB, and
/// obs-text (RFC 9110 Section 5.5).
static HEADER_VALUE_MAP: [bool; 256] = build_header_value_map();

const fn build_target_map() -> [bool; 256] {
    let mut map = [false; 256];
    let mut i: usize = 0;
    while i < 256 {
        let b = i as u8;
        map[i] = b.is_ascii_alphanumeric()
            || b == b'/'
            || b == b'-'
            || b == b'_'
            || b == b'.'
            || b == b'?'
            || b == b'='
            || b == b'&';
        i += 1;
    }
    map
}

const fn build_header_name_map() -> [bool; 256] {
    let mut map = [false; 256];
    let mut i: usize = 0;
    while i < 256 {
        let b = i as u8;
        map[i] = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            );
        i += 1;
    }
    map
}

const fn build_header_value_map() -> [bool; 256] {
    let mut map = [false; 256];
    let mut i: usize = 0;
    while i < 256 {
        let b = i as u8;
        map[i] = b == b'\t' || b == b' ' || (b >= 0x21 && b != 0x7f);
        i += 1;
    }
    map
}

#[inline]
pub fn is_request_target_token(b: u8) -> bool {
    TARGET_MAP[b as usize]
}

#[inline]
pub fn is_header_name_token(b: u8) -> bool {
    HEADER_NAME_MAP[b as usize]
}

#[inline]
pub fn is_header_value_token(b: u8) -> bool {
    HEADER_VALUE_MAP[b as usize]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_tokens_accept_route_characters() {
        for &b in b"/bonuses?page=2&sort=asc_DESC-v1.0" {
            assert!(is_request_target_token(b), "rejected {:?}", b as char);
        }
    }

    #[test]
    fn target_tokens_reject_whitespace_and_controls() {
        for b in [b' ', b'\r', b'\n', b'\t', 0x00, 0x7f, b'%', b'#'] {
            assert!(!is_request_target_token(b), "accepted {b:#04x}");
        }
    }

    #[test]
    fn header_name_tokens_follow_tchar() {
        assert!(is_header_name_token(b'C'));
        assert!(is_header_name_token(b'-'));
        assert!(!is_header_name_token(b':'));
        assert!(!is_header_name_token(b' '));
    }

    #[test]
    fn header_value_tokens_allow_obs_text_but_not_controls() {
        assert!(is_header_value_token(b' '));
        assert!(is_header_value_token(0x80));
        assert!(!is_header_value_token(b'\r'));
        assert!(!is_header_value_token(0x00));
    }
}
