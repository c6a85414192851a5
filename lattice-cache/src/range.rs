// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-range parsing and adjustment
//!
//! <https://datatracker.ietf.org/doc/html/rfc7233#section-3>

use http::header::RANGE;
use http::Method;
use log::debug;
use once_cell::sync::Lazy;
use pingora_http::RequestHeader;
use regex::Regex;
use std::str;

// A Range header longer than this is not worth parsing: it caps both the
// parse time and the number of specs a request can ask for (roughly ten).
const MAX_RANGE_HEADER_BYTES: usize = 100;

/// A byte range as requested, before it is resolved against a body length.
///
/// The `u64::MAX` sentinel in the first slot marks a suffix range whose `last`
/// holds the suffix length (the trailing N bytes). An open-ended spec
/// (`500-`) is stored the same way, with `last` holding its first byte
/// position. Otherwise the range is inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawByteRange {
    first: u64,
    last: u64,
}

impl RawByteRange {
    /// Construct a range of the [first, last] bytes, inclusive on both ends.
    ///
    /// Constructing a non-suffix range with `first > last` is a programmer error.
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(
            first == u64::MAX || first <= last,
            "invalid raw range {first}-{last}"
        );
        RawByteRange { first, last }
    }

    /// Construct a suffix range of the trailing `suffix_len` bytes.
    pub fn suffix(suffix_len: u64) -> Self {
        RawByteRange {
            first: u64::MAX,
            last: suffix_len,
        }
    }

    /// Whether this is a suffix (or open-ended) spec
    pub fn is_suffix(&self) -> bool {
        self.first == u64::MAX
    }

    /// The suffix length. Only meaningful for suffix ranges.
    pub fn suffix_length(&self) -> u64 {
        debug_assert!(self.is_suffix());
        self.last
    }

    /// The first byte position. Only meaningful for non-suffix ranges.
    pub fn first_byte_pos(&self) -> u64 {
        debug_assert!(!self.is_suffix());
        self.first
    }

    /// The last byte position, inclusive. Only meaningful for non-suffix ranges.
    pub fn last_byte_pos(&self) -> u64 {
        debug_assert!(!self.is_suffix());
        self.last
    }
}

/// A byte range resolved against a known body length.
///
/// Invariants: `first_byte_pos <= last_byte_pos < body_length`, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustedByteRange {
    first_byte_pos: u64,
    last_byte_pos: u64,
}

impl AdjustedByteRange {
    /// Construct a resolved range of the [first, last] bytes of a body.
    pub fn new(first: u64, last: u64) -> Self {
        assert!(first <= last, "invalid adjusted range {first}-{last}");
        AdjustedByteRange {
            first_byte_pos: first,
            last_byte_pos: last,
        }
    }

    pub fn first_byte_pos(&self) -> u64 {
        self.first_byte_pos
    }

    pub fn last_byte_pos(&self) -> u64 {
        self.last_byte_pos
    }

    /// The number of bytes covered, never zero.
    pub fn length(&self) -> u64 {
        self.last_byte_pos - self.first_byte_pos + 1
    }

    /// Drop the first `n` bytes from the range, after they have been served.
    pub fn trim_front(&mut self, n: u64) {
        assert!(n < self.length(), "attempt to trim too much from range");
        self.first_byte_pos += n;
    }
}

/// Extract the byte ranges requested by `req_header`.
///
/// Range headers are only meaningful on GET, and multiple `Range` header
/// lines are invalid per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2.2),
/// so both cases yield no ranges. `range_count_limit` caps how many specs a
/// single header may carry; without it the input length cap applies instead.
pub fn request_range_specs(
    req_header: &RequestHeader,
    range_count_limit: Option<usize>,
) -> Vec<RawByteRange> {
    if req_header.method != Method::GET {
        // don't bother parsing a range we are not going to use
        return vec![];
    }

    let mut range_headers = req_header.headers.get_all(RANGE).iter();
    let range = match (range_headers.next(), range_headers.next()) {
        (Some(value), None) => value,
        _ => return vec![],
    };

    parse_range_header_value(range.as_bytes(), range_count_limit)
}

// Match one byte-range-spec, e.g. "0-100", "-5" or "1-". Anything between
// specs other than a single comma is rejected wholesale.
static RE_BYTE_RANGE_SPEC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d*)-(\d*)$").unwrap());

/// Parse a full `Range` header value into raw byte ranges.
///
/// The grammar is bytes-only: `"bytes=" byte-range-spec *("," byte-range-spec)`.
/// Any malformed spec invalidates the whole header and yields an empty vector.
/// `first > last` is unsatisfiable garbage and also rejected, as is a literal
/// first byte position of `u64::MAX`, which is reserved as the suffix sentinel.
pub fn parse_range_header_value(
    value: &[u8],
    range_count_limit: Option<usize>,
) -> Vec<RawByteRange> {
    if range_count_limit.is_none() && value.len() > MAX_RANGE_HEADER_BYTES {
        debug!("refusing to parse an oversized range header ({} bytes)", value.len());
        return vec![];
    }

    let Ok(value_str) = str::from_utf8(value) else {
        return vec![];
    };

    let mut parts = value_str.splitn(2, '=');
    if !parts.next().is_some_and(|unit| unit.eq_ignore_ascii_case("bytes")) {
        return vec![];
    }
    let Some(specs_str) = parts.next() else {
        return vec![];
    };

    let mut ranges = Vec::new();
    for spec in specs_str.split(',') {
        if let Some(limit) = range_count_limit {
            if ranges.len() >= limit {
                debug!("refusing to parse a range header with more than {limit} ranges");
                return vec![];
            }
        }

        let Some(captured) = RE_BYTE_RANGE_SPEC.captures(spec) else {
            return vec![];
        };
        let first_digits = captured.get(1).map_or("", |c| c.as_str());
        let last_digits = captured.get(2).map_or("", |c| c.as_str());

        let range = match (first_digits.is_empty(), last_digits.is_empty()) {
            // "-": no positions at all
            (true, true) => return vec![],
            // "-N": the trailing N bytes
            (true, false) => {
                let Ok(suffix_len) = last_digits.parse::<u64>() else {
                    return vec![];
                };
                RawByteRange::suffix(suffix_len)
            }
            // "N-": open-ended, stored in the suffix slot
            (false, true) => {
                let Ok(first) = first_digits.parse::<u64>() else {
                    return vec![];
                };
                if first == u64::MAX {
                    return vec![];
                }
                RawByteRange::suffix(first)
            }
            // "N-M"
            (false, false) => {
                let (Ok(first), Ok(last)) =
                    (first_digits.parse::<u64>(), last_digits.parse::<u64>())
                else {
                    return vec![];
                };
                if first == u64::MAX || first > last {
                    return vec![];
                }
                RawByteRange::new(first, last)
            }
        };
        ranges.push(range);
    }

    ranges
}

/// Resolve a raw range against the actual body length.
///
/// `None` means the range cannot be satisfied by a body of this length, which
/// a server answers with `416 Range Not Satisfiable`.
pub fn adjust_byte_range(spec: RawByteRange, body_length: u64) -> Option<AdjustedByteRange> {
    if body_length == 0 {
        return None;
    }
    if spec.is_suffix() {
        let suffix_len = spec.suffix_length();
        if suffix_len == 0 || suffix_len >= body_length {
            return None;
        }
        Some(AdjustedByteRange::new(
            body_length - suffix_len,
            body_length - 1,
        ))
    } else {
        if spec.first_byte_pos() >= body_length {
            return None;
        }
        Some(AdjustedByteRange::new(
            spec.first_byte_pos(),
            spec.last_byte_pos().min(body_length - 1),
        ))
    }
}
