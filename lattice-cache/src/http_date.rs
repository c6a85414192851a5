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

//! HTTP date parsing and formatting
//!
//! Acceptable date/time formats per
//! [RFC 7231](https://tools.ietf.org/html/rfc7231#section-7.1.1.1):
//!
//! - `Sun, 06 Nov 1994 08:49:37 GMT` (IMF-fixdate)
//! - `Sunday, 06-Nov-94 08:49:37 GMT` (obsolete RFC 850 format)
//! - `Sun Nov  6 08:49:37 1994` (ANSI C's asctime() format)
//!
//! The formats are tried in that order and the first one that consumes the
//! entire value wins.

use http::HeaderValue;
use httpdate::{fmt_http_date, parse_http_date};
use std::time::SystemTime;

/// Parse the given header value as an HTTP date.
///
/// Returns `None` (the null time) for a missing header or a value in none of
/// the three accepted formats.
pub fn parse(value: Option<&HeaderValue>) -> Option<SystemTime> {
    parse_str(value?.to_str().ok()?)
}

/// [parse] for a raw string value.
pub fn parse_str(value: &str) -> Option<SystemTime> {
    parse_http_date(value).ok()
}

/// Format the timestamp as an IMF-fixdate string.
pub fn format(time: SystemTime) -> String {
    fmt_http_date(time)
}
