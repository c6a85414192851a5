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

//! Cache backend storage abstraction
//!
//! A backend is a capability set of lookup and insert context factories plus
//! a couple of administrative operations. Backends may be shared across many
//! streams and must synchronize internally; a context, however, belongs to
//! the stream that created it and is only ever driven from there.

use crate::http_date;
use crate::lookup::LookupRequest;
use crate::meta::CacheMeta;
use crate::range::AdjustedByteRange;

use bytes::Bytes;
use http::header;
use http::HeaderValue;
use pingora_http::HMap;
use std::any::Any;

/// The outcome of a lookup, delivered to the `get_headers` callback.
#[derive(Debug)]
pub enum LookupResult {
    /// No entry exists for this key.
    NotFound,
    /// An entry exists but it is stale and carries nothing to revalidate with.
    Unusable,
    /// A fresh entry; serve it directly.
    Fresh { meta: CacheMeta, body_length: u64 },
    /// A stale entry with validators; revalidate before serving.
    RequiresValidation {
        meta: CacheMeta,
        body_length: u64,
        validators: Validators,
    },
}

/// The validators of a stale entry, to be injected into the upstream request.
#[derive(Debug, Clone)]
pub struct Validators {
    /// The cached `ETag` value, for `If-None-Match`.
    pub etag: Option<HeaderValue>,
    /// The cached `Last-Modified` value, kept only when it parses as an HTTP
    /// date so that it is usable in `If-Modified-Since`.
    pub last_modified: Option<HeaderValue>,
    /// The cached `Date` value, the `If-Modified-Since` fallback.
    pub date: Option<HeaderValue>,
}

impl Validators {
    /// Collect the validators present in the cached response headers.
    ///
    /// `None` when the headers carry nothing that could be revalidated.
    pub fn from_headers(headers: &HMap) -> Option<Self> {
        let etag = headers.get(header::ETAG).cloned();
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .filter(|v| http_date::parse(Some(*v)).is_some())
            .cloned();
        let date = headers
            .get(header::DATE)
            .filter(|v| http_date::parse(Some(*v)).is_some())
            .cloned();
        if etag.is_none() && last_modified.is_none() && date.is_none() {
            return None;
        }
        Some(Validators {
            etag,
            last_modified,
            date,
        })
    }

    /// The value to send as `If-Modified-Since`: `Last-Modified` when present
    /// and parseable, the cached `Date` otherwise.
    pub fn if_modified_since(&self) -> Option<&HeaderValue> {
        self.last_modified.as_ref().or(self.date.as_ref())
    }
}

/// Statically known information about a cache backend.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub name: &'static str,
    pub supports_range_requests: bool,
}

/// Delivers the [LookupResult] of a lookup. Invoked exactly once per context.
pub type LookupHeadersCallback = Box<dyn FnOnce(LookupResult) + Send>;

/// Delivers one chunk of cached body, or `None` on a backend read error
/// (which aborts the stream).
pub type LookupBodyCallback = Box<dyn FnOnce(Option<Bytes>) + Send>;

/// Delivers cached trailers.
pub type LookupTrailersCallback = Box<dyn FnOnce(HMap) + Send>;

/// Signals whether the backend is ready for the next body chunk of an
/// insertion. `false` aborts the ingestion.
pub type InsertReadyCallback = Box<dyn FnOnce(bool) + Send>;

/// Manages the lifetime of one cache lookup.
///
/// A context is exclusive to its creating stream. Callbacks may be invoked
/// inline from the calling thread; callers that need them on a particular
/// event loop must bounce them there themselves. Dropping the context aborts
/// the lookup.
pub trait LookupContext: Send {
    /// Deliver the lookup outcome. It is a programming error to call this twice.
    ///
    /// Internal backend failures are reported as [LookupResult::NotFound] so
    /// that the stream fails open toward the upstream.
    fn get_headers(&mut self, cb: LookupHeadersCallback);

    /// Deliver `body[range.first ..= range.last]`.
    ///
    /// May be called many times, with disjoint ranges advancing monotonically
    /// through the body. The backend may deliver fewer bytes than requested
    /// (the caller re-requests the rest) but never more, and never an empty
    /// buffer.
    ///
    /// Precondition: `range.last_byte_pos()` is within the body length
    /// reported through the [Self::get_headers] callback.
    fn get_body(&mut self, range: AdjustedByteRange, cb: LookupBodyCallback);

    /// Deliver the cached trailers. Only valid if the lookup advertised them.
    fn get_trailers(&mut self, _cb: LookupTrailersCallback) {
        panic!("this cache entry has no trailers");
    }

    /// Helper function to cast the trait object to concrete types
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Manages the lifetime of one cache insertion.
///
/// Commit happens on whichever call carries `end_stream`; committing twice is
/// a programmer error and a committed context ignores further chunks.
/// Dropping the context before commit abandons the insertion.
pub trait InsertContext: Send {
    /// Accept the response metadata for caching. Only called once. Commits
    /// when `end_stream` is set.
    fn insert_headers(&mut self, meta: CacheMeta, end_stream: bool);

    /// Append a chunk of response body.
    ///
    /// The insertion streams at a pace determined by the backend: `ready_cb`
    /// answers `true` to request the next chunk, `false` to abort the
    /// ingestion (e.g. on quota exhaustion). Commits when `end_stream` is set.
    fn insert_body(&mut self, chunk: Bytes, ready_cb: InsertReadyCallback, end_stream: bool);

    /// Accept response trailers for caching.
    fn insert_trailers(&mut self, _trailers: HMap) {
        panic!("trailers are not cacheable");
    }
}

/// Implement this interface to provide a cache backend for the caching filter.
///
/// A backend instance is injected at filter construction and shared across
/// streams, so all of its operations must be internally synchronized.
pub trait CacheStorage: Send + Sync {
    /// Open a lookup for the given request. On a miss the same context is
    /// handed back through [Self::make_insert_context] to admit the upstream
    /// response.
    fn make_lookup_context(&self, request: LookupRequest) -> Box<dyn LookupContext>;

    /// Open an insertion for the request behind `lookup`.
    ///
    /// Responses with a chunked transfer encoding are dechunked before
    /// insertion, so the stored body length is authoritative.
    fn make_insert_context(&self, lookup: Box<dyn LookupContext>) -> Box<dyn InsertContext>;

    /// Atomically refresh the stored metadata of the entry behind `lookup`,
    /// leaving its body untouched. Called after a successful revalidation.
    ///
    /// Returns `false` when the entry no longer exists.
    fn update_headers(&self, lookup: &dyn LookupContext, meta: CacheMeta) -> bool;

    /// Returns statically known information about this backend.
    fn cache_info(&self) -> CacheInfo;
}
