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

//! The per-stream caching filter state machine

use crate::config::CacheConfig;
use crate::stream::{Dispatcher, FilterStatus, StreamHandle};

use bytes::Bytes;
use http::header;
use http::{HeaderValue, StatusCode};
use lattice_cache::filters;
use lattice_cache::range::{self, AdjustedByteRange, RawByteRange};
use lattice_cache::storage::{
    CacheStorage, InsertContext, InsertReadyCallback, LookupBodyCallback, LookupContext,
    LookupHeadersCallback, LookupResult,
};
use lattice_cache::{CacheControl, CacheMeta, LookupRequest};
use log::debug;
use parking_lot::Mutex;
use pingora_http::{HMap, RequestHeader, ResponseHeader};
use std::sync::{Arc, Weak};

/// This reflects where the filter is in the lifetime of its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Nothing has happened yet.
    Initial,
    /// A backend lookup is in flight; iteration is suspended.
    LookingUp,
    /// A fresh hit is being streamed downstream; the upstream is not used.
    ServingFromCache,
    /// The request went (or is going) to the upstream untouched.
    Forwarding,
    /// The request went upstream carrying revalidation preconditions.
    Validating,
    /// A 304 was fused with the cached entry; its body is being injected.
    InjectingAfterValidation,
    /// Terminal: the filter is done with this stream.
    Done,
    /// Terminal: the stream is gone; posted callbacks become no-ops.
    Destroyed,
}

impl FilterState {
    /// Convert [FilterState] as `str`, for logging and debugging.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterState::Initial => "initial",
            FilterState::LookingUp => "looking-up",
            FilterState::ServingFromCache => "serving-from-cache",
            FilterState::Forwarding => "forwarding",
            FilterState::Validating => "validating",
            FilterState::InjectingAfterValidation => "injecting-after-validation",
            FilterState::Done => "done",
            FilterState::Destroyed => "destroyed",
        }
    }
}

// The cached body slice still to be delivered downstream, and how.
struct ServeState {
    // None once the final chunk went out
    remaining: Option<AdjustedByteRange>,
    // a get_body is outstanding; its result is delivered even if the
    // watermark rises in the meantime, it just doesn't trigger the next read
    in_flight: bool,
    // inject into the encode path (revalidation fuse) instead of starting a
    // locally generated response
    inject: bool,
}

/// The per-stream caching filter.
///
/// Construct one per proxy stream with [CacheFilter::new] and drive it
/// through the entry points below. The backend is injected, never looked up
/// in any global registry. All suspension is cooperative: the filter returns
/// a [FilterStatus] and resumes itself from dispatcher callbacks that carry a
/// weak handle, so a destroyed stream simply drops them.
pub struct CacheFilter {
    storage: Arc<dyn CacheStorage>,
    config: Arc<CacheConfig>,
    handle: Arc<dyn StreamHandle>,
    // self-reference for posted callbacks: upgrade-or-drop
    cell: Weak<Mutex<CacheFilter>>,
    state: FilterState,
    lookup: Option<Box<dyn LookupContext>>,
    insert: Option<Box<dyn InsertContext>>,
    request_range_specs: Vec<RawByteRange>,
    // set while Validating: what a 304 would refresh and re-serve
    cached_meta: Option<CacheMeta>,
    cached_body_length: u64,
    serve: Option<ServeState>,
    // outstanding high-watermark notifications from downstream
    watermark_depth: u32,
}

impl CacheFilter {
    /// Create the filter for one stream, with the backend and config injected.
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        config: Arc<CacheConfig>,
        handle: Arc<dyn StreamHandle>,
    ) -> Arc<Mutex<CacheFilter>> {
        Arc::new_cyclic(|cell| {
            Mutex::new(CacheFilter {
                storage,
                config,
                handle,
                cell: cell.clone(),
                state: FilterState::Initial,
                lookup: None,
                insert: None,
                request_range_specs: Vec::new(),
                cached_meta: None,
                cached_body_length: 0,
                serve: None,
                watermark_depth: 0,
            })
        })
    }

    /// Where the filter currently is, for logging and tests.
    pub fn state(&self) -> FilterState {
        self.state
    }

    /* Request path */

    /// Client request headers arrived.
    pub fn decode_headers(&mut self, req: &RequestHeader, _end_stream: bool) -> FilterStatus {
        debug_assert_eq!(self.state, FilterState::Initial);
        if !filters::request_cacheable(req) {
            // not a cacheable method: stay out of the way entirely
            self.state = FilterState::Forwarding;
            return FilterStatus::Continue;
        }

        self.request_range_specs =
            range::request_range_specs(req, self.config.byte_range_parse_limit);

        let request = LookupRequest::new(req, self.handle.now());
        let mut lookup = self.storage.make_lookup_context(request);
        self.state = FilterState::LookingUp;
        lookup.get_headers(self.lookup_headers_callback());
        self.lookup = Some(lookup);
        FilterStatus::StopAllIterationAndWatermark
    }

    /// Client request body. GET bodies are none of our business.
    pub fn decode_data(&mut self, _data: &Bytes, _end_stream: bool) -> FilterStatus {
        FilterStatus::Continue
    }

    /// Client request trailers.
    pub fn decode_trailers(&mut self, _trailers: &HMap) -> FilterStatus {
        FilterStatus::Continue
    }

    /* Response path */

    /// Upstream response headers arrived.
    pub fn encode_headers(&mut self, resp: &mut ResponseHeader, end_stream: bool) -> FilterStatus {
        match self.state {
            FilterState::Forwarding => {
                self.maybe_start_insert(resp, end_stream);
                FilterStatus::Continue
            }
            FilterState::Validating => self.on_validation_response(resp, end_stream),
            _ => FilterStatus::Continue,
        }
    }

    /// Upstream response body passing through.
    pub fn encode_data(&mut self, data: &Bytes, end_stream: bool) -> FilterStatus {
        if self.insert.is_some() {
            let ready_cb = self.insert_ready_callback();
            let insert = self.insert.as_mut().unwrap();
            insert.insert_body(data.clone(), ready_cb, end_stream);
            if end_stream {
                self.insert = None;
                self.state = FilterState::Done;
            }
        }
        FilterStatus::Continue
    }

    /// Upstream response trailers. Trailers are not cacheable, so an ongoing
    /// insertion is abandoned rather than committed without them.
    pub fn encode_trailers(&mut self, _trailers: &HMap) -> FilterStatus {
        if self.insert.take().is_some() {
            debug!("response has trailers, abandoning cache insertion");
        }
        FilterStatus::Continue
    }

    /* Watermarks: downstream buffer pressure gates cached-body reads */

    /// The downstream buffer filled past its high watermark.
    pub fn on_above_write_buffer_high_watermark(&mut self) {
        self.watermark_depth += 1;
    }

    /// The downstream buffer drained below its low watermark.
    pub fn on_below_write_buffer_low_watermark(&mut self) {
        debug_assert!(self.watermark_depth > 0);
        self.watermark_depth = self.watermark_depth.saturating_sub(1);
        if self.watermark_depth == 0 {
            self.request_body_chunk();
        }
    }

    /// The stream is going away. Every later-firing callback becomes a no-op.
    pub fn on_destroy(&mut self) {
        self.state = FilterState::Destroyed;
        self.lookup = None;
        self.insert = None;
        self.serve = None;
        self.cached_meta = None;
    }

    /* Lookup completion */

    fn on_lookup_complete(&mut self, result: LookupResult) {
        if self.state != FilterState::LookingUp {
            debug!("late lookup result in state {}, dropped", self.state.as_str());
            return;
        }
        match result {
            LookupResult::NotFound | LookupResult::Unusable => {
                // fail open toward the upstream
                self.state = FilterState::Forwarding;
                self.handle.continue_decoding();
            }
            LookupResult::Fresh { meta, body_length } => {
                self.serve_cached_response(meta, body_length);
            }
            LookupResult::RequiresValidation {
                meta,
                body_length,
                validators,
            } => {
                for (name, value) in filters::revalidation_headers(&validators) {
                    self.handle.set_request_header(name, value);
                }
                self.cached_meta = Some(meta);
                self.cached_body_length = body_length;
                self.state = FilterState::Validating;
                self.handle.continue_decoding();
            }
        }
    }

    // Synthesize the downstream response for a fresh hit. The upstream is
    // never contacted.
    fn serve_cached_response(&mut self, meta: CacheMeta, body_length: u64) {
        let mut headers = meta.response_header_copy();
        let age = filters::response_age(&meta, self.handle.now());
        headers.insert_header(header::AGE, age).unwrap();
        // the cached body is stored dechunked, so its length is authoritative
        headers.remove_header(&header::TRANSFER_ENCODING);
        headers
            .insert_header(header::CONTENT_LENGTH, body_length)
            .unwrap();

        let mut serve_range = None;
        if self.request_range_specs.len() == 1 {
            match range::adjust_byte_range(self.request_range_specs[0], body_length) {
                Some(r) => {
                    headers.set_status(StatusCode::PARTIAL_CONTENT).unwrap();
                    headers
                        .insert_header(
                            header::CONTENT_RANGE,
                            format!(
                                "bytes {}-{}/{body_length}",
                                r.first_byte_pos(),
                                r.last_byte_pos()
                            ),
                        )
                        .unwrap();
                    headers
                        .insert_header(header::CONTENT_LENGTH, r.length())
                        .unwrap();
                    serve_range = Some(r);
                }
                None => {
                    headers.set_status(StatusCode::RANGE_NOT_SATISFIABLE).unwrap();
                    headers
                        .insert_header(header::CONTENT_RANGE, format!("bytes */{body_length}"))
                        .unwrap();
                    headers
                        .insert_header(header::CONTENT_LENGTH, HeaderValue::from_static("0"))
                        .unwrap();
                    self.handle.encode_headers(headers, true);
                    self.state = FilterState::Done;
                    self.lookup = None;
                    return;
                }
            }
        }
        // anything other than exactly one satisfiable range serves the full
        // response (multipart/byteranges is out of scope)

        debug!(
            "serving {body_length} cached bytes, status {}",
            headers.status.as_u16()
        );
        let range = serve_range.or_else(|| {
            (body_length > 0).then(|| AdjustedByteRange::new(0, body_length - 1))
        });
        let Some(range) = range else {
            // no body to speak of: headers end the stream
            self.handle.encode_headers(headers, true);
            self.state = FilterState::Done;
            self.lookup = None;
            return;
        };

        self.handle.encode_headers(headers, false);
        self.state = FilterState::ServingFromCache;
        self.serve = Some(ServeState {
            remaining: Some(range),
            in_flight: false,
            inject: false,
        });
        self.request_body_chunk();
    }

    /* Validation completion */

    fn on_validation_response(
        &mut self,
        resp: &mut ResponseHeader,
        end_stream: bool,
    ) -> FilterStatus {
        if resp.status != StatusCode::NOT_MODIFIED {
            // the cached entry did not survive validation; whatever came back
            // takes its place (in cache too, when it qualifies)
            self.cached_meta = None;
            self.state = FilterState::Forwarding;
            self.maybe_start_insert(resp, end_stream);
            return FilterStatus::Continue;
        }

        let old_meta = self
            .cached_meta
            .take()
            .expect("validating state must hold the cached meta");
        let merged = filters::revalidate_merge_header(old_meta.response_header(), resp);
        let now = self.handle.now();
        let cache_control = CacheControl::from_resp_headers(&merged);
        let fresh_until = filters::calculate_fresh_until(now, cache_control.as_ref(), &merged);
        let mut new_meta = CacheMeta::new(fresh_until, now, merged);
        new_meta.set_created(old_meta.created());

        let lookup = self
            .lookup
            .as_ref()
            .expect("validating state must hold the lookup context");
        if !self.storage.update_headers(lookup.as_ref(), new_meta.clone()) {
            // the entry vanished between lookup and validation: treat it as a
            // miss and let the upstream 304 through unchanged
            debug!("no cache entry to refresh after 304, forwarding");
            self.state = FilterState::Forwarding;
            self.lookup = None;
            return FilterStatus::Continue;
        }

        // the downstream never sees the 304: replace it with the refreshed
        // cached response and inject the cached body behind it
        let mut headers = new_meta.response_header_copy();
        headers.remove_header(&header::TRANSFER_ENCODING);
        headers
            .insert_header(header::CONTENT_LENGTH, self.cached_body_length)
            .unwrap();
        *resp = headers;
        self.cached_meta = Some(new_meta);

        if self.cached_body_length == 0 {
            // the headers end the stream, just as the 304 did
            self.state = FilterState::Done;
            self.lookup = None;
            return FilterStatus::Continue;
        }

        self.state = FilterState::InjectingAfterValidation;
        self.serve = Some(ServeState {
            remaining: Some(AdjustedByteRange::new(0, self.cached_body_length - 1)),
            in_flight: false,
            inject: true,
        });
        self.request_body_chunk();
        FilterStatus::ContinueAndDontEndStream
    }

    /* Insertion */

    fn maybe_start_insert(&mut self, resp: &ResponseHeader, end_stream: bool) {
        if self.lookup.is_none() {
            // never looked up (non-GET), nowhere to insert
            return;
        }
        let cache_control = CacheControl::from_resp_headers(resp);
        let Some(meta) = filters::resp_cacheable(cache_control.as_ref(), resp, self.handle.now())
        else {
            self.lookup = None;
            return;
        };
        let mut insert = self.storage.make_insert_context(self.lookup.take().unwrap());
        insert.insert_headers(meta, end_stream);
        if end_stream {
            self.state = FilterState::Done;
        } else {
            self.insert = Some(insert);
        }
    }

    fn abort_insert(&mut self) {
        if self.insert.take().is_some() {
            debug!("cache backend is not accepting more body, insertion aborted");
        }
    }

    /* Cached body streaming */

    // Ask the backend for the next chunk, bounded by the downstream buffer
    // limit. No new read starts while the downstream signals pressure; the
    // low-watermark entry point restarts the loop.
    fn request_body_chunk(&mut self) {
        if self.watermark_depth > 0 {
            return;
        }
        let Some(serve) = self.serve.as_mut() else {
            return;
        };
        if serve.in_flight {
            return;
        }
        let Some(remaining) = serve.remaining else {
            return;
        };
        let limit = (self.handle.encoder_buffer_limit().max(1)) as u64;
        let chunk_len = remaining.length().min(limit);
        let chunk = AdjustedByteRange::new(
            remaining.first_byte_pos(),
            remaining.first_byte_pos() + chunk_len - 1,
        );
        serve.in_flight = true;
        let cb = self.lookup_body_callback();
        self.lookup
            .as_mut()
            .expect("streaming states hold the lookup context")
            .get_body(chunk, cb);
    }

    fn on_body_chunk(&mut self, body: Option<Bytes>) {
        if !matches!(
            self.state,
            FilterState::ServingFromCache | FilterState::InjectingAfterValidation
        ) {
            return;
        }
        let serve = self.serve.as_mut().expect("streaming states hold serve state");
        serve.in_flight = false;

        let Some(data) = body else {
            // backend read error: headers are out, a reset is all that's left
            debug!("cache backend body read failed, resetting the stream");
            self.finish_streaming();
            self.state = FilterState::Done;
            self.handle.reset_stream();
            return;
        };

        let mut remaining = serve.remaining.expect("a read was in flight");
        let delivered = data.len() as u64;
        if delivered == 0 || delivered > remaining.length() {
            debug_assert!(false, "backend delivered a chunk outside the requested range");
            self.finish_streaming();
            self.state = FilterState::Done;
            self.handle.reset_stream();
            return;
        }

        // the backend may deliver less than asked; re-request the rest
        let end_stream = delivered == remaining.length();
        if end_stream {
            serve.remaining = None;
        } else {
            remaining.trim_front(delivered);
            serve.remaining = Some(remaining);
        }

        if serve.inject {
            self.handle.inject_encoded_data(data, end_stream);
        } else {
            self.handle.encode_data(data, end_stream);
        }

        if end_stream {
            self.finish_streaming();
            self.state = FilterState::Done;
        } else {
            self.request_body_chunk();
        }
    }

    fn finish_streaming(&mut self) {
        self.serve = None;
        self.lookup = None;
    }

    /* Posted-callback plumbing: every callback carries a weak handle to the
     * filter and is bounced onto the stream's dispatcher. A dead handle, or
     * a destroyed filter, swallows the callback. */

    fn lookup_headers_callback(&self) -> LookupHeadersCallback {
        let cell = self.cell.clone();
        let dispatcher = self.handle.dispatcher();
        Box::new(move |result| {
            post_to_filter(&dispatcher, cell, move |filter| {
                filter.on_lookup_complete(result)
            });
        })
    }

    fn lookup_body_callback(&self) -> LookupBodyCallback {
        let cell = self.cell.clone();
        let dispatcher = self.handle.dispatcher();
        Box::new(move |body| {
            post_to_filter(&dispatcher, cell, move |filter| filter.on_body_chunk(body));
        })
    }

    fn insert_ready_callback(&self) -> InsertReadyCallback {
        let cell = self.cell.clone();
        let dispatcher = self.handle.dispatcher();
        Box::new(move |ready| {
            if ready {
                // the insertion already streams at the upstream's pace
                return;
            }
            post_to_filter(&dispatcher, cell, |filter| filter.abort_insert());
        })
    }
}

fn post_to_filter(
    dispatcher: &Dispatcher,
    cell: Weak<Mutex<CacheFilter>>,
    f: impl FnOnce(&mut CacheFilter) + Send + 'static,
) {
    dispatcher.post(move || {
        let Some(filter) = cell.upgrade() else {
            return;
        };
        let mut filter = filter.lock();
        if filter.state == FilterState::Destroyed {
            return;
        }
        f(&mut filter);
    });
}
