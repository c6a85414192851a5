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

//! Mock proxy stream for driving the cache filter in tests

use bytes::Bytes;
use http::header::HeaderName;
use http::HeaderValue;
use lattice_filter::{Dispatcher, StreamHandle};
use parking_lot::Mutex;
use pingora_http::ResponseHeader;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything the filter did to the downstream, in order.
#[derive(Debug)]
pub enum StreamEvent {
    /// continue_decoding: iteration resumed toward the upstream
    ContinueDecoding,
    /// a locally generated response started
    Headers(ResponseHeader, bool),
    /// a chunk of a locally generated response
    Data(Bytes, bool),
    /// a chunk injected behind headers on the encode path
    Injected(Bytes, bool),
    /// the stream was reset
    Reset,
}

/// A settable clock shared between a test and its streams.
#[derive(Clone)]
pub struct MockClock(Arc<Mutex<SystemTime>>);

impl MockClock {
    pub fn new(start: SystemTime) -> Self {
        MockClock(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> SystemTime {
        *self.0.lock()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

/// A recording [StreamHandle].
pub struct MockStream {
    dispatcher: Arc<Dispatcher>,
    clock: MockClock,
    buffer_limit: usize,
    pub events: Mutex<Vec<StreamEvent>>,
    /// headers the filter set on the upstream-bound request
    pub request_headers: Mutex<Vec<(HeaderName, HeaderValue)>>,
}

impl MockStream {
    pub fn new(clock: MockClock, buffer_limit: usize) -> Arc<Self> {
        Arc::new(MockStream {
            dispatcher: Arc::new(Dispatcher::new()),
            clock,
            buffer_limit,
            events: Mutex::new(Vec::new()),
            request_headers: Mutex::new(Vec::new()),
        })
    }

    pub fn drain(&self) -> usize {
        self.dispatcher.run_until_idle()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// The single Headers event, which must be the first downstream event.
    pub fn response_headers(&self) -> (ResponseHeader, bool) {
        let events = self.events.lock();
        match events.first() {
            Some(StreamEvent::Headers(h, end)) => (h.clone(), *end),
            other => panic!("expected a Headers event first, got {other:?}"),
        }
    }

    /// All locally generated body chunks, with their end_stream flags.
    pub fn data_chunks(&self) -> Vec<(Bytes, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Data(b, end) => Some((b.clone(), *end)),
                _ => None,
            })
            .collect()
    }

    /// All injected body chunks, with their end_stream flags.
    pub fn injected_chunks(&self) -> Vec<(Bytes, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Injected(b, end) => Some((b.clone(), *end)),
                _ => None,
            })
            .collect()
    }

    pub fn continued_decoding(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, StreamEvent::ContinueDecoding))
    }

    pub fn was_reset(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, StreamEvent::Reset))
    }

    /// The value of a header the filter injected into the upstream request.
    pub fn upstream_request_header(&self, name: HeaderName) -> Option<HeaderValue> {
        self.request_headers
            .lock()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
    }
}

impl StreamHandle for MockStream {
    fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    fn encoder_buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn continue_decoding(&self) {
        self.events.lock().push(StreamEvent::ContinueDecoding);
    }

    fn set_request_header(&self, name: HeaderName, value: HeaderValue) {
        self.request_headers.lock().push((name, value));
    }

    fn encode_headers(&self, headers: ResponseHeader, end_stream: bool) {
        self.events
            .lock()
            .push(StreamEvent::Headers(headers, end_stream));
    }

    fn encode_data(&self, data: Bytes, end_stream: bool) {
        self.events.lock().push(StreamEvent::Data(data, end_stream));
    }

    fn inject_encoded_data(&self, data: Bytes, end_stream: bool) {
        self.events
            .lock()
            .push(StreamEvent::Injected(data, end_stream));
    }

    fn reset_stream(&self) {
        self.events.lock().push(StreamEvent::Reset);
    }
}
