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

//! The framework surface the caching filter consumes
//!
//! The filter runs inside someone else's proxy: a stream hands it entry
//! points, and everything the filter wants back from the stream goes through
//! [StreamHandle]. All resumption is expressed by posting callbacks to the
//! stream's [Dispatcher], a single-threaded cooperative event loop.

use bytes::Bytes;
use http::header::HeaderName;
use http::HeaderValue;
use parking_lot::Mutex;
use pingora_http::ResponseHeader;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

/// What a filter entry point tells the framework to do with the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Keep iterating through the filter chain.
    Continue,
    /// Suspend this filter's iteration, with watermark discipline applied to
    /// buffered data, until the filter resumes it from a posted callback.
    StopAllIterationAndWatermark,
    /// Continue header encoding but do not end the stream: the filter will
    /// inject body data afterwards.
    ContinueAndDontEndStream,
}

type Task = Box<dyn FnOnce() + Send>;

/// A per-stream FIFO of posted callbacks.
///
/// Tasks run in posting order, one at a time, on whichever thread drives the
/// stream. Everything the filter defers runs from here, which is what makes
/// the filter single-threaded without it ever blocking.
pub struct Dispatcher {
    tasks: Mutex<VecDeque<Task>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a callback to run on this stream.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks.lock().push_back(Box::new(task));
    }

    /// Number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run exactly one pending callback, if any. Returns whether one ran.
    pub fn run_one(&self) -> bool {
        // pop under the lock, run outside it: tasks are allowed to post more
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run callbacks, including newly posted ones, until none remain.
    /// Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

/// The per-stream surface the proxy framework provides to the filter.
///
/// Implementations must tolerate being called from the filter's entry points
/// as well as from dispatcher callbacks; they must not call back into the
/// filter synchronously.
pub trait StreamHandle: Send + Sync {
    /// The event loop driving this stream.
    fn dispatcher(&self) -> Arc<Dispatcher>;

    /// The downstream buffer limit, which bounds each injected body chunk.
    fn encoder_buffer_limit(&self) -> usize;

    /// The stream's time source.
    fn now(&self) -> SystemTime;

    /// Resume request filter iteration toward the upstream after a
    /// [FilterStatus::StopAllIterationAndWatermark].
    fn continue_decoding(&self);

    /// Overwrite a header on the request before it resumes upstream.
    fn set_request_header(&self, name: HeaderName, value: HeaderValue);

    /// Begin a locally generated downstream response.
    fn encode_headers(&self, headers: ResponseHeader, end_stream: bool);

    /// Stream a chunk of a locally generated downstream response.
    fn encode_data(&self, data: Bytes, end_stream: bool);

    /// Append data to the encode path behind headers that already went
    /// through it (the revalidation fuse path).
    fn inject_encoded_data(&self, data: Bytes, end_stream: bool);

    /// Abort the downstream stream. The only way out once headers are sent.
    fn reset_stream(&self);
}
