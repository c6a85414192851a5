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

//! The HTTP caching filter for proxy streams.
//!
//! A [CacheFilter] sits in a proxy filter chain, one per stream. On the
//! request path it looks the request up in a pluggable backend and either
//! serves the cached response, forwards the request untouched, or forwards it
//! with revalidation preconditions injected. On the response path it admits
//! cacheable responses into the backend and fuses 304 revalidation answers
//! with the cached body.
//!
//! The filter is driven entirely by its stream's single-threaded dispatcher;
//! see [stream] for the framework surface it consumes.

#![allow(clippy::new_without_default)]

pub mod config;
pub mod filter;
pub mod stream;

pub use config::CacheConfig;
pub use filter::{CacheFilter, FilterState};
pub use stream::{Dispatcher, FilterStatus, StreamHandle};
