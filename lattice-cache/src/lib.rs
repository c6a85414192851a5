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

//! HTTP caching primitives for proxy data paths.
//!
//! This crate holds everything a caching filter needs that is independent of
//! the surrounding proxy stream: header parsers (`Cache-Control`, HTTP dates,
//! `Range`), the cache key, cached-response metadata, the pluggable storage
//! contract, and a reference in-memory backend for tests.

#![allow(clippy::new_without_default)]

pub mod cache_control;
pub mod filters;
pub mod http_date;
pub mod key;
pub mod lookup;
mod memory;
pub mod meta;
pub mod range;
pub mod storage;

pub use cache_control::CacheControl;
pub use key::CacheKey;
pub use lookup::LookupRequest;
pub use memory::MemCache;
pub use meta::CacheMeta;
pub use range::{AdjustedByteRange, RawByteRange};
pub use storage::{
    CacheInfo, CacheStorage, InsertContext, LookupContext, LookupResult, Validators,
};
