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

//! Cache lookup request and result evaluation

use crate::key::CacheKey;
use crate::meta::CacheMeta;
use crate::storage::{LookupResult, Validators};

use pingora_http::RequestHeader;
use std::time::SystemTime;

/// Everything about a request that a backend needs to look for a matching
/// response and to evaluate whether the entry it finds is usable.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    key: CacheKey,
    timestamp: SystemTime,
}

impl LookupRequest {
    /// Build the lookup for a request received at `timestamp`.
    pub fn new(req_header: &RequestHeader, timestamp: SystemTime) -> Self {
        LookupRequest {
            key: CacheKey::from_request(req_header),
            timestamp,
        }
    }

    /// Build a lookup from an already derived key, for backends and tests.
    pub fn from_key(key: CacheKey, timestamp: SystemTime) -> Self {
        LookupRequest { key, timestamp }
    }

    /// The fingerprint this lookup searches for.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// When this lookup was created, i.e. the request time.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Evaluate a stored entry against this request.
    ///
    /// A fresh entry serves directly; a stale one with validators asks for
    /// revalidation; a stale one without is unusable. Backends call this from
    /// their `get_headers` path once they have located the entry.
    pub fn make_lookup_result(&self, meta: CacheMeta, body_length: u64) -> LookupResult {
        if meta.is_fresh(self.timestamp) {
            return LookupResult::Fresh { meta, body_length };
        }
        match Validators::from_headers(meta.headers()) {
            Some(validators) => LookupResult::RequiresValidation {
                meta,
                body_length,
                validators,
            },
            None => LookupResult::Unusable,
        }
    }
}
