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

//! Cache key

use blake2::{Blake2b, Digest};
use http::header;
use pingora_http::RequestHeader;

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

/*
 * Blake2 hashing, which is fast and has consistent output across machines.
 * Hashes like ahash are designed purely for in-memory hashtables and must be
 * avoided here so that keys stay stable for the lifetime of an entry.
 */
pub(crate) type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

/// The fingerprint of a cacheable request.
///
/// Derived from the request authority, method and path. Equality is exact and
/// the key is stable for the lifetime of a cache entry; backends use the
/// hashed [Self::combined()] form as their map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    // All strings for now. It can be more structural as long as it can hash
    namespace: String,
    primary: String,
}

impl CacheKey {
    /// Create a new [CacheKey] from the given namespace and primary string.
    ///
    /// Both `namespace` and `primary` are fed to the primary hash.
    pub fn new<S1, S2>(namespace: S1, primary: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        CacheKey {
            namespace: namespace.into(),
            primary: primary.into(),
        }
    }

    /// Build the [CacheKey] for a request.
    ///
    /// The namespace is the request authority (falling back to the `Host`
    /// header for origin-form requests) and the primary key is the method
    /// plus the full path and query.
    pub fn from_request(req_header: &RequestHeader) -> Self {
        let authority = req_header
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req_header
                    .headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(|h| h.to_string())
            })
            .unwrap_or_default();
        let path = req_header
            .uri
            .path_and_query()
            .map_or("/", |p| p.as_str());
        CacheKey {
            namespace: authority,
            primary: format!("{} {}", req_header.method, path),
        }
    }

    /// Return the namespace of this key
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Return the primary key of this key
    pub fn primary_key(&self) -> &str {
        &self.primary
    }

    /// Return the hash of this key
    pub fn primary_bin(&self) -> HashBinary {
        let mut hasher = Blake2b128::new();
        hasher.update(&self.namespace);
        hasher.update(&self.primary);
        hasher.finalize().into()
    }

    /// The hex string of [Self::primary_bin()], used by backends as the map key
    pub fn combined(&self) -> String {
        hex::encode(self.primary_bin())
    }
}
