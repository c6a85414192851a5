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

//! Metadata for caching

use pingora_http::{HMap, ResponseHeader};
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct InternalMeta {
    fresh_until: SystemTime,
    created: SystemTime,
    updated: SystemTime,
}

#[derive(Debug)]
struct CacheMetaInner {
    internal: InternalMeta,
    header: ResponseHeader,
}

/// The cacheable response header and cache metadata
#[derive(Debug)]
pub struct CacheMeta(Box<CacheMetaInner>);

impl CacheMeta {
    /// Create a [CacheMeta] from the given metadata and the response header
    pub fn new(fresh_until: SystemTime, created: SystemTime, header: ResponseHeader) -> CacheMeta {
        CacheMeta(Box::new(CacheMetaInner {
            internal: InternalMeta {
                fresh_until,
                created,
                updated: created, // created == updated for new meta
            },
            header,
        }))
    }

    /// When the asset was created/admitted to cache
    pub fn created(&self) -> SystemTime {
        self.0.internal.created
    }

    /// The last time the asset was revalidated
    ///
    /// This value will be the same as [Self::created()] if no revalidation ever happens
    pub fn updated(&self) -> SystemTime {
        self.0.internal.updated
    }

    /// Until when the asset is considered fresh
    pub fn fresh_until(&self) -> SystemTime {
        self.0.internal.fresh_until
    }

    /// Is the asset still valid
    pub fn is_fresh(&self, time: SystemTime) -> bool {
        // NOTE: HTTP cache time resolution is second
        self.0.internal.fresh_until >= time
    }

    /// Preserve the original admission time after a revalidation refreshed this meta.
    ///
    /// `updated` is already the revalidation time, which created() must not follow.
    pub fn set_created(&mut self, created: SystemTime) {
        self.0.internal.created = created;
    }

    /// Get the response header in this asset
    pub fn response_header(&self) -> &ResponseHeader {
        &self.0.header
    }

    /// Modify the header in this asset
    pub fn response_header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.0.header
    }

    /// Get a copy of the response header
    pub fn response_header_copy(&self) -> ResponseHeader {
        self.0.header.clone()
    }

    /// get all the headers of this asset
    pub fn headers(&self) -> &HMap {
        &self.0.header.headers
    }
}

impl Clone for CacheMeta {
    fn clone(&self) -> Self {
        CacheMeta(Box::new(CacheMetaInner {
            internal: self.0.internal.clone(),
            header: self.0.header.clone(),
        }))
    }
}
