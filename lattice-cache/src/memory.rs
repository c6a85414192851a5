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

//! Hash map based in memory cache
//!
//! For testing only, not for production use: nothing is ever evicted.

use crate::lookup::LookupRequest;
use crate::meta::CacheMeta;
use crate::range::AdjustedByteRange;
use crate::storage::{
    CacheInfo, CacheStorage, InsertContext, InsertReadyCallback, LookupContext,
    LookupBodyCallback, LookupHeadersCallback, LookupResult,
};

use bytes::Bytes;
use log::warn;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

struct CacheObject {
    meta: CacheMeta,
    body: Arc<Vec<u8>>,
}

type SharedMap = Arc<RwLock<HashMap<String, CacheObject>>>;

/// Hash map based in memory cache, guarded by a single lock.
///
/// For testing only, not for production use.
pub struct MemCache {
    cached: SharedMap,
}

impl MemCache {
    /// Create a new [MemCache]
    pub fn new() -> Self {
        MemCache {
            cached: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

struct MemLookupContext {
    request: LookupRequest,
    cached: SharedMap,
    // set by get_headers, read by get_body
    body: Option<Arc<Vec<u8>>>,
}

impl MemLookupContext {
    fn hash(&self) -> String {
        self.request.key().combined()
    }
}

impl LookupContext for MemLookupContext {
    fn get_headers(&mut self, cb: LookupHeadersCallback) {
        let entry = {
            let cached = self.cached.read();
            cached
                .get(&self.hash())
                .map(|obj| (obj.meta.clone(), obj.body.clone()))
        };
        let result = match entry {
            Some((meta, body)) => {
                let body_length = body.len() as u64;
                self.body = Some(body);
                self.request.make_lookup_result(meta, body_length)
            }
            None => LookupResult::NotFound,
        };
        cb(result)
    }

    fn get_body(&mut self, range: AdjustedByteRange, cb: LookupBodyCallback) {
        let body = self
            .body
            .as_ref()
            .expect("get_body requires a prior get_headers hit");
        assert!(
            (range.last_byte_pos() as usize) < body.len(),
            "attempt to read past the end of the body"
        );
        let first = range.first_byte_pos() as usize;
        let last = range.last_byte_pos() as usize;
        cb(Some(Bytes::copy_from_slice(&body[first..=last])))
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

struct MemInsertContext {
    hash: String,
    cached: SharedMap,
    // response pieces staged here until commit, invisible to lookups
    meta: Option<CacheMeta>,
    body: Vec<u8>,
    committed: bool,
}

impl MemInsertContext {
    fn commit(&mut self) {
        debug_assert!(!self.committed, "insert context committed twice");
        self.committed = true;
        let object = CacheObject {
            meta: self.meta.take().expect("commit requires insert_headers"),
            body: Arc::new(std::mem::take(&mut self.body)),
        };
        // replaces any prior entry under this key
        self.cached.write().insert(self.hash.clone(), object);
    }
}

impl InsertContext for MemInsertContext {
    fn insert_headers(&mut self, meta: CacheMeta, end_stream: bool) {
        assert!(!self.committed, "insert_headers after commit");
        assert!(self.meta.is_none(), "insert_headers called twice");
        self.meta = Some(meta);
        if end_stream {
            self.commit();
        }
    }

    fn insert_body(&mut self, chunk: Bytes, ready_cb: InsertReadyCallback, end_stream: bool) {
        if self.committed {
            // a committed insertion ignores whatever else arrives
            ready_cb(false);
            return;
        }
        self.body.extend_from_slice(&chunk);
        if end_stream {
            self.commit();
        } else {
            ready_cb(true);
        }
    }
}

impl CacheStorage for MemCache {
    fn make_lookup_context(&self, request: LookupRequest) -> Box<dyn LookupContext> {
        Box::new(MemLookupContext {
            request,
            cached: self.cached.clone(),
            body: None,
        })
    }

    fn make_insert_context(&self, lookup: Box<dyn LookupContext>) -> Box<dyn InsertContext> {
        let lookup = lookup
            .as_any()
            .downcast_ref::<MemLookupContext>()
            .expect("MemCache only accepts its own lookup contexts");
        Box::new(MemInsertContext {
            hash: lookup.hash(),
            cached: self.cached.clone(),
            meta: None,
            body: Vec::new(),
            committed: false,
        })
    }

    fn update_headers(&self, lookup: &dyn LookupContext, meta: CacheMeta) -> bool {
        let lookup = lookup
            .as_any()
            .downcast_ref::<MemLookupContext>()
            .expect("MemCache only accepts its own lookup contexts");
        let mut cached = self.cached.write();
        match cached.get_mut(&lookup.hash()) {
            Some(obj) => {
                obj.meta = meta;
                true
            }
            None => {
                warn!("no entry to update for {}", lookup.hash());
                false
            }
        }
    }

    fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            name: "MemCache",
            supports_range_requests: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::CacheKey;
    use parking_lot::Mutex;
    use pingora_http::ResponseHeader;
    use std::time::{Duration, SystemTime};

    fn gen_meta(fresh_for: Duration) -> CacheMeta {
        let now = SystemTime::now();
        let mut header = ResponseHeader::build(200, None).unwrap();
        header.append_header("foo1", "bar1").unwrap();
        header.append_header("Server", "Lattice").unwrap();
        CacheMeta::new(now + fresh_for, now, header)
    }

    fn lookup_ctx(cache: &MemCache, key: &str) -> Box<dyn LookupContext> {
        let request = LookupRequest::from_key(CacheKey::new("", key), SystemTime::now());
        cache.make_lookup_context(request)
    }

    fn get_headers_sync(ctx: &mut dyn LookupContext) -> LookupResult {
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        ctx.get_headers(Box::new(move |r| {
            *result2.lock() = Some(r);
        }));
        let mut locked = result.lock();
        locked.take().expect("callback must have been invoked")
    }

    fn get_body_sync(ctx: &mut dyn LookupContext, range: AdjustedByteRange) -> Option<Bytes> {
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        ctx.get_body(
            range,
            Box::new(move |b| {
                *result2.lock() = Some(b);
            }),
        );
        let mut locked = result.lock();
        locked.take().expect("callback must have been invoked")
    }

    #[test]
    fn test_write_then_read() {
        let cache = MemCache::new();

        let mut ctx = lookup_ctx(&cache, "a");
        assert!(matches!(
            get_headers_sync(ctx.as_mut()),
            LookupResult::NotFound
        ));

        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("test1".into(), Box::new(|ok| assert!(ok)), false);
        insert.insert_body("test2".into(), Box::new(|_| {}), true);

        let mut ctx = lookup_ctx(&cache, "a");
        let result = get_headers_sync(ctx.as_mut());
        let LookupResult::Fresh { meta, body_length } = result else {
            panic!("expected a fresh hit");
        };
        assert_eq!(body_length, 10);
        assert_eq!(meta.headers().get("foo1").unwrap(), "bar1");

        let data = get_body_sync(ctx.as_mut(), AdjustedByteRange::new(0, 9)).unwrap();
        assert_eq!(data, "test1test2");
    }

    #[test]
    fn test_read_range() {
        let cache = MemCache::new();

        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("test1test2".into(), Box::new(|_| {}), true);

        let mut ctx = lookup_ctx(&cache, "a");
        let LookupResult::Fresh { body_length, .. } = get_headers_sync(ctx.as_mut()) else {
            panic!("expected a fresh hit");
        };
        assert_eq!(body_length, 10);

        let data = get_body_sync(ctx.as_mut(), AdjustedByteRange::new(5, 9)).unwrap();
        assert_eq!(data, "test2");
        let data = get_body_sync(ctx.as_mut(), AdjustedByteRange::new(4, 4)).unwrap();
        assert_eq!(data, "1");
    }

    #[test]
    #[should_panic(expected = "read past the end")]
    fn test_read_past_end_asserts() {
        let cache = MemCache::new();

        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("abc".into(), Box::new(|_| {}), true);

        let mut ctx = lookup_ctx(&cache, "a");
        let _ = get_headers_sync(ctx.as_mut());
        let _ = get_body_sync(ctx.as_mut(), AdjustedByteRange::new(0, 3));
    }

    #[test]
    fn test_commit_replaces_and_seals() {
        let cache = MemCache::new();

        // first version
        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("v1".into(), Box::new(|_| {}), true);

        // chunks after commit are ignored and answered with not-ready
        let ignored = Arc::new(Mutex::new(None));
        let ignored2 = ignored.clone();
        insert.insert_body(
            "zzz".into(),
            Box::new(move |ok| *ignored2.lock() = Some(ok)),
            false,
        );
        assert_eq!(*ignored.lock(), Some(false));

        // second insertion replaces the entry atomically
        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("v2-longer".into(), Box::new(|_| {}), true);

        let mut ctx = lookup_ctx(&cache, "a");
        let LookupResult::Fresh { body_length, .. } = get_headers_sync(ctx.as_mut()) else {
            panic!("expected a fresh hit");
        };
        assert_eq!(body_length, 9);
        let data = get_body_sync(ctx.as_mut(), AdjustedByteRange::new(0, 8)).unwrap();
        assert_eq!(data, "v2-longer");
    }

    #[test]
    fn test_pre_commit_invisible() {
        let cache = MemCache::new();

        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::from_secs(10)), false);
        insert.insert_body("partial".into(), Box::new(|_| {}), false);

        // not committed yet: lookups see nothing
        let mut ctx = lookup_ctx(&cache, "a");
        assert!(matches!(
            get_headers_sync(ctx.as_mut()),
            LookupResult::NotFound
        ));

        insert.insert_body(" body".into(), Box::new(|_| {}), true);
        let mut ctx = lookup_ctx(&cache, "a");
        assert!(matches!(
            get_headers_sync(ctx.as_mut()),
            LookupResult::Fresh { body_length: 12, .. }
        ));
    }

    #[test]
    fn test_update_headers() {
        let cache = MemCache::new();

        let ctx = lookup_ctx(&cache, "a");
        let mut insert = cache.make_insert_context(ctx);
        insert.insert_headers(gen_meta(Duration::ZERO), false);
        insert.insert_body("body".into(), Box::new(|_| {}), true);

        // the entry is admitted already stale
        let mut ctx = lookup_ctx(&cache, "a");
        assert!(!matches!(
            get_headers_sync(ctx.as_mut()),
            LookupResult::Fresh { .. }
        ));

        // refresh the meta, keep the body
        let refreshed = gen_meta(Duration::from_secs(10));
        assert!(cache.update_headers(ctx.as_ref(), refreshed));

        let mut ctx = lookup_ctx(&cache, "a");
        let LookupResult::Fresh { body_length, .. } = get_headers_sync(ctx.as_mut()) else {
            panic!("expected a fresh hit after update_headers");
        };
        assert_eq!(body_length, 4);

        // updating a missing entry reports failure
        let ctx = lookup_ctx(&cache, "never-inserted");
        assert!(!cache.update_headers(ctx.as_ref(), gen_meta(Duration::ZERO)));
    }

    #[test]
    fn test_cache_info() {
        let cache = MemCache::new();
        let info = cache.cache_info();
        assert_eq!(info.name, "MemCache");
        assert!(info.supports_range_requests);
    }
}
