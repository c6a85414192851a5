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

//! Utility functions to help process HTTP headers for caching

use crate::cache_control::CacheControl;
use crate::http_date;
use crate::meta::CacheMeta;

use http::header;
use http::{HeaderValue, Method};
use log::debug;
use pingora_http::{RequestHeader, ResponseHeader};
use std::time::{Duration, SystemTime};

/// Decide if the request can be served from cache at all.
pub fn request_cacheable(req_header: &RequestHeader) -> bool {
    req_header.method == Method::GET
}

/// Decide if the response is cacheable, and if so return its [CacheMeta].
///
/// `cache_control` is the parsed [CacheControl] from the response header. It
/// is a standalone argument so that the caller can choose to use, change or
/// ignore it.
pub fn resp_cacheable(
    cache_control: Option<&CacheControl>,
    resp_header: &ResponseHeader,
    now: SystemTime,
) -> Option<CacheMeta> {
    if !resp_header.status.is_success() {
        return None;
    }
    if let Some(cc) = cache_control {
        if cc.no_store() || cc.private() {
            debug!("response uncacheable: no-store/private directive");
            return None;
        }
    }
    // A zero lifetime still caches: the entry is admitted already stale and
    // will be revalidated on its next hit.
    let fresh_until = calculate_fresh_until(now, cache_control, resp_header);

    let mut cloned_header = resp_header.clone();
    if let Some(cc) = cache_control {
        cc.strip_private_headers(&mut cloned_header);
    }
    Some(CacheMeta::new(fresh_until, now, cloned_header))
}

/// Calculate the [SystemTime] at which the asset expires.
///
/// A `Cache-Control` header, when present, is authoritative, even when it
/// yields a zero lifetime; the `Expires` header is only the fallback.
pub fn calculate_fresh_until(
    now: SystemTime,
    cache_control: Option<&CacheControl>,
    resp_header: &ResponseHeader,
) -> SystemTime {
    fn freshness_ttl_to_time(now: SystemTime, fresh_for: Duration) -> SystemTime {
        if fresh_for.is_zero() {
            // ensure that the response is treated as stale
            now.checked_sub(Duration::from_secs(1))
                .unwrap_or(SystemTime::UNIX_EPOCH)
        } else {
            now.checked_add(fresh_for).unwrap_or(now)
        }
    }

    if let Some(cc) = cache_control {
        return freshness_ttl_to_time(now, cc.effective_max_age());
    }
    calculate_expires_header_time(resp_header)
        .unwrap_or_else(|| freshness_ttl_to_time(now, Duration::ZERO))
}

/// Calculate the expire time from the `Expires` header only.
pub fn calculate_expires_header_time(resp_header: &ResponseHeader) -> Option<SystemTime> {
    // according to RFC 7234:
    // https://datatracker.ietf.org/doc/html/rfc7234#section-4.2.1
    // - treat multiple expires headers as invalid
    // https://datatracker.ietf.org/doc/html/rfc7234#section-5.3
    // - "MUST interpret invalid date formats... as representing a time in the past"
    let mut expires_iter = resp_header.headers.get_all(header::EXPIRES).iter();
    let expires_header = expires_iter.next();
    if expires_header.is_none() || expires_iter.next().is_some() {
        return None;
    }
    http_date::parse(expires_header).or(Some(SystemTime::UNIX_EPOCH))
}

/// The `Age` a cached response has reached by `now`, in whole seconds.
///
/// Computed against the cached `Date` header; a missing or unparseable
/// `Date` falls back to the time the entry was admitted or last revalidated.
pub fn response_age(meta: &CacheMeta, now: SystemTime) -> u64 {
    let base = http_date::parse(meta.headers().get(header::DATE)).unwrap_or_else(|| meta.updated());
    now.duration_since(base).map_or(0, |d| d.as_secs())
}

/// After a successful revalidation, refresh the headers a 304 is allowed to
/// update on the cached response.
pub fn revalidate_merge_header(
    cached: &ResponseHeader,
    resp_304: &ResponseHeader,
) -> ResponseHeader {
    /*
     * https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.5
     * 304 response MUST generate ... would have been sent in a 200 ...
     * - Content-Location, Date, ETag, and Vary
     * - Cache-Control and Expires...
     */
    let mut old_header = cached.clone();
    let mut clone_header = |header_name: &'static str| {
        // TODO: multiple headers
        if let Some(value) = resp_304.headers.get(header_name) {
            old_header.insert_header(header_name, value).unwrap();
        }
    };
    clone_header("date");
    clone_header("cache-control");
    clone_header("expires");
    clone_header("etag");
    clone_header("last-modified");
    old_header
}

/// The precondition headers a revalidation request carries upstream.
///
/// `If-None-Match` from the cached ETag when one exists, and
/// `If-Modified-Since` from the cached `Last-Modified` (falling back to the
/// cached `Date`).
pub fn revalidation_headers(
    validators: &crate::storage::Validators,
) -> Vec<(header::HeaderName, HeaderValue)> {
    let mut headers = Vec::with_capacity(2);
    if let Some(etag) = validators.etag.as_ref() {
        headers.push((header::IF_NONE_MATCH, etag.clone()));
    }
    if let Some(since) = validators.if_modified_since() {
        headers.push((header::IF_MODIFIED_SINCE, since.clone()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CACHE_CONTROL, EXPIRES, SET_COOKIE};

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn build_response(status: u16, headers: &[(header::HeaderName, &str)]) -> ResponseHeader {
        let mut header = ResponseHeader::build(status, Some(headers.len())).unwrap();
        for (k, v) in headers {
            header.append_header(k.to_string(), *v).unwrap();
        }
        header
    }

    fn resp_cacheable_wrapper(resp: &ResponseHeader) -> Option<CacheMeta> {
        resp_cacheable(
            CacheControl::from_resp_headers(resp).as_ref(),
            resp,
            SystemTime::now(),
        )
    }

    #[test]
    fn test_request_cacheable() {
        let req = RequestHeader::build("GET", b"/", None).unwrap();
        assert!(request_cacheable(&req));
        for method in ["HEAD", "POST", "PUT", "DELETE", "PURGE"] {
            let req = RequestHeader::build(method, b"/", None).unwrap();
            assert!(!request_cacheable(&req));
        }
    }

    #[test]
    fn test_resp_cacheable() {
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[(CACHE_CONTROL, "max-age=12345")],
        ))
        .unwrap();

        assert!(meta.is_fresh(SystemTime::now()));
        assert!(meta.is_fresh(SystemTime::now() + Duration::from_secs(12)));
        assert!(!meta.is_fresh(SystemTime::now() + Duration::from_secs(12346)));
    }

    #[test]
    fn test_resp_uncacheable_directives() {
        let meta =
            resp_cacheable_wrapper(&build_response(200, &[(CACHE_CONTROL, "private, max-age=12345")]));
        assert!(meta.is_none());

        let meta =
            resp_cacheable_wrapper(&build_response(200, &[(CACHE_CONTROL, "no-store, max-age=12345")]));
        assert!(meta.is_none());
    }

    #[test]
    fn test_resp_uncacheable_statuses() {
        init_log();
        for status in [301, 304, 404, 500, 503] {
            let meta =
                resp_cacheable_wrapper(&build_response(status, &[(CACHE_CONTROL, "max-age=12345")]));
            assert!(meta.is_none(), "status {status} must not be cacheable");
        }
    }

    #[test]
    fn test_resp_zero_max_age() {
        let meta =
            resp_cacheable_wrapper(&build_response(200, &[(CACHE_CONTROL, "max-age=0, public")]));

        // cacheable, but needs revalidation
        assert!(!meta.unwrap().is_fresh(SystemTime::now()));
    }

    #[test]
    fn test_resp_expires() {
        let five_sec_time = SystemTime::now() + Duration::from_secs(5);

        // future expires is cacheable and fresh
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[(EXPIRES, &http_date::format(five_sec_time))],
        ))
        .unwrap();
        assert!(meta.is_fresh(SystemTime::now()));
        assert!(!meta.is_fresh(SystemTime::now() + Duration::from_secs(6)));
    }

    #[test]
    fn test_resp_past_expires() {
        // cacheable, but expired
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[(EXPIRES, "Fri, 15 May 2015 15:34:21 GMT")],
        ));
        assert!(!meta.unwrap().is_fresh(SystemTime::now()));
    }

    #[test]
    fn test_resp_nonstandard_expires() {
        // invalid date formats count as a time in the past
        let meta = resp_cacheable_wrapper(&build_response(200, &[(EXPIRES, "0")]));
        assert!(!meta.unwrap().is_fresh(SystemTime::now()));
    }

    #[test]
    fn test_resp_multiple_expires() {
        let five_sec_time = SystemTime::now() + Duration::from_secs(5);
        let ten_sec_time = SystemTime::now() + Duration::from_secs(10);

        // multiple expires = invalid = stale
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[
                (EXPIRES, &http_date::format(five_sec_time)),
                (EXPIRES, &http_date::format(ten_sec_time)),
            ],
        ));
        assert!(!meta.unwrap().is_fresh(SystemTime::now()));
    }

    #[test]
    fn test_resp_cache_control_with_expires() {
        let five_sec_time = SystemTime::now() + Duration::from_secs(5);
        // cache-control takes precedence over expires
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[
                (EXPIRES, &http_date::format(five_sec_time)),
                (CACHE_CONTROL, "max-age=0"),
            ],
        ));
        assert!(!meta.unwrap().is_fresh(SystemTime::now()));
    }

    #[test]
    fn test_resp_cache_no_cache_fields() {
        // check #field-names are stripped from the cached header
        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[
                (SET_COOKIE, "my-cookie"),
                (CACHE_CONTROL, "private=\"something\", max-age=10"),
                (header::HeaderName::from_static("something"), "foo"),
            ],
        ))
        .unwrap();
        assert!(meta.headers().contains_key(SET_COOKIE));
        assert!(!meta.headers().contains_key("something"));

        let meta = resp_cacheable_wrapper(&build_response(
            200,
            &[
                (SET_COOKIE, "my-cookie"),
                (CACHE_CONTROL, "max-age=0, no-cache=\"meta1, SeT-Cookie ,meta2\""),
                (header::HeaderName::from_static("meta1"), "foo"),
            ],
        ))
        .unwrap();
        assert!(!meta.headers().contains_key(SET_COOKIE));
        assert!(!meta.headers().contains_key("meta1"));
    }

    #[test]
    fn test_response_age() {
        let now = SystemTime::now();
        let date = http_date::format(now - Duration::from_secs(25));
        let meta = CacheMeta::new(
            now + Duration::from_secs(100),
            now,
            build_response(200, &[(header::DATE, &date)]),
        );
        assert_eq!(response_age(&meta, now), 25);

        // no Date header: age counts from admission
        let meta = CacheMeta::new(now + Duration::from_secs(100), now, build_response(200, &[]));
        assert_eq!(response_age(&meta, now + Duration::from_secs(7)), 7);
    }

    #[test]
    fn test_revalidate_merge_header() {
        let cached = build_response(
            200,
            &[
                (header::DATE, "Sun, 06 Nov 1994 08:49:37 GMT"),
                (header::ETAG, "\"v1\""),
                (header::CONTENT_LENGTH, "5"),
                (header::HeaderName::from_static("x-custom"), "kept"),
            ],
        );
        let resp_304 = build_response(
            304,
            &[
                (header::DATE, "Sun, 06 Nov 1994 08:49:47 GMT"),
                (header::ETAG, "\"v2\""),
            ],
        );
        let merged = revalidate_merge_header(&cached, &resp_304);
        assert_eq!(merged.status.as_u16(), 200);
        assert_eq!(
            merged.headers.get(header::DATE).unwrap(),
            "Sun, 06 Nov 1994 08:49:47 GMT"
        );
        assert_eq!(merged.headers.get(header::ETAG).unwrap(), "\"v2\"");
        assert_eq!(merged.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(merged.headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_revalidation_headers() {
        use crate::storage::Validators;

        let mut resp = build_response(
            200,
            &[
                (header::ETAG, "abc123"),
                (header::LAST_MODIFIED, "Sun, 06 Nov 1994 08:49:37 GMT"),
            ],
        );
        let validators = Validators::from_headers(&resp.headers).unwrap();
        let headers = revalidation_headers(&validators);
        assert_eq!(
            headers,
            vec![
                (header::IF_NONE_MATCH, HeaderValue::from_static("abc123")),
                (
                    header::IF_MODIFIED_SINCE,
                    HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT")
                ),
            ]
        );

        // without Last-Modified, If-Modified-Since comes from Date
        resp.remove_header(&header::LAST_MODIFIED);
        resp.insert_header(header::DATE, "Sun, 06 Nov 1994 08:49:37 GMT")
            .unwrap();
        let validators = Validators::from_headers(&resp.headers).unwrap();
        let headers = revalidation_headers(&validators);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].0, header::IF_MODIFIED_SINCE);
    }
}
