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

//! Caching filter configuration

/// Options shared by every [crate::CacheFilter](filter) built from them.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// The maximum number of ranges accepted in a single `Range` header
    /// before the header is rejected wholesale. When unset, an input length
    /// cap bounds the parse instead.
    pub byte_range_parse_limit: Option<usize>,
}
