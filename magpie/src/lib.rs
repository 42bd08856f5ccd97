//  Copyright 2026 Magpie Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! magpie - in-process caching with composable policies.
//!
//! A cache is configured from an enumerated set of policies: size bounds
//! with hot/cold eviction, value and error expiry, weak-reference retention
//! of managed pointers, synchronous and asynchronous resolvers with
//! single-flight misses, and scheduled background refresh.
//!
//! ```
//! use magpie::CacheBuilder;
//!
//! let cache = CacheBuilder::<u64, String>::new()
//!     .with_max_size(1024)
//!     .build()
//!     .unwrap();
//!
//! cache.emplace(1, "one".to_string()).unwrap();
//! assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
//! ```

mod cache;
mod concurrency;
mod entry;
mod error;
mod generic;
mod metrics;
mod pointer;
mod policy;
mod queue;
mod refresh;
mod resolver;

pub mod prelude;
pub use prelude::*;
