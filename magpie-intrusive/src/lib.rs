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

//! Intrusive data structures used by the magpie cache engine.
//!
//! Items participate in several containers at once (hash chain, eviction
//! queue, refresh delay list) through links embedded in a single allocation.
//! The containers never own their items; the caller is responsible for
//! keeping the allocation alive while it is linked anywhere.

pub mod adapter;
pub mod dlist;
pub mod hash_table;
