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

use std::sync::atomic::{AtomicUsize, Ordering};

/// Internal counters, updated with relaxed ordering on the hot paths.
#[derive(Debug, Default)]
pub struct Metrics {
    pub hit: AtomicUsize,
    pub miss: AtomicUsize,
    pub insert: AtomicUsize,
    pub replace: AtomicUsize,
    pub evict: AtomicUsize,
    pub weaken: AtomicUsize,
    pub strengthen: AtomicUsize,
    pub resolve_success: AtomicUsize,
    pub resolve_error: AtomicUsize,
    pub refresh: AtomicUsize,
    pub cancel: AtomicUsize,
}

macro_rules! counter {
    ($($name:ident),* $(,)?) => {
        impl Metrics {
            $(
                pub fn $name(&self) -> usize {
                    self.$name.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

counter! {
    hit, miss, insert, replace, evict, weaken, strengthen,
    resolve_success, resolve_error, refresh, cancel,
}
