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

use std::cell::RefCell;

use parking_lot::Mutex;

/// Single-owner access to the cache core.
///
/// One cell guards the entire core: the table, every linked entry, the
/// eviction queue, and the refresh delay list. User callbacks never run while
/// the cell is held; completions collected inside are delivered after release.
pub trait CoreCell<T>: 'static {
    fn new(core: T) -> Self;

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R;
}

/// Selects the cell type guarding the cache core.
pub trait Concurrency: Send + Sync + 'static {
    type Cell<T: 'static>: CoreCell<T>;
}

/// Concurrency policy backed by a real mutex. The default.
pub struct ThreadSafe;

/// Concurrency policy with a zero-cost stub in place of the mutex.
///
/// A cache built with this policy is not `Sync`; the caller promises external
/// synchronization (typically single-threaded use). Async resolvers and the
/// refresh drivers are only available on [`ThreadSafe`] caches.
pub struct ThreadUnsafe;

pub struct MutexCell<T>(Mutex<T>);

impl<T: 'static> CoreCell<T> for MutexCell<T> {
    fn new(core: T) -> Self {
        Self(Mutex::new(core))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.lock())
    }
}

pub struct UnsyncCell<T>(RefCell<T>);

impl<T: 'static> CoreCell<T> for UnsyncCell<T> {
    fn new(core: T) -> Self {
        Self(RefCell::new(core))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl Concurrency for ThreadSafe {
    type Cell<T: 'static> = MutexCell<T>;
}

impl Concurrency for ThreadUnsafe {
    type Cell<T: 'static> = UnsyncCell<T>;
}
