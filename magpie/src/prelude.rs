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

pub use crate::cache::{Cache, CacheBuilder, IdentitySet, LocalCache};
pub use crate::concurrency::{ThreadSafe, ThreadUnsafe};
pub use crate::error::{DefaultError, Error, Result};
pub use crate::metrics::Metrics;
pub use crate::pointer::{NeverWeak, NoWeaken, SharedPointer, WeakenShared, Weakener};
pub use crate::policy::{ComposeError, Policy, RefreshConfig};
pub use crate::refresh::RefreshDriver;
pub use crate::resolver::{AsyncGet, ResolveHandle};
pub use magpie_common::clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use magpie_common::code::{DefaultHashBuilder, ErrorValue, HashBuilder, Key, Value};
