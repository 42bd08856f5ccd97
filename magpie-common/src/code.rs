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

use std::fmt::Debug;
use std::hash::{BuildHasher, Hash};

/// Key trait for the cache.
pub trait Key: Send + Sync + 'static + Hash + Eq {}
/// Value trait for the cache.
pub trait Value: Send + Sync + 'static {}

impl<T: Send + Sync + 'static + Hash + Eq> Key for T {}
impl<T: Send + Sync + 'static> Value for T {}

/// Error-value trait for the cache.
///
/// Error values are delivered to every waiter of a pending resolution, so they
/// must be cloneable.
pub trait ErrorValue: Send + Sync + 'static + Clone + Debug {}

impl<T: Send + Sync + 'static + Clone + Debug> ErrorValue for T {}

/// Hash builder trait.
pub trait HashBuilder: BuildHasher + Send + Sync + 'static {}

impl<T: BuildHasher + Send + Sync + 'static> HashBuilder for T {}

/// The default hash builder.
pub type DefaultHashBuilder = ahash::RandomState;
