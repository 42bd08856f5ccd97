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

use std::collections::TryReserveError;
use std::sync::Arc;

use magpie_intrusive::hash_table::RehashError;

/// The default resolver-error payload: an opaque, shareable error value.
pub type DefaultError = Arc<dyn std::error::Error + Send + Sync>;

/// Cache error taxonomy.
///
/// `E` is the resolver-error payload type configured on the cache.
#[derive(Debug, thiserror::Error)]
pub enum Error<E = DefaultError> {
    /// A user-supplied resolver reported an error.
    #[error("resolver reported an error")]
    Resolver(E),
    /// The cache was dropped, or a pending resolution was cancelled, before a
    /// completion could be delivered.
    #[error("resolution cancelled")]
    Cancelled,
    /// A bucket-array allocation was refused; the cache is unchanged.
    #[error("allocation failed")]
    Allocation(#[from] TryReserveError),
    /// A resolver callback was invoked after it already delivered a
    /// completion.
    #[error("completion already delivered")]
    AlreadyCompleted,
    /// The entry or bucket count exceeded the addressable range.
    #[error("capacity overflow")]
    CapacityOverflow,
}

impl<E> From<RehashError> for Error<E> {
    fn from(e: RehashError) -> Self {
        match e {
            RehashError::Alloc(e) => Self::Allocation(e),
            RehashError::Overflow => Self::CapacityOverflow,
        }
    }
}

pub type Result<T, E = DefaultError> = std::result::Result<T, Error<E>>;
