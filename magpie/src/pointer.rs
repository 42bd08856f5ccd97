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

use std::sync::{Arc, Weak};

/// A value type that is a managed, shareable pointer with a non-owning
/// counterpart.
pub trait SharedPointer: Clone + Send + Sync + 'static {
    type Weak: Clone + Send + Sync + 'static;

    fn downgrade(this: &Self) -> Self::Weak;

    /// `None` when every owning pointer has been dropped.
    fn upgrade(weak: &Self::Weak) -> Option<Self>;
}

impl<T: Send + Sync + 'static> SharedPointer for Arc<T> {
    type Weak = Weak<T>;

    fn downgrade(this: &Self) -> Self::Weak {
        Arc::downgrade(this)
    }

    fn upgrade(weak: &Self::Weak) -> Option<Self> {
        weak.upgrade()
    }
}

/// How an evicted value is weakened, if at all.
///
/// Selected per cache at the type level; the non-pointer strategy makes the
/// weak payload uninhabited so weakened entries simply expire.
pub trait Weakener<V>: Send + Sync + 'static {
    type Weak: Send + Sync + 'static;

    fn weaken(value: &V) -> Option<Self::Weak>;

    fn strengthen(weak: &Self::Weak) -> Option<V>;
}

/// Values cannot be weakened; eviction expires them.
pub struct NoWeaken;

/// The weak payload of [`NoWeaken`]. Uninhabited.
pub enum NeverWeak {}

impl<V> Weakener<V> for NoWeaken {
    type Weak = NeverWeak;

    fn weaken(_: &V) -> Option<Self::Weak> {
        None
    }

    fn strengthen(weak: &Self::Weak) -> Option<V> {
        match *weak {}
    }
}

/// Values are managed pointers; eviction keeps a non-owning handle that a
/// later lookup may strengthen back into the owning form.
pub struct WeakenShared;

impl<V: SharedPointer> Weakener<V> for WeakenShared {
    type Weak = V::Weak;

    fn weaken(value: &V) -> Option<Self::Weak> {
        Some(V::downgrade(value))
    }

    fn strengthen(weak: &Self::Weak) -> Option<V> {
        V::upgrade(weak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_pointer_roundtrip() {
        let strong = Arc::new(7);
        let weak = <Arc<i32> as SharedPointer>::downgrade(&strong);
        assert_eq!(<Arc<i32> as SharedPointer>::upgrade(&weak).as_deref(), Some(&7));

        drop(strong);
        assert!(<Arc<i32> as SharedPointer>::upgrade(&weak).is_none());
    }

    #[test]
    fn test_no_weaken_never_produces_a_weak() {
        assert!(<NoWeaken as Weakener<String>>::weaken(&"x".to_string()).is_none());
    }
}
