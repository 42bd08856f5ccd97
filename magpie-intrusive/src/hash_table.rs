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
use std::ptr::NonNull;

use crate::adapter::Adapter;

/// Failure to grow the bucket array.
#[derive(Debug)]
pub enum RehashError {
    /// The allocator refused the new bucket array.
    Alloc(TryReserveError),
    /// The required bucket count exceeds the addressable range.
    Overflow,
}

impl From<TryReserveError> for RehashError {
    fn from(e: TryReserveError) -> Self {
        Self::Alloc(e)
    }
}

impl std::fmt::Display for RehashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "bucket array allocation failed: {e}"),
            Self::Overflow => write!(f, "bucket count overflow"),
        }
    }
}

impl std::error::Error for RehashError {}

/// Link embedded by items stored in a [`HashTable`].
///
/// The item's hash is cached here so that rehashing never recomputes it.
#[derive(Debug, Default)]
pub struct HashLink {
    next: Option<NonNull<HashLink>>,
    hash: u64,
    linked: bool,
}

impl HashLink {
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Intrusive chained hash table.
///
/// Buckets hold singly-linked chains with head insertion, so the most
/// recently linked item for a hash is found first when scanning its bucket.
/// Rehashing grows the bucket array to the next power of two that satisfies
/// the configured maximum load factor and preserves chain order, which keeps
/// the newest-first property across growth.
pub struct HashTable<A>
where
    A: Adapter<Link = HashLink>,
{
    buckets: Vec<Option<NonNull<HashLink>>>,
    len: usize,
    max_load_factor: f64,

    _marker: std::marker::PhantomData<A>,
}

const INITIAL_BUCKETS: usize = 4;

impl<A> Default for HashTable<A>
where
    A: Adapter<Link = HashLink>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> HashTable<A>
where
    A: Adapter<Link = HashLink>,
{
    pub fn new() -> Self {
        Self::with_max_load_factor(1.0)
    }

    pub fn with_max_load_factor(max_load_factor: f64) -> Self {
        assert!(max_load_factor > 0.0);
        Self {
            buckets: vec![None; INITIAL_BUCKETS],
            len: 0,
            max_load_factor,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.buckets.len() as f64
    }

    pub fn max_load_factor(&self) -> f64 {
        self.max_load_factor
    }

    pub fn bucket_index(&self, hash: u64) -> usize {
        // Bucket counts are always powers of two.
        hash as usize & (self.buckets.len() - 1)
    }

    /// Whether linking one more item would exceed the maximum load factor.
    ///
    /// Callers use this to drop removable items before [`HashTable::link`]
    /// triggers the rehash, which may make the rehash unnecessary.
    pub fn needs_rehash(&self) -> bool {
        (self.len + 1) as f64 > self.max_load_factor * self.buckets.len() as f64
    }

    /// Link `item` under `hash`, at the head of its bucket.
    ///
    /// Rehashes first when the load factor demands it. A failed rehash
    /// allocation leaves the table untouched and the item unlinked.
    ///
    /// # Safety
    ///
    /// `item` must be live, unlinked, and stay live while linked here.
    pub unsafe fn link(&mut self, hash: u64, item: NonNull<A::Item>) -> Result<(), RehashError> {
        if self.needs_rehash() {
            let mut target = self.buckets.len().max(INITIAL_BUCKETS);
            while (self.len + 1) as f64 > self.max_load_factor * target as f64 {
                target = target.checked_mul(2).ok_or(RehashError::Overflow)?;
            }
            self.rehash(target)?;
        }

        let mut link = A::item_to_link(item);
        debug_assert!(!link.as_ref().linked);

        let index = self.bucket_index(hash);
        link.as_mut().hash = hash;
        link.as_mut().next = self.buckets[index];
        link.as_mut().linked = true;
        self.buckets[index] = Some(link);
        self.len += 1;

        Ok(())
    }

    /// # Safety
    ///
    /// `item` must be linked in this table.
    pub unsafe fn unlink(&mut self, item: NonNull<A::Item>) {
        let mut link = A::item_to_link(item);
        debug_assert!(link.as_ref().linked);

        let index = self.bucket_index(link.as_ref().hash);

        let mut cursor = &mut self.buckets[index];
        loop {
            let current = cursor.expect("unlink target must be reachable from its bucket");
            if current == link {
                *cursor = link.as_ref().next;
                break;
            }
            cursor = &mut (*current.as_ptr()).next;
        }

        link.as_mut().next = None;
        link.as_mut().linked = false;
        self.len -= 1;
    }

    /// Iterate the bucket that `hash` maps to, newest first.
    pub fn bucket_iter(&self, hash: u64) -> BucketIter<'_, A> {
        BucketIter {
            cursor: self.buckets[self.bucket_index(hash)],
            _table: std::marker::PhantomData,
        }
    }

    /// Iterate every linked item, bucket by bucket.
    pub fn iter(&self) -> TableIter<'_, A> {
        TableIter {
            table: self,
            bucket: 0,
            cursor: None,
        }
    }

    /// Unlink every item and hand each to `dispose`. The bucket array is
    /// kept.
    ///
    /// # Safety
    ///
    /// Every linked item must be live.
    pub unsafe fn clear_and_dispose(&mut self, mut dispose: impl FnMut(NonNull<A::Item>)) {
        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();
            while let Some(mut link) = cursor {
                cursor = link.as_mut().next.take();
                link.as_mut().linked = false;
                dispose(A::link_to_item(link));
            }
        }
        self.len = 0;
    }

    /// Grow the bucket array, preserving chain order.
    ///
    /// Growth keeps the old bucket count a divisor of the new one, so items
    /// that share a bucket afterwards already shared one before and their
    /// relative order carries over unchanged.
    unsafe fn rehash(&mut self, new_count: usize) -> Result<(), RehashError> {
        debug_assert!(new_count.is_power_of_two());
        debug_assert!(new_count > self.buckets.len());

        let mut new_buckets: Vec<Option<NonNull<HashLink>>> = Vec::new();
        new_buckets.try_reserve_exact(new_count)?;
        new_buckets.resize(new_count, None);

        let mut tails: Vec<Option<NonNull<HashLink>>> = Vec::new();
        tails.try_reserve_exact(new_count)?;
        tails.resize(new_count, None);

        let mask = new_count - 1;
        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();
            while let Some(mut link) = cursor {
                cursor = link.as_mut().next.take();

                let new_index = link.as_ref().hash as usize & mask;
                match tails[new_index] {
                    Some(mut tail) => tail.as_mut().next = Some(link),
                    None => new_buckets[new_index] = Some(link),
                }
                tails[new_index] = Some(link);
            }
        }

        self.buckets = new_buckets;
        Ok(())
    }
}

pub struct BucketIter<'a, A>
where
    A: Adapter<Link = HashLink>,
{
    cursor: Option<NonNull<HashLink>>,
    _table: std::marker::PhantomData<&'a HashTable<A>>,
}

impl<A> Iterator for BucketIter<'_, A>
where
    A: Adapter<Link = HashLink>,
{
    type Item = NonNull<A::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.cursor?;
        unsafe {
            self.cursor = link.as_ref().next;
            Some(A::link_to_item(link))
        }
    }
}

pub struct TableIter<'a, A>
where
    A: Adapter<Link = HashLink>,
{
    table: &'a HashTable<A>,
    bucket: usize,
    cursor: Option<NonNull<HashLink>>,
}

impl<A> Iterator for TableIter<'_, A>
where
    A: Adapter<Link = HashLink>,
{
    type Item = NonNull<A::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(link) = self.cursor {
                unsafe {
                    self.cursor = link.as_ref().next;
                    return Some(A::link_to_item(link));
                }
            }
            if self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.cursor = self.table.buckets[self.bucket];
            self.bucket += 1;
        }
    }
}
