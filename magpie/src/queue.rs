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

use std::ptr::NonNull;

use magpie_common::code::{ErrorValue, Key, Value};
use magpie_intrusive::dlist::Dlist;

use crate::entry::{Entry, EntryFlags, EntryQueueAdapter};
use crate::pointer::Weakener;

/// Eviction order with a hot zone and a cold zone.
///
/// One list, front to back: hot entries first, then cold. The midpoint
/// references the first cold entry. New entries join at the top of the cold
/// zone; hits promote to the hot front, pushing the entry just above the
/// midpoint back into cold. Eviction only ever takes the cold back, so a hot
/// entry cannot be evicted directly.
///
/// The zones stay balanced: `hot − cold ∈ {0, 1}`, rebalanced by sliding the
/// midpoint over its neighbor.
pub(crate) struct HotColdQueue<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    list: Dlist<EntryQueueAdapter<K, V, E, W>>,
    /// First cold entry; `None` when the cold zone is empty.
    mid: Option<NonNull<Entry<K, V, E, W>>>,
    hot: usize,
    cold: usize,
}

impl<K, V, E, W> HotColdQueue<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    pub(crate) fn new() -> Self {
        Self {
            list: Dlist::new(),
            mid: None,
            hot: 0,
            cold: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.hot + self.cold
    }

    /// # Safety
    ///
    /// `ptr` must be live and not in the queue.
    pub(crate) unsafe fn on_create(&mut self, mut ptr: NonNull<Entry<K, V, E, W>>) {
        debug_assert!(!ptr.as_ref().flags.contains(EntryFlags::IN_QUEUE));

        // Top of the cold zone.
        self.list.insert_before(self.mid, ptr);
        self.mid = Some(ptr);
        self.cold += 1;

        let flags = &mut ptr.as_mut().flags;
        flags.insert(EntryFlags::IN_QUEUE);
        flags.remove(EntryFlags::HOT);

        self.rebalance();
    }

    /// # Safety
    ///
    /// `ptr` must be live. Entries revived from the weak state re-enter the
    /// queue here.
    pub(crate) unsafe fn on_hit(&mut self, mut ptr: NonNull<Entry<K, V, E, W>>) {
        let flags = ptr.as_ref().flags;

        if flags.contains(EntryFlags::IN_QUEUE) {
            if self.mid == Some(ptr) {
                self.mid = self.list.next_of(ptr);
            }
            self.list.remove(ptr);
            if flags.contains(EntryFlags::HOT) {
                self.hot -= 1;
            } else {
                self.cold -= 1;
            }
        }

        self.list.push_front(ptr);
        self.hot += 1;
        ptr.as_mut().flags.insert(EntryFlags::IN_QUEUE | EntryFlags::HOT);

        self.rebalance();
    }

    /// # Safety
    ///
    /// `ptr` must be in the queue.
    pub(crate) unsafe fn on_unlink(&mut self, mut ptr: NonNull<Entry<K, V, E, W>>) {
        debug_assert!(ptr.as_ref().flags.contains(EntryFlags::IN_QUEUE));

        if self.mid == Some(ptr) {
            self.mid = self.list.next_of(ptr);
        }
        self.list.remove(ptr);
        if ptr.as_ref().flags.contains(EntryFlags::HOT) {
            self.hot -= 1;
        } else {
            self.cold -= 1;
        }
        ptr.as_mut().flags.remove(EntryFlags::IN_QUEUE | EntryFlags::HOT);

        self.rebalance();
    }

    /// Take the coldest entry out of the queue, or `None` when only hot
    /// entries remain.
    ///
    /// # Safety
    ///
    /// Queued entries must be live.
    pub(crate) unsafe fn pop_cold(&mut self) -> Option<NonNull<Entry<K, V, E, W>>> {
        if self.cold == 0 {
            return None;
        }

        let mut victim = self.list.back()?;
        debug_assert!(!victim.as_ref().flags.contains(EntryFlags::HOT));

        if self.mid == Some(victim) {
            self.mid = None;
            debug_assert_eq!(self.cold, 1);
        }
        self.list.remove(victim);
        self.cold -= 1;
        victim.as_mut().flags.remove(EntryFlags::IN_QUEUE | EntryFlags::HOT);

        self.rebalance();
        Some(victim)
    }

    unsafe fn rebalance(&mut self) {
        // Demote across the midpoint while the hot zone is oversized.
        while self.hot > self.cold + 1 {
            let mut demote = match self.mid {
                Some(mid) => self.list.prev_of(mid).expect("hot zone is non-empty"),
                None => self.list.back().expect("hot zone is non-empty"),
            };
            demote.as_mut().flags.remove(EntryFlags::HOT);
            self.mid = Some(demote);
            self.hot -= 1;
            self.cold += 1;
        }
        // Promote the first cold entry while the cold zone is oversized.
        while self.cold > self.hot {
            let mut promote = self.mid.expect("cold zone is non-empty");
            promote.as_mut().flags.insert(EntryFlags::HOT);
            self.mid = self.list.next_of(promote);
            self.cold -= 1;
            self.hot += 1;
        }
    }

    #[cfg(test)]
    unsafe fn check_invariants(&self) {
        assert!(self.hot == self.cold || self.hot == self.cold + 1);
        assert_eq!(self.list.len(), self.hot + self.cold);

        let mut seen_cold = false;
        let mut hot = 0;
        let mut cold = 0;
        for ptr in self.list.iter() {
            let is_hot = ptr.as_ref().flags.contains(EntryFlags::HOT);
            if !is_hot && !seen_cold {
                seen_cold = true;
                assert_eq!(self.mid, Some(ptr));
            }
            // Hot entries never follow cold ones.
            assert!(!(is_hot && seen_cold));
            if is_hot {
                hot += 1;
            } else {
                cold += 1;
            }
        }
        if !seen_cold {
            assert!(self.mid.is_none());
        }
        assert_eq!(hot, self.hot);
        assert_eq!(cold, self.cold);
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::pointer::NoWeaken;

    type TestEntry = Entry<u64, u64, u64, NoWeaken>;
    type TestQueue = HotColdQueue<u64, u64, u64, NoWeaken>;

    unsafe fn new_entry(key: u64) -> NonNull<TestEntry> {
        TestEntry::new_value(Some(key), key).allocate()
    }

    unsafe fn del_entry(ptr: NonNull<TestEntry>) {
        TestEntry::reclaim(ptr);
    }

    unsafe fn keys(queue: &TestQueue) -> Vec<u64> {
        queue.list.iter().map(|ptr| ptr.as_ref().key.unwrap()).collect_vec()
    }

    #[test]
    fn test_create_and_pop_drain() {
        unsafe {
            let ptrs = (0..5).map(|i| new_entry(i)).collect_vec();
            let mut queue = TestQueue::new();

            for ptr in &ptrs {
                queue.on_create(*ptr);
                queue.check_invariants();
            }
            assert_eq!(queue.len(), 5);

            // Each pop takes the current cold back; midpoint rebalancing
            // feeds formerly hot entries back into the cold zone as the
            // queue shrinks.
            let mut popped = vec![];
            while let Some(victim) = queue.pop_cold() {
                queue.check_invariants();
                popped.push(victim.as_ref().key.unwrap());
            }
            assert_eq!(popped, vec![1, 3, 4, 2]);

            // The last survivor sits in the hot zone and is never popped.
            assert_eq!(queue.len(), 1);
            assert_eq!(keys(&queue), vec![0]);

            queue.on_unlink(ptrs[0]);
            for ptr in ptrs {
                del_entry(ptr);
            }
        }
    }

    #[test]
    fn test_hit_promotes_and_protects() {
        unsafe {
            let ptrs = (0..4).map(|i| new_entry(i)).collect_vec();
            let mut queue = TestQueue::new();

            for ptr in &ptrs {
                queue.on_create(*ptr);
            }
            queue.check_invariants();

            queue.on_hit(ptrs[0]);
            queue.check_invariants();
            assert_eq!(keys(&queue).first(), Some(&0));
            assert!(ptrs[0].as_ref().flags.contains(EntryFlags::HOT));

            // The coldest entry is untouched by the promotion.
            let victim = queue.pop_cold().unwrap();
            assert_ne!(victim.as_ref().key.unwrap(), 0);
            queue.check_invariants();

            for ptr in ptrs {
                del_entry(ptr);
            }
        }
    }

    #[test]
    fn test_unlink_adjusts_midpoint() {
        unsafe {
            let ptrs = (0..6).map(|i| new_entry(i)).collect_vec();
            let mut queue = TestQueue::new();

            for ptr in &ptrs {
                queue.on_create(*ptr);
            }
            queue.check_invariants();

            let mid = queue.mid.unwrap();
            queue.on_unlink(mid);
            queue.check_invariants();

            for ptr in &ptrs {
                if ptr.as_ref().flags.contains(EntryFlags::IN_QUEUE) {
                    queue.on_unlink(*ptr);
                    queue.check_invariants();
                }
            }
            assert_eq!(queue.len(), 0);
            assert!(queue.mid.is_none());

            for ptr in ptrs {
                del_entry(ptr);
            }
        }
    }

    #[test]
    fn test_drain_evicts_least_recently_hit_first() {
        unsafe {
            let ptrs = (0..4).map(|i| new_entry(i)).collect_vec();
            let mut queue = TestQueue::new();

            for ptr in &ptrs {
                queue.on_create(*ptr);
            }
            for ptr in &ptrs {
                queue.on_hit(*ptr);
                queue.check_invariants();
            }

            let mut popped = vec![];
            while let Some(victim) = queue.pop_cold() {
                queue.check_invariants();
                popped.push(victim.as_ref().key.unwrap());
            }
            assert_eq!(popped, vec![0, 1, 2]);

            // The most recently hit entry survives in the hot zone.
            assert_eq!(keys(&queue), vec![3]);

            queue.on_unlink(ptrs[3]);
            for ptr in ptrs {
                del_entry(ptr);
            }
        }
    }
}
