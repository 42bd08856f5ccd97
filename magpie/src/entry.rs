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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use magpie_common::code::{ErrorValue, Key, Value};
use magpie_intrusive::dlist::DlistLink;
use magpie_intrusive::hash_table::HashLink;
use magpie_intrusive::intrusive_adapter;

use crate::pointer::Weakener;

bitflags! {
    /// Container membership and refresh bookkeeping for one entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EntryFlags: u8 {
        const IN_TABLE = 0b0000_0001;
        const IN_QUEUE = 0b0000_0010;
        /// On the hot side of the eviction queue's midpoint.
        const HOT = 0b0000_0100;
        const IN_REFRESH_LIST = 0b0000_1000;
        const REFRESH_STARTED = 0b0001_0000;
    }
}

/// A completion callback registered by one waiter of a pending resolution.
pub(crate) type CompletionFn<V, E> = Box<dyn FnOnce(&std::result::Result<V, E>) + Send>;

/// The waiter queue of an in-flight resolution.
///
/// Callbacks complete in registration order. Cancellation drains the queue
/// without invoking anything; dropping a callback closes its waiter's channel,
/// which the waiter observes as a cancellation.
pub(crate) struct PendingQueue<V, E> {
    callbacks: Vec<CompletionFn<V, E>>,
    expired: bool,
    weakened: bool,
}

impl<V, E> PendingQueue<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            expired: false,
            weakened: false,
        }
    }

    pub(crate) fn push_callback(&mut self, callback: CompletionFn<V, E>) {
        self.callbacks.push(callback);
    }

    pub(crate) fn waiters(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn mark_expired(&mut self) {
        self.expired = true;
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expired
    }

    pub(crate) fn weaken(&mut self) {
        self.weakened = true;
    }

    pub(crate) fn strengthen(&mut self) {
        self.weakened = false;
    }

    pub(crate) fn is_weakened(&self) -> bool {
        self.weakened
    }

    pub(crate) fn into_callbacks(self) -> Vec<CompletionFn<V, E>> {
        self.callbacks
    }
}

/// The entry's resolution state.
///
/// Transitions are monotonic: `Pending` → (`Value` | `Error`) → (`Weak` |
/// `Expired`) → `Expired`, with `Weak` → `Value` on a successful strengthen.
pub(crate) enum State<V, E, WK> {
    Pending(PendingQueue<V, E>),
    Value(V),
    Error(E),
    Weak(WK),
    Expired,
}

/// One cache record.
///
/// A single allocation that participates in the hash table, the eviction
/// queue, and the refresh delay list through embedded links. The allocation
/// is freed when the strong count drops to zero; the table owns one count
/// while the entry is linked, and each [`EntryRef`] owns one.
pub(crate) struct Entry<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    pub(crate) hash_link: HashLink,
    pub(crate) queue_link: DlistLink,
    pub(crate) refresh_link: DlistLink,

    refs: AtomicUsize,

    /// `None` only for identity-set entries, whose value is its own key.
    pub(crate) key: Option<K>,
    pub(crate) state: State<V, E, W::Weak>,
    pub(crate) flags: EntryFlags,

    pub(crate) expire_at: Option<Duration>,
    /// Monotonic shadow of `expire_at`, installed when the configured clock
    /// is not steady so wall-clock jumps cannot un-expire the entry.
    pub(crate) expire_at_steady: Option<Duration>,
    pub(crate) refresh_at: Option<Duration>,
    pub(crate) cancel_at: Option<Duration>,
}

intrusive_adapter! {
    pub(crate) EntryTableAdapter<K, V, E, W> = Entry<K, V, E, W> { hash_link: HashLink }
    where K: Key, V: Value, E: ErrorValue, W: Weakener<V>
}

intrusive_adapter! {
    pub(crate) EntryQueueAdapter<K, V, E, W> = Entry<K, V, E, W> { queue_link: DlistLink }
    where K: Key, V: Value, E: ErrorValue, W: Weakener<V>
}

intrusive_adapter! {
    pub(crate) EntryRefreshAdapter<K, V, E, W> = Entry<K, V, E, W> { refresh_link: DlistLink }
    where K: Key, V: Value, E: ErrorValue, W: Weakener<V>
}

impl<K, V, E, W> Entry<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    fn with_state(key: Option<K>, state: State<V, E, W::Weak>) -> Self {
        Self {
            hash_link: HashLink::default(),
            queue_link: DlistLink::default(),
            refresh_link: DlistLink::default(),
            refs: AtomicUsize::new(0),
            key,
            state,
            flags: EntryFlags::empty(),
            expire_at: None,
            expire_at_steady: None,
            refresh_at: None,
            cancel_at: None,
        }
    }

    pub(crate) fn new_pending(key: Option<K>) -> Self {
        Self::with_state(key, State::Pending(PendingQueue::new()))
    }

    pub(crate) fn new_value(key: Option<K>, value: V) -> Self {
        Self::with_state(key, State::Value(value))
    }

    /// Move the entry onto the heap and leak it; the caller manages the
    /// strong count from here on.
    pub(crate) fn allocate(self) -> NonNull<Self> {
        unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(self))) }
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Entry::allocate`] and its strong count must be
    /// zero.
    pub(crate) unsafe fn reclaim(ptr: NonNull<Self>) {
        debug_assert_eq!(ptr.as_ref().refs(), 0);
        drop(Box::from_raw(ptr.as_ptr()));
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash_link.hash()
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when this was the last reference.
    pub(crate) fn ref_dec(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// Whether a lookup may still observe this entry.
    ///
    /// Pending entries flagged expired stop matching but are not swept; the
    /// in-flight resolution still has to deliver to its waiters.
    pub(crate) fn is_visible(&self) -> bool {
        match &self.state {
            State::Pending(pending) => !pending.is_expired(),
            _ => true,
        }
    }

    fn deadline_passed(&self, wall: Duration, steady: Duration) -> bool {
        self.expire_at.is_some_and(|at| wall >= at)
            || self.expire_at_steady.is_some_and(|at| steady >= at)
    }

    /// Whether the maintenance sweep may unlink this entry.
    pub(crate) fn is_expired(&self, wall: Duration, steady: Duration) -> bool {
        match &self.state {
            State::Expired => true,
            State::Pending(_) => false,
            State::Weak(weak) => {
                W::strengthen(weak).is_none() || self.deadline_passed(wall, steady)
            }
            State::Value(_) | State::Error(_) => self.deadline_passed(wall, steady),
        }
    }

    /// `Value → Expired`; a pending entry is flagged instead so its waiters
    /// still receive the eventual outcome.
    pub(crate) fn mark_expired(&mut self) {
        match &mut self.state {
            State::Pending(pending) => pending.mark_expired(),
            state => *state = State::Expired,
        }
    }

    /// `Value → Weak` when the value still has a weak form, `Value → Expired`
    /// otherwise. Pending entries record the request for assignment time.
    pub(crate) fn weaken(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Expired);
        self.state = match state {
            State::Value(value) => match W::weaken(&value) {
                Some(weak) => State::Weak(weak),
                None => State::Expired,
            },
            State::Pending(mut pending) => {
                pending.weaken();
                State::Pending(pending)
            }
            other => other,
        };
    }

    /// `Weak → Value` when the pointee is still live, `Weak → Expired`
    /// otherwise. Returns whether the entry holds (or will hold) a strong
    /// value afterwards.
    pub(crate) fn strengthen(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, State::Expired);
        let (state, strong) = match state {
            State::Weak(weak) => match W::strengthen(&weak) {
                Some(value) => (State::Value(value), true),
                None => (State::Expired, false),
            },
            State::Pending(mut pending) => {
                pending.strengthen();
                (State::Pending(pending), true)
            }
            State::Expired => (State::Expired, false),
            other => (other, true),
        };
        self.state = state;
        strong
    }

    /// Drop an unresolved pending record without notifying waiters.
    pub(crate) fn cancel(&mut self) {
        if self.is_pending() {
            self.state = State::Expired;
        }
    }
}

/// A counted handle to an entry, usable outside the cache lock.
///
/// The allocation is freed when the last handle of an unlinked entry drops.
pub(crate) struct EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    ptr: NonNull<Entry<K, V, E, W>>,
}

impl<K, V, E, W> EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    /// # Safety
    ///
    /// `ptr` must be live; a new strong count is taken here.
    pub(crate) unsafe fn retain(ptr: NonNull<Entry<K, V, E, W>>) -> Self {
        ptr.as_ref().ref_inc();
        Self { ptr }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<Entry<K, V, E, W>> {
        self.ptr
    }
}

impl<K, V, E, W> Clone for EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    fn clone(&self) -> Self {
        unsafe {
            self.ptr.as_ref().ref_inc();
        }
        Self { ptr: self.ptr }
    }
}

impl<K, V, E, W> Drop for EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
    fn drop(&mut self) {
        unsafe {
            if self.ptr.as_ref().ref_dec() {
                Entry::reclaim(self.ptr);
            }
        }
    }
}

unsafe impl<K, V, E, W> Send for EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
}
unsafe impl<K, V, E, W> Sync for EntryRef<K, V, E, W>
where
    K: Key,
    V: Value,
    E: ErrorValue,
    W: Weakener<V>,
{
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pointer::{NoWeaken, WeakenShared};

    type PlainEntry = Entry<u64, String, Arc<str>, NoWeaken>;

    #[test]
    fn test_state_machine_plain() {
        let mut entry = PlainEntry::new_pending(Some(3));
        assert!(entry.is_pending());
        assert!(entry.is_visible());
        assert!(!entry.is_expired(Duration::ZERO, Duration::ZERO));

        if let State::Pending(pending) = &mut entry.state {
            assert_eq!(pending.waiters(), 0);
            pending.push_callback(Box::new(|_| {}));
            assert_eq!(pending.waiters(), 1);
        }

        // Erasing a pending entry only hides it from lookups.
        entry.mark_expired();
        assert!(entry.is_pending());
        assert!(!entry.is_visible());
        assert!(!entry.is_expired(Duration::ZERO, Duration::ZERO));

        entry.state = State::Value("three".to_string());
        entry.mark_expired();
        assert!(entry.is_expired(Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn test_weaken_without_pointer_support_expires() {
        let mut entry = PlainEntry::new_value(Some(3), "three".to_string());
        entry.weaken();
        assert!(entry.is_expired(Duration::ZERO, Duration::ZERO));
        assert!(!entry.strengthen());
    }

    #[test]
    fn test_weaken_and_strengthen_shared_pointer() {
        let value = Arc::new(31u64);
        let mut entry =
            Entry::<u64, Arc<u64>, Arc<str>, WeakenShared>::new_value(Some(1), value.clone());

        entry.weaken();
        assert!(matches!(entry.state, State::Weak(_)));
        assert!(!entry.is_expired(Duration::ZERO, Duration::ZERO));

        assert!(entry.strengthen());
        assert!(matches!(entry.state, State::Value(_)));

        entry.weaken();
        drop(value);
        assert!(entry.is_expired(Duration::ZERO, Duration::ZERO));
        assert!(!entry.strengthen());
        assert!(matches!(entry.state, State::Expired));
    }

    #[test]
    fn test_deadline_expiry() {
        let mut entry = PlainEntry::new_value(Some(3), "three".to_string());
        entry.expire_at = Some(Duration::from_secs(10));

        assert!(!entry.is_expired(Duration::from_secs(9), Duration::ZERO));
        assert!(entry.is_expired(Duration::from_secs(10), Duration::ZERO));

        // The monotonic shadow fires even when the wall clock is turned back.
        entry.expire_at_steady = Some(Duration::from_secs(10));
        assert!(entry.is_expired(Duration::from_secs(1), Duration::from_secs(10)));
    }

    #[test]
    fn test_refcount() {
        let ptr = PlainEntry::new_value(Some(1), "one".to_string()).allocate();
        let a = unsafe { EntryRef::retain(ptr) };
        let b = a.clone();
        assert_eq!(unsafe { ptr.as_ref().refs() }, 2);
        drop(a);
        assert_eq!(unsafe { ptr.as_ref().refs() }, 1);
        drop(b);
        // `b` was the last reference; the allocation is gone.
    }
}
