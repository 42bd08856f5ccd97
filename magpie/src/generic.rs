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

//! The cache engine.
//!
//! One cell guards the whole core (table, queue, refresh list, every linked
//! entry). Policy event hooks run inside the cell and are infallible; user
//! code (resolvers, waiter completions, value drops) runs strictly outside,
//! from the [`PostOps`] batch collected during the locked section.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use itertools::Itertools;
use magpie_common::clock::{Clock, MonotonicClock};
use magpie_common::code::{ErrorValue, HashBuilder, Key, Value};
use magpie_intrusive::dlist::Dlist;
use magpie_intrusive::hash_table::HashTable;

use crate::concurrency::{Concurrency, CoreCell, ThreadSafe};
use crate::entry::{
    CompletionFn, Entry, EntryFlags, EntryRef, EntryRefreshAdapter, EntryTableAdapter, State,
};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::pointer::Weakener;
use crate::policy::PolicySet;
use crate::queue::HotColdQueue;
use crate::refresh::{RefreshNotifier, RefreshTarget};
use crate::resolver::{
    blocking_waiter, oneshot_waiter, AsyncGet, AsyncResolver, CompleteResolve, ResolveHandle,
    SyncResolver,
};

/// One observation of the cache's clocks, taken before entering the cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Now {
    /// The configured clock.
    pub(crate) wall: Duration,
    /// The monotonic shadow clock.
    pub(crate) steady: Duration,
}

/// Work that must not run while the cell is held: waiter completions, entry
/// deallocation, refresh scheduling.
pub(crate) struct PostOps<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    completions: Vec<(std::result::Result<V, E>, Vec<CompletionFn<V, E>>)>,
    reclaim: Vec<NonNull<Entry<K, V, E, W>>>,
    wake_refresh: bool,
    timers: Vec<(Duration, EntryRef<K, V, E, W>)>,
}

impl<K, V, E, W> PostOps<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    fn new() -> Self {
        Self {
            completions: Vec::new(),
            reclaim: Vec::new(),
            wake_refresh: false,
            timers: Vec::new(),
        }
    }
}

/// The state guarded by the cell.
pub(crate) struct CacheCore<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    table: HashTable<EntryTableAdapter<K, V, E, W>>,
    queue: Option<HotColdQueue<K, V, E, W>>,
    refresh_list: Dlist<EntryRefreshAdapter<K, V, E, W>>,
    set: PolicySet,
    metrics: Arc<Metrics>,
}

// The core is only ever reached through its cell; the raw entry pointers it
// holds are guarded by that exclusivity plus the entries' strong counts.
unsafe impl<K, V, E, W> Send for CacheCore<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
}

type Matcher<'a, K, V, E, W> = &'a dyn Fn(&Entry<K, V, E, W>) -> bool;

/// Outcome of one locked lookup in the synchronous path.
pub(crate) enum GetPlan<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    Hit(V),
    NegHit(E),
    Absent,
    Join(std::sync::mpsc::Receiver<std::result::Result<V, E>>),
    Resolve(EntryRef<K, V, E, W>),
}

/// Outcome of one locked lookup in the asynchronous path. The waiter channel
/// is already satisfied or registered in every case except `Launch`.
enum AsyncPlan<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    Done,
    Launch(EntryRef<K, V, E, W>),
}

enum Found<V, E> {
    Value(V),
    Negative(E),
    Join,
    Gone,
}

impl<K, V, E, W> CacheCore<K, V, E, W>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    pub(crate) fn new(set: PolicySet, max_load_factor: f64, metrics: Arc<Metrics>) -> Self {
        Self {
            table: HashTable::with_max_load_factor(max_load_factor),
            queue: set.queue.then(HotColdQueue::new),
            refresh_list: Dlist::new(),
            set,
            metrics,
        }
    }

    /// First bucket entry that a lookup may observe: matching, unexpired,
    /// and (for weak entries) still upgradable.
    unsafe fn scan(
        &self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        now: Now,
    ) -> Option<NonNull<Entry<K, V, E, W>>> {
        self.table.bucket_iter(hash).find(|ptr| {
            let entry = ptr.as_ref();
            entry.hash() == hash
                && entry.is_visible()
                && !entry.is_expired(now.wall, now.steady)
                && matcher(entry)
        })
    }

    /// Classify a found entry, cloning out whatever the caller needs and
    /// registering `waiter` when the entry is still pending.
    unsafe fn classify(
        &self,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        waiter: impl FnOnce() -> CompletionFn<V, E>,
    ) -> Found<V, E> {
        let entry = ptr.as_mut();
        match &mut entry.state {
            State::Weak(_) => {
                // The scan saw a live pointee; under the cell nothing has
                // changed since.
                entry.strengthen();
                self.metrics.strengthen.fetch_add(1, Ordering::Relaxed);
                match &entry.state {
                    State::Value(value) => Found::Value(value.clone()),
                    _ => Found::Gone,
                }
            }
            State::Value(value) => Found::Value(value.clone()),
            State::Error(error) => Found::Negative(error.clone()),
            State::Pending(pending) => {
                pending.push_callback(waiter());
                Found::Join
            }
            State::Expired => Found::Gone,
        }
    }

    pub(crate) unsafe fn get_plan(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        make_key: impl FnOnce() -> Option<K>,
        now: Now,
        has_resolver: bool,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<GetPlan<K, V, E, W>, Error<E>> {
        if let Some(ptr) = self.scan(hash, matcher, now) {
            let mut rx = None;
            let found = self.classify(ptr, || {
                let (tx, waiter_rx) = std::sync::mpsc::sync_channel(1);
                rx = Some(waiter_rx);
                blocking_waiter(tx)
            });
            match found {
                Found::Value(value) => {
                    self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                    self.dispatch_hit(ptr, now);
                    self.maintenance(now, post);
                    return Ok(GetPlan::Hit(value));
                }
                Found::Negative(error) => {
                    self.maintenance(now, post);
                    return Ok(GetPlan::NegHit(error));
                }
                Found::Join => return Ok(GetPlan::Join(rx.expect("waiter registered"))),
                Found::Gone => {}
            }
        }

        self.metrics.miss.fetch_add(1, Ordering::Relaxed);
        if has_resolver {
            let entry = self.begin_resolve(hash, make_key(), now, post)?;
            Ok(GetPlan::Resolve(entry))
        } else {
            self.maintenance(now, post);
            Ok(GetPlan::Absent)
        }
    }

    unsafe fn async_get_plan(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        make_key: impl FnOnce() -> Option<K>,
        now: Now,
        has_resolver: bool,
        tx: tokio::sync::oneshot::Sender<std::result::Result<Option<V>, E>>,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<AsyncPlan<K, V, E, W>, Error<E>> {
        let mut tx = Some(tx);
        if let Some(ptr) = self.scan(hash, matcher, now) {
            let found = self.classify(ptr, || oneshot_waiter(tx.take().expect("tx available")));
            match found {
                Found::Value(value) => {
                    self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                    self.dispatch_hit(ptr, now);
                    self.maintenance(now, post);
                    let _ = tx.take().expect("tx available").send(Ok(Some(value)));
                    return Ok(AsyncPlan::Done);
                }
                Found::Negative(error) => {
                    self.maintenance(now, post);
                    let _ = tx.take().expect("tx available").send(Err(error));
                    return Ok(AsyncPlan::Done);
                }
                Found::Join => return Ok(AsyncPlan::Done),
                Found::Gone => {}
            }
        }

        let tx = tx.take().expect("tx available");
        self.metrics.miss.fetch_add(1, Ordering::Relaxed);
        if has_resolver {
            let entry = self.begin_resolve(hash, make_key(), now, post)?;
            {
                let mut ptr = entry.as_ptr();
                match &mut ptr.as_mut().state {
                    State::Pending(pending) => pending.push_callback(oneshot_waiter(tx)),
                    _ => unreachable!("a freshly created entry is pending"),
                }
            }
            Ok(AsyncPlan::Launch(entry))
        } else {
            self.maintenance(now, post);
            let _ = tx.send(Ok(None));
            Ok(AsyncPlan::Done)
        }
    }

    /// Non-mutating lookup: no events, no maintenance, no resolution.
    unsafe fn peek(
        &self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        now: Now,
    ) -> Result<Option<V>, Error<E>> {
        match self.scan(hash, matcher, now) {
            Some(ptr) => match &ptr.as_ref().state {
                State::Value(value) => Ok(Some(value.clone())),
                State::Weak(weak) => Ok(W::strengthen(weak)),
                State::Error(error) => Err(Error::Resolver(error.clone())),
                State::Pending(_) | State::Expired => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Create a pending entry and link it so concurrent lookups join the
    /// resolution instead of starting their own.
    unsafe fn begin_resolve(
        &mut self,
        hash: u64,
        key: Option<K>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<EntryRef<K, V, E, W>, Error<E>> {
        let ptr = Entry::new_pending(key).allocate();
        if let Err(e) = self.link_new(hash, ptr, now, post) {
            Entry::reclaim(ptr);
            return Err(e);
        }
        self.dispatch_create(ptr);
        Ok(EntryRef::retain(ptr))
    }

    /// Assign the resolver outcome, deliver to waiters, and expire the
    /// superseded entry.
    unsafe fn finish_resolve(
        &mut self,
        entry: &EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
        outcome: std::result::Result<V, E>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) {
        let mut ptr = entry.as_ptr();

        let (callbacks, was_expired, was_weakened) = {
            let entry = ptr.as_mut();
            match std::mem::replace(&mut entry.state, State::Expired) {
                State::Pending(pending) => {
                    let was_expired = pending.is_expired();
                    let was_weakened = pending.is_weakened();
                    (pending.into_callbacks(), was_expired, was_weakened)
                }
                // Already cancelled; the waiters are gone and there is
                // nothing to deliver.
                other => {
                    entry.state = other;
                    return;
                }
            }
        };

        match &outcome {
            Ok(value) => {
                {
                    let inherited = superseded.as_ref().map(|old| {
                        let old_ptr = old.as_ptr();
                        old_ptr.as_ref().cancel_at
                    });
                    let entry = ptr.as_mut();
                    if was_expired {
                        // Erased mid-resolve: deliver but do not cache.
                    } else if was_weakened {
                        entry.state = match W::weaken(value) {
                            Some(weak) => State::Weak(weak),
                            None => State::Expired,
                        };
                    } else {
                        entry.state = State::Value(value.clone());
                    }
                    if let Some(cancel_at) = inherited {
                        // A refreshed value keeps its predecessor's idle
                        // deadline.
                        entry.cancel_at = cancel_at;
                    }
                }
                self.metrics.resolve_success.fetch_add(1, Ordering::Relaxed);
                self.dispatch_assign(ptr, true, now, post);
            }
            Err(error) => {
                if self.set.negative_cache && !was_expired {
                    ptr.as_mut().state = State::Error(error.clone());
                }
                self.metrics.resolve_error.fetch_add(1, Ordering::Relaxed);
                self.dispatch_assign(ptr, false, now, post);
            }
        }

        if let Some(old) = superseded {
            let mut old_ptr = old.as_ptr();
            old_ptr.as_mut().mark_expired();
        }

        post.completions.push((outcome, callbacks));
        self.maintenance(now, post);
    }

    /// Abandon an in-flight resolution: waiters observe a cancellation.
    unsafe fn cancel_resolve(
        &mut self,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) {
        ptr.as_mut().cancel();
        self.metrics.cancel.fetch_add(1, Ordering::Relaxed);
        self.maintenance(now, post);
    }

    unsafe fn emplace(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        key: Option<K>,
        value: V,
        ttl: Option<Duration>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<(), Error<E>> {
        let replaced = self.expire_matching(hash, matcher);
        if replaced > 0 {
            self.metrics.replace.fetch_add(replaced, Ordering::Relaxed);
        }

        let mut ptr = Entry::new_value(key, value).allocate();
        if let Err(e) = self.link_new(hash, ptr, now, post) {
            Entry::reclaim(ptr);
            return Err(e);
        }
        self.dispatch_create(ptr);
        self.dispatch_assign(ptr, true, now, post);
        if let Some(ttl) = ttl {
            // A per-entry deadline takes precedence over the cache-wide
            // max-age.
            let entry = ptr.as_mut();
            entry.expire_at = Some(now.wall + ttl);
            entry.expire_at_steady =
                (!self.set.clock_steady).then(|| now.steady + ttl);
        }
        self.metrics.insert.fetch_add(1, Ordering::Relaxed);
        self.maintenance(now, post);
        Ok(())
    }

    /// Whether a lookup would currently observe an entry for the matcher.
    unsafe fn contains(&self, hash: u64, matcher: Matcher<'_, K, V, E, W>, now: Now) -> bool {
        self.scan(hash, matcher, now).is_some()
    }

    unsafe fn get_or_emplace(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        make_entry: impl FnOnce() -> (Option<K>, V),
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<V, Error<E>> {
        if let Some(ptr) = self.scan(hash, matcher, now) {
            let found = self.classify(ptr, || -> CompletionFn<V, E> { Box::new(|_| {}) });
            match found {
                Found::Value(value) => {
                    self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                    self.dispatch_hit(ptr, now);
                    self.maintenance(now, post);
                    return Ok(value);
                }
                Found::Negative(error) => {
                    self.maintenance(now, post);
                    return Err(Error::Resolver(error));
                }
                // A pending lookup is not a live value; supersede it.
                Found::Join | Found::Gone => {}
            }
        }

        let replaced = self.expire_matching(hash, matcher);
        if replaced > 0 {
            self.metrics.replace.fetch_add(replaced, Ordering::Relaxed);
        }

        let (key, value) = make_entry();
        let returned = value.clone();
        let ptr = Entry::new_value(key, value).allocate();
        if let Err(e) = self.link_new(hash, ptr, now, post) {
            Entry::reclaim(ptr);
            return Err(e);
        }
        self.dispatch_create(ptr);
        self.dispatch_assign(ptr, true, now, post);
        self.metrics.insert.fetch_add(1, Ordering::Relaxed);
        self.maintenance(now, post);
        Ok(returned)
    }

    unsafe fn erase(
        &mut self,
        hash: u64,
        matcher: Matcher<'_, K, V, E, W>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) {
        self.expire_matching(hash, matcher);
        self.maintenance(now, post);
    }

    unsafe fn clear(&mut self, now: Now, post: &mut PostOps<K, V, E, W>) {
        let entries = self.table.iter().collect_vec();
        for mut ptr in entries {
            ptr.as_mut().mark_expired();
        }
        self.maintenance(now, post);
    }

    unsafe fn count(&self, now: Now) -> usize {
        self.table
            .iter()
            .filter(|ptr| {
                let entry = ptr.as_ref();
                entry.is_visible() && !entry.is_expired(now.wall, now.steady)
            })
            .count()
    }

    /// Mark every matching entry expired; returns how many were live.
    unsafe fn expire_matching(&mut self, hash: u64, matcher: Matcher<'_, K, V, E, W>) -> usize {
        let matches = self
            .table
            .bucket_iter(hash)
            .filter(|ptr| {
                let entry = ptr.as_ref();
                entry.hash() == hash && matcher(entry)
            })
            .collect_vec();
        let mut live = 0;
        for mut ptr in matches {
            if ptr.as_ref().is_visible() && !matches!(ptr.as_ref().state, State::Expired) {
                live += 1;
            }
            ptr.as_mut().mark_expired();
        }
        live
    }

    unsafe fn link_new(
        &mut self,
        hash: u64,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Result<(), Error<E>> {
        // Dropping expired entries first may make the rehash unnecessary.
        if self.table.needs_rehash() {
            self.sweep_expired(now, post);
        }
        self.table.link(hash, ptr)?;
        ptr.as_ref().ref_inc();
        ptr.as_mut().flags.insert(EntryFlags::IN_TABLE);
        Ok(())
    }

    unsafe fn unlink_entry(
        &mut self,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        post: &mut PostOps<K, V, E, W>,
    ) {
        self.table.unlink(ptr);
        ptr.as_mut().flags.remove(EntryFlags::IN_TABLE);
        self.dispatch_unlink(ptr);
        if ptr.as_ref().ref_dec() {
            // Freed outside the cell; dropping the value may run user code.
            post.reclaim.push(ptr);
        }
    }

    // Event dispatch. Hooks run in composition order and never fail.

    unsafe fn dispatch_create(&mut self, ptr: NonNull<Entry<K, V, E, W>>) {
        if let Some(queue) = self.queue.as_mut() {
            queue.on_create(ptr);
        }
    }

    unsafe fn dispatch_assign(
        &mut self,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        value_assigned: bool,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) {
        let age = if value_assigned {
            self.set.max_age
        } else {
            self.set.max_error_age
        };
        if let Some(age) = age {
            let entry = ptr.as_mut();
            entry.expire_at = Some(now.wall + age);
            if !self.set.clock_steady {
                entry.expire_at_steady = Some(now.steady + age);
            }
        }

        if let Some(refresh) = self.set.refresh {
            // Only successfully assigned, still-cached values are refreshed.
            let schedulable = {
                let entry = ptr.as_ref();
                value_assigned
                    && entry.flags.contains(EntryFlags::IN_TABLE)
                    && matches!(entry.state, State::Value(_))
            };
            if schedulable {
                if let Some(idle) = refresh.idle {
                    // Arm the idle deadline on the first assignment only;
                    // re-resolved entries inherit their predecessor's, so a
                    // refresh chain cannot keep itself alive.
                    let entry = ptr.as_mut();
                    if entry.cancel_at.is_none() {
                        entry.cancel_at = Some(now.wall + idle);
                    }
                }
                ptr.as_mut().refresh_at = Some(now.wall + refresh.delay);
                if self.set.timer_refresh {
                    post.timers.push((refresh.delay, EntryRef::retain(ptr)));
                } else if !ptr.as_ref().flags.contains(EntryFlags::IN_REFRESH_LIST) {
                    self.refresh_list.push_back(ptr);
                    ptr.as_mut().flags.insert(EntryFlags::IN_REFRESH_LIST);
                    post.wake_refresh = true;
                }
            }
        }
    }

    unsafe fn dispatch_hit(&mut self, mut ptr: NonNull<Entry<K, V, E, W>>, now: Now) {
        if let Some(queue) = self.queue.as_mut() {
            queue.on_hit(ptr);
        }
        if let Some(refresh) = self.set.refresh {
            if let Some(idle) = refresh.idle {
                ptr.as_mut().cancel_at = Some(now.wall + idle);
            }
        }
    }

    unsafe fn dispatch_unlink(&mut self, mut ptr: NonNull<Entry<K, V, E, W>>) {
        if ptr.as_ref().flags.contains(EntryFlags::IN_QUEUE) {
            self.queue
                .as_mut()
                .expect("queued entries imply a queue policy")
                .on_unlink(ptr);
        }
        if ptr.as_ref().flags.contains(EntryFlags::IN_REFRESH_LIST) {
            self.refresh_list.remove(ptr);
            ptr.as_mut().flags.remove(EntryFlags::IN_REFRESH_LIST);
        }
    }

    /// The bookkeeping pass closing every mutation: ask the size bound for a
    /// removal budget, take victims from the cold side, then sweep expired
    /// entries out of the table.
    unsafe fn maintenance(&mut self, now: Now, post: &mut PostOps<K, V, E, W>) {
        let budget = self.policy_removal_check();
        for _ in 0..budget {
            let Some(victim) = self
                .queue
                .as_mut()
                .expect("the size bound depends on the queue policy")
                .pop_cold()
            else {
                break;
            };
            self.retire_victim(victim);
        }
        self.sweep_expired(now, post);
    }

    fn policy_removal_check(&self) -> usize {
        match self.set.max_size {
            Some(limit) => self.table.len().saturating_sub(limit),
            None => 0,
        }
    }

    unsafe fn retire_victim(&mut self, mut victim: NonNull<Entry<K, V, E, W>>) {
        if self.set.weaken {
            victim.as_mut().weaken();
            if matches!(victim.as_ref().state, State::Weak(_)) {
                // Weakened entries stay linked, outside the queue, and are
                // revived or swept depending on the pointee's fate.
                self.metrics.weaken.fetch_add(1, Ordering::Relaxed);
                return;
            }
        } else {
            victim.as_mut().mark_expired();
        }
        self.metrics.evict.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn sweep_expired(&mut self, now: Now, post: &mut PostOps<K, V, E, W>) {
        let expired = self
            .table
            .iter()
            .filter(|ptr| ptr.as_ref().is_expired(now.wall, now.steady))
            .collect_vec();
        for ptr in expired {
            self.unlink_entry(ptr, post);
        }
    }

    /// Pop every due head of the delay list. Idle-cancelled entries expire;
    /// the rest are handed back for re-resolution.
    unsafe fn collect_due_refresh(
        &mut self,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Vec<(K, EntryRef<K, V, E, W>)> {
        let mut due = Vec::new();
        while let Some(mut ptr) = self.refresh_list.front() {
            match ptr.as_ref().refresh_at {
                Some(at) if now.wall >= at => {}
                _ => break,
            }
            self.refresh_list.remove(ptr);
            ptr.as_mut().flags.remove(EntryFlags::IN_REFRESH_LIST);

            if ptr.as_ref().cancel_at.is_some_and(|at| now.wall >= at) {
                ptr.as_mut().mark_expired();
                continue;
            }
            if ptr.as_ref().flags.contains(EntryFlags::REFRESH_STARTED) {
                continue;
            }
            ptr.as_mut().flags.insert(EntryFlags::REFRESH_STARTED);
            let key = ptr
                .as_ref()
                .key
                .clone()
                .expect("refreshed entries are keyed");
            due.push((key, EntryRef::retain(ptr)));
        }
        self.maintenance(now, post);
        due
    }

    /// Earliest refresh deadline, on the configured clock.
    unsafe fn next_refresh_due(&self) -> Option<Duration> {
        self.refresh_list
            .front()
            .and_then(|ptr| ptr.as_ref().refresh_at)
    }

    /// Timer-mode due check for one entry.
    unsafe fn take_timer_refresh(
        &mut self,
        mut ptr: NonNull<Entry<K, V, E, W>>,
        now: Now,
        post: &mut PostOps<K, V, E, W>,
    ) -> Option<K> {
        if !ptr.as_ref().flags.contains(EntryFlags::IN_TABLE)
            || ptr.as_ref().flags.contains(EntryFlags::REFRESH_STARTED)
            || !matches!(ptr.as_ref().state, State::Value(_))
        {
            return None;
        }
        if ptr.as_ref().cancel_at.is_some_and(|at| now.wall >= at) {
            ptr.as_mut().mark_expired();
            self.maintenance(now, post);
            return None;
        }
        ptr.as_mut().flags.insert(EntryFlags::REFRESH_STARTED);
        Some(ptr.as_ref().key.clone().expect("refreshed entries are keyed"))
    }

    /// Destruction: cancel pendings, drop every linked entry's table
    /// reference, and free what nothing else holds.
    unsafe fn teardown(&mut self) {
        let entries = self.table.iter().collect_vec();
        let mut post = PostOps::new();
        for mut ptr in entries {
            ptr.as_mut().cancel();
            self.unlink_entry(ptr, &mut post);
        }
        for ptr in post.reclaim {
            Entry::reclaim(ptr);
        }
        // Dropped callbacks close their waiter channels; waiters observe the
        // cancellation.
        drop(post.completions);
    }
}

/// How misses produce values.
pub(crate) enum ResolveDriver<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    Sync(SyncResolver<K, V, E>),
    /// Launches the user's asynchronous resolver with a prepared callback
    /// handle; built by the thread-safe builder.
    Async(Box<dyn Fn(EntryRef<K, V, E, W>, Option<EntryRef<K, V, E, W>>, &K) + Send + Sync>),
}

/// The engine state shared by every cache handle.
pub(crate) struct CacheShared<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    core: CC::Cell<CacheCore<K, V, E, W>>,
    clock: C,
    steady: MonotonicClock,
    hash_builder: S,
    pub(crate) set: PolicySet,
    resolver: OnceLock<ResolveDriver<K, V, E, W>>,
    refresh_notifier: OnceLock<RefreshNotifier<K, V, E, W>>,
    pub(crate) metrics: Arc<Metrics>,
}

impl<K, V, E, W, C, CC, S> CacheShared<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    pub(crate) fn new(set: PolicySet, max_load_factor: f64, clock: C, hash_builder: S) -> Self {
        let metrics = Arc::new(Metrics::default());
        let core = CacheCore::new(set.clone(), max_load_factor, metrics.clone());
        Self {
            core: <CC::Cell<CacheCore<K, V, E, W>> as CoreCell<CacheCore<K, V, E, W>>>::new(core),
            clock,
            steady: MonotonicClock::new(),
            hash_builder,
            set,
            resolver: OnceLock::new(),
            refresh_notifier: OnceLock::new(),
            metrics,
        }
    }

    pub(crate) fn install_resolver(&self, driver: ResolveDriver<K, V, E, W>) {
        assert!(
            self.resolver.set(driver).is_ok(),
            "resolver installed twice"
        );
    }

    pub(crate) fn install_refresh_notifier(&self, notifier: RefreshNotifier<K, V, E, W>) {
        assert!(
            self.refresh_notifier.set(notifier).is_ok(),
            "refresh notifier installed twice"
        );
    }

    fn now(&self) -> Now {
        Now {
            wall: self.clock.now(),
            steady: self.steady.now(),
        }
    }

    fn hash_of<Q: std::hash::Hash>(&self, key: &Q) -> u64 {
        self.hash_builder.hash_one(key)
    }

    fn has_resolver(&self) -> bool {
        self.resolver.get().is_some()
    }

    /// Run the work that was deferred out of the locked section.
    fn run_post(&self, post: PostOps<K, V, E, W>) {
        for (outcome, callbacks) in post.completions {
            for callback in callbacks {
                callback(&outcome);
            }
        }
        for ptr in post.reclaim {
            unsafe { Entry::reclaim(ptr) };
        }
        if post.wake_refresh {
            if let Some(notifier) = self.refresh_notifier.get() {
                notifier.wake();
            }
        }
        for (delay, entry) in post.timers {
            if let Some(notifier) = self.refresh_notifier.get() {
                notifier.schedule(delay, entry);
            }
        }
    }

    pub(crate) fn get(&self, key: &K) -> Result<Option<V>, Error<E>> {
        let hash = self.hash_of(key);
        let now = self.now();
        let has_resolver = self.has_resolver();
        let mut post = PostOps::new();
        let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(key);

        let plan = self.core.with(|core| unsafe {
            core.get_plan(hash, &matcher, || Some(key.clone()), now, has_resolver, &mut post)
        });
        self.run_post(post);

        match plan? {
            GetPlan::Hit(value) => Ok(Some(value)),
            GetPlan::NegHit(error) => Err(Error::Resolver(error)),
            GetPlan::Absent => Ok(None),
            GetPlan::Join(rx) => match rx.recv() {
                Ok(Ok(value)) => Ok(Some(value)),
                Ok(Err(error)) => Err(Error::Resolver(error)),
                Err(_) => Err(Error::Cancelled),
            },
            GetPlan::Resolve(entry) => self.resolve_and_wait(key, entry, None),
        }
    }

    /// Resolve a freshly linked pending entry and block until the outcome.
    fn resolve_and_wait(
        &self,
        key: &K,
        entry: EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
    ) -> Result<Option<V>, Error<E>> {
        match self.resolver.get().expect("resolve plan implies a resolver") {
            ResolveDriver::Sync(resolve) => {
                tracing::trace!("resolving miss synchronously");
                let outcome = resolve(key);
                let mut post = PostOps::new();
                let now = self.now();
                self.core.with(|core| unsafe {
                    core.finish_resolve(&entry, superseded, outcome.clone(), now, &mut post)
                });
                self.run_post(post);
                match outcome {
                    Ok(value) => Ok(Some(value)),
                    Err(error) => Err(Error::Resolver(error)),
                }
            }
            ResolveDriver::Async(launch) => {
                let (tx, rx) = std::sync::mpsc::sync_channel(1);
                self.core.with(|_core| unsafe {
                    let mut ptr = entry.as_ptr();
                    match &mut ptr.as_mut().state {
                        State::Pending(pending) => pending.push_callback(blocking_waiter(tx)),
                        _ => unreachable!("resolution has not been launched yet"),
                    }
                });
                launch(entry, superseded, key);
                match rx.recv() {
                    Ok(Ok(value)) => Ok(Some(value)),
                    Ok(Err(error)) => Err(Error::Resolver(error)),
                    Err(_) => Err(Error::Cancelled),
                }
            }
        }
    }

    pub(crate) fn get_if_exists(&self, key: &K) -> Result<Option<V>, Error<E>> {
        let hash = self.hash_of(key);
        let now = self.now();
        let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(key);
        self.core.with(|core| unsafe { core.peek(hash, &matcher, now) })
    }

    pub(crate) fn emplace(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), Error<E>> {
        let hash = self.hash_of(&key);
        let now = self.now();
        let mut post = PostOps::new();
        let result = {
            let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(&key);
            self.core.with(|core| unsafe {
                core.emplace(hash, &matcher, Some(key.clone()), value, ttl, now, &mut post)
            })
        };
        self.run_post(post);
        result
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        let now = self.now();
        let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(key);
        self.core
            .with(|core| unsafe { core.contains(hash, &matcher, now) })
    }

    pub(crate) fn get_or_emplace(&self, key: K, make: impl FnOnce() -> V) -> Result<V, Error<E>> {
        let hash = self.hash_of(&key);
        let now = self.now();
        let mut post = PostOps::new();
        let result = {
            let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(&key);
            self.core.with(|core| unsafe {
                core.get_or_emplace(hash, &matcher, || (Some(key.clone()), make()), now, &mut post)
            })
        };
        self.run_post(post);
        result
    }

    pub(crate) fn erase(&self, key: &K) {
        let hash = self.hash_of(key);
        let now = self.now();
        let mut post = PostOps::new();
        let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(key);
        self.core
            .with(|core| unsafe { core.erase(hash, &matcher, now, &mut post) });
        self.run_post(post);
    }

    pub(crate) fn clear(&self) {
        let now = self.now();
        let mut post = PostOps::new();
        self.core.with(|core| unsafe { core.clear(now, &mut post) });
        self.run_post(post);
    }

    pub(crate) fn len(&self) -> usize {
        let now = self.now();
        self.core.with(|core| unsafe { core.count(now) })
    }
}

// Identity-set operations: the value is its own key. Pending entries have no
// key and can be neither joined nor expired by candidate.
impl<V, E, W, C, CC, S> CacheShared<V, V, E, W, C, CC, S>
where
    V: Key + Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    pub(crate) fn identity_get(&self, candidate: &V) -> Result<Option<V>, Error<E>> {
        let hash = self.hash_of(candidate);
        let now = self.now();
        let mut post = PostOps::new();
        let matcher = identity_matcher(candidate);

        let plan = self
            .core
            .with(|core| unsafe { core.get_plan(hash, &matcher, || None, now, false, &mut post) });
        self.run_post(post);

        match plan? {
            GetPlan::Hit(value) => Ok(Some(value)),
            GetPlan::NegHit(error) => Err(Error::Resolver(error)),
            _ => Ok(None),
        }
    }

    pub(crate) fn identity_insert(&self, value: V) -> Result<V, Error<E>> {
        let hash = self.hash_of(&value);
        let now = self.now();
        let mut post = PostOps::new();
        let result = {
            let matcher = identity_matcher(&value);
            self.core.with(|core| unsafe {
                core.get_or_emplace(hash, &matcher, || (None, value.clone()), now, &mut post)
            })
        };
        self.run_post(post);
        result
    }

    pub(crate) fn identity_erase(&self, candidate: &V) {
        let hash = self.hash_of(candidate);
        let now = self.now();
        let mut post = PostOps::new();
        let matcher = identity_matcher(candidate);
        self.core
            .with(|core| unsafe { core.erase(hash, &matcher, now, &mut post) });
        self.run_post(post);
    }
}

fn identity_matcher<V, E, W>(candidate: &V) -> impl Fn(&Entry<V, V, E, W>) -> bool + '_
where
    V: Key + Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    move |entry: &Entry<V, V, E, W>| match &entry.state {
        State::Value(value) => value == candidate,
        _ => false,
    }
}

// Asynchronous gets, resolver completions, and refresh drivers reach the
// cache from other threads; they exist on thread-safe caches only.
impl<K, V, E, W, C, S> CacheShared<K, V, E, W, C, ThreadSafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    pub(crate) fn async_get(&self, key: &K) -> AsyncGet<V, E> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let hash = self.hash_of(key);
        let now = self.now();
        let has_resolver = self.has_resolver();
        let mut post = PostOps::new();
        let matcher = |entry: &Entry<K, V, E, W>| entry.key.as_ref() == Some(key);

        let plan = self.core.with(|core| unsafe {
            core.async_get_plan(
                hash,
                &matcher,
                || Some(key.clone()),
                now,
                has_resolver,
                tx,
                &mut post,
            )
        });
        self.run_post(post);

        match plan {
            Ok(AsyncPlan::Done) => AsyncGet::new(rx),
            Ok(AsyncPlan::Launch(entry)) => {
                self.launch_resolve(key, entry, None);
                AsyncGet::new(rx)
            }
            Err(error) => AsyncGet::failed(rx, error),
        }
    }

    /// Start the configured resolver for a linked pending entry. With a
    /// synchronous resolver the resolution happens on the calling thread;
    /// registered waiters are still completed through their channels.
    fn launch_resolve(
        &self,
        key: &K,
        entry: EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
    ) {
        match self.resolver.get().expect("launch implies a resolver") {
            ResolveDriver::Sync(resolve) => {
                let outcome = resolve(key);
                let mut post = PostOps::new();
                let now = self.now();
                self.core.with(|core| unsafe {
                    core.finish_resolve(&entry, superseded, outcome, now, &mut post)
                });
                self.run_post(post);
            }
            ResolveDriver::Async(launch) => launch(entry, superseded, key),
        }
    }

    /// Re-resolve one entry whose refresh deadline passed.
    fn refresh_one(&self, key: K, old: EntryRef<K, V, E, W>) {
        self.metrics.refresh.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("refreshing entry");

        let hash = self.hash_of(&key);
        let now = self.now();
        let mut post = PostOps::new();
        let entry = self
            .core
            .with(|core| unsafe { core.begin_resolve(hash, Some(key.clone()), now, &mut post) });
        self.run_post(post);

        match entry {
            Ok(entry) => self.launch_resolve(&key, entry, Some(old)),
            Err(error) => {
                // The stale value stays; nothing re-arms this entry, but the
                // value is still served until expiry or eviction.
                tracing::warn!("refresh allocation failed: {error}");
            }
        }
    }

    /// Timer-driven refresh deadline for one entry.
    pub(crate) fn fire_timer_refresh(&self, entry: EntryRef<K, V, E, W>) {
        let now = self.now();
        let mut post = PostOps::new();
        let job = self
            .core
            .with(|core| unsafe { core.take_timer_refresh(entry.as_ptr(), now, &mut post) });
        self.run_post(post);
        if let Some(key) = job {
            self.refresh_one(key, entry);
        }
    }
}

impl<K, V, E, W, C, S> CompleteResolve<K, V, E, W> for CacheShared<K, V, E, W, C, ThreadSafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    fn complete(
        &self,
        entry: EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
        outcome: std::result::Result<V, E>,
    ) {
        let now = self.now();
        let mut post = PostOps::new();
        self.core.with(|core| unsafe {
            core.finish_resolve(&entry, superseded, outcome, now, &mut post)
        });
        self.run_post(post);
    }

    fn abandon(&self, entry: EntryRef<K, V, E, W>) {
        let now = self.now();
        let mut post = PostOps::new();
        self.core
            .with(|core| unsafe { core.cancel_resolve(entry.as_ptr(), now, &mut post) });
        self.run_post(post);
    }
}

impl<K, V, E, W, C, S> RefreshTarget for CacheShared<K, V, E, W, C, ThreadSafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    fn next_due(&self) -> Option<Duration> {
        self.core.with(|core| unsafe { core.next_refresh_due() })
    }

    fn clock_now(&self) -> Duration {
        self.clock.now()
    }

    fn run_due(&self) {
        let now = self.now();
        let mut post = PostOps::new();
        let due = self
            .core
            .with(|core| unsafe { core.collect_due_refresh(now, &mut post) });
        self.run_post(post);
        for (key, old) in due {
            self.refresh_one(key, old);
        }
    }
}

impl<K, V, E, W, C, CC, S> Drop for CacheShared<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    fn drop(&mut self) {
        if let Some(notifier) = self.refresh_notifier.get() {
            notifier.stop();
        }
        // Cancel outstanding resolutions and free everything the table owns.
        self.core.with(|core| unsafe { core.teardown() });
    }
}

/// Build the async-resolver launcher for a thread-safe cache.
pub(crate) fn async_launcher<K, V, E, W, C, S>(
    shared: &Arc<CacheShared<K, V, E, W, C, ThreadSafe, S>>,
    resolve: AsyncResolver<K, V, E, W>,
) -> ResolveDriver<K, V, E, W>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    let shared_dyn: Arc<dyn CompleteResolve<K, V, E, W>> = shared.clone();
    let weak: Weak<dyn CompleteResolve<K, V, E, W>> = Arc::downgrade(&shared_dyn);
    ResolveDriver::Async(Box::new(move |entry, superseded, key| {
        let handle = ResolveHandle::new(weak.clone(), entry, superseded);
        resolve(handle, key);
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use magpie_common::clock::ManualClock;

    use crate::cache::CacheBuilder;

    #[test]
    fn test_replace_counts() {
        let cache = CacheBuilder::<u64, String>::new().build().unwrap();

        cache.emplace(1, "a".to_string()).unwrap();
        cache.emplace(1, "b".to_string()).unwrap();

        assert_eq!(cache.metrics().insert(), 2);
        assert_eq!(cache.metrics().replace(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn test_per_entry_ttl_overrides_max_age() {
        let clock = Arc::new(ManualClock::new());
        let cache = CacheBuilder::<u64, String>::new()
            .with_clock(clock.clone())
            .with_max_age(Duration::from_secs(60))
            .build()
            .unwrap();

        cache
            .emplace_with_ttl(1, "short".to_string(), Duration::from_secs(5))
            .unwrap();
        cache.emplace(2, "long".to_string()).unwrap();

        clock.set(Duration::from_secs(5));
        assert_eq!(cache.get(&1).unwrap(), None);
        assert_eq!(cache.get(&2).unwrap(), Some("long".to_string()));

        clock.set(Duration::from_secs(60));
        assert_eq!(cache.get(&2).unwrap(), None);
    }

    #[test]
    fn test_contains_fires_no_events() {
        let cache = CacheBuilder::<u64, String>::new().build().unwrap();
        cache.emplace(1, "one".to_string()).unwrap();

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert_eq!(cache.metrics().hit(), 0);
        assert_eq!(cache.metrics().miss(), 0);
    }

    #[test]
    fn test_handles_share_one_engine() {
        let cache = CacheBuilder::<u64, String>::new().build().unwrap();
        let other = cache.clone();

        other.emplace(1, "one".to_string()).unwrap();
        assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));

        cache.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_expired_entries_are_swept_on_mutation() {
        let clock = Arc::new(ManualClock::new());
        let cache = CacheBuilder::<u64, String>::new()
            .with_clock(clock.clone())
            .with_max_age(Duration::from_secs(1))
            .build()
            .unwrap();

        for key in 0..4 {
            cache.emplace(key, "stale".to_string()).unwrap();
        }
        clock.set(Duration::from_secs(2));

        // Any mutation drops the dead weight; the table does not grow.
        cache.emplace(100, "fresh".to_string()).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
