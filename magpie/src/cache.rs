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

use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use magpie_common::clock::{Clock, SystemClock};
use magpie_common::code::{DefaultHashBuilder, ErrorValue, HashBuilder, Key, Value};

use crate::concurrency::{Concurrency, ThreadSafe, ThreadUnsafe};
use crate::error::{DefaultError, Error};
use crate::generic::{async_launcher, CacheShared, ResolveDriver};
use crate::metrics::Metrics;
use crate::pointer::{NoWeaken, SharedPointer, WeakenShared, Weakener};
use crate::policy::{compose, ComposeError, Policy, RefreshConfig};
use crate::refresh::{RefreshDriver, RefreshNotifier, RefreshTarget};
use crate::resolver::{AsyncGet, AsyncResolver, ResolveHandle, SyncResolver};

/// A cache configured from an enumerated set of policies.
///
/// Handles are cheap to clone and share one engine.
pub struct Cache<K, V, E = DefaultError, W = NoWeaken, C = SystemClock, CC = ThreadSafe, S = DefaultHashBuilder>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    shared: Arc<CacheShared<K, V, E, W, C, CC, S>>,
}

impl<K, V, E, W, C, CC, S> Clone for Cache<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// A single-threaded cache; the mutex is replaced by a zero-cost stub.
pub type LocalCache<K, V, E = DefaultError> =
    Cache<K, V, E, NoWeaken, SystemClock, ThreadUnsafe, DefaultHashBuilder>;

impl<K, V> Cache<K, V>
where
    K: Key + Clone,
    V: Value + Clone,
{
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }
}

impl<K, V, E, W, C, CC, S> Cache<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    /// Look the key up, resolving a miss when a resolver is configured.
    ///
    /// Blocks while a resolution for the key is in flight; concurrent calls
    /// for the same key share one resolver invocation.
    pub fn get(&self, key: &K) -> Result<Option<V>, Error<E>> {
        self.shared.get(key)
    }

    /// Like [`Cache::get`], but never blocks, never resolves, and fires no
    /// events.
    pub fn get_if_exists(&self, key: &K) -> Result<Option<V>, Error<E>> {
        self.shared.get_if_exists(key)
    }

    /// Store a value, superseding any existing entries for the key.
    pub fn emplace(&self, key: K, value: V) -> Result<(), Error<E>> {
        self.shared.emplace(key, value, None)
    }

    /// Like [`Cache::emplace`], with a per-entry time to live that takes
    /// precedence over the cache-wide max-age.
    pub fn emplace_with_ttl(&self, key: K, value: V, ttl: Duration) -> Result<(), Error<E>> {
        self.shared.emplace(key, value, Some(ttl))
    }

    /// Like [`Cache::emplace`], constructing the value on demand.
    pub fn emplace_with(&self, key: K, make: impl FnOnce() -> V) -> Result<(), Error<E>> {
        self.shared.emplace(key, make(), None)
    }

    /// Whether a lookup would currently observe an entry for the key. Fires
    /// no events.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.contains(key)
    }

    /// Return the live value for the key, inserting a freshly constructed
    /// one when there is none.
    pub fn get_or_emplace(&self, key: K, make: impl FnOnce() -> V) -> Result<V, Error<E>> {
        self.shared.get_or_emplace(key, make)
    }

    /// Expire every entry for the key. In-flight resolutions still deliver
    /// to waiters that already joined; their outcome is not cached.
    pub fn erase(&self, key: &K) {
        self.shared.erase(key)
    }

    /// Expire every entry.
    pub fn clear(&self) {
        self.shared.clear()
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }
}

impl<K, V, E, W, C, S> Cache<K, V, E, W, C, ThreadSafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    /// Look the key up without blocking; the returned future completes when
    /// the value (or resolver error) is available.
    pub fn async_get(&self, key: &K) -> AsyncGet<V, E> {
        self.shared.async_get(key)
    }
}

/// A set whose values are their own keys.
///
/// Lookups take a candidate value and return the cached instance that equals
/// it. Pending resolutions cannot exist here; entries always hold values.
pub struct IdentitySet<V, C = SystemClock, CC = ThreadSafe, S = DefaultHashBuilder>
where
    V: Key + Value + Clone,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    shared: Arc<CacheShared<V, V, DefaultError, NoWeaken, C, CC, S>>,
}

impl<V> IdentitySet<V>
where
    V: Key + Value + Clone,
{
    pub fn new() -> Self {
        Self::with_policies(&[]).expect("an empty policy list composes")
    }
}

impl<V> Default for IdentitySet<V>
where
    V: Key + Value + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C, CC, S> IdentitySet<V, C, CC, S>
where
    V: Key + Value + Clone,
    C: Clock + Default,
    CC: Concurrency,
    S: HashBuilder + Default,
{
    pub fn with_policies(policies: &[Policy]) -> Result<Self, ComposeError> {
        let clock = C::default();
        let set = compose(policies, clock.is_steady())?;
        let shared = Arc::new(CacheShared::new(set, 1.0, clock, S::default()));
        Ok(Self { shared })
    }
}

impl<V, C, CC, S> IdentitySet<V, C, CC, S>
where
    V: Key + Value + Clone,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    /// Return the cached instance equal to `value`, inserting `value` when
    /// there is none.
    pub fn insert(&self, value: V) -> Result<V, Error<DefaultError>> {
        self.shared.identity_insert(value)
    }

    pub fn get(&self, candidate: &V) -> Option<V> {
        self.shared.identity_get(candidate).unwrap_or(None)
    }

    pub fn erase(&self, candidate: &V) {
        self.shared.identity_erase(candidate)
    }

    pub fn clear(&self) {
        self.shared.clear()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configures and builds a [`Cache`].
///
/// Policies are declared here and composed at build time: dependencies are
/// pulled in transitively, defaults are supplied, duplicates rejected or
/// deduplicated. Methods that change a type parameter (clock, hasher, weaken
/// strategy, concurrency) must come before the resolver is installed.
pub struct CacheBuilder<K, V, E = DefaultError, W = NoWeaken, C = SystemClock, CC = ThreadSafe, S = DefaultHashBuilder>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    policies: Vec<Policy>,
    max_load_factor: f64,
    clock: C,
    hash_builder: S,
    sync_resolver: Option<SyncResolver<K, V, E>>,
    async_resolver: Option<AsyncResolver<K, V, E, W>>,
    refresh_driver: RefreshDriver,

    _marker: PhantomData<CC>,
}

impl<K, V, E, W, C, CC, S> CacheBuilder<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock + Default,
    CC: Concurrency,
    S: HashBuilder + Default,
{
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
            max_load_factor: 1.0,
            clock: C::default(),
            hash_builder: S::default(),
            sync_resolver: None,
            async_resolver: None,
            refresh_driver: RefreshDriver::default(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, E, W, C, CC, S> Default for CacheBuilder<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock + Default,
    CC: Concurrency,
    S: HashBuilder + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E, W, C, CC, S> CacheBuilder<K, V, E, W, C, CC, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    CC: Concurrency,
    S: HashBuilder,
{
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_policies(mut self, policies: impl IntoIterator<Item = Policy>) -> Self {
        self.policies.extend(policies);
        self
    }

    /// Bound the entry count; pulls in the eviction queue.
    pub fn with_max_size(self, limit: usize) -> Self {
        self.with_policy(Policy::MaxSize(limit))
    }

    /// Expire values this long after assignment.
    pub fn with_max_age(self, age: Duration) -> Self {
        self.with_policy(Policy::MaxAge(age))
    }

    /// Cache resolver errors and expire them this long after assignment.
    pub fn with_max_error_age(self, age: Duration) -> Self {
        self.with_policy(Policy::MaxErrorAge(age))
    }

    /// Cache resolver errors until explicitly expired.
    pub fn with_negative_cache(self) -> Self {
        self.with_policy(Policy::NegativeCache)
    }

    pub fn with_max_load_factor(mut self, max_load_factor: f64) -> Self {
        self.max_load_factor = max_load_factor;
        self
    }

    /// Produce missing values synchronously. Concurrent lookups of the same
    /// key share one invocation.
    pub fn with_resolver(
        mut self,
        resolve: impl Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    ) -> Self {
        assert!(
            self.async_resolver.is_none(),
            "a cache has a single resolver"
        );
        self.sync_resolver = Some(Arc::new(resolve));
        self
    }

    pub fn with_hash_builder<S2: HashBuilder>(
        self,
        hash_builder: S2,
    ) -> CacheBuilder<K, V, E, W, C, CC, S2> {
        CacheBuilder {
            policies: self.policies,
            max_load_factor: self.max_load_factor,
            clock: self.clock,
            hash_builder,
            sync_resolver: self.sync_resolver,
            async_resolver: self.async_resolver,
            refresh_driver: self.refresh_driver,
            _marker: PhantomData,
        }
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> CacheBuilder<K, V, E, W, C2, CC, S> {
        CacheBuilder {
            policies: self.policies,
            max_load_factor: self.max_load_factor,
            clock,
            hash_builder: self.hash_builder,
            sync_resolver: self.sync_resolver,
            async_resolver: self.async_resolver,
            refresh_driver: self.refresh_driver,
            _marker: PhantomData,
        }
    }

    /// Select the resolver-error payload type. Must precede the resolver.
    pub fn with_error_type<E2: ErrorValue>(self) -> CacheBuilder<K, V, E2, W, C, CC, S> {
        assert!(
            self.sync_resolver.is_none() && self.async_resolver.is_none(),
            "select the error type before installing a resolver"
        );
        CacheBuilder {
            policies: self.policies,
            max_load_factor: self.max_load_factor,
            clock: self.clock,
            hash_builder: self.hash_builder,
            sync_resolver: None,
            async_resolver: None,
            refresh_driver: self.refresh_driver,
            _marker: PhantomData,
        }
    }

    /// Weaken evicted entries instead of expiring them. The value type must
    /// be a managed pointer. Must precede the resolver.
    pub fn weaken_evicted(self) -> CacheBuilder<K, V, E, WeakenShared, C, CC, S>
    where
        V: SharedPointer,
    {
        assert!(
            self.sync_resolver.is_none() && self.async_resolver.is_none(),
            "select the weaken policy before installing a resolver"
        );
        CacheBuilder {
            policies: self.policies,
            max_load_factor: self.max_load_factor,
            clock: self.clock,
            hash_builder: self.hash_builder,
            sync_resolver: None,
            async_resolver: None,
            refresh_driver: self.refresh_driver,
            _marker: PhantomData,
        }
        .with_policy(Policy::Weaken)
    }
}

impl<K, V, E, W, C, S> CacheBuilder<K, V, E, W, C, ThreadSafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    /// Promise external synchronization and drop the mutex.
    ///
    /// Thread-unsafe caches have no asynchronous resolver and no refresh
    /// drivers.
    pub fn thread_unsafe(self) -> CacheBuilder<K, V, E, W, C, ThreadUnsafe, S> {
        assert!(
            self.async_resolver.is_none(),
            "an asynchronous resolver requires the thread-safe policy"
        );
        CacheBuilder {
            policies: self.policies,
            max_load_factor: self.max_load_factor,
            clock: self.clock,
            hash_builder: self.hash_builder,
            sync_resolver: self.sync_resolver,
            async_resolver: None,
            refresh_driver: RefreshDriver::Worker,
            _marker: PhantomData,
        }
        .with_policy(Policy::ThreadUnsafe)
    }

    /// Produce missing values asynchronously through a single-shot callback.
    pub fn with_async_resolver(
        mut self,
        resolve: impl Fn(ResolveHandle<K, V, E, W>, &K) + Send + Sync + 'static,
    ) -> Self {
        assert!(
            self.sync_resolver.is_none(),
            "a cache has a single resolver"
        );
        self.async_resolver = Some(Arc::new(resolve));
        self
    }

    /// Re-resolve entries this long after each assignment.
    pub fn with_refresh(self, delay: Duration) -> Self {
        self.with_policy(Policy::Refresh(RefreshConfig::new(delay)))
    }

    /// Like [`CacheBuilder::with_refresh`], dropping entries that go unread
    /// for `idle` at their next deadline.
    pub fn with_refresh_idle(self, delay: Duration, idle: Duration) -> Self {
        self.with_policy(Policy::Refresh(RefreshConfig::with_idle(delay, idle)))
    }

    pub fn with_refresh_driver(mut self, driver: RefreshDriver) -> Self {
        self.refresh_driver = driver;
        self
    }

    pub fn build(self) -> Result<Cache<K, V, E, W, C, ThreadSafe, S>, ComposeError> {
        let mut policies = self.policies;
        if self.sync_resolver.is_some() {
            policies.push(Policy::Resolver);
        }
        if self.async_resolver.is_some() {
            policies.push(Policy::AsyncResolver);
        }

        let mut set = compose(&policies, self.clock.is_steady())?;
        if set.refresh.is_some() && self.sync_resolver.is_none() && self.async_resolver.is_none() {
            return Err(ComposeError::RefreshWithoutResolver);
        }
        set.timer_refresh =
            set.refresh.is_some() && matches!(self.refresh_driver, RefreshDriver::Timer(_));

        let shared = Arc::new(CacheShared::new(
            set.clone(),
            self.max_load_factor,
            self.clock,
            self.hash_builder,
        ));

        if let Some(resolve) = self.sync_resolver {
            shared.install_resolver(ResolveDriver::Sync(resolve));
        } else if let Some(resolve) = self.async_resolver {
            shared.install_resolver(async_launcher(&shared, resolve));
        }

        if set.refresh.is_some() {
            let notifier = match self.refresh_driver {
                RefreshDriver::Worker => {
                    let shared_dyn: Arc<dyn RefreshTarget> = shared.clone();
                    let weak: Weak<dyn RefreshTarget> = Arc::downgrade(&shared_dyn);
                    RefreshNotifier::worker(weak)
                }
                RefreshDriver::Timer(handle) => {
                    let weak = Arc::downgrade(&shared);
                    RefreshNotifier::timer(handle, move |entry| {
                        if let Some(shared) = weak.upgrade() {
                            shared.fire_timer_refresh(entry);
                        }
                    })
                }
            };
            shared.install_refresh_notifier(notifier);
        }

        Ok(Cache { shared })
    }
}

impl<K, V, E, W, C, S> CacheBuilder<K, V, E, W, C, ThreadUnsafe, S>
where
    K: Key + Clone,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
    C: Clock,
    S: HashBuilder,
{
    pub fn build(self) -> Result<Cache<K, V, E, W, C, ThreadUnsafe, S>, ComposeError> {
        let mut policies = self.policies;
        if self.sync_resolver.is_some() {
            policies.push(Policy::Resolver);
        }

        let set = compose(&policies, self.clock.is_steady())?;
        let shared = Arc::new(CacheShared::new(
            set,
            self.max_load_factor,
            self.clock,
            self.hash_builder,
        ));
        if let Some(resolve) = self.sync_resolver {
            shared.install_resolver(ResolveDriver::Sync(resolve));
        }
        Ok(Cache { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Cache<u64, u64>>();
        is_send_sync_static::<Cache<u64, Arc<u64>, DefaultError, WeakenShared>>();
        is_send_sync_static::<CacheBuilder<u64, u64>>();
        is_send_sync_static::<IdentitySet<String>>();
    }

    #[test]
    fn test_builder_defaults_compose() {
        let cache = CacheBuilder::<u64, String>::new().build().unwrap();
        assert!(cache.is_empty());
    }
}
