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

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use magpie_common::code::{ErrorValue, Key, Value};
use tokio::sync::oneshot;

use crate::entry::{CompletionFn, EntryRef};
use crate::error::{DefaultError, Error};
use crate::pointer::{NoWeaken, Weakener};

/// Synchronous value producer.
pub type SyncResolver<K, V, E> =
    Arc<dyn Fn(&K) -> std::result::Result<V, E> + Send + Sync + 'static>;

/// Asynchronous value producer: hand the outcome to the callback whenever it
/// is ready, on any thread.
pub type AsyncResolver<K, V, E, W> =
    Arc<dyn Fn(ResolveHandle<K, V, E, W>, &K) + Send + Sync + 'static>;

/// The cache side of a resolver completion.
///
/// Implemented by the engine; the indirection keeps the callback object
/// independent of the cache's clock and hasher parameters.
pub(crate) trait CompleteResolve<K, V, E, W>: Send + Sync
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    /// Assign `outcome` to `entry`, expiring `superseded` once the new value
    /// is in place, and deliver to every waiter.
    fn complete(
        &self,
        entry: EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
        outcome: std::result::Result<V, E>,
    );

    /// Cancel the resolution: waiters are dropped without a completion.
    fn abandon(&self, entry: EntryRef<K, V, E, W>);
}

/// Single-shot completion callback handed to an asynchronous resolver.
///
/// Exactly one of [`assign`](Self::assign), [`assign_error`](Self::assign_error)
/// or [`cancel`](Self::cancel) takes effect; later calls report
/// [`Error::AlreadyCompleted`]. Dropping the handle unresolved cancels. The
/// handle holds the cache weakly, so an outstanding resolve neither keeps a
/// dropped cache alive nor touches freed memory.
pub struct ResolveHandle<K, V, E = DefaultError, W = NoWeaken>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    target: Weak<dyn CompleteResolve<K, V, E, W>>,
    entry: Option<EntryRef<K, V, E, W>>,
    superseded: Option<EntryRef<K, V, E, W>>,
}

impl<K, V, E, W> ResolveHandle<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    pub(crate) fn new(
        target: Weak<dyn CompleteResolve<K, V, E, W>>,
        entry: EntryRef<K, V, E, W>,
        superseded: Option<EntryRef<K, V, E, W>>,
    ) -> Self {
        Self {
            target,
            entry: Some(entry),
            superseded,
        }
    }

    pub fn assign(&mut self, value: V) -> Result<(), Error<E>> {
        self.deliver(Ok(value))
    }

    pub fn assign_error(&mut self, error: E) -> Result<(), Error<E>> {
        self.deliver(Err(error))
    }

    pub fn cancel(&mut self) -> Result<(), Error<E>> {
        let entry = self.entry.take().ok_or(Error::AlreadyCompleted)?;
        self.superseded = None;
        if let Some(target) = self.target.upgrade() {
            target.abandon(entry);
        }
        Ok(())
    }

    fn deliver(&mut self, outcome: std::result::Result<V, E>) -> Result<(), Error<E>> {
        let entry = self.entry.take().ok_or(Error::AlreadyCompleted)?;
        match self.target.upgrade() {
            Some(target) => {
                target.complete(entry, self.superseded.take(), outcome);
                Ok(())
            }
            // The cache is gone; the entry is unlinked and dies with the
            // handle.
            None => Err(Error::Cancelled),
        }
    }
}

impl<K, V, E, W> Drop for ResolveHandle<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    fn drop(&mut self) {
        if self.entry.is_some() {
            let _ = self.cancel();
        }
    }
}

/// Waiter future returned by `async_get`.
///
/// Completes with `Ok(None)` when the key is absent and no resolver is
/// configured, and with [`Error::Cancelled`] when the cache is dropped before
/// the resolution finishes. Completions always go through the waiter channel,
/// even for values that were available at call time, so delivery is posted
/// rather than inline.
pub struct AsyncGet<V, E = DefaultError> {
    rx: oneshot::Receiver<std::result::Result<Option<V>, E>>,
    failed: Option<Error<E>>,
}

impl<V, E> AsyncGet<V, E> {
    pub(crate) fn new(rx: oneshot::Receiver<std::result::Result<Option<V>, E>>) -> Self {
        Self { rx, failed: None }
    }

    pub(crate) fn failed(rx: oneshot::Receiver<std::result::Result<Option<V>, E>>, error: Error<E>) -> Self {
        Self {
            rx,
            failed: Some(error),
        }
    }
}

impl<V, E> Future for AsyncGet<V, E> {
    type Output = Result<Option<V>, Error<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // No field needs structural pinning: the receiver is `Unpin` and the
        // error slot is plain data.
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(error) = this.failed.take() {
            return Poll::Ready(Err(error));
        }
        this.rx.poll_unpin(cx).map(|received| match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Resolver(error)),
            Err(_) => Err(Error::Cancelled),
        })
    }
}

/// Completion callback that posts to an `async_get` waiter.
///
/// Completions go through the channel even when the value is already
/// available at registration time, so delivery is never inline.
pub(crate) fn oneshot_waiter<V, E>(
    tx: oneshot::Sender<std::result::Result<Option<V>, E>>,
) -> CompletionFn<V, E>
where
    V: Value + Clone,
    E: ErrorValue,
{
    Box::new(move |outcome| {
        let _ = tx.send(outcome.clone().map(Some));
    })
}

/// Completion callback that unblocks a synchronous waiter.
pub(crate) fn blocking_waiter<V, E>(
    tx: std::sync::mpsc::SyncSender<std::result::Result<V, E>>,
) -> CompletionFn<V, E>
where
    V: Value + Clone,
    E: ErrorValue,
{
    Box::new(move |outcome| {
        let _ = tx.send(outcome.clone());
    })
}
