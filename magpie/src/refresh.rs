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

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use magpie_common::code::{ErrorValue, Key, Value};
use parking_lot::Mutex;

use crate::entry::EntryRef;
use crate::pointer::Weakener;

/// How refresh deadlines are serviced.
#[derive(Debug, Clone, Default)]
pub enum RefreshDriver {
    /// A dedicated background thread waits for the earliest deadline.
    #[default]
    Worker,
    /// A timer task per entry, spawned onto the given tokio runtime.
    Timer(tokio::runtime::Handle),
}

pub(crate) enum RefreshSignal {
    Wake,
    Stop,
}

/// The cache side of the refresh worker.
///
/// The worker only ever holds the cache weakly; when the upgrade fails the
/// worker exits on its own.
pub(crate) trait RefreshTarget: Send + Sync + 'static {
    /// Earliest `refresh_at` on the delay list, on the cache's clock.
    fn next_due(&self) -> Option<Duration>;

    fn clock_now(&self) -> Duration;

    /// Service every deadline that has passed.
    fn run_due(&self);
}

pub(crate) struct RefreshWorker {
    tx: flume::Sender<RefreshSignal>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RefreshWorker {
    pub(crate) fn spawn(target: Weak<dyn RefreshTarget>) -> Self {
        let (tx, rx) = flume::unbounded();
        let join = std::thread::Builder::new()
            .name("magpie-refresh".to_string())
            .spawn(move || worker_loop(target, rx))
            .expect("failed to spawn refresh worker");
        Self {
            tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn wake(&self) {
        let _ = self.tx.send(RefreshSignal::Wake);
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(RefreshSignal::Stop);
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            // The final cache handle may be dropped by the worker itself;
            // joining would then deadlock, so detach instead.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(target: Weak<dyn RefreshTarget>, rx: flume::Receiver<RefreshSignal>) {
    loop {
        let wait = {
            let Some(target) = target.upgrade() else { return };
            match target.next_due() {
                None => None,
                Some(due) => {
                    let timeout = due.saturating_sub(target.clock_now());
                    if timeout.is_zero() {
                        target.run_due();
                        continue;
                    }
                    Some(timeout)
                }
            }
            // The upgraded handle drops here; a parked worker never keeps
            // the cache alive.
        };

        let signal = match wait {
            None => rx.recv().ok(),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(signal) => Some(signal),
                Err(flume::RecvTimeoutError::Timeout) => {
                    if let Some(target) = target.upgrade() {
                        target.run_due();
                    }
                    continue;
                }
                Err(flume::RecvTimeoutError::Disconnected) => None,
            },
        };

        match signal {
            Some(RefreshSignal::Wake) => continue,
            Some(RefreshSignal::Stop) | None => return,
        }
    }
}

/// Post-mutation refresh plumbing, installed on caches with a refresh policy.
///
/// The closures capture a weak cache handle and the driver, keeping the
/// engine's post-mutation path independent of the concurrency policy.
pub(crate) struct RefreshNotifier<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    wake: Box<dyn Fn() + Send + Sync>,
    schedule: Box<dyn Fn(Duration, EntryRef<K, V, E, W>) + Send + Sync>,
    stop: Box<dyn Fn() + Send + Sync>,
}

impl<K, V, E, W> RefreshNotifier<K, V, E, W>
where
    K: Key,
    V: Value + Clone,
    E: ErrorValue,
    W: Weakener<V>,
{
    /// Worker-driven refresh. The worker thread is spawned on first use.
    pub(crate) fn worker(target: Weak<dyn RefreshTarget>) -> Self {
        let cell = Arc::new(OnceLock::<RefreshWorker>::new());
        let wake_cell = cell.clone();
        let wake_target = target.clone();
        Self {
            wake: Box::new(move || {
                wake_cell
                    .get_or_init(|| RefreshWorker::spawn(wake_target.clone()))
                    .wake();
            }),
            schedule: Box::new(|_, _| {}),
            stop: Box::new(move || {
                if let Some(worker) = cell.get() {
                    worker.stop();
                }
            }),
        }
    }

    /// Timer-driven refresh on a tokio runtime.
    pub(crate) fn timer(
        handle: tokio::runtime::Handle,
        fire: impl Fn(EntryRef<K, V, E, W>) + Send + Sync + 'static,
    ) -> Self {
        let fire = Arc::new(fire);
        Self {
            wake: Box::new(|| {}),
            schedule: Box::new(move |delay, entry| {
                let fire = fire.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    fire(entry);
                });
            }),
            stop: Box::new(|| {}),
        }
    }

    pub(crate) fn wake(&self) {
        (self.wake)();
    }

    pub(crate) fn schedule(&self, delay: Duration, entry: EntryRef<K, V, E, W>) {
        (self.schedule)(delay, entry);
    }

    pub(crate) fn stop(&self) {
        (self.stop)();
    }
}
