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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Background refresh configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Entries are re-resolved this long after each assignment.
    pub delay: Duration,
    /// When set, an entry that has not been hit for this long is dropped at
    /// its next refresh deadline instead of being re-resolved.
    pub idle: Option<Duration>,
}

impl RefreshConfig {
    pub fn new(delay: Duration) -> Self {
        Self { delay, idle: None }
    }

    pub fn with_idle(delay: Duration, idle: Duration) -> Self {
        Self {
            delay,
            idle: Some(idle),
        }
    }
}

/// A declared capability of the cache.
///
/// Declarations are closed over their dependencies, deduplicated, and
/// stacked in a stable order by [`compose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    /// Guard the cache with a real mutex. Default when neither concurrency
    /// policy is declared.
    ThreadSafe,
    /// Replace the mutex with a zero-cost stub; the caller synchronizes.
    ThreadUnsafe,
    /// Maintain the hot/cold eviction queue.
    Queue,
    /// Bound the entry count; pulls in [`Policy::Queue`].
    MaxSize(usize),
    /// Evictions weaken managed-pointer values instead of expiring them.
    Weaken,
    /// Retain resolver errors as cached negatives.
    NegativeCache,
    /// Per-entry absolute deadline support.
    ExpireAt,
    /// Expire values this long after assignment; pulls in
    /// [`Policy::ExpireAt`].
    MaxAge(Duration),
    /// Expire cached errors this long after assignment; pulls in
    /// [`Policy::ExpireAt`] and [`Policy::NegativeCache`].
    MaxErrorAge(Duration),
    /// A synchronous resolver is configured.
    Resolver,
    /// An asynchronous resolver is configured; pulls in
    /// [`Policy::SharedHandle`] and [`Policy::ThreadSafe`].
    AsyncResolver,
    /// Background tasks hold a weak handle to the cache.
    SharedHandle,
    /// Re-resolve entries on a schedule; pulls in [`Policy::SharedHandle`]
    /// and [`Policy::ThreadSafe`], and requires a resolver.
    Refresh(RefreshConfig),
}

/// Discriminant used for deduplication and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum PolicyKind {
    ThreadSafe,
    ThreadUnsafe,
    Queue,
    MaxSize,
    Weaken,
    NegativeCache,
    ExpireAt,
    MaxAge,
    MaxErrorAge,
    Resolver,
    AsyncResolver,
    SharedHandle,
    Refresh,
}

impl Policy {
    pub(crate) fn kind(&self) -> PolicyKind {
        match self {
            Policy::ThreadSafe => PolicyKind::ThreadSafe,
            Policy::ThreadUnsafe => PolicyKind::ThreadUnsafe,
            Policy::Queue => PolicyKind::Queue,
            Policy::MaxSize(_) => PolicyKind::MaxSize,
            Policy::Weaken => PolicyKind::Weaken,
            Policy::NegativeCache => PolicyKind::NegativeCache,
            Policy::ExpireAt => PolicyKind::ExpireAt,
            Policy::MaxAge(_) => PolicyKind::MaxAge,
            Policy::MaxErrorAge(_) => PolicyKind::MaxErrorAge,
            Policy::Resolver => PolicyKind::Resolver,
            Policy::AsyncResolver => PolicyKind::AsyncResolver,
            Policy::SharedHandle => PolicyKind::SharedHandle,
            Policy::Refresh(_) => PolicyKind::Refresh,
        }
    }

    fn dependencies(&self) -> Vec<Policy> {
        match self {
            Policy::MaxSize(_) => vec![Policy::Queue],
            Policy::MaxAge(_) => vec![Policy::ExpireAt],
            Policy::MaxErrorAge(_) => vec![Policy::ExpireAt, Policy::NegativeCache],
            Policy::AsyncResolver => vec![Policy::SharedHandle, Policy::ThreadSafe],
            Policy::Refresh(_) => vec![Policy::SharedHandle, Policy::ThreadSafe],
            _ => vec![],
        }
    }
}

/// The composed policy stack.
///
/// Dispatch consults these fields in a fixed order, so event delivery is
/// reproducible for any declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PolicySet {
    pub(crate) thread_safe: bool,
    pub(crate) queue: bool,
    pub(crate) max_size: Option<usize>,
    pub(crate) weaken: bool,
    pub(crate) negative_cache: bool,
    pub(crate) max_age: Option<Duration>,
    pub(crate) max_error_age: Option<Duration>,
    pub(crate) refresh: Option<RefreshConfig>,
    /// Refresh deadlines are serviced by per-entry timer tasks instead of
    /// the worker thread's delay list.
    pub(crate) timer_refresh: bool,
    /// The clock configured on the cache is steady; no monotonic shadow
    /// deadlines are needed.
    pub(crate) clock_steady: bool,
    /// Stable composition order, kept for reproducibility.
    pub(crate) order: Vec<PolicyKind>,
}

/// Errors in the declared policy list.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("thread-safe and thread-unsafe policies are mutually exclusive")]
    ConflictingConcurrency,
    #[error("a policy was declared twice with different options")]
    ConflictingOptions,
    #[error("max-size must be non-zero")]
    ZeroMaxSize,
    #[error("the refresh policy requires a resolver")]
    RefreshWithoutResolver,
}

/// Close the declared policies over their dependencies, supply defaults,
/// deduplicate, and produce the composed set.
pub(crate) fn compose(declared: &[Policy], clock_steady: bool) -> Result<PolicySet, ComposeError> {
    // Transitive closure, declaration order first, dependencies after.
    let mut closed: Vec<Policy> = Vec::new();
    let mut worklist: Vec<Policy> = declared.to_vec();
    while let Some(policy) = worklist.pop() {
        match closed.iter().find(|p| p.kind() == policy.kind()) {
            Some(existing) if *existing != policy => {
                return Err(ComposeError::ConflictingOptions)
            }
            Some(_) => continue,
            None => {}
        }
        worklist.extend(policy.dependencies());
        closed.push(policy);
    }

    let has = |kind: PolicyKind| closed.iter().any(|p| p.kind() == kind);

    if has(PolicyKind::ThreadSafe) && has(PolicyKind::ThreadUnsafe) {
        return Err(ComposeError::ConflictingConcurrency);
    }
    // Default concurrency policy.
    if !has(PolicyKind::ThreadSafe) && !has(PolicyKind::ThreadUnsafe) {
        closed.push(Policy::ThreadSafe);
    }

    let mut set = PolicySet {
        clock_steady,
        ..PolicySet::default()
    };
    for policy in &closed {
        match *policy {
            Policy::ThreadSafe => set.thread_safe = true,
            Policy::ThreadUnsafe => set.thread_safe = false,
            Policy::Queue => set.queue = true,
            Policy::MaxSize(limit) => {
                if limit == 0 {
                    return Err(ComposeError::ZeroMaxSize);
                }
                set.max_size = Some(limit);
            }
            Policy::Weaken => set.weaken = true,
            Policy::NegativeCache => set.negative_cache = true,
            Policy::ExpireAt => {}
            Policy::MaxAge(age) => set.max_age = Some(age),
            Policy::MaxErrorAge(age) => set.max_error_age = Some(age),
            Policy::Resolver | Policy::AsyncResolver | Policy::SharedHandle => {}
            Policy::Refresh(config) => set.refresh = Some(config),
        }
    }

    set.order = closed.iter().map(Policy::kind).collect();
    set.order.sort_unstable();
    set.order.dedup();

    tracing::debug!(order = ?set.order, "composed policy stack");

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_are_closed_transitively() {
        let set = compose(&[Policy::MaxSize(5)], true).unwrap();
        assert!(set.queue);
        assert_eq!(set.max_size, Some(5));
        // Defaults arrive even when nothing asked for them.
        assert!(set.thread_safe);
    }

    #[test]
    fn test_max_error_age_pulls_in_negative_cache() {
        let set = compose(&[Policy::MaxErrorAge(Duration::from_secs(1))], true).unwrap();
        assert!(set.negative_cache);
        assert_eq!(set.max_error_age, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_duplicate_declarations_are_deduplicated() {
        let set = compose(&[Policy::Queue, Policy::Queue, Policy::MaxSize(3)], true).unwrap();
        assert!(set.queue);
        assert_eq!(
            set.order.iter().filter(|k| **k == PolicyKind::Queue).count(),
            1
        );
    }

    #[test]
    fn test_conflicting_options_are_rejected() {
        assert_eq!(
            compose(&[Policy::MaxSize(3), Policy::MaxSize(4)], true),
            Err(ComposeError::ConflictingOptions)
        );
        assert_eq!(
            compose(&[Policy::ThreadSafe, Policy::ThreadUnsafe], true),
            Err(ComposeError::ConflictingConcurrency)
        );
        assert_eq!(
            compose(&[Policy::MaxSize(0)], true),
            Err(ComposeError::ZeroMaxSize)
        );
    }

    #[test]
    fn test_order_is_stable_across_declaration_orders() {
        let a = compose(&[Policy::NegativeCache, Policy::MaxSize(2)], true).unwrap();
        let b = compose(&[Policy::MaxSize(2), Policy::NegativeCache], true).unwrap();
        assert_eq!(a.order, b.order);
    }
}
