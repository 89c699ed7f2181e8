// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::policy::{AccessDecision, AccessVector, ClassId};
use crate::security_server::ServerError;
use crate::sync::Mutex;
use crate::SecurityId;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// Interface used internally by the `SecurityServer` implementation to implement policy queries.
///
/// This trait allows layering of caching, delegation, and thread-safety between the policy-backed
/// calculations, and the caller-facing permission-check interface.
pub(super) trait Query {
    /// Computes the [`AccessDecision`] permitted to `source_sid` for accessing `target_sid`, an
    /// object of class `target_class`. `requested` only affects decisions made before a policy is
    /// loaded.
    fn compute_access_decision(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError>;

    /// Returns the generation of the policy that decisions are currently computed against.
    fn policy_generation(&self) -> u64;
}

/// Mutable counterpart of [`Query`], for caches that update their state on lookup.
pub(super) trait QueryMut {
    fn compute_access_decision(
        &mut self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError>;

    fn policy_generation(&mut self) -> u64;
}

impl<Q: Query> QueryMut for Q {
    fn compute_access_decision(
        &mut self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        (self as &dyn Query).compute_access_decision(
            source_sid,
            target_sid,
            target_class,
            requested,
        )
    }

    fn policy_generation(&mut self) -> u64 {
        (self as &dyn Query).policy_generation()
    }
}

/// An interface for emptying caches that store [`Query`] input/output pairs. This interface
/// requires implementers to update state via interior mutability.
pub(super) trait Reset {
    /// Removes all entries from this cache. Returns true only if the cache is still valid after
    /// reset.
    fn reset(&self) -> bool;
}

/// An interface for emptying caches that store [`Query`] input/output pairs.
pub(super) trait ResetMut {
    fn reset(&mut self) -> bool;
}

impl<R: Reset> ResetMut for R {
    fn reset(&mut self) -> bool {
        (self as &dyn Reset).reset()
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct QueryArgs {
    source_sid: SecurityId,
    target_sid: SecurityId,
    target_class: ClassId,
}

/// Thread-hostile associative cache with capacity defined at construction and FIFO eviction.
///
/// Entries remember the policy generation their decision was computed against, and are treated
/// as misses once the delegate reports a different generation. Decisions made before any policy
/// is loaded (generation zero) are never cached.
pub(super) struct FifoQueryCache<D> {
    entries: HashMap<QueryArgs, AccessDecision>,
    insertion_order: VecDeque<QueryArgs>,
    capacity: usize,
    delegate: D,
}

impl<D> FifoQueryCache<D> {
    /// Constructs a fixed-size access vector cache that delegates to `delegate`.
    ///
    /// # Panics
    ///
    /// This will panic if called with a `capacity` of zero.
    pub fn new(delegate: D, capacity: usize) -> Self {
        assert!(capacity > 0, "cannot instantiate fixed access vector cache of size 0");
        Self {
            entries: HashMap::with_capacity(capacity),
            insertion_order: VecDeque::with_capacity(capacity),
            capacity,
            delegate,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, query_args: QueryArgs, access_decision: AccessDecision) {
        if self.entries.insert(query_args, access_decision).is_some() {
            return;
        }
        self.insertion_order.push_back(query_args);
        if self.insertion_order.len() > self.capacity {
            if let Some(evicted) = self.insertion_order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

impl<D: QueryMut> QueryMut for FifoQueryCache<D> {
    fn compute_access_decision(
        &mut self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        let query_args = QueryArgs { source_sid, target_sid, target_class };
        let generation = self.delegate.policy_generation();
        if let Some(access_decision) = self.entries.get(&query_args) {
            if generation != 0 && access_decision.generation == generation {
                return Ok(access_decision.clone());
            }
        }

        let access_decision = self.delegate.compute_access_decision(
            source_sid,
            target_sid,
            target_class,
            requested,
        )?;
        if access_decision.generation != 0 {
            self.insert(query_args, access_decision.clone());
        }
        Ok(access_decision)
    }

    fn policy_generation(&mut self) -> u64 {
        self.delegate.policy_generation()
    }
}

impl<D> ResetMut for FifoQueryCache<D> {
    fn reset(&mut self) -> bool {
        self.entries.clear();
        self.insertion_order.clear();
        true
    }
}

/// A locked access vector cache.
pub(super) struct Locked<D> {
    delegate: Arc<Mutex<D>>,
}

impl<D> Clone for Locked<D> {
    fn clone(&self) -> Self {
        Self { delegate: self.delegate.clone() }
    }
}

impl<D> Locked<D> {
    /// Constructs a locked access vector cache that delegates to `delegate`.
    pub fn new(delegate: D) -> Self {
        Self { delegate: Arc::new(Mutex::new(delegate)) }
    }
}

impl<D: QueryMut> Query for Locked<D> {
    fn compute_access_decision(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        self.delegate.lock().compute_access_decision(
            source_sid,
            target_sid,
            target_class,
            requested,
        )
    }

    fn policy_generation(&self) -> u64 {
        self.delegate.lock().policy_generation()
    }
}

impl<D: ResetMut> Reset for Locked<D> {
    fn reset(&self) -> bool {
        self.delegate.lock().reset()
    }
}

impl<Q: Query> Query for Weak<Q> {
    fn compute_access_decision(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        self.upgrade().ok_or(ServerError::NoPolicy).and_then(|q| {
            q.compute_access_decision(source_sid, target_sid, target_class, requested)
        })
    }

    fn policy_generation(&self) -> u64 {
        self.upgrade().map_or(0, |q| q.policy_generation())
    }
}

/// Default size of an access vector cache shared by all threads in the system.
const DEFAULT_SHARED_SIZE: usize = 1000;

/// Access vector cache manager that delegates queries to security server type, `SS`, and owns a
/// shared cache of size `DEFAULT_SHARED_SIZE`.
pub(super) struct Manager<SS> {
    shared_cache: Locked<FifoQueryCache<Weak<SS>>>,
}

impl<SS> Manager<SS> {
    /// Constructs a [`Manager`] that delegates cache misses to `security_server`.
    pub fn new(security_server: Weak<SS>) -> Self {
        let shared_cache = FifoQueryCache::new(security_server, DEFAULT_SHARED_SIZE);
        Self { shared_cache: Locked::new(shared_cache) }
    }

    /// Returns a shared reference to the shared cache managed by this manager.
    pub fn get_shared_cache(&self) -> &Locked<FifoQueryCache<Weak<SS>>> {
        &self.shared_cache
    }
}

impl<SS> Reset for Manager<SS> {
    /// Resets caches owned by this manager. A security server must start serving a new policy
    /// *before* resetting its managers, so that stale decisions are not cached after the reset.
    fn reset(&self) -> bool {
        self.shared_cache.reset()
    }
}
