// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::policy::{Policy, SecurityContext};
use crate::{SecurityId, FIRST_UNUSED_SID};

/// Number of hash buckets. SIDs are distributed by `sid % BUCKET_COUNT`.
const BUCKET_COUNT: usize = 128;

/// Allocates and maintains the mapping between [`SecurityId`]s (SIDs) and [`SecurityContext`]s.
///
/// Initial SIDs are seeded from the policy's initial contexts. Other SIDs are allocated
/// sequentially from [`FIRST_UNUSED_SID`] and are never reused by the same table.
pub struct SidTable {
    buckets: Vec<Vec<(SecurityId, SecurityContext)>>,
    len: usize,

    /// The value of the next SID to allocate.
    next_sid: u32,
}

impl Default for SidTable {
    fn default() -> Self {
        Self { buckets: vec![Vec::new(); BUCKET_COUNT], len: 0, next_sid: FIRST_UNUSED_SID }
    }
}

impl SidTable {
    /// Returns a table containing the initial contexts defined by `policy`.
    pub fn new(policy: &Policy) -> Self {
        let mut table = Self::default();
        for initial in policy.ocontexts().initial_contexts() {
            match SecurityId::from_u32(initial.sid()) {
                Some(sid) if initial.sid() < FIRST_UNUSED_SID => {
                    table.insert(sid, initial.context().clone())
                }
                _ => log::debug!("ignoring context for unsupported initial SID {}", initial.sid()),
            }
        }
        table
    }

    /// Returns a table for `policy` that keeps the SIDs of this table, which were allocated under
    /// `previous`. Each context is re-expressed by name in terms of `policy`; SIDs whose contexts
    /// are not valid in `policy` are dropped. Converted SIDs are kept even if their context now
    /// equals that of another SID. Returns the new table and the number of SIDs dropped.
    pub fn convert(&self, previous: &Policy, policy: &Policy) -> (Self, usize) {
        let mut table = Self::new(policy);
        table.next_sid = self.next_sid;

        let mut dropped = 0;
        for (sid, context) in self.iter().filter(|(sid, _)| sid.as_u32() >= FIRST_UNUSED_SID) {
            match policy.convert_security_context(previous, context) {
                Ok(context) => table.insert(sid, context),
                Err(error) => {
                    log::debug!("dropping SID {}: {}", sid.as_u32(), error);
                    dropped += 1;
                }
            }
        }
        (table, dropped)
    }

    /// Returns the SID mapped to `context`, allocating one if none exists yet. Returns `None`
    /// only if the SID space is exhausted.
    pub fn context_to_sid(&mut self, context: &SecurityContext) -> Option<SecurityId> {
        if let Some(sid) = self.find_sid(context) {
            return Some(sid);
        }
        let sid = SecurityId::from_u32(self.next_sid)?;
        self.next_sid = self.next_sid.checked_add(1)?;
        self.insert(sid, context.clone());
        Some(sid)
    }

    /// Returns the SID mapped to `context`, if any, without allocating.
    ///
    /// After [`SidTable::convert`] several SIDs may map to equal contexts, e.g. when a converted
    /// context matches an initial context of the new policy. All of them stay valid, and the
    /// lowest is returned, so initial SIDs take precedence.
    pub fn find_sid(&self, context: &SecurityContext) -> Option<SecurityId> {
        self.iter()
            .filter(|(_, existing)| *existing == context)
            .map(|(sid, _)| sid)
            .min_by_key(SecurityId::as_u32)
    }

    pub fn sid_to_context(&self, sid: SecurityId) -> Option<&SecurityContext> {
        self.bucket(sid).iter().find(|(existing, _)| *existing == sid).map(|(_, context)| context)
    }

    /// Removes `sid` from the table, returning its context. The SID is not allocated again.
    pub fn remove(&mut self, sid: SecurityId) -> Option<SecurityContext> {
        let index = Self::bucket_index(sid);
        let bucket = &mut self.buckets[index];
        let position = bucket.iter().position(|(existing, _)| *existing == sid)?;
        self.len -= 1;
        Some(bucket.swap_remove(position).1)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn insert(&mut self, sid: SecurityId, context: SecurityContext) {
        let index = Self::bucket_index(sid);
        self.buckets[index].push((sid, context));
        self.len += 1;
    }

    fn iter(&self) -> impl Iterator<Item = (SecurityId, &SecurityContext)> {
        self.buckets.iter().flatten().map(|(sid, context)| (*sid, context))
    }

    fn bucket(&self, sid: SecurityId) -> &[(SecurityId, SecurityContext)] {
        &self.buckets[Self::bucket_index(sid)]
    }

    fn bucket_index(sid: SecurityId) -> usize {
        sid.as_u32() as usize % BUCKET_COUNT
    }
}
