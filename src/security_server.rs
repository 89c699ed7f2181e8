// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::access_vector_cache::{Manager as AvcManager, Query, Reset};
use crate::permission_check::PermissionCheck;
use crate::policy::error::QueryError;
use crate::policy::ocontext::{OContexts, SidCache};
use crate::policy::{
    parse_policy, AccessDecision, AccessVector, ClassId, ComputeKind, Policy, SecurityContext,
    SecurityContextError,
};
use crate::sid_table::SidTable;
use crate::sync::RwLock;
use crate::{EngineConfig, InitialSid, NullessByteStr, SecurityId};

use anyhow::Context as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by the decision API. Callers must treat a failed request as denied.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ServerError {
    #[error("no policy has been loaded")]
    NoPolicy,
    #[error("security identifier {} is not mapped to a context", .sid.as_u32())]
    UnknownSid { sid: SecurityId },
    #[error("class {} is not defined by the policy", .class.as_u32())]
    UnknownClass { class: ClassId },
    #[error("invalid security context: {0}")]
    InvalidContext(#[from] SecurityContextError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("security identifiers exhausted")]
    SidsExhausted,
}

struct ActivePolicy {
    /// Parsed policy structure.
    parsed: Policy,

    /// The binary policy that was previously passed to `load_policy()`.
    binary: Vec<u8>,

    /// Number of policies loaded so far, including this one.
    generation: u64,
}

pub struct SecurityServer {
    /// Manager for the access vector cache shared between threads subject to access control by
    /// this security server.
    avc_manager: AvcManager<SecurityServer>,

    /// Features supported by this engine, checked against each policy at load.
    config: EngineConfig,

    /// Allocates and maintains the mapping between `SecurityId`s (SIDs) and Security Contexts.
    /// Always locked before `active_policy`.
    sid_table: RwLock<SidTable>,

    /// Immutable snapshot of the currently active policy, replaced wholesale by `load_policy()`.
    active_policy: RwLock<Option<Arc<ActivePolicy>>>,

    /// True if hooks should enforce policy-based access decisions.
    enforcing: AtomicBool,
}

impl SecurityServer {
    pub fn new() -> Arc<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Returns a security server that loads policies for an engine supporting `config`.
    pub fn with_config(config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|security_server| Self {
            avc_manager: AvcManager::new(security_server.clone()),
            config,
            sid_table: RwLock::new(SidTable::default()),
            active_policy: RwLock::new(None),
            enforcing: AtomicBool::new(false),
        })
    }

    /// Returns a [`PermissionCheck`] that consults the shared access vector cache.
    pub fn as_permission_check(&self) -> PermissionCheck<'_> {
        PermissionCheck::new(self, self.avc_manager.get_shared_cache())
    }

    /// Applies the supplied policy to the security server.
    ///
    /// The new policy must keep the value and permissions of every class defined by the active
    /// policy. Live SIDs are re-expressed in terms of the new policy; SIDs whose contexts are not
    /// valid under it are dropped. On failure the active policy is left untouched.
    pub fn load_policy(&self, binary_policy: Vec<u8>) -> Result<(), anyhow::Error> {
        // Parse the supplied policy, and reject the load operation if it is
        // malformed or invalid.
        let parsed = parse_policy(&binary_policy, self.config)?;

        let mut sid_table = self.sid_table.write();
        let previous = self.active_policy.read().clone();
        let (new_sid_table, dropped, generation) = match previous.as_deref() {
            Some(previous) => {
                previous
                    .parsed
                    .check_compatible(&parsed)
                    .context("checking compatibility with the active policy")?;
                let (new_sid_table, dropped) = sid_table.convert(&previous.parsed, &parsed);
                (new_sid_table, dropped, previous.generation + 1)
            }
            None => (SidTable::new(&parsed), 0, 1),
        };

        *self.active_policy.write() =
            Some(Arc::new(ActivePolicy { parsed, binary: binary_policy, generation }));
        *sid_table = new_sid_table;
        let sid_count = sid_table.len();
        std::mem::drop(sid_table);

        // Caches are reset only once the new policy is being served.
        self.avc_manager.reset();

        log::info!(
            "loaded policy generation {} ({} SIDs, {} dropped)",
            generation,
            sid_count,
            dropped
        );
        Ok(())
    }

    /// Reads a binary policy from `reader` and applies it, as [`Self::load_policy()`].
    pub fn load_policy_from_reader(
        &self,
        mut reader: impl std::io::Read,
    ) -> Result<(), anyhow::Error> {
        let mut binary_policy = Vec::new();
        reader.read_to_end(&mut binary_policy).context("reading binary policy")?;
        self.load_policy(binary_policy)
    }

    /// Returns the binary policy most recently passed to `load_policy()`, if any.
    pub fn get_binary_policy(&self) -> Option<Vec<u8>> {
        self.current().map(|active_policy| active_policy.binary.clone())
    }

    /// Returns true if a policy has been loaded.
    pub fn has_policy(&self) -> bool {
        self.active_policy.read().is_some()
    }

    /// Returns the generation of the active policy: the number of policies loaded so far.
    pub fn policy_generation(&self) -> u64 {
        self.current().map_or(0, |active_policy| active_policy.generation)
    }

    /// Returns the number of SIDs currently mapped to contexts.
    pub fn sid_count(&self) -> usize {
        self.sid_table.read().len()
    }

    /// Set to enforcing mode if `enforce` is true, permissive mode otherwise.
    pub fn set_enforcing(&self, enforcing: bool) {
        self.enforcing.store(enforcing, Ordering::Relaxed);
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforcing.load(Ordering::Relaxed)
    }

    /// Returns the class identifier of the class named `name`, if the active policy defines it.
    pub fn class_id_by_name(&self, name: &str) -> Option<ClassId> {
        self.current()?.parsed.class_id_by_name(name)
    }

    /// Returns the access vector of the named permissions of the named class.
    pub fn access_vector_by_names(
        &self,
        class_name: &str,
        permission_names: &[&str],
    ) -> Result<AccessVector, ServerError> {
        let active_policy = self.current().ok_or(ServerError::NoPolicy)?;
        Ok(active_policy.parsed.access_vector_by_names(class_name, permission_names)?)
    }

    /// Returns the security ID mapped to `security_context`, creating it if it does not exist.
    ///
    /// All objects with the same security context will have the same SID associated.
    pub fn security_context_to_sid(
        &self,
        security_context: NullessByteStr<'_>,
    ) -> Result<SecurityId, ServerError> {
        self.intern_with(|_, policy| Ok(policy.parse_security_context(security_context)?))
    }

    /// Returns the Security Context string for the requested `sid`.
    pub fn sid_to_security_context(&self, sid: SecurityId) -> Option<Vec<u8>> {
        let sid_table = self.sid_table.read();
        let active_policy = self.current()?;
        let context = sid_table.sid_to_context(sid)?;
        Some(active_policy.parsed.serialize_security_context(context))
    }

    /// Computes the [`AccessDecision`] for `source_sid` accessing `target_sid` as an object of
    /// class `target_class`.
    ///
    /// Before a policy is loaded exactly the `requested` permissions are granted.
    pub fn compute_access_vector(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        let sid_table = self.sid_table.read();
        let Some(active_policy) = self.current() else {
            return Ok(AccessDecision::allow_requested(requested));
        };

        let source_context = context_of(&sid_table, source_sid)?;
        let target_context = context_of(&sid_table, target_sid)?;
        let mut decision = active_policy
            .parsed
            .compute_access_decision(source_context, target_context, target_class)
            .ok_or(ServerError::UnknownClass { class: target_class })?;
        decision.generation = active_policy.generation;
        Ok(decision)
    }

    /// Returns the SID with which to label a new object of class `target_class`, created by
    /// `source_sid` in relation to `target_sid`, applying type transition rules.
    pub fn compute_transition_sid(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
    ) -> Result<SecurityId, ServerError> {
        self.compute_new_sid(source_sid, target_sid, target_class, ComputeKind::Transition)
    }

    /// As [`Self::compute_transition_sid()`], applying type member rules.
    pub fn compute_member_sid(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
    ) -> Result<SecurityId, ServerError> {
        self.compute_new_sid(source_sid, target_sid, target_class, ComputeKind::Member)
    }

    /// Returns the SIDs with which to label a filesystem named `fs_name` and the files within it.
    /// Defaults to the `fs` and `file` initial SIDs.
    pub fn fs_sid(&self, fs_name: &str) -> Result<(SecurityId, SecurityId), ServerError> {
        self.ocontext_sid_pair((InitialSid::Fs, InitialSid::File), |ocontexts| {
            ocontexts.filesystem(fs_name).map(|entry| {
                (&entry.sids, entry.fs_context(), entry.file_context())
            })
        })
    }

    /// Returns the SID with which to label `port` of `protocol`. Defaults to the `port` initial
    /// SID.
    pub fn port_sid(&self, protocol: u32, port: u16) -> Result<SecurityId, ServerError> {
        self.ocontext_sid(InitialSid::Port, |ocontexts| {
            ocontexts.port(protocol, port.into()).map(|entry| (&entry.sid, entry.context()))
        })
    }

    /// Returns the SIDs with which to label the network interface `name` and the messages
    /// received on it. Defaults to the `netif` and `netmsg` initial SIDs.
    pub fn netif_sid(&self, name: &str) -> Result<(SecurityId, SecurityId), ServerError> {
        self.ocontext_sid_pair((InitialSid::Netif, InitialSid::Netmsg), |ocontexts| {
            ocontexts.netif(name).map(|entry| {
                (&entry.sids, entry.interface_context(), entry.message_context())
            })
        })
    }

    /// Returns the SID with which to label the node `addr`. Only IPv4 nodes are labeled by the
    /// policy; other addresses receive the `node` initial SID.
    pub fn node_sid(&self, addr: IpAddr) -> Result<SecurityId, ServerError> {
        let IpAddr::V4(addr) = addr else {
            return Ok(SecurityId::initial(InitialSid::Node));
        };
        self.ocontext_sid(InitialSid::Node, |ocontexts| {
            ocontexts.node(addr.into()).map(|entry| (&entry.sid, entry.context()))
        })
    }

    fn current(&self) -> Option<Arc<ActivePolicy>> {
        self.active_policy.read().clone()
    }

    fn compute_new_sid(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        kind: ComputeKind,
    ) -> Result<SecurityId, ServerError> {
        self.intern_with(|sid_table, policy| {
            let source_context = context_of(sid_table, source_sid)?;
            let target_context = context_of(sid_table, target_sid)?;
            policy
                .new_security_context(source_context, target_context, target_class, kind)
                .ok_or(ServerError::UnknownClass { class: target_class })
        })
    }

    /// Returns the SID of the context produced by `compute`, allocating a SID if the context has
    /// none. `compute` is re-run under the write lock when a SID must be allocated, so that the
    /// context is always computed against the policy the table belongs to.
    fn intern_with(
        &self,
        compute: impl Fn(&SidTable, &Policy) -> Result<SecurityContext, ServerError>,
    ) -> Result<SecurityId, ServerError> {
        {
            let sid_table = self.sid_table.read();
            let active_policy = self.current().ok_or(ServerError::NoPolicy)?;
            let context = compute(&sid_table, &active_policy.parsed)?;
            if let Some(sid) = sid_table.find_sid(&context) {
                return Ok(sid);
            }
        }

        let mut sid_table = self.sid_table.write();
        let active_policy = self.current().ok_or(ServerError::NoPolicy)?;
        let context = compute(&sid_table, &active_policy.parsed)?;
        sid_table.context_to_sid(&context).ok_or(ServerError::SidsExhausted)
    }

    /// Looks up an object context entry with `lookup`, returning its SID, interning its context
    /// on first use. Returns the `default` initial SID if no entry matches.
    fn ocontext_sid(
        &self,
        default: InitialSid,
        lookup: impl Fn(&OContexts) -> Option<(&SidCache<SecurityId>, &SecurityContext)>,
    ) -> Result<SecurityId, ServerError> {
        {
            let _sid_table = self.sid_table.read();
            let Some(active_policy) = self.current() else {
                return Ok(SecurityId::initial(default));
            };
            match lookup(active_policy.parsed.ocontexts()) {
                None => return Ok(SecurityId::initial(default)),
                Some((sids, _)) => {
                    if let Some(sid) = sids.get() {
                        return Ok(sid);
                    }
                }
            }
        }

        let mut sid_table = self.sid_table.write();
        let Some(active_policy) = self.current() else {
            return Ok(SecurityId::initial(default));
        };
        let Some((sids, context)) = lookup(active_policy.parsed.ocontexts()) else {
            return Ok(SecurityId::initial(default));
        };
        let sid = sid_table.context_to_sid(context).ok_or(ServerError::SidsExhausted)?;
        Ok(sids.get_or_set(sid))
    }

    /// As [`Self::ocontext_sid()`], for entries that label two objects.
    fn ocontext_sid_pair(
        &self,
        (first_default, second_default): (InitialSid, InitialSid),
        lookup: impl Fn(
            &OContexts,
        ) -> Option<(&SidCache<(SecurityId, SecurityId)>, &SecurityContext, &SecurityContext)>,
    ) -> Result<(SecurityId, SecurityId), ServerError> {
        let defaults = (SecurityId::initial(first_default), SecurityId::initial(second_default));
        {
            let _sid_table = self.sid_table.read();
            let Some(active_policy) = self.current() else {
                return Ok(defaults);
            };
            match lookup(active_policy.parsed.ocontexts()) {
                None => return Ok(defaults),
                Some((sids, _, _)) => {
                    if let Some(sids) = sids.get() {
                        return Ok(sids);
                    }
                }
            }
        }

        let mut sid_table = self.sid_table.write();
        let Some(active_policy) = self.current() else {
            return Ok(defaults);
        };
        let Some((sids, first, second)) = lookup(active_policy.parsed.ocontexts()) else {
            return Ok(defaults);
        };
        let first = sid_table.context_to_sid(first).ok_or(ServerError::SidsExhausted)?;
        let second = sid_table.context_to_sid(second).ok_or(ServerError::SidsExhausted)?;
        Ok(sids.get_or_set((first, second)))
    }
}

fn context_of(sid_table: &SidTable, sid: SecurityId) -> Result<&SecurityContext, ServerError> {
    sid_table.sid_to_context(sid).ok_or(ServerError::UnknownSid { sid })
}

impl Query for SecurityServer {
    fn compute_access_decision(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> Result<AccessDecision, ServerError> {
        self.compute_access_vector(source_sid, target_sid, target_class, requested)
    }

    fn policy_generation(&self) -> u64 {
        SecurityServer::policy_generation(self)
    }
}
