// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::access_vector_cache::{FifoQueryCache, Locked, Query};
use crate::policy::{AccessVector, ClassId};
use crate::security_server::SecurityServer;
use crate::SecurityId;

use std::sync::Weak;

/// Describes the result of a permission lookup between two Security Contexts.
#[derive(Clone, Debug, PartialEq)]
pub struct PermissionCheckResult {
    /// True if the specified permissions should be permitted.
    pub permit: bool,

    /// True if details of the check should be audit logged. Audit logs are by default only output
    /// when the policy defines that the permissions should be denied (whether or not the check is
    /// "permissive"), but may be suppressed for some denials ("dontaudit"), or for some allowed
    /// permissions ("auditallow").
    pub audit: bool,
}

/// Implements the `has_permission()` API, based on the security server's shared access vector
/// cache.
pub struct PermissionCheck<'a> {
    security_server: &'a SecurityServer,
    access_vector_cache: &'a Locked<FifoQueryCache<Weak<SecurityServer>>>,
}

impl<'a> PermissionCheck<'a> {
    pub(crate) fn new(
        security_server: &'a SecurityServer,
        access_vector_cache: &'a Locked<FifoQueryCache<Weak<SecurityServer>>>,
    ) -> Self {
        Self { security_server, access_vector_cache }
    }

    /// Returns whether `source_sid` has all of the `requested` permissions on `target_sid`, an
    /// object of class `target_class`. The result indicates both whether the permissions are
    /// `permit`ted, and whether the caller should `audit` log the query.
    pub fn has_permission(
        &self,
        source_sid: SecurityId,
        target_sid: SecurityId,
        target_class: ClassId,
        requested: AccessVector,
    ) -> PermissionCheckResult {
        has_permission(
            self.security_server.is_enforcing(),
            self.access_vector_cache,
            source_sid,
            target_sid,
            target_class,
            requested,
        )
    }

    pub fn security_server(&self) -> &SecurityServer {
        self.security_server
    }
}

/// Internal implementation of the `has_permission()` API, in terms of the `Query` trait.
fn has_permission(
    is_enforcing: bool,
    query: &impl Query,
    source_sid: SecurityId,
    target_sid: SecurityId,
    target_class: ClassId,
    requested: AccessVector,
) -> PermissionCheckResult {
    let mut result =
        match query.compute_access_decision(source_sid, target_sid, target_class, requested) {
            Ok(decision) => {
                let permit = decision.allowed.contains(requested);
                let audit = if permit {
                    decision.audit_allow.contains(requested)
                } else {
                    (requested & !decision.allowed & decision.audit_deny) != AccessVector::NONE
                };
                PermissionCheckResult { permit, audit }
            }
            Err(error) => {
                log::debug!("denying permission check: {}", error);
                PermissionCheckResult { permit: false, audit: true }
            }
        };

    if !result.permit && !is_enforcing {
        // If the security server is not currently enforcing then permit all access.
        result.permit = true;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::testing::PolicyBuilder;
    use crate::policy::AccessDecision;
    use crate::security_server::ServerError;
    use crate::EngineConfig;

    use test_case::test_case;

    const READ: AccessVector = AccessVector::from_raw(0b01);
    const WRITE: AccessVector = AccessVector::from_raw(0b10);

    fn sid(value: u32) -> SecurityId {
        SecurityId::from_u32(value).unwrap()
    }

    fn class() -> ClassId {
        ClassId::from_u32(1).unwrap()
    }

    /// Answers every query with a fixed decision, or fails for unknown targets.
    struct FixedDecision(AccessDecision);

    impl Query for FixedDecision {
        fn compute_access_decision(
            &self,
            _source_sid: SecurityId,
            target_sid: SecurityId,
            _target_class: ClassId,
            _requested: AccessVector,
        ) -> Result<AccessDecision, ServerError> {
            if target_sid.as_u32() == 0xbad {
                return Err(ServerError::UnknownSid { sid: target_sid });
            }
            Ok(self.0.clone())
        }

        fn policy_generation(&self) -> u64 {
            self.0.generation
        }
    }

    fn decision(
        allowed: AccessVector,
        audit_allow: AccessVector,
        audit_deny: AccessVector,
    ) -> FixedDecision {
        FixedDecision(AccessDecision {
            allowed,
            decided: allowed,
            audit_allow,
            audit_deny,
            notify: AccessVector::NONE,
            generation: 1,
        })
    }

    #[test_case(READ | WRITE, READ, true, false; "allowed")]
    #[test_case(READ, READ | WRITE, false, true; "partially denied")]
    #[test_case(AccessVector::NONE, READ, false, true; "denied")]
    fn enforcing_checks(allowed: AccessVector, requested: AccessVector, permit: bool, audit: bool) {
        let query = decision(allowed, AccessVector::NONE, AccessVector::ALL);
        assert_eq!(
            has_permission(true, &query, sid(11), sid(12), class(), requested),
            PermissionCheckResult { permit, audit }
        );
    }

    #[test]
    fn permissive_checks_permit_but_still_audit() {
        let query = decision(AccessVector::NONE, AccessVector::NONE, AccessVector::ALL);
        assert_eq!(
            has_permission(false, &query, sid(11), sid(12), class(), READ),
            PermissionCheckResult { permit: true, audit: true }
        );
    }

    #[test]
    fn audit_allow_and_dont_audit() {
        let query = decision(READ, READ, AccessVector::ALL);
        assert_eq!(
            has_permission(true, &query, sid(11), sid(12), class(), READ),
            PermissionCheckResult { permit: true, audit: true }
        );

        // Denials of `write` are not audited.
        let query = decision(READ, AccessVector::NONE, !WRITE);
        assert_eq!(
            has_permission(true, &query, sid(11), sid(12), class(), WRITE),
            PermissionCheckResult { permit: false, audit: false }
        );
    }

    #[test]
    fn errors_are_audited_denials() {
        let query = decision(AccessVector::ALL, AccessVector::NONE, AccessVector::NONE);
        assert_eq!(
            has_permission(true, &query, sid(11), sid(0xbad), class(), READ),
            PermissionCheckResult { permit: false, audit: true }
        );
    }

    #[test]
    fn security_server_checks() {
        let builder = PolicyBuilder::new()
            .class("file", &["read", "write", "execute"])
            .types(&["t_proc", "t_file"])
            .role("r", &["t_proc", "t_file"])
            .user("u", &["r"], "")
            .allow("t_proc", "t_file", "file", &["read", "write"])
            .audit_allow("t_proc", "t_file", "file", &["write"])
            .dont_audit("t_proc", "t_file", "file", &["execute"]);
        let security_server =
            SecurityServer::with_config(EngineConfig { mls: false, ..EngineConfig::default() });
        security_server.load_policy(builder.bytes()).expect("load policy");
        security_server.set_enforcing(true);

        let source = security_server.security_context_to_sid(b"u:r:t_proc".into()).unwrap();
        let target = security_server.security_context_to_sid(b"u:r:t_file".into()).unwrap();
        let file = security_server.class_id_by_name("file").unwrap();
        let check = |names: &[&str]| {
            let requested = security_server.access_vector_by_names("file", names).unwrap();
            security_server.as_permission_check().has_permission(source, target, file, requested)
        };

        assert_eq!(check(&["read"]), PermissionCheckResult { permit: true, audit: false });
        assert_eq!(check(&["write"]), PermissionCheckResult { permit: true, audit: true });
        assert_eq!(check(&["execute"]), PermissionCheckResult { permit: false, audit: false });
        assert_eq!(
            check(&["read", "execute"]),
            PermissionCheckResult { permit: false, audit: false }
        );

        // Unknown SIDs fail closed.
        let unknown = SecurityId::from_u32(1000).unwrap();
        let result = security_server.as_permission_check().has_permission(
            source,
            unknown,
            file,
            AccessVector::NONE,
        );
        assert_eq!(result, PermissionCheckResult { permit: false, audit: true });

        security_server.set_enforcing(false);
        assert_eq!(check(&["execute"]), PermissionCheckResult { permit: true, audit: false });
        let permission_check = security_server.as_permission_check();
        assert!(std::ptr::eq(permission_check.security_server(), security_server.as_ref()));
    }
}
