// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod avtab;
pub mod constraints;
pub mod error;
pub mod extensible_bitmap;
pub mod index;
pub mod metadata;
pub mod mls;
pub mod ocontext;
pub mod parsed_policy;
pub mod parser;
pub mod security_context;
pub mod symbols;

#[cfg(test)]
pub(crate) mod testing;

pub use parsed_policy::ComputeKind;
pub use security_context::{SecurityContext, SecurityContextError};

use crate::{EngineConfig, InitialSid, NullessByteStr};
use anyhow::Context as _;
use error::{QueryError, ValidateError};
use metadata::Config;
use ocontext::OContexts;
use parsed_policy::ParsedPolicy;
use parser::{PolicyCursor, PolicyWriter};
use std::num::NonZeroU32;
use symbols::Symbol;

/// An identifier of a symbol within a policy: the symbol's non-zero value in its table.
pub trait PolicyId: Copy + Sized {
    /// Human-readable name of the identified kind, used in errors.
    const KIND: &'static str;

    fn from_u32(value: u32) -> Option<Self>;
}

macro_rules! policy_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
        pub struct $name(NonZeroU32);

        impl $name {
            pub fn from_u32(value: u32) -> Option<Self> {
                NonZeroU32::new(value).map(Self)
            }

            pub fn as_u32(&self) -> u32 {
                self.0.get()
            }

            /// The bit representing this symbol in an [`extensible_bitmap::ExtensibleBitmap`].
            pub(crate) fn bit(&self) -> u32 {
                self.0.get() - 1
            }
        }

        impl PolicyId for $name {
            const KIND: &'static str = $kind;

            fn from_u32(value: u32) -> Option<Self> {
                $name::from_u32(value)
            }
        }
    };
}

policy_id!(
    /// Identifies a user within a policy.
    UserId,
    "user"
);
policy_id!(
    /// Identifies a role within a policy.
    RoleId,
    "role"
);
policy_id!(
    /// Identifies a type within a policy.
    TypeId,
    "type"
);
policy_id!(
    /// Identifies a sensitivity level within a policy.
    SensitivityId,
    "sensitivity"
);
policy_id!(
    /// Identifies a security category within a policy.
    CategoryId,
    "category"
);
policy_id!(
    /// Identifies a class within a policy.
    ClassId,
    "class"
);

/// Converts a raw value read from a policy into an identifier, rejecting zero.
pub(crate) fn parse_id<T: PolicyId>(value: u32) -> Result<T, ValidateError> {
    T::from_u32(value).ok_or(ValidateError::UndefinedReference { kind: T::KIND, value })
}

/// The set of permissions that may be granted to sources accessing targets of a particular class,
/// as defined in a policy. Permission value `v` is bit `v - 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessVector(u32);

impl AccessVector {
    pub const NONE: AccessVector = AccessVector(0);
    pub const ALL: AccessVector = AccessVector(u32::MAX);

    pub(crate) const fn from_raw(access_vector: u32) -> Self {
        Self(access_vector)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns whether every permission in `other` is also in `self`.
    pub fn contains(&self, other: AccessVector) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitAnd for AccessVector {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        AccessVector(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for AccessVector {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        AccessVector(self.0 | rhs.0)
    }
}

impl std::ops::Not for AccessVector {
    type Output = Self;

    fn not(self) -> Self::Output {
        AccessVector(!self.0)
    }
}

impl std::ops::BitAndAssign for AccessVector {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl std::ops::BitOrAssign for AccessVector {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

/// Encapsulates the result of a permissions calculation, between source & target contexts, for a
/// specific class. Decisions describe which permissions are allowed, and which should be
/// audit-logged when allowed, when denied, or notified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessDecision {
    pub allowed: AccessVector,
    /// The allowed permissions restricted to those the class defines.
    pub decided: AccessVector,
    pub audit_allow: AccessVector,
    pub audit_deny: AccessVector,
    pub notify: AccessVector,
    /// The policy generation the decision was computed against. Zero before any policy is loaded.
    pub generation: u64,
}

impl AccessDecision {
    /// Returns a decision granting exactly `requested`, used before a policy is loaded.
    pub(crate) fn allow_requested(requested: AccessVector) -> Self {
        Self {
            allowed: requested,
            decided: requested,
            audit_allow: AccessVector::NONE,
            audit_deny: AccessVector::NONE,
            notify: AccessVector::NONE,
            generation: 0,
        }
    }
}

/// A data structure that can be parsed from a binary policy. Parsing consumes the cursor and
/// returns the value together with the cursor positioned after it.
pub trait Parse: Sized {
    /// The type of error that may be returned from `parse()`, usually [`error::ParseError`] or
    /// [`anyhow::Error`].
    type Error: Into<anyhow::Error>;

    fn parse<'a>(cursor: PolicyCursor<'a>) -> Result<(Self, PolicyCursor<'a>), Self::Error>;
}

/// A data structure that can be written in binary policy form. Writing is the exact inverse of
/// [`Parse`] for the writer's configuration.
pub trait Write {
    fn write(&self, writer: &mut PolicyWriter);
}

/// Parses and validates `binary_policy` for an engine supporting the features in `config`.
pub fn parse_policy(binary_policy: &[u8], config: EngineConfig) -> anyhow::Result<Policy> {
    let parsed = ParsedPolicy::parse(binary_policy, config.into()).context("parsing policy")?;
    Ok(Policy(parsed))
}

/// Information on a class, for sharing outside this crate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassInfo<'a> {
    pub class_name: &'a str,
    pub class_id: ClassId,
}

/// A parsed and validated policy.
#[derive(Debug)]
pub struct Policy(ParsedPolicy);

impl Policy {
    /// The features in effect for this policy: those declared by the policy and supported by the
    /// engine.
    pub fn config(&self) -> Config {
        self.0.config()
    }

    /// Whether the policy declared features the engine does not support.
    pub fn is_downgraded(&self) -> bool {
        self.0.is_downgraded()
    }

    /// Serializes this policy. Equal policies serialize to identical bytes.
    pub fn write(&self) -> Vec<u8> {
        self.0.write()
    }

    pub fn classes(&self) -> Vec<ClassInfo<'_>> {
        self.0
            .symbols()
            .classes
            .iter()
            .filter_map(|class| {
                let class_id = ClassId::from_u32(class.value())?;
                Some(ClassInfo { class_name: class.name(), class_id })
            })
            .collect()
    }

    pub fn class_id_by_name(&self, name: &str) -> Option<ClassId> {
        self.0.class_by_name(name).and_then(|class| ClassId::from_u32(class.value()))
    }

    /// Returns the access vector for the named permissions of the named class. Inherited
    /// permissions are included.
    pub fn access_vector_by_names(
        &self,
        class_name: &str,
        permission_names: &[&str],
    ) -> Result<AccessVector, QueryError> {
        let symbols = self.0.symbols();
        let class = self
            .0
            .class_by_name(class_name)
            .ok_or_else(|| QueryError::UnknownClass { name: class_name.to_string() })?;
        permission_names.iter().try_fold(AccessVector::NONE, |access_vector, name| {
            let permission = symbols.class_permission_by_name(class, name).ok_or_else(|| {
                QueryError::UnknownPermission {
                    class: class_name.to_string(),
                    permission: name.to_string(),
                }
            })?;
            Ok(access_vector | permission.access_vector())
        })
    }

    /// Returns the [`SecurityContext`] defined by this policy for the specified initial SID.
    pub fn initial_context(&self, id: InitialSid) -> Option<&SecurityContext> {
        self.0.ocontexts().initial_context(id)
    }

    pub fn ocontexts(&self) -> &OContexts {
        self.0.ocontexts()
    }

    /// Returns a [`SecurityContext`] with fields parsed from the supplied Security Context string.
    pub fn parse_security_context(
        &self,
        security_context: NullessByteStr<'_>,
    ) -> Result<SecurityContext, SecurityContextError> {
        SecurityContext::parse_str(self.0.symbols(), security_context.as_bytes())
    }

    /// Validates a [`SecurityContext`] against this policy.
    pub fn validate_security_context(
        &self,
        security_context: &SecurityContext,
    ) -> Result<(), SecurityContextError> {
        security_context.validate(self.0.symbols())
    }

    /// Returns a byte string describing the supplied [`SecurityContext`].
    pub fn serialize_security_context(&self, security_context: &SecurityContext) -> Vec<u8> {
        security_context.serialize(self.0.symbols())
    }

    /// Re-expresses `security_context`, defined by `previous`, in terms of this policy.
    pub fn convert_security_context(
        &self,
        previous: &Policy,
        security_context: &SecurityContext,
    ) -> Result<SecurityContext, SecurityContextError> {
        security_context.convert(previous.0.symbols(), self.0.symbols())
    }

    /// Verifies that every class of this policy exists in `new` with unchanged values and
    /// permissions, so that class and permission values held by clients stay meaningful.
    pub fn check_compatible(&self, new: &Policy) -> Result<(), ValidateError> {
        self.0.check_compatible(&new.0)
    }

    /// Computes the access decision for `source` accessing `target` through an object of
    /// `class`. Returns `None` if the class is not defined. The decision's generation is zero.
    pub fn compute_access_decision(
        &self,
        source: &SecurityContext,
        target: &SecurityContext,
        class: ClassId,
    ) -> Option<AccessDecision> {
        self.0.compute_access_decision(source, target, class)
    }

    /// Returns the security context that should be applied to a new object of `class` created by
    /// `source` in relation to `target`. Returns `None` if the class is not defined.
    pub fn new_security_context(
        &self,
        source: &SecurityContext,
        target: &SecurityContext,
        class: ClassId,
        kind: ComputeKind,
    ) -> Option<SecurityContext> {
        self.0.new_security_context(source, target, class, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use testing::PolicyBuilder;

    fn policy() -> Policy {
        let bytes = PolicyBuilder::new()
            .common("file_common", &["read", "write"])
            .class_with_common("file", "file_common", &["execute"])
            .class("process", &["fork", "transition"])
            .types(&["t"])
            .role("r", &["t"])
            .user("u", &["r"], "")
            .bytes();
        let config = EngineConfig { mls: false, ..EngineConfig::default() };
        parse_policy(&bytes, config).expect("valid policy")
    }

    #[test]
    fn zero_is_not_an_id() {
        assert_eq!(TypeId::from_u32(0), None);
        assert_eq!(
            parse_id::<TypeId>(0),
            Err(ValidateError::UndefinedReference { kind: "type", value: 0 })
        );
        assert_eq!(parse_id::<RoleId>(3).map(|id| id.bit()), Ok(2));
    }

    #[test]
    fn access_vector_operators() {
        let read = AccessVector::from_raw(0b01);
        let write = AccessVector::from_raw(0b10);
        assert_eq!((read | write).bits(), 0b11);
        assert_eq!(read & write, AccessVector::NONE);
        assert_eq!((read | write) & !read, write);
        assert!((read | write).contains(read));
        assert!(!read.contains(read | write));
        assert_eq!(AccessVector::default(), AccessVector::NONE);
    }

    #[test]
    fn class_lookups() {
        let policy = policy();
        let names: Vec<_> = policy.classes().into_iter().map(|class| class.class_name).collect();
        assert_eq!(names, vec!["file", "process"]);
        assert_eq!(policy.class_id_by_name("process").map(|id| id.as_u32()), Some(2));
        assert_eq!(policy.class_id_by_name("socket"), None);
    }

    #[test]
    fn access_vectors_by_name_include_inherited_permissions() {
        let policy = policy();
        assert_eq!(
            policy.access_vector_by_names("file", &["read", "execute"]),
            Ok(AccessVector::from_raw(0b101))
        );
        assert_eq!(policy.access_vector_by_names("file", &[]), Ok(AccessVector::NONE));
        assert_eq!(
            policy.access_vector_by_names("file", &["fork"]),
            Err(QueryError::UnknownPermission {
                class: "file".to_string(),
                permission: "fork".to_string()
            })
        );
        assert_eq!(
            policy.access_vector_by_names("socket", &["read"]),
            Err(QueryError::UnknownClass { name: "socket".to_string() })
        );
    }

    #[test]
    fn security_context_strings() {
        let policy = policy();
        let context = policy
            .parse_security_context(b"u:r:t\0ignored".into())
            .expect("valid context");
        assert_eq!(policy.serialize_security_context(&context), b"u:r:t".to_vec());
        assert_eq!(policy.validate_security_context(&context), Ok(()));
        assert!(policy.parse_security_context(b"u:r:missing_t".into()).is_err());
    }

    #[test]
    fn write_is_stable() {
        let policy = policy();
        let bytes = policy.write();
        let config = EngineConfig { mls: false, ..EngineConfig::default() };
        let reparsed = parse_policy(&bytes, config).expect("reparse");
        assert_eq!(reparsed.write(), bytes);
    }
}
