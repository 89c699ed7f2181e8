// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::avtab::{AvTab, AvTabDatum, AvTabKey};
use super::constraints::apply_constraints;
use super::error::{ParseError, ValidateError};
use super::extensible_bitmap::ExtensibleBitmap;
use super::index::Symbols;
use super::metadata::{Config, Header};
use super::mls::compute_mls_allowed;
use super::ocontext::OContexts;
use super::parser::{PolicyCursor, PolicyWriter};
use super::security_context::SecurityContext;
use super::symbols::{Class, Symbol};
use super::{AccessDecision, AccessVector, ClassId, Parse, TypeId, Write};

use anyhow::Context as _;

/// Name of the class whose new objects inherit the context of their creator.
pub(super) const PROCESS_CLASS_NAME: &str = "process";

const DEFAULT_VALUE_NONE: u32 = 0;
const DEFAULT_VALUE_ALL: u32 = 1;
const DEFAULT_VALUE_SELF: u32 = 2;

/// The vector granted by a default behavior before rules are applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefaultValue {
    None,
    All,
    /// Every permission, provided that the source and target types are the same.
    SelfType,
}

/// A per-class default for one access vector, with the classes it does not apply to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DefaultBehavior {
    pub(super) value: DefaultValue,
    pub(super) excluded_classes: ExtensibleBitmap,
}

impl DefaultBehavior {
    fn none() -> Self {
        Self { value: DefaultValue::None, excluded_classes: ExtensibleBitmap::new() }
    }

    pub fn value(&self) -> DefaultValue {
        self.value
    }

    /// Returns the vector this default grants for `class` when `source` accesses `target`.
    fn vector(&self, class: ClassId, source: TypeId, target: TypeId) -> AccessVector {
        if self.excluded_classes.is_set(class.bit()) {
            return AccessVector::NONE;
        }
        match self.value {
            DefaultValue::None => AccessVector::NONE,
            DefaultValue::All => AccessVector::ALL,
            DefaultValue::SelfType if source == target => AccessVector::ALL,
            DefaultValue::SelfType => AccessVector::NONE,
        }
    }
}

impl Parse for DefaultBehavior {
    type Error = ParseError;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (value, tail) = cursor.parse_u32()?;
        let value = match value {
            DEFAULT_VALUE_NONE => DefaultValue::None,
            DEFAULT_VALUE_ALL => DefaultValue::All,
            DEFAULT_VALUE_SELF => DefaultValue::SelfType,
            value => return Err(ParseError::InvalidDefaultBehavior { value }),
        };
        let (excluded_classes, tail) = ExtensibleBitmap::parse(tail)?;
        Ok((Self { value, excluded_classes }, tail))
    }
}

impl Write for DefaultBehavior {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(match self.value {
            DefaultValue::None => DEFAULT_VALUE_NONE,
            DefaultValue::All => DEFAULT_VALUE_ALL,
            DefaultValue::SelfType => DEFAULT_VALUE_SELF,
        });
        self.excluded_classes.write(writer);
    }
}

/// Default behaviors for each access vector. Audit and notify defaults are absent when the policy
/// or the engine lacks the feature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DefaultBehaviors {
    allowed: DefaultBehavior,
    audit_allow: Option<DefaultBehavior>,
    audit_deny: Option<DefaultBehavior>,
    notify: Option<DefaultBehavior>,
}

impl Default for DefaultBehaviors {
    fn default() -> Self {
        Self { allowed: DefaultBehavior::none(), audit_allow: None, audit_deny: None, notify: None }
    }
}

impl DefaultBehaviors {
    pub fn allowed(&self) -> &DefaultBehavior {
        &self.allowed
    }

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), ParseError> {
        let (layout, supported) = (cursor.layout(), cursor.supported());
        let (allowed, tail) = DefaultBehavior::parse(cursor)?;
        let (audit_allow, audit_deny, tail) = if layout.audit {
            let (audit_allow, tail) = DefaultBehavior::parse(tail)?;
            let (audit_deny, tail) = DefaultBehavior::parse(tail)?;
            if supported.audit {
                (Some(audit_allow), Some(audit_deny), tail)
            } else {
                (None, None, tail)
            }
        } else {
            (None, None, tail)
        };
        let (notify, tail) = if layout.notify {
            let (notify, tail) = DefaultBehavior::parse(tail)?;
            (supported.notify.then_some(notify), tail)
        } else {
            (None, tail)
        };
        Ok((Self { allowed, audit_allow, audit_deny, notify }, tail))
    }

    fn write(&self, writer: &mut PolicyWriter) {
        let config = writer.config();
        self.allowed.write(writer);
        if config.audit {
            self.audit_allow.clone().unwrap_or_else(DefaultBehavior::none).write(writer);
            self.audit_deny.clone().unwrap_or_else(DefaultBehavior::none).write(writer);
        }
        if config.notify {
            self.notify.clone().unwrap_or_else(DefaultBehavior::none).write(writer);
        }
    }

    fn iter(&self) -> impl Iterator<Item = &DefaultBehavior> {
        std::iter::once(&self.allowed)
            .chain(self.audit_allow.iter())
            .chain(self.audit_deny.iter())
            .chain(self.notify.iter())
    }
}

/// Selects which AVTab type field drives [`ParsedPolicy::new_security_context`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComputeKind {
    Transition,
    Member,
}

/// A fully parsed and validated binary policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedPolicy {
    /// Features the policy declared, restricted to those the engine supports.
    config: Config,
    /// Whether the policy declared features the engine does not support.
    downgraded: bool,
    symbols: Symbols,
    defaults: DefaultBehaviors,
    avtab: AvTab,
    ocontexts: OContexts,
}

impl ParsedPolicy {
    /// Parses and validates `bytes` for an engine supporting the features in `engine`.
    ///
    /// A policy whose MLS setting differs from the engine's is rejected. Audit and notify
    /// settings may differ in either direction, which reads the policy in downgraded mode: fields
    /// for features the engine lacks are read and discarded, and features the policy lacks stay
    /// disabled.
    pub(super) fn parse(bytes: &[u8], engine: Config) -> anyhow::Result<Self> {
        let (layout, tail) = Header::parse(PolicyCursor::new(bytes)).context("parsing header")?;
        if layout.mls != engine.mls {
            return Err(ParseError::MlsConfigMismatch { policy: layout.mls, engine: engine.mls })
                .context("parsing header");
        }
        let config = layout.intersection(&engine);
        let downgraded = layout != engine;
        if downgraded {
            log::warn!(
                "policy features {:?} differ from engine support {:?}; reading in downgraded mode",
                layout,
                engine
            );
        }
        let tail = tail.with_config(layout, config);

        let (level_count, tail) = if layout.mls {
            let (level_count, tail) = tail.parse_u32().context("parsing level count")?;
            (Some(level_count), tail)
        } else {
            (None, tail)
        };

        let (symbols, tail) = Symbols::parse(tail, level_count)?;

        let (defaults, tail) =
            DefaultBehaviors::parse(tail).context("parsing default behaviors")?;
        for behavior in defaults.iter() {
            symbols
                .check_classes(&behavior.excluded_classes)
                .context("validating default behaviors")?;
        }

        let (avtab, tail) = AvTab::parse(tail).context("parsing access vector table")?;
        Self::validate_avtab(&symbols, &avtab).context("validating access vector table")?;

        let (ocontexts, tail) = OContexts::parse(tail, &symbols)?;

        if !tail.is_empty() {
            return Err(ParseError::TrailingData { num_bytes: tail.len() }.into());
        }

        Ok(Self { config, downgraded, symbols, defaults, avtab, ocontexts })
    }

    fn validate_avtab(symbols: &Symbols, avtab: &AvTab) -> Result<(), ValidateError> {
        for (key, datum) in avtab.sorted_entries() {
            symbols.check_type(key.source_type)?;
            symbols.check_type(key.target_type)?;
            symbols.check_class(key.class)?;
            for type_ in datum.transition.iter().chain(datum.member.iter()) {
                symbols.check_type(*type_)?;
            }
        }
        Ok(())
    }

    /// Serializes this policy with its effective configuration. Entries are written in a stable
    /// order, so equal policies produce identical bytes.
    pub(super) fn write(&self) -> Vec<u8> {
        let mut writer = PolicyWriter::new(self.config);
        Header::new(&self.config).write(&mut writer);
        if self.config.mls {
            writer.write_u32(self.symbols.sensitivities.len() as u32);
        }
        self.symbols.write(&mut writer);
        self.defaults.write(&mut writer);
        self.avtab.write(&mut writer);
        self.ocontexts.write(&mut writer);
        writer.into_inner()
    }

    pub(super) fn config(&self) -> Config {
        self.config
    }

    pub(super) fn is_downgraded(&self) -> bool {
        self.downgraded
    }

    pub(super) fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    pub(super) fn defaults(&self) -> &DefaultBehaviors {
        &self.defaults
    }

    pub(super) fn avtab(&self) -> &AvTab {
        &self.avtab
    }

    pub(super) fn ocontexts(&self) -> &OContexts {
        &self.ocontexts
    }

    /// Computes the access decision for `source` accessing `target` through an object of `class`.
    /// Returns `None` if `class` is not defined.
    ///
    /// Starts from the per-class defaults, overlays the AVTab entry for the pair of types, then
    /// removes permissions disallowed by MLS flows and by the class's constraints.
    pub(super) fn compute_access_decision(
        &self,
        source: &SecurityContext,
        target: &SecurityContext,
        class_id: ClassId,
    ) -> Option<AccessDecision> {
        let class = self.symbols.class(class_id)?;
        let class_mask = self.symbols.class_mask(class);
        let (source_type, target_type) = (source.type_(), target.type_());
        let default =
            |behavior: &DefaultBehavior| behavior.vector(class_id, source_type, target_type);

        let mut allowed = default(&self.defaults.allowed);
        let mut audit_allow =
            self.defaults.audit_allow.as_ref().map_or(AccessVector::NONE, default);
        let mut audit_deny = self.defaults.audit_deny.as_ref().map_or(class_mask, default);
        let mut notify = self.defaults.notify.as_ref().map_or(AccessVector::NONE, default);

        let key = AvTabKey { source_type, target_type, class: class_id };
        if let Some(datum) = self.avtab.search(&key) {
            allowed |= datum.allowed.unwrap_or(AccessVector::NONE);
            audit_allow |= datum.audit_allow.unwrap_or(AccessVector::NONE);
            audit_deny &= datum.audit_deny.unwrap_or(AccessVector::ALL);
            notify |= datum.notify.unwrap_or(AccessVector::NONE);
        }

        if let (Some(flows), Some(source_range), Some(target_range)) =
            (class.flows(), source.range(), target.range())
        {
            allowed = compute_mls_allowed(source_range, target_range, flows, allowed);
        }

        allowed =
            apply_constraints(class.constraints(), source, target, &self.symbols.roles, allowed);

        Some(AccessDecision {
            allowed,
            decided: allowed & class_mask,
            audit_allow: audit_allow & class_mask,
            audit_deny: audit_deny & class_mask,
            notify: notify & class_mask,
            generation: 0,
        })
    }

    /// Computes the context of a new object of class `class_id`, created by `source` in relation
    /// to `target`. Returns `None` if `class_id` is not defined.
    ///
    /// Processes inherit the source context; other objects inherit the target context with the
    /// source's user. An explicit transition (or member) rule replaces the type. If the result of
    /// applying a rule is not a valid context, the inherited context is used instead.
    pub(super) fn new_security_context(
        &self,
        source: &SecurityContext,
        target: &SecurityContext,
        class_id: ClassId,
        kind: ComputeKind,
    ) -> Option<SecurityContext> {
        let class = self.symbols.class(class_id)?;
        let inherited = if class.name() == PROCESS_CLASS_NAME {
            source.clone()
        } else {
            target.with_user(source.user())
        };

        let key =
            AvTabKey { source_type: source.type_(), target_type: target.type_(), class: class_id };
        let rule_type = self.avtab.search(&key).and_then(|datum: &AvTabDatum| match kind {
            ComputeKind::Transition => datum.transition,
            ComputeKind::Member => datum.member,
        });
        let Some(rule_type) = rule_type else {
            return Some(inherited);
        };

        let computed = inherited.with_type(rule_type);
        match computed.validate(&self.symbols) {
            Ok(()) => Some(computed),
            Err(error) => {
                log::warn!(
                    "{:?} rule for class {:?} computed an invalid context ({}); using the \
                     inherited context",
                    kind,
                    class.name(),
                    error
                );
                Some(inherited)
            }
        }
    }

    /// Verifies that every class of `self` exists in `new` with the same value and that each of
    /// its permissions, including inherited ones, keeps its value.
    pub(super) fn check_compatible(&self, new: &ParsedPolicy) -> Result<(), ValidateError> {
        for class in self.symbols.classes.iter() {
            let new_class = new
                .symbols
                .classes
                .by_name(class.name())
                .ok_or_else(|| ValidateError::ClassMissing { name: class.name().to_string() })?;
            if new_class.value() != class.value() {
                return Err(ValidateError::ClassValueChanged {
                    name: class.name().to_string(),
                    old: class.value(),
                    new: new_class.value(),
                });
            }
            for permission in self.symbols.class_permissions(class) {
                let unchanged = new
                    .symbols
                    .class_permission_by_name(new_class, permission.name())
                    .is_some_and(|new_permission| new_permission.value() == permission.value());
                if !unchanged {
                    return Err(ValidateError::PermissionChanged {
                        class: class.name().to_string(),
                        permission: permission.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub(super) fn class_by_name(&self, name: &str) -> Option<&Class> {
        self.symbols.classes.by_name(name)
    }
}
