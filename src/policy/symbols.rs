// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::constraints::Constraint;
use super::error::ValidateError;
use super::extensible_bitmap::ExtensibleBitmap;
use super::mls::{BaseFlows, SecurityRange};
use super::parser::{PolicyCursor, PolicyWriter};
use super::{AccessVector, Parse, Write};

use std::collections::HashSet;

/// The largest permission value; class permission sets fit in one [`AccessVector`].
pub(super) const MAX_PERMISSION_VALUE: u32 = 32;

/// Smallest encoding of a named symbol: an empty name and a value.
pub(super) const MIN_SYMBOL_SIZE: usize = 8;

/// A named policy element with a dense 1-based value within its table.
pub trait Symbol: Parse + Write {
    /// Human-readable name of this kind of symbol, used in errors.
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn value(&self) -> u32;
}

fn parse_name_value(cursor: PolicyCursor<'_>) -> anyhow::Result<(String, u32, PolicyCursor<'_>)> {
    let (name, tail) = cursor.parse_string()?;
    let (value, tail) = tail.parse_u32()?;
    Ok((name, value, tail))
}

fn write_name_value(writer: &mut PolicyWriter, name: &str, value: u32) {
    writer.write_string(name);
    writer.write_u32(value);
}

macro_rules! impl_symbol {
    ($type:ty, $kind:literal) => {
        impl Symbol for $type {
            const KIND: &'static str = $kind;

            fn name(&self) -> &str {
                &self.name
            }

            fn value(&self) -> u32 {
                self.value
            }
        }
    };
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Permission {
    pub(super) name: String,
    pub(super) value: u32,
}

impl Permission {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Returns the single-bit [`AccessVector`] for this permission.
    pub fn access_vector(&self) -> AccessVector {
        AccessVector::from_raw(1 << (self.value - 1))
    }
}

/// The permissions defined directly by a class or common, ordered by value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Permissions {
    pub(super) declared: u32,
    pub(super) permissions: Vec<Permission>,
}

impl Permissions {
    pub(super) fn new(
        declared: u32,
        mut permissions: Vec<Permission>,
    ) -> Result<Self, ValidateError> {
        let mut names = HashSet::new();
        let mut values = HashSet::new();
        for permission in permissions.iter() {
            if permission.value == 0 || permission.value > MAX_PERMISSION_VALUE {
                return Err(ValidateError::ValueOutOfRange {
                    kind: "permission",
                    value: permission.value,
                    max: MAX_PERMISSION_VALUE,
                });
            }
            if !values.insert(permission.value) {
                return Err(ValidateError::DuplicateValue {
                    kind: "permission",
                    value: permission.value,
                });
            }
            if !names.insert(permission.name.as_str()) {
                return Err(ValidateError::DuplicateName {
                    kind: "permission",
                    name: permission.name.clone(),
                });
            }
        }
        permissions.sort_by_key(|permission| permission.value);
        Ok(Self { declared, permissions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&Permission> {
        self.permissions.iter().find(|permission| permission.name == name)
    }

    /// Returns the union of all permission bits.
    pub fn mask(&self) -> AccessVector {
        self.permissions
            .iter()
            .fold(AccessVector::NONE, |mask, permission| mask | permission.access_vector())
    }
}

impl Parse for Permissions {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (declared, tail) = cursor.parse_u32()?;
        let (count, mut tail) = tail.parse_u32()?;
        tail.check_count("permission", count, MIN_SYMBOL_SIZE)?;
        let mut permissions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, value, next) = parse_name_value(tail)?;
            tail = next;
            permissions.push(Permission { name, value });
        }
        Ok((Self::new(declared, permissions)?, tail))
    }
}

impl Write for Permissions {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.declared);
        writer.write_u32(self.permissions.len() as u32);
        for permission in self.permissions.iter() {
            write_name_value(writer, &permission.name, permission.value);
        }
    }
}

/// A set of permissions shared by several classes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommonSymbol {
    pub(super) name: String,
    pub(super) value: u32,
    pub(super) permissions: Permissions,
}

impl_symbol!(CommonSymbol, "common");

impl CommonSymbol {
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

impl Parse for CommonSymbol {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        let (permissions, tail) = Permissions::parse(tail)?;
        Ok((Self { name, value, permissions }, tail))
    }
}

impl Write for CommonSymbol {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
        self.permissions.write(writer);
    }
}

/// An object class: its own permissions, an optional inherited common, the constraints that
/// restrict its permissions and, for MLS policies, the information flows of each permission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Class {
    pub(super) name: String,
    pub(super) value: u32,
    pub(super) common: Option<String>,
    pub(super) permissions: Permissions,
    pub(super) constraints: Vec<Constraint>,
    pub(super) flows: Option<BaseFlows>,
}

impl_symbol!(Class, "class");

impl Class {
    pub fn common_name(&self) -> Option<&str> {
        self.common.as_deref()
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn flows(&self) -> Option<&BaseFlows> {
        self.flows.as_ref()
    }
}

impl Parse for Class {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        let (common, tail) = tail.parse_string()?;
        let (permissions, tail) = Permissions::parse(tail)?;
        let (count, mut tail) = tail.parse_u32()?;
        tail.check_count("constraint", count, MIN_SYMBOL_SIZE)?;
        let mut constraints = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (constraint, next) = Constraint::parse(tail)?;
            tail = next;
            constraints.push(constraint);
        }
        let (flows, tail) = if tail.layout().mls {
            let (flows, tail) = BaseFlows::parse(tail)?;
            (Some(flows), tail)
        } else {
            (None, tail)
        };
        let common = (!common.is_empty()).then_some(common);
        Ok((Self { name, value, common, permissions, constraints, flows }, tail))
    }
}

impl Write for Class {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
        writer.write_string(self.common.as_deref().unwrap_or(""));
        self.permissions.write(writer);
        writer.write_u32(self.constraints.len() as u32);
        for constraint in self.constraints.iter() {
            constraint.write(writer);
        }
        if writer.config().mls {
            self.flows.clone().unwrap_or_default().write(writer);
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Role {
    pub(super) name: String,
    pub(super) value: u32,
    pub(super) dominates: ExtensibleBitmap,
    pub(super) types: ExtensibleBitmap,
}

impl_symbol!(Role, "role");

impl Role {
    /// Roles dominated by this role, excluding itself.
    pub fn dominates(&self) -> &ExtensibleBitmap {
        &self.dominates
    }

    /// Types that may be combined with this role in a security context.
    pub fn types(&self) -> &ExtensibleBitmap {
        &self.types
    }
}

impl Parse for Role {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        let (dominates, tail) = ExtensibleBitmap::parse(tail)?;
        let (types, tail) = ExtensibleBitmap::parse(tail)?;
        Ok((Self { name, value, dominates, types }, tail))
    }
}

impl Write for Role {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
        self.dominates.write(writer);
        self.types.write(writer);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Type {
    pub(super) name: String,
    pub(super) value: u32,
}

impl_symbol!(Type, "type");

impl Parse for Type {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        Ok((Self { name, value }, tail))
    }
}

impl Write for Type {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct User {
    pub(super) name: String,
    pub(super) value: u32,
    pub(super) roles: ExtensibleBitmap,
    pub(super) ranges: Vec<SecurityRange>,
}

impl_symbol!(User, "user");

impl User {
    pub fn roles(&self) -> &ExtensibleBitmap {
        &self.roles
    }

    /// The MLS ranges this user is authorized for. Empty for non-MLS policies.
    pub fn ranges(&self) -> &[SecurityRange] {
        &self.ranges
    }
}

impl Parse for User {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        let (roles, mut tail) = ExtensibleBitmap::parse(tail)?;
        let mut ranges = Vec::new();
        if tail.layout().mls {
            let (count, next) = tail.parse_u32()?;
            tail = next;
            // Each range holds two levels of at least a sensitivity and an empty bitmap.
            tail.check_count("user range", count, 32)?;
            for _ in 0..count {
                let (range, next) = SecurityRange::parse(tail)?;
                tail = next;
                ranges.push(range);
            }
        }
        Ok((Self { name, value, roles, ranges }, tail))
    }
}

impl Write for User {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
        self.roles.write(writer);
        if writer.config().mls {
            writer.write_u32(self.ranges.len() as u32);
            for range in self.ranges.iter() {
                range.write(writer);
            }
        }
    }
}

/// An MLS sensitivity. Sensitivities are ordered by value, higher values dominating lower ones.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sensitivity {
    pub(super) name: String,
    pub(super) value: u32,
    pub(super) categories: ExtensibleBitmap,
}

impl_symbol!(Sensitivity, "sensitivity");

impl Sensitivity {
    /// Categories that may accompany this sensitivity in a level.
    pub fn categories(&self) -> &ExtensibleBitmap {
        &self.categories
    }
}

impl Parse for Sensitivity {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        let (categories, tail) = ExtensibleBitmap::parse(tail)?;
        Ok((Self { name, value, categories }, tail))
    }
}

impl Write for Sensitivity {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
        self.categories.write(writer);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Category {
    pub(super) name: String,
    pub(super) value: u32,
}

impl_symbol!(Category, "category");

impl Parse for Category {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (name, value, tail) = parse_name_value(cursor)?;
        Ok((Self { name, value }, tail))
    }
}

impl Write for Category {
    fn write(&self, writer: &mut PolicyWriter) {
        write_name_value(writer, &self.name, self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::metadata::Config;

    fn permission(name: &str, value: u32) -> Permission {
        Permission { name: name.to_string(), value }
    }

    #[test]
    fn permissions_are_sorted_by_value() {
        let permissions =
            Permissions::new(2, vec![permission("write", 2), permission("read", 1)])
                .expect("valid permissions");
        let names: Vec<_> = permissions.iter().map(Permission::name).collect();
        assert_eq!(names, vec!["read", "write"]);
        assert_eq!(permissions.mask(), AccessVector::from_raw(0b11));
        assert_eq!(
            permissions.by_name("write").map(Permission::access_vector),
            Some(AccessVector::from_raw(0b10))
        );
    }

    #[test]
    fn permission_values_are_bounded() {
        assert_eq!(
            Permissions::new(1, vec![permission("big", 33)]),
            Err(ValidateError::ValueOutOfRange { kind: "permission", value: 33, max: 32 })
        );
        assert!(Permissions::new(1, vec![permission("zero", 0)]).is_err());
    }

    #[test]
    fn duplicate_permissions_are_rejected() {
        assert_eq!(
            Permissions::new(2, vec![permission("read", 1), permission("read", 2)]),
            Err(ValidateError::DuplicateName { kind: "permission", name: "read".to_string() })
        );
        assert_eq!(
            Permissions::new(2, vec![permission("read", 1), permission("write", 1)]),
            Err(ValidateError::DuplicateValue { kind: "permission", value: 1 })
        );
    }

    #[test]
    fn class_without_common_or_flows() {
        let class = Class {
            name: "file".to_string(),
            value: 1,
            common: None,
            permissions: Permissions::new(1, vec![permission("read", 1)]).unwrap(),
            constraints: vec![],
            flows: None,
        };
        let config = Config::default();
        let mut writer = PolicyWriter::new(config);
        class.write(&mut writer);
        let bytes = writer.into_inner();
        let cursor = PolicyCursor::new(&bytes).with_config(config, config);
        let (parsed, tail) = Class::parse(cursor).expect("parse class");
        assert!(tail.is_empty());
        assert_eq!(parsed, class);
        assert_eq!(parsed.common_name(), None);
    }

    #[test]
    fn mls_user_carries_ranges() {
        let mls = Config { mls: true, ..Config::default() };
        let mut writer = PolicyWriter::new(mls);
        writer.write_string("u");
        writer.write_u32(1);
        ExtensibleBitmap::new().write(&mut writer);
        writer.write_u32(1);
        for _ in 0..2 {
            writer.write_u32(1);
            ExtensibleBitmap::new().write(&mut writer);
        }
        let bytes = writer.into_inner();

        let cursor = PolicyCursor::new(&bytes).with_config(mls, mls);
        let (user, tail) = User::parse(cursor).expect("parse user");
        assert!(tail.is_empty());
        assert_eq!(user.name(), "u");
        assert_eq!(user.ranges().len(), 1);
        assert!(user.ranges()[0].is_single_level());
    }
}
