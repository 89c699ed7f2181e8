// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::extensible_bitmap::ExtensibleBitmap;
use super::index::Symbols;
use super::mls::{SecurityLevel, SecurityRange};
use super::parser::{PolicyCursor, PolicyWriter};
use super::symbols::{Category, Role, Sensitivity, Symbol, Type, User};
use super::{parse_id, CategoryId, Parse, RoleId, SensitivityId, TypeId, UserId, Write};

use thiserror::Error;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Errors that may be returned when parsing, validating or converting a [`SecurityContext`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SecurityContextError {
    #[error("security context syntax is invalid")]
    InvalidSyntax,
    #[error("user {name:?} is not defined")]
    UnknownUser { name: String },
    #[error("role {name:?} is not defined")]
    UnknownRole { name: String },
    #[error("type {name:?} is not defined")]
    UnknownType { name: String },
    #[error("sensitivity {name:?} is not defined")]
    UnknownSensitivity { name: String },
    #[error("category {name:?} is not defined")]
    UnknownCategory { name: String },
    #[error("{kind} value {value} is not defined")]
    UndefinedValue { kind: &'static str, value: u32 },
    #[error("category range {low:?}.{high:?} is empty")]
    InvalidCategoryRange { low: String, high: String },
    #[error("the policy requires a security range")]
    MissingRange,
    #[error("the policy does not support security ranges")]
    UnexpectedRange,
    #[error("role {role:?} is not authorized for type {type_:?}")]
    RoleTypeMismatch { role: String, type_: String },
    #[error("user {user:?} is not authorized for role {role:?}")]
    UserRoleMismatch { user: String, role: String },
    #[error("low level is not dominated by the high level")]
    InvalidRange,
    #[error("categories are not allowed with sensitivity {sensitivity:?}")]
    CategoryNotAllowed { sensitivity: String },
    #[error("security range is not authorized for user {user:?}")]
    UserRangeMismatch { user: String },
}

/// A security context: user, role, type and, for MLS policies, a security range. Identifiers are
/// only meaningful relative to the policy that produced them.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecurityContext {
    user: UserId,
    role: RoleId,
    type_: TypeId,
    range: Option<SecurityRange>,
}

impl SecurityContext {
    pub fn new(user: UserId, role: RoleId, type_: TypeId, range: Option<SecurityRange>) -> Self {
        Self { user, role, type_, range }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn role(&self) -> RoleId {
        self.role
    }

    pub fn type_(&self) -> TypeId {
        self.type_
    }

    pub fn range(&self) -> Option<&SecurityRange> {
        self.range.as_ref()
    }

    /// Returns a copy of this context with its type replaced.
    pub fn with_type(&self, type_: TypeId) -> Self {
        Self { type_, ..self.clone() }
    }

    /// Returns a copy of this context with its user replaced.
    pub fn with_user(&self, user: UserId) -> Self {
        Self { user, ..self.clone() }
    }

    /// Parses a context string of the form `user:role:type[:low[-high]]`, where each level is
    /// `sensitivity[:category,...]` and a category may be written as an inclusive `cA.cB` range.
    /// The result is validated before it is returned.
    pub(super) fn parse_str(symbols: &Symbols, bytes: &[u8]) -> Result<Self, SecurityContextError> {
        let text = std::str::from_utf8(bytes).map_err(|_| SecurityContextError::InvalidSyntax)?;
        let mut fields = text.splitn(4, ':');
        let (user, role, type_) = match (fields.next(), fields.next(), fields.next()) {
            (Some(user), Some(role), Some(type_))
                if !user.is_empty() && !role.is_empty() && !type_.is_empty() =>
            {
                (user, role, type_)
            }
            _ => return Err(SecurityContextError::InvalidSyntax),
        };
        let user = symbols
            .users
            .by_name(user)
            .ok_or_else(|| SecurityContextError::UnknownUser { name: user.to_string() })?;
        let role = symbols
            .roles
            .by_name(role)
            .ok_or_else(|| SecurityContextError::UnknownRole { name: role.to_string() })?;
        let type_ = symbols
            .types
            .by_name(type_)
            .ok_or_else(|| SecurityContextError::UnknownType { name: type_.to_string() })?;

        let range = match (fields.next(), symbols.mls) {
            (None, false) => None,
            (None, true) => return Err(SecurityContextError::MissingRange),
            (Some(_), false) => return Err(SecurityContextError::UnexpectedRange),
            (Some(range), true) => Some(parse_range(symbols, range)?),
        };

        let context = Self::new(
            id_of::<UserId, _>(user)?,
            id_of::<RoleId, _>(role)?,
            id_of::<TypeId, _>(type_)?,
            range,
        );
        context.validate(symbols)?;
        Ok(context)
    }

    /// Returns the string form of this context. The high level is omitted when it equals the low
    /// level, and categories are listed individually.
    pub(super) fn serialize(&self, symbols: &Symbols) -> Vec<u8> {
        let mut parts = vec![
            symbols.user(self.user).map(User::name).unwrap_or_default().to_string(),
            symbols.role(self.role).map(Role::name).unwrap_or_default().to_string(),
            symbols.type_(self.type_).map(Type::name).unwrap_or_default().to_string(),
        ];
        if let Some(range) = &self.range {
            let mut levels = format_level(symbols, &range.low);
            if !range.is_single_level() {
                levels.push('-');
                levels.push_str(&format_level(symbols, &range.high));
            }
            parts.push(levels);
        }
        parts.join(":").into_bytes()
    }

    /// Verifies that this context is permitted by the policy: the role is authorized for the
    /// type, the user for the role, and, with MLS, that the range is well formed, uses only
    /// permitted categories, and lies within one of the user's ranges.
    pub(super) fn validate(&self, symbols: &Symbols) -> Result<(), SecurityContextError> {
        let user = lookup::<User>(symbols.user(self.user), self.user.as_u32())?;
        let role = lookup::<Role>(symbols.role(self.role), self.role.as_u32())?;
        let type_ = lookup::<Type>(symbols.type_(self.type_), self.type_.as_u32())?;

        if !role.types().is_set(self.type_.bit()) {
            return Err(SecurityContextError::RoleTypeMismatch {
                role: role.name().to_string(),
                type_: type_.name().to_string(),
            });
        }
        if !user.roles().is_set(self.role.bit()) {
            return Err(SecurityContextError::UserRoleMismatch {
                user: user.name().to_string(),
                role: role.name().to_string(),
            });
        }

        match (&self.range, symbols.mls) {
            (None, false) => Ok(()),
            (None, true) => Err(SecurityContextError::MissingRange),
            (Some(_), false) => Err(SecurityContextError::UnexpectedRange),
            (Some(range), true) => {
                validate_level(symbols, &range.low)?;
                validate_level(symbols, &range.high)?;
                if !range.is_well_formed() {
                    return Err(SecurityContextError::InvalidRange);
                }
                if !user.ranges().iter().any(|authorized| authorized.contains(range)) {
                    return Err(SecurityContextError::UserRangeMismatch {
                        user: user.name().to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Re-expresses this context, defined by the policy `from`, in terms of the policy `to` by
    /// matching every component by name, then validates the result against `to`.
    pub(super) fn convert(
        &self,
        from: &Symbols,
        to: &Symbols,
    ) -> Result<SecurityContext, SecurityContextError> {
        let user = lookup::<User>(from.user(self.user), self.user.as_u32())?.name();
        let role = lookup::<Role>(from.role(self.role), self.role.as_u32())?.name();
        let type_ = lookup::<Type>(from.type_(self.type_), self.type_.as_u32())?.name();

        let user = to
            .users
            .by_name(user)
            .ok_or_else(|| SecurityContextError::UnknownUser { name: user.to_string() })?;
        let role = to
            .roles
            .by_name(role)
            .ok_or_else(|| SecurityContextError::UnknownRole { name: role.to_string() })?;
        let type_ = to
            .types
            .by_name(type_)
            .ok_or_else(|| SecurityContextError::UnknownType { name: type_.to_string() })?;

        let range = match (&self.range, to.mls) {
            (Some(range), true) => Some(SecurityRange::new(
                convert_level(&range.low, from, to)?,
                convert_level(&range.high, from, to)?,
            )),
            (None, false) => None,
            (None, true) => return Err(SecurityContextError::MissingRange),
            (Some(_), false) => return Err(SecurityContextError::UnexpectedRange),
        };

        let context = Self::new(
            id_of::<UserId, _>(user)?,
            id_of::<RoleId, _>(role)?,
            id_of::<TypeId, _>(type_)?,
            range,
        );
        context.validate(to)?;
        Ok(context)
    }
}

fn lookup<'a, T: Symbol>(symbol: Option<&'a T>, value: u32) -> Result<&'a T, SecurityContextError> {
    symbol.ok_or(SecurityContextError::UndefinedValue { kind: T::KIND, value })
}

fn id_of<I: super::PolicyId, T: Symbol>(symbol: &T) -> Result<I, SecurityContextError> {
    I::from_u32(symbol.value())
        .ok_or(SecurityContextError::UndefinedValue { kind: T::KIND, value: symbol.value() })
}

/// Parses `low[-high]`. A range without a high level is a single level.
pub(super) fn parse_range(
    symbols: &Symbols,
    text: &str,
) -> Result<SecurityRange, SecurityContextError> {
    let (low, high) = match text.split_once('-') {
        Some((low, high)) => (low, Some(high)),
        None => (text, None),
    };
    let low = parse_level(symbols, low)?;
    let high = match high {
        Some(high) => parse_level(symbols, high)?,
        None => low.clone(),
    };
    Ok(SecurityRange::new(low, high))
}

fn parse_level(symbols: &Symbols, text: &str) -> Result<SecurityLevel, SecurityContextError> {
    let (sensitivity, categories) = match text.split_once(':') {
        Some((sensitivity, categories)) => (sensitivity, Some(categories)),
        None => (text, None),
    };
    if sensitivity.is_empty() {
        return Err(SecurityContextError::InvalidSyntax);
    }
    let sensitivity = symbols.sensitivities.by_name(sensitivity).ok_or_else(|| {
        SecurityContextError::UnknownSensitivity { name: sensitivity.to_string() }
    })?;

    let mut bitmap = ExtensibleBitmap::new();
    for item in categories.into_iter().flat_map(|categories| categories.split(',')) {
        let category_by_name = |name: &str| {
            if name.is_empty() {
                return Err(SecurityContextError::InvalidSyntax);
            }
            symbols
                .categories
                .by_name(name)
                .ok_or_else(|| SecurityContextError::UnknownCategory { name: name.to_string() })
        };
        match item.split_once('.') {
            Some((low, high)) => {
                let low_category = category_by_name(low)?;
                let high_category = category_by_name(high)?;
                if low_category.value() > high_category.value() {
                    return Err(SecurityContextError::InvalidCategoryRange {
                        low: low.to_string(),
                        high: high.to_string(),
                    });
                }
                for value in low_category.value()..=high_category.value() {
                    bitmap.set(value - 1, true);
                }
            }
            None => bitmap.set(category_by_name(item)?.value() - 1, true),
        }
    }
    Ok(SecurityLevel::new(id_of::<SensitivityId, _>(sensitivity)?, bitmap))
}

fn format_level(symbols: &Symbols, level: &SecurityLevel) -> String {
    let mut text = symbols
        .sensitivity(level.sensitivity)
        .map(|sensitivity| sensitivity.name().to_string())
        .unwrap_or_default();
    let categories: Vec<&str> = level
        .categories
        .iter()
        .filter_map(|bit| CategoryId::from_u32(bit + 1))
        .filter_map(|id| symbols.category(id))
        .map(Category::name)
        .collect();
    if !categories.is_empty() {
        text.push(':');
        text.push_str(&categories.join(","));
    }
    text
}

fn validate_level(symbols: &Symbols, level: &SecurityLevel) -> Result<(), SecurityContextError> {
    let sensitivity = lookup::<Sensitivity>(
        symbols.sensitivity(level.sensitivity),
        level.sensitivity.as_u32(),
    )?;
    for bit in level.categories.iter() {
        if symbols.categories.by_value(bit + 1).is_none() {
            return Err(SecurityContextError::UndefinedValue {
                kind: Category::KIND,
                value: bit + 1,
            });
        }
    }
    if !sensitivity.categories().contains(&level.categories) {
        return Err(SecurityContextError::CategoryNotAllowed {
            sensitivity: sensitivity.name().to_string(),
        });
    }
    Ok(())
}

fn convert_level(
    level: &SecurityLevel,
    from: &Symbols,
    to: &Symbols,
) -> Result<SecurityLevel, SecurityContextError> {
    let value = level.sensitivity.as_u32();
    let name = lookup::<Sensitivity>(from.sensitivity(level.sensitivity), value)?.name();
    let sensitivity = to
        .sensitivities
        .by_name(name)
        .ok_or_else(|| SecurityContextError::UnknownSensitivity { name: name.to_string() })?;
    let mut categories = ExtensibleBitmap::new();
    for bit in level.categories.iter() {
        let name = lookup::<Category>(from.categories.by_value(bit + 1), bit + 1)?.name();
        let category = to
            .categories
            .by_name(name)
            .ok_or_else(|| SecurityContextError::UnknownCategory { name: name.to_string() })?;
        categories.set(category.value() - 1, true);
    }
    Ok(SecurityLevel::new(id_of::<SensitivityId, _>(sensitivity)?, categories))
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct ContextIds {
    user: le::U32,
    role: le::U32,
    type_: le::U32,
}

impl Parse for SecurityContext {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (ids, tail) = cursor.parse_or_error::<ContextIds>()?;
        let (range, tail) = if tail.layout().mls {
            let (range, tail) = SecurityRange::parse(tail)?;
            (Some(range), tail)
        } else {
            (None, tail)
        };
        Ok((
            Self {
                user: parse_id(ids.user.get())?,
                role: parse_id(ids.role.get())?,
                type_: parse_id(ids.type_.get())?,
                range,
            },
            tail,
        ))
    }
}

impl Write for SecurityContext {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write(&ContextIds {
            user: le::U32::new(self.user.as_u32()),
            role: le::U32::new(self.role.as_u32()),
            type_: le::U32::new(self.type_.as_u32()),
        });
        if writer.config().mls {
            debug_assert!(self.range.is_some(), "MLS context written without a range");
            if let Some(range) = &self.range {
                range.write(writer);
            }
        }
    }
}
