// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::{ParseError, ValidateError};
use super::extensible_bitmap::ExtensibleBitmap;
use super::mls::SecurityLevel;
use super::parser::{PolicyCursor, PolicyWriter};
use super::symbols::{
    Category, Class, CommonSymbol, Permission, Role, Sensitivity, Symbol, Type, User,
    MIN_SYMBOL_SIZE,
};
use super::{
    AccessVector, CategoryId, ClassId, Parse, RoleId, SensitivityId, TypeId, UserId, Write,
};

use anyhow::Context as _;
use std::collections::HashMap;

/// The symbols of one kind, ordered by value, with lookup by name and by value.
///
/// Values are dense: a table of `n` symbols holds exactly the values `1..=n`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolTable<T> {
    symbols: Vec<T>,
    by_name: HashMap<String, usize>,
}

impl<T: Symbol> SymbolTable<T> {
    pub(super) fn new(declared: u32, mut symbols: Vec<T>) -> Result<Self, ValidateError> {
        let max = symbols.len() as u32;
        if declared != max {
            return Err(ValidateError::ValueOutOfRange { kind: T::KIND, value: declared, max });
        }
        symbols.sort_by_key(|symbol| symbol.value());
        let mut by_name = HashMap::with_capacity(symbols.len());
        for (index, symbol) in symbols.iter().enumerate() {
            let value = symbol.value();
            if value == 0 || value > max {
                return Err(ValidateError::ValueOutOfRange { kind: T::KIND, value, max });
            }
            // Sorted values that fit in `1..=max` are distinct only if each sits at its own index.
            if value != index as u32 + 1 {
                return Err(ValidateError::DuplicateValue { kind: T::KIND, value });
            }
            if by_name.insert(symbol.name().to_string(), index).is_some() {
                return Err(ValidateError::DuplicateName {
                    kind: T::KIND,
                    name: symbol.name().to_string(),
                });
            }
        }
        Ok(Self { symbols, by_name })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterates over symbols in value order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.symbols.iter()
    }

    pub fn by_value(&self, value: u32) -> Option<&T> {
        value.checked_sub(1).and_then(|index| self.symbols.get(index as usize))
    }

    pub fn by_name(&self, name: &str) -> Option<&T> {
        self.by_name.get(name).map(|index| &self.symbols[*index])
    }

    /// Verifies that every bit in `bitmap` names a symbol of this table.
    fn check_bitmap(&self, bitmap: &ExtensibleBitmap) -> Result<(), ValidateError> {
        match bitmap.iter().find(|bit| self.by_value(bit + 1).is_none()) {
            Some(bit) => Err(ValidateError::UndefinedReference { kind: T::KIND, value: bit + 1 }),
            None => Ok(()),
        }
    }
}

impl<T: Symbol> Parse for SymbolTable<T> {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (declared, tail) = cursor.parse_u32()?;
        let (count, mut tail) = tail.parse_u32()?;
        tail.check_count(T::KIND, count, MIN_SYMBOL_SIZE)?;
        let mut symbols = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (symbol, next) = T::parse(tail).map_err(Into::<anyhow::Error>::into)?;
            tail = next;
            symbols.push(symbol);
        }
        Ok((Self::new(declared, symbols)?, tail))
    }
}

impl<T: Symbol> Write for SymbolTable<T> {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.symbols.len() as u32);
        writer.write_u32(self.symbols.len() as u32);
        for symbol in self.symbols.iter() {
            symbol.write(writer);
        }
    }
}

impl<T: Symbol> Default for SymbolTable<T> {
    fn default() -> Self {
        Self { symbols: Vec::new(), by_name: HashMap::new() }
    }
}

/// All symbol tables of a policy, indexed and cross-validated: every reference from one symbol to
/// another resolves.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Symbols {
    pub(super) mls: bool,
    pub(super) commons: SymbolTable<CommonSymbol>,
    pub(super) classes: SymbolTable<Class>,
    pub(super) roles: SymbolTable<Role>,
    pub(super) types: SymbolTable<Type>,
    pub(super) users: SymbolTable<User>,
    pub(super) sensitivities: SymbolTable<Sensitivity>,
    pub(super) categories: SymbolTable<Category>,
}

impl Symbols {
    /// Parses the symbol tables in policy order. For MLS policies, `level_count` must match the
    /// number of sensitivities.
    pub(super) fn parse(
        cursor: PolicyCursor<'_>,
        level_count: Option<u32>,
    ) -> anyhow::Result<(Self, PolicyCursor<'_>)> {
        let (commons, tail) = SymbolTable::parse(cursor).context("parsing commons")?;
        let (classes, tail) = SymbolTable::parse(tail).context("parsing classes")?;
        let (roles, tail) = SymbolTable::parse(tail).context("parsing roles")?;
        let (types, tail) = SymbolTable::parse(tail).context("parsing types")?;
        let (users, tail) = SymbolTable::parse(tail).context("parsing users")?;
        let mls = tail.layout().mls;
        let (sensitivities, categories, tail) = if mls {
            let (sensitivities, tail) =
                SymbolTable::<Sensitivity>::parse(tail).context("parsing sensitivities")?;
            let (categories, tail) = SymbolTable::parse(tail).context("parsing categories")?;
            (sensitivities, categories, tail)
        } else {
            (SymbolTable::default(), SymbolTable::default(), tail)
        };
        if let Some(level_count) = level_count {
            let found = sensitivities.len() as u32;
            if level_count != found {
                let error =
                    ParseError::InvalidCount { kind: "levels", expected: level_count, found };
                return Err(error).context("parsing sensitivities");
            }
        }

        let symbols =
            Self { mls, commons, classes, roles, types, users, sensitivities, categories };
        symbols.validate().context("validating symbols")?;
        Ok((symbols, tail))
    }

    pub(super) fn write(&self, writer: &mut PolicyWriter) {
        self.commons.write(writer);
        self.classes.write(writer);
        self.roles.write(writer);
        self.types.write(writer);
        self.users.write(writer);
        if self.mls {
            self.sensitivities.write(writer);
            self.categories.write(writer);
        }
    }

    /// Verifies that cross-references between symbol tables resolve.
    pub(super) fn validate(&self) -> Result<(), ValidateError> {
        for class in self.classes.iter() {
            if let Some(common_name) = class.common_name() {
                let common = self.commons.by_name(common_name).ok_or_else(|| {
                    ValidateError::UnknownCommon {
                        class: class.name().to_string(),
                        common: common_name.to_string(),
                    }
                })?;
                for inherited in common.permissions().iter() {
                    for own in class.permissions().iter() {
                        if own.name() == inherited.name() {
                            return Err(ValidateError::DuplicateName {
                                kind: "permission",
                                name: own.name().to_string(),
                            });
                        }
                        if own.value() == inherited.value() {
                            return Err(ValidateError::DuplicateValue {
                                kind: "permission",
                                value: own.value(),
                            });
                        }
                    }
                }
            }
            for constraint in class.constraints() {
                let mut result = Ok(());
                constraint.expr().for_each_set(&mut |kind, set| {
                    if result.is_ok() {
                        result = if kind == Role::KIND {
                            self.roles.check_bitmap(set)
                        } else {
                            self.types.check_bitmap(set)
                        };
                    }
                });
                result?;
            }
        }
        for role in self.roles.iter() {
            self.roles.check_bitmap(role.dominates())?;
            self.types.check_bitmap(role.types())?;
        }
        for user in self.users.iter() {
            self.roles.check_bitmap(user.roles())?;
            for range in user.ranges() {
                self.check_level(&range.low)?;
                self.check_level(&range.high)?;
                if !range.is_well_formed() {
                    return Err(ValidateError::InvalidContext(format!(
                        "range of user {:?} has a low level above its high level",
                        user.name()
                    )));
                }
            }
        }
        for sensitivity in self.sensitivities.iter() {
            self.categories.check_bitmap(sensitivity.categories())?;
        }
        Ok(())
    }

    fn check_level(&self, level: &SecurityLevel) -> Result<(), ValidateError> {
        let value = level.sensitivity.as_u32();
        if self.sensitivities.by_value(value).is_none() {
            return Err(ValidateError::UndefinedReference { kind: Sensitivity::KIND, value });
        }
        self.categories.check_bitmap(&level.categories)
    }

    /// Verifies that every bit in `classes` names a defined class.
    pub(super) fn check_classes(&self, classes: &ExtensibleBitmap) -> Result<(), ValidateError> {
        self.classes.check_bitmap(classes)
    }

    /// Verifies that `value` names a defined type.
    pub(super) fn check_type(&self, type_: TypeId) -> Result<(), ValidateError> {
        match self.type_(type_) {
            Some(_) => Ok(()),
            None => Err(ValidateError::UndefinedReference {
                kind: Type::KIND,
                value: type_.as_u32(),
            }),
        }
    }

    /// Verifies that `value` names a defined class.
    pub(super) fn check_class(&self, class: ClassId) -> Result<(), ValidateError> {
        match self.class(class) {
            Some(_) => Ok(()),
            None => Err(ValidateError::UndefinedReference {
                kind: Class::KIND,
                value: class.as_u32(),
            }),
        }
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.by_value(id.as_u32())
    }

    pub fn role(&self, id: RoleId) -> Option<&Role> {
        self.roles.by_value(id.as_u32())
    }

    pub fn type_(&self, id: TypeId) -> Option<&Type> {
        self.types.by_value(id.as_u32())
    }

    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.by_value(id.as_u32())
    }

    pub fn sensitivity(&self, id: SensitivityId) -> Option<&Sensitivity> {
        self.sensitivities.by_value(id.as_u32())
    }

    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.by_value(id.as_u32())
    }

    /// Returns the inherited common of `class`, if any.
    pub fn common_of(&self, class: &Class) -> Option<&CommonSymbol> {
        class.common_name().and_then(|name| self.commons.by_name(name))
    }

    /// Returns all permissions of `class`, including those inherited from its common.
    pub fn class_permissions<'a>(
        &'a self,
        class: &'a Class,
    ) -> impl Iterator<Item = &'a Permission> {
        let inherited =
            self.common_of(class).into_iter().flat_map(|common| common.permissions().iter());
        inherited.chain(class.permissions().iter())
    }

    /// Returns the mask of every permission defined for `class`.
    pub fn class_mask(&self, class: &Class) -> AccessVector {
        self.class_permissions(class)
            .fold(AccessVector::NONE, |mask, permission| mask | permission.access_vector())
    }

    /// Finds the permission of `class` called `name`, including inherited permissions.
    pub fn class_permission_by_name<'a>(
        &'a self,
        class: &'a Class,
        name: &str,
    ) -> Option<&'a Permission> {
        self.class_permissions(class).find(|permission| permission.name() == name)
    }
}
