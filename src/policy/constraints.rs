// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::extensible_bitmap::ExtensibleBitmap;
use super::index::SymbolTable;
use super::parser::{PolicyCursor, PolicyWriter};
use super::security_context::SecurityContext;
use super::symbols::{Role, Symbol, Type};
use super::{AccessVector, Parse, RoleId, Write};

use thiserror::Error;

pub(super) const CONSTRAINT_EXPR_NOT: u32 = 1;
pub(super) const CONSTRAINT_EXPR_AND: u32 = 2;
pub(super) const CONSTRAINT_EXPR_OR: u32 = 3;
pub(super) const CONSTRAINT_EXPR_SAME_USER: u32 = 4;
pub(super) const CONSTRAINT_EXPR_TYPE_SOURCE: u32 = 5;
pub(super) const CONSTRAINT_EXPR_TYPE_TARGET: u32 = 6;
pub(super) const CONSTRAINT_EXPR_ROLE_SOURCE: u32 = 7;
pub(super) const CONSTRAINT_EXPR_ROLE_TARGET: u32 = 8;
pub(super) const CONSTRAINT_EXPR_ROLE_RELATION: u32 = 9;

pub(super) const ROLE_RELATION_DOM: u32 = 1;
pub(super) const ROLE_RELATION_DOMBY: u32 = 2;
pub(super) const ROLE_RELATION_EQ: u32 = 3;
pub(super) const ROLE_RELATION_INCOMP: u32 = 4;

/// Maximum nesting of a constraint expression tree.
pub(super) const MAX_EXPR_DEPTH: usize = 64;

/// Size of an expression node header: kind and attribute.
const NODE_SIZE: usize = 8;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConstraintError {
    #[error("invalid constraint term type {type_:?}")]
    InvalidTermType { type_: u32 },
    #[error("invalid role relation {attr:?}")]
    InvalidRoleRelation { attr: u32 },
    #[error("invalid constraint term sequence")]
    InvalidTermSequence,
    #[error("constraint expression nesting exceeds {}", MAX_EXPR_DEPTH)]
    TooDeep,
}

/// Relation between the source and target roles tested by [`ConstraintExpr::RoleRelation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleRelation {
    Dominates,    // `dom` in policy language
    DominatedBy,  // `domby` in policy language
    Equal,        // `eq` in policy language
    Incomparable, // `incomp` in policy language
}

impl RoleRelation {
    fn from_attr(attr: u32) -> Result<Self, ConstraintError> {
        match attr {
            ROLE_RELATION_DOM => Ok(Self::Dominates),
            ROLE_RELATION_DOMBY => Ok(Self::DominatedBy),
            ROLE_RELATION_EQ => Ok(Self::Equal),
            ROLE_RELATION_INCOMP => Ok(Self::Incomparable),
            _ => Err(ConstraintError::InvalidRoleRelation { attr }),
        }
    }

    fn attr(&self) -> u32 {
        match self {
            Self::Dominates => ROLE_RELATION_DOM,
            Self::DominatedBy => ROLE_RELATION_DOMBY,
            Self::Equal => ROLE_RELATION_EQ,
            Self::Incomparable => ROLE_RELATION_INCOMP,
        }
    }
}

/// A boolean expression over a source and a target [`SecurityContext`]. Type and role sets store
/// symbol value `v` at bit `v - 1`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConstraintExpr {
    Not(Box<ConstraintExpr>),
    And(Box<ConstraintExpr>, Box<ConstraintExpr>),
    Or(Box<ConstraintExpr>, Box<ConstraintExpr>),
    SameUser,
    TypeSource(ExtensibleBitmap),
    TypeTarget(ExtensibleBitmap),
    RoleSource(ExtensibleBitmap),
    RoleTarget(ExtensibleBitmap),
    RoleRelation(RoleRelation),
}

impl ConstraintExpr {
    /// Evaluates the expression for the given contexts, resolving role dominance through `roles`.
    pub(super) fn evaluate(
        &self,
        source: &SecurityContext,
        target: &SecurityContext,
        roles: &SymbolTable<Role>,
    ) -> bool {
        match self {
            Self::Not(expr) => !expr.evaluate(source, target, roles),
            Self::And(left, right) => {
                left.evaluate(source, target, roles) && right.evaluate(source, target, roles)
            }
            Self::Or(left, right) => {
                left.evaluate(source, target, roles) || right.evaluate(source, target, roles)
            }
            Self::SameUser => source.user() == target.user(),
            Self::TypeSource(types) => types.is_set(source.type_().bit()),
            Self::TypeTarget(types) => types.is_set(target.type_().bit()),
            Self::RoleSource(set) => set.is_set(source.role().bit()),
            Self::RoleTarget(set) => set.is_set(target.role().bit()),
            Self::RoleRelation(relation) => {
                let (r1, r2) = (source.role(), target.role());
                let dominates = |r1: RoleId, r2: RoleId| {
                    r1 == r2
                        || roles
                            .by_value(r1.as_u32())
                            .map_or(false, |role| role.dominates().is_set(r2.bit()))
                };
                match relation {
                    RoleRelation::Equal => r1 == r2,
                    RoleRelation::Dominates => dominates(r1, r2),
                    RoleRelation::DominatedBy => dominates(r2, r1),
                    RoleRelation::Incomparable => !dominates(r1, r2) && !dominates(r2, r1),
                }
            }
        }
    }

    /// Calls `visit` with every type and role set in the expression, labelled with the kind of
    /// symbol the set refers to.
    pub(super) fn for_each_set(&self, visit: &mut impl FnMut(&'static str, &ExtensibleBitmap)) {
        match self {
            Self::Not(expr) => expr.for_each_set(visit),
            Self::And(left, right) | Self::Or(left, right) => {
                left.for_each_set(visit);
                right.for_each_set(visit);
            }
            Self::TypeSource(set) | Self::TypeTarget(set) => visit(Type::KIND, set),
            Self::RoleSource(set) | Self::RoleTarget(set) => visit(Role::KIND, set),
            Self::SameUser | Self::RoleRelation(_) => {}
        }
    }

    /// Builds an expression tree from nodes in postfix order.
    fn from_postfix(nodes: Vec<PostfixNode>) -> Result<Self, ConstraintError> {
        let mut stack: Vec<(ConstraintExpr, usize)> = Vec::new();
        for node in nodes {
            let (expr, depth) = match node {
                PostfixNode::Not => {
                    let (expr, depth) = stack.pop().ok_or(ConstraintError::InvalidTermSequence)?;
                    (Self::Not(Box::new(expr)), depth + 1)
                }
                PostfixNode::And => Self::pop_binary(&mut stack, Self::And)?,
                PostfixNode::Or => Self::pop_binary(&mut stack, Self::Or)?,
                PostfixNode::Leaf(expr) => (expr, 1),
            };
            if depth > MAX_EXPR_DEPTH {
                return Err(ConstraintError::TooDeep);
            }
            stack.push((expr, depth));
        }
        let (expr, _) = stack.pop().ok_or(ConstraintError::InvalidTermSequence)?;
        if !stack.is_empty() {
            return Err(ConstraintError::InvalidTermSequence);
        }
        Ok(expr)
    }

    fn pop_binary(
        stack: &mut Vec<(ConstraintExpr, usize)>,
        build: fn(Box<ConstraintExpr>, Box<ConstraintExpr>) -> ConstraintExpr,
    ) -> Result<(ConstraintExpr, usize), ConstraintError> {
        let (right, right_depth) = stack.pop().ok_or(ConstraintError::InvalidTermSequence)?;
        let (left, left_depth) = stack.pop().ok_or(ConstraintError::InvalidTermSequence)?;
        Ok((build(Box::new(left), Box::new(right)), left_depth.max(right_depth) + 1))
    }

    fn postfix_len(&self) -> usize {
        match self {
            Self::Not(expr) => expr.postfix_len() + 1,
            Self::And(left, right) | Self::Or(left, right) => {
                left.postfix_len() + right.postfix_len() + 1
            }
            _ => 1,
        }
    }

    fn write_postfix(&self, writer: &mut PolicyWriter) {
        let (kind, attr, set) = match self {
            Self::Not(expr) => {
                expr.write_postfix(writer);
                (CONSTRAINT_EXPR_NOT, 0, None)
            }
            Self::And(left, right) => {
                left.write_postfix(writer);
                right.write_postfix(writer);
                (CONSTRAINT_EXPR_AND, 0, None)
            }
            Self::Or(left, right) => {
                left.write_postfix(writer);
                right.write_postfix(writer);
                (CONSTRAINT_EXPR_OR, 0, None)
            }
            Self::SameUser => (CONSTRAINT_EXPR_SAME_USER, 0, None),
            Self::TypeSource(set) => (CONSTRAINT_EXPR_TYPE_SOURCE, 0, Some(set)),
            Self::TypeTarget(set) => (CONSTRAINT_EXPR_TYPE_TARGET, 0, Some(set)),
            Self::RoleSource(set) => (CONSTRAINT_EXPR_ROLE_SOURCE, 0, Some(set)),
            Self::RoleTarget(set) => (CONSTRAINT_EXPR_ROLE_TARGET, 0, Some(set)),
            Self::RoleRelation(relation) => (CONSTRAINT_EXPR_ROLE_RELATION, relation.attr(), None),
        };
        writer.write_u32(kind);
        writer.write_u32(attr);
        if let Some(set) = set {
            set.write(writer);
        }
    }
}

#[derive(Debug)]
enum PostfixNode {
    Not,
    And,
    Or,
    Leaf(ConstraintExpr),
}

impl Parse for ConstraintExpr {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("constraint expression node", count, NODE_SIZE)?;
        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (kind, next) = tail.parse_u32()?;
            let (attr, next) = next.parse_u32()?;
            tail = next;
            let node = match kind {
                CONSTRAINT_EXPR_NOT => PostfixNode::Not,
                CONSTRAINT_EXPR_AND => PostfixNode::And,
                CONSTRAINT_EXPR_OR => PostfixNode::Or,
                CONSTRAINT_EXPR_SAME_USER => PostfixNode::Leaf(Self::SameUser),
                CONSTRAINT_EXPR_ROLE_RELATION => {
                    PostfixNode::Leaf(Self::RoleRelation(RoleRelation::from_attr(attr)?))
                }
                CONSTRAINT_EXPR_TYPE_SOURCE
                | CONSTRAINT_EXPR_TYPE_TARGET
                | CONSTRAINT_EXPR_ROLE_SOURCE
                | CONSTRAINT_EXPR_ROLE_TARGET => {
                    let (set, next) = ExtensibleBitmap::parse(tail)?;
                    tail = next;
                    PostfixNode::Leaf(match kind {
                        CONSTRAINT_EXPR_TYPE_SOURCE => Self::TypeSource(set),
                        CONSTRAINT_EXPR_TYPE_TARGET => Self::TypeTarget(set),
                        CONSTRAINT_EXPR_ROLE_SOURCE => Self::RoleSource(set),
                        _ => Self::RoleTarget(set),
                    })
                }
                _ => return Err(ConstraintError::InvalidTermType { type_: kind }.into()),
            };
            nodes.push(node);
        }
        Ok((Self::from_postfix(nodes)?, tail))
    }
}

impl Write for ConstraintExpr {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.postfix_len() as u32);
        self.write_postfix(writer);
    }
}

/// Restricts `permissions` of a class to the context pairs for which `expr` holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Constraint {
    pub(super) permissions: AccessVector,
    pub(super) expr: ConstraintExpr,
}

impl Constraint {
    pub fn permissions(&self) -> AccessVector {
        self.permissions
    }

    pub fn expr(&self) -> &ConstraintExpr {
        &self.expr
    }
}

impl Parse for Constraint {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (permissions, tail) = cursor.parse_u32()?;
        let (expr, tail) = ConstraintExpr::parse(tail)?;
        Ok((Self { permissions: AccessVector::from_raw(permissions), expr }, tail))
    }
}

impl Write for Constraint {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.permissions.bits());
        self.expr.write(writer);
    }
}

/// Clears from `allowed` the permissions of every constraint whose expression does not hold for
/// `source` and `target`. Constraints are applied in declaration order and only remove
/// permissions.
pub(super) fn apply_constraints(
    constraints: &[Constraint],
    source: &SecurityContext,
    target: &SecurityContext,
    roles: &SymbolTable<Role>,
    allowed: AccessVector,
) -> AccessVector {
    let mut allowed = allowed;
    for constraint in constraints {
        if (constraint.permissions & allowed) != AccessVector::NONE
            && !constraint.expr.evaluate(source, target, roles)
        {
            allowed &= !constraint.permissions;
        }
    }
    allowed
}
