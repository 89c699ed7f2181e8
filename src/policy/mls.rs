// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::extensible_bitmap::ExtensibleBitmap;
use super::parser::{PolicyCursor, PolicyWriter};
use super::{parse_id, AccessVector, Parse, SensitivityId, Write};

use std::cmp::Ordering;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The relation between two [`SecurityLevel`]s.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LevelRelation {
    Equal,
    Dominates,
    DominatedBy,
    Incomparable,
}

/// A sensitivity together with a set of categories. Category value `v` is stored at bit `v - 1`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecurityLevel {
    pub sensitivity: SensitivityId,
    pub categories: ExtensibleBitmap,
}

impl SecurityLevel {
    pub fn new(sensitivity: SensitivityId, categories: ExtensibleBitmap) -> Self {
        Self { sensitivity, categories }
    }

    /// Returns how `self` relates to `other`: `self` dominates `other` when its sensitivity is at
    /// least as high and its categories are a superset.
    pub fn relation(&self, other: &SecurityLevel) -> LevelRelation {
        let covers = self.categories.contains(&other.categories);
        let covered = other.categories.contains(&self.categories);
        match self.sensitivity.cmp(&other.sensitivity) {
            Ordering::Equal if covers && covered => LevelRelation::Equal,
            Ordering::Equal | Ordering::Greater if covers => LevelRelation::Dominates,
            Ordering::Equal | Ordering::Less if covered => LevelRelation::DominatedBy,
            _ => LevelRelation::Incomparable,
        }
    }

    /// Returns whether `self` dominates or equals `other`.
    pub fn dominates(&self, other: &SecurityLevel) -> bool {
        matches!(self.relation(other), LevelRelation::Equal | LevelRelation::Dominates)
    }
}

impl Parse for SecurityLevel {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (sensitivity, tail) = cursor.parse_u32()?;
        let (categories, tail) = ExtensibleBitmap::parse(tail)?;
        Ok((Self { sensitivity: parse_id(sensitivity)?, categories }, tail))
    }
}

impl Write for SecurityLevel {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.sensitivity.as_u32());
        self.categories.write(writer);
    }
}

/// A low and a high [`SecurityLevel`], with the high level dominating the low level.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecurityRange {
    pub low: SecurityLevel,
    pub high: SecurityLevel,
}

impl SecurityRange {
    pub fn new(low: SecurityLevel, high: SecurityLevel) -> Self {
        Self { low, high }
    }

    /// A range whose low and high levels are the same.
    pub fn single(level: SecurityLevel) -> Self {
        Self { low: level.clone(), high: level }
    }

    pub fn is_single_level(&self) -> bool {
        self.low == self.high
    }

    pub fn is_well_formed(&self) -> bool {
        self.high.dominates(&self.low)
    }

    /// Returns whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &SecurityRange) -> bool {
        other.low.dominates(&self.low) && self.high.dominates(&other.high)
    }
}

impl Parse for SecurityRange {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (low, tail) = SecurityLevel::parse(cursor)?;
        let (high, tail) = SecurityLevel::parse(tail)?;
        Ok((Self { low, high }, tail))
    }
}

impl Write for SecurityRange {
    fn write(&self, writer: &mut PolicyWriter) {
        self.low.write(writer);
        self.high.write(writer);
    }
}

/// Per-class mapping of permission bits to the information flows they imply.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BaseFlows {
    pub read: AccessVector,
    pub write: AccessVector,
    pub readby: AccessVector,
    pub writeby: AccessVector,
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct BaseFlowsMetadata {
    read: le::U32,
    write: le::U32,
    readby: le::U32,
    writeby: le::U32,
}

impl Parse for BaseFlows {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (flows, tail) = cursor.parse_or_error::<BaseFlowsMetadata>()?;
        Ok((
            Self {
                read: AccessVector::from_raw(flows.read.get()),
                write: AccessVector::from_raw(flows.write.get()),
                readby: AccessVector::from_raw(flows.readby.get()),
                writeby: AccessVector::from_raw(flows.writeby.get()),
            },
            tail,
        ))
    }
}

impl Write for BaseFlows {
    fn write(&self, writer: &mut PolicyWriter) {
        writer.write(&BaseFlowsMetadata {
            read: le::U32::new(self.read.bits()),
            write: le::U32::new(self.write.bits()),
            readby: le::U32::new(self.readby.bits()),
            writeby: le::U32::new(self.writeby.bits()),
        });
    }
}

/// Removes from `allowed` the permissions whose information flows are not permitted between the
/// `source` and `target` ranges.
pub(super) fn compute_mls_allowed(
    source: &SecurityRange,
    target: &SecurityRange,
    flows: &BaseFlows,
    allowed: AccessVector,
) -> AccessVector {
    let high = source.high.relation(&target.high);
    let low = source.low.relation(&target.low);
    let down = |relation| matches!(relation, LevelRelation::Equal | LevelRelation::Dominates);
    let up = |relation| matches!(relation, LevelRelation::Equal | LevelRelation::DominatedBy);

    let mut allowed = allowed;
    if !down(high) {
        allowed &= !flows.read;
    }
    if !up(high) {
        allowed &= !flows.readby;
    }
    if !(up(low) || (target.is_single_level() && up(high))) {
        allowed &= !flows.write;
    }
    if !(down(low) || (source.is_single_level() && down(high))) {
        allowed &= !flows.writeby;
    }
    allowed
}
