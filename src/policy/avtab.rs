// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::ParseError;
use super::parser::{PolicyCursor, PolicyWriter};
use super::{parse_id, AccessVector, ClassId, Parse, TypeId, Write};

use thiserror::Error;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub(super) const DEFAULT_BUCKET_COUNT: usize = 512;

pub(super) const AVTAB_ALLOWED: u32 = 0x1;
pub(super) const AVTAB_TRANSITION: u32 = 0x2;
pub(super) const AVTAB_AUDITALLOW: u32 = 0x4;
pub(super) const AVTAB_AUDITDENY: u32 = 0x8;
pub(super) const AVTAB_NOTIFY: u32 = 0x10;
pub(super) const AVTAB_MEMBER: u32 = 0x20;

const AVTAB_ALL_KINDS: u32 = AVTAB_ALLOWED
    | AVTAB_TRANSITION
    | AVTAB_AUDITALLOW
    | AVTAB_AUDITDENY
    | AVTAB_NOTIFY
    | AVTAB_MEMBER;

/// Number of `u32` values in a record after the field count, excluding the per-kind fields.
const AVTAB_KEY_FIELDS: u32 = 4;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AvTabError {
    #[error("access vector table already contains an entry for {0:?}")]
    DuplicateKey(AvTabKey),
}

/// Identifies the type-enforcement rules that apply to a source type accessing a target type
/// through an object of the given class.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AvTabKey {
    pub source_type: TypeId,
    pub target_type: TypeId,
    pub class: ClassId,
}

impl AvTabKey {
    fn hash(&self, bucket_count: usize) -> usize {
        let hash = self
            .class
            .as_u32()
            .wrapping_add(self.target_type.as_u32() << 2)
            .wrapping_add(self.source_type.as_u32() << 9);
        hash as usize % bucket_count
    }
}

/// The rules defined for one [`AvTabKey`]. Each field is present only if the corresponding rule
/// kind was specified.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AvTabDatum {
    pub allowed: Option<AccessVector>,
    pub transition: Option<TypeId>,
    pub audit_allow: Option<AccessVector>,
    pub audit_deny: Option<AccessVector>,
    pub notify: Option<AccessVector>,
    pub member: Option<TypeId>,
}

impl AvTabDatum {
    /// Returns the bitmask of rule kinds present in this datum.
    pub fn specified(&self) -> u32 {
        [
            (self.allowed.is_some(), AVTAB_ALLOWED),
            (self.transition.is_some(), AVTAB_TRANSITION),
            (self.audit_allow.is_some(), AVTAB_AUDITALLOW),
            (self.audit_deny.is_some(), AVTAB_AUDITDENY),
            (self.notify.is_some(), AVTAB_NOTIFY),
            (self.member.is_some(), AVTAB_MEMBER),
        ]
        .into_iter()
        .filter(|(present, _)| *present)
        .fold(0, |specified, (_, bit)| specified | bit)
    }

    fn is_empty(&self) -> bool {
        self.specified() == 0
    }
}

/// Hash table of type-enforcement rules, with at most one [`AvTabDatum`] per [`AvTabKey`].
#[derive(Clone, Debug)]
pub struct AvTab {
    buckets: Vec<Vec<(AvTabKey, AvTabDatum)>>,
    len: usize,
}

impl AvTab {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKET_COUNT)
    }

    /// Returns an empty table with `bucket_count` buckets (at least one).
    pub fn with_buckets(bucket_count: usize) -> Self {
        Self { buckets: vec![Vec::new(); bucket_count.max(1)], len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, key: AvTabKey, datum: AvTabDatum) -> Result<(), AvTabError> {
        let bucket_count = self.buckets.len();
        let bucket = &mut self.buckets[key.hash(bucket_count)];
        if bucket.iter().any(|(existing, _)| *existing == key) {
            return Err(AvTabError::DuplicateKey(key));
        }
        bucket.push((key, datum));
        self.len += 1;
        Ok(())
    }

    pub fn search(&self, key: &AvTabKey) -> Option<&AvTabDatum> {
        self.buckets[key.hash(self.buckets.len())]
            .iter()
            .find_map(|(existing, datum)| (existing == key).then_some(datum))
    }

    /// Returns all entries ordered by key, independent of bucket layout.
    pub fn sorted_entries(&self) -> Vec<(&AvTabKey, &AvTabDatum)> {
        let mut entries: Vec<_> =
            self.buckets.iter().flatten().map(|(key, datum)| (key, datum)).collect();
        entries.sort_by_key(|(key, _)| **key);
        entries
    }
}

impl Default for AvTab {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AvTab {
    fn eq(&self, other: &Self) -> bool {
        self.sorted_entries() == other.sorted_entries()
    }
}

impl Eq for AvTab {}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct RecordHeader {
    field_count: le::U32,
    source_type: le::U32,
    target_type: le::U32,
    class: le::U32,
    specified: le::U32,
}

/// Parses one optional field. Fields for features absent from the policy layout are a format
/// error; fields for features the engine does not support are consumed and discarded.
fn parse_field<'a>(
    cursor: PolicyCursor<'a>,
    specified: u32,
    bit: u32,
    in_layout: bool,
    supported: bool,
) -> Result<(Option<u32>, PolicyCursor<'a>), ParseError> {
    if specified & bit == 0 {
        return Ok((None, cursor));
    }
    if !in_layout {
        return Err(ParseError::UnsupportedRuleKind { specified });
    }
    let (value, tail) = cursor.parse_u32()?;
    Ok((supported.then_some(value), tail))
}

impl Parse for AvTab {
    type Error = anyhow::Error;

    fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), Self::Error> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("access vector rule", count, std::mem::size_of::<RecordHeader>())?;
        let (layout, supported) = (tail.layout(), tail.supported());

        let mut avtab = AvTab::new();
        for _ in 0..count {
            let (header, record_tail) = tail.parse_or_error::<RecordHeader>()?;
            let specified = header.specified.get();
            if specified & !AVTAB_ALL_KINDS != 0 {
                return Err(ParseError::UnsupportedRuleKind { specified }.into());
            }
            let declared = header.field_count.get();
            let found = AVTAB_KEY_FIELDS + specified.count_ones();
            if declared != found {
                return Err(ParseError::FieldCountMismatch { declared, found }.into());
            }

            let key = AvTabKey {
                source_type: parse_id(header.source_type.get())?,
                target_type: parse_id(header.target_type.get())?,
                class: parse_id(header.class.get())?,
            };

            let (allowed, t) = parse_field(record_tail, specified, AVTAB_ALLOWED, true, true)?;
            let (transition, t) = parse_field(t, specified, AVTAB_TRANSITION, true, true)?;
            let (audit_allow, t) =
                parse_field(t, specified, AVTAB_AUDITALLOW, layout.audit, supported.audit)?;
            let (audit_deny, t) =
                parse_field(t, specified, AVTAB_AUDITDENY, layout.audit, supported.audit)?;
            let (notify, t) =
                parse_field(t, specified, AVTAB_NOTIFY, layout.notify, supported.notify)?;
            let (member, t) = parse_field(t, specified, AVTAB_MEMBER, true, true)?;
            tail = t;

            let datum = AvTabDatum {
                allowed: allowed.map(AccessVector::from_raw),
                transition: transition.map(parse_id).transpose()?,
                audit_allow: audit_allow.map(AccessVector::from_raw),
                audit_deny: audit_deny.map(AccessVector::from_raw),
                notify: notify.map(AccessVector::from_raw),
                member: member.map(parse_id).transpose()?,
            };
            // Records carrying only discarded fields are dropped.
            if datum.is_empty() && specified != 0 {
                continue;
            }
            avtab.insert(key, datum)?;
        }
        Ok((avtab, tail))
    }
}

impl Write for AvTab {
    fn write(&self, writer: &mut PolicyWriter) {
        let entries = self.sorted_entries();
        writer.write_u32(entries.len() as u32);
        for (key, datum) in entries {
            let specified = datum.specified();
            writer.write(&RecordHeader {
                field_count: le::U32::new(AVTAB_KEY_FIELDS + specified.count_ones()),
                source_type: le::U32::new(key.source_type.as_u32()),
                target_type: le::U32::new(key.target_type.as_u32()),
                class: le::U32::new(key.class.as_u32()),
                specified: le::U32::new(specified),
            });
            let fields = [
                datum.allowed.map(|v| v.bits()),
                datum.transition.map(|t| t.as_u32()),
                datum.audit_allow.map(|v| v.bits()),
                datum.audit_deny.map(|v| v.bits()),
                datum.notify.map(|v| v.bits()),
                datum.member.map(|t| t.as_u32()),
            ];
            for field in fields.into_iter().flatten() {
                writer.write_u32(field);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::metadata::Config;

    fn key(source: u32, target: u32, class: u32) -> AvTabKey {
        AvTabKey {
            source_type: TypeId::from_u32(source).unwrap(),
            target_type: TypeId::from_u32(target).unwrap(),
            class: ClassId::from_u32(class).unwrap(),
        }
    }

    fn allow(bits: u32) -> AvTabDatum {
        AvTabDatum { allowed: Some(AccessVector::from_raw(bits)), ..Default::default() }
    }

    fn encode(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    fn parse_with(bytes: &[u8], layout: Config, supported: Config) -> anyhow::Result<AvTab> {
        let cursor = PolicyCursor::new(bytes).with_config(layout, supported);
        let (avtab, tail) = AvTab::parse(cursor)?;
        assert!(tail.is_empty());
        Ok(avtab)
    }

    const ALL_FEATURES: Config = Config { mls: false, audit: true, notify: true };

    #[test]
    fn missing_key_yields_none() {
        let mut avtab = AvTab::new();
        avtab.insert(key(1, 2, 3), allow(1)).expect("insert");
        assert_eq!(avtab.search(&key(2, 1, 3)), None);
        assert_eq!(avtab.search(&key(1, 2, 3)), Some(&allow(1)));
    }

    #[test]
    fn colliding_keys_keep_their_data() {
        let mut avtab = AvTab::with_buckets(1);
        for source in 1..=50 {
            avtab.insert(key(source, 7, 1), allow(source)).expect("insert");
        }
        assert_eq!(avtab.len(), 50);
        for source in 1..=50 {
            assert_eq!(avtab.search(&key(source, 7, 1)), Some(&allow(source)));
        }
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut avtab = AvTab::with_buckets(4);
        avtab.insert(key(1, 1, 1), allow(1)).expect("insert");
        assert_eq!(
            avtab.insert(key(1, 1, 1), allow(2)),
            Err(AvTabError::DuplicateKey(key(1, 1, 1)))
        );
        assert_eq!(avtab.search(&key(1, 1, 1)), Some(&allow(1)));
    }

    #[test]
    fn equality_ignores_bucket_layout() {
        let mut small = AvTab::with_buckets(3);
        let mut large = AvTab::new();
        for (k, d) in [(key(4, 5, 6), allow(1)), (key(1, 2, 3), allow(2))] {
            small.insert(k, d.clone()).expect("insert");
            large.insert(k, d).expect("insert");
        }
        assert_eq!(small, large);
    }

    #[test]
    fn write_is_sorted_and_parses_back() {
        let mut avtab = AvTab::with_buckets(7);
        avtab.insert(key(9, 1, 1), allow(4)).expect("insert");
        avtab
            .insert(
                key(2, 3, 1),
                AvTabDatum {
                    transition: TypeId::from_u32(5),
                    audit_deny: Some(AccessVector::from_raw(0xfffffffe)),
                    ..Default::default()
                },
            )
            .expect("insert");

        let mut writer = PolicyWriter::new(ALL_FEATURES);
        avtab.write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(
            bytes,
            encode(&[2, 6, 2, 3, 1, 10, 5, 0xfffffffe, 5, 9, 1, 1, 1, 4])
        );
        assert_eq!(parse_with(&bytes, ALL_FEATURES, ALL_FEATURES).expect("parse"), avtab);
    }

    #[test]
    fn field_count_mismatch_is_rejected() {
        let bytes = encode(&[1, 6, 1, 1, 1, AVTAB_ALLOWED, 3, 0]);
        let error = parse_with(&bytes, ALL_FEATURES, ALL_FEATURES).expect_err("mismatch");
        assert_eq!(
            error.downcast::<ParseError>().expect("parse error"),
            ParseError::FieldCountMismatch { declared: 6, found: 5 }
        );
    }

    #[test]
    fn audit_rules_require_audit_layout() {
        let bytes = encode(&[1, 5, 1, 1, 1, AVTAB_AUDITALLOW, 3]);
        let no_audit = Config { audit: false, ..ALL_FEATURES };
        let error = parse_with(&bytes, no_audit, no_audit).expect_err("no audit in layout");
        assert_eq!(
            error.downcast::<ParseError>().expect("parse error"),
            ParseError::UnsupportedRuleKind { specified: AVTAB_AUDITALLOW }
        );
    }

    #[test]
    fn downgraded_read_discards_unsupported_fields() {
        let bytes = encode(&[
            2, //
            6, 1, 1, 1, AVTAB_ALLOWED | AVTAB_NOTIFY, 3, 0xff, //
            5, 2, 2, 1, AVTAB_AUDITALLOW, 1,
        ]);
        let supported = Config { audit: false, notify: false, ..ALL_FEATURES };
        let avtab = parse_with(&bytes, ALL_FEATURES, supported).expect("downgraded parse");
        assert_eq!(avtab.len(), 1);
        assert_eq!(avtab.search(&key(1, 1, 1)), Some(&allow(3)));
        assert_eq!(avtab.search(&key(2, 2, 1)), None);
    }

    #[test]
    fn zero_type_is_rejected() {
        let bytes = encode(&[1, 5, 0, 1, 1, AVTAB_ALLOWED, 3]);
        assert!(parse_with(&bytes, ALL_FEATURES, ALL_FEATURES).is_err());
    }
}
