// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::ParseError;
use super::parser::{PolicyCursor, PolicyWriter};

use std::collections::BTreeMap;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum number of bits that can be represented in one node of an [`ExtensibleBitmap`].
pub(super) const MAP_NODE_BITS: u32 = 8 * std::mem::size_of::<u64>() as u32;

/// A sparse set of small integers, stored as an ordered set of 64-bit words each covering
/// `[start_bit, start_bit + 64)`. Only non-zero words are stored.
///
/// Policy symbol sets (roles, types, categories, classes) store symbol value `v` at bit `v - 1`.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ExtensibleBitmap {
    nodes: BTreeMap<u32, u64>,
    high_bit: u32,
}

impl ExtensibleBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the exclusive upper bound of the bits stored: one past the last bit of the last
    /// node, or zero when the bitmap is empty.
    pub fn high_bit(&self) -> u32 {
        self.high_bit
    }

    /// Returns the count of nodes in the bitmap.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns whether the `index`'th bit in this bitmap is a 1-bit.
    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.high_bit {
            return false;
        }
        let (start, offset) = node_position(index);
        self.nodes.get(&start).map_or(false, |word| word & (1u64 << offset) != 0)
    }

    /// Sets or clears the `index`'th bit. Clearing the last set bit of a node removes the node.
    pub fn set(&mut self, index: u32, value: bool) {
        let (start, offset) = node_position(index);
        if value {
            *self.nodes.entry(start).or_insert(0) |= 1u64 << offset;
        } else if let Some(word) = self.nodes.get_mut(&start) {
            *word &= !(1u64 << offset);
            if *word == 0 {
                self.nodes.remove(&start);
            }
        }
        self.update_high_bit();
    }

    /// Returns the union of `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        let mut nodes = self.nodes.clone();
        for (start, word) in other.nodes.iter() {
            *nodes.entry(*start).or_insert(0) |= word;
        }
        let mut result = Self { nodes, high_bit: 0 };
        result.update_high_bit();
        result
    }

    /// Returns whether every bit set in `other` is also set in `self`.
    pub fn contains(&self, other: &Self) -> bool {
        if self.high_bit < other.high_bit {
            return false;
        }
        other.nodes.iter().all(|(start, word)| {
            self.nodes.get(start).map_or(false, |self_word| self_word & word == *word)
        })
    }

    /// Returns an iterator over the indices of the set bits, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.iter().flat_map(|(start, word)| {
            let (start, word) = (*start, *word);
            (0..MAP_NODE_BITS)
                .filter(move |offset| word & (1u64 << offset) != 0)
                .map(move |offset| start + offset)
        })
    }

    fn update_high_bit(&mut self) {
        self.high_bit = match self.nodes.last_key_value() {
            Some((start, _)) => start.saturating_add(MAP_NODE_BITS),
            None => 0,
        };
    }

    pub(super) fn parse(cursor: PolicyCursor<'_>) -> Result<(Self, PolicyCursor<'_>), ParseError> {
        let (metadata, mut tail) = cursor.parse_or_error::<Metadata>()?;
        let map_size = metadata.map_size.get();
        if map_size != MAP_NODE_BITS {
            return Err(ParseError::InvalidBitmapMapSize {
                expected: MAP_NODE_BITS,
                found: map_size,
            });
        }
        let count = metadata.count.get();
        tail.check_count("extensible bitmap node", count, std::mem::size_of::<MapItem>())?;

        let mut nodes = BTreeMap::new();
        let mut next_start = 0;
        for _ in 0..count {
            let (item, next_tail) = tail.parse_or_error::<MapItem>()?;
            tail = next_tail;
            let start_bit = item.start_bit.get();
            if start_bit % MAP_NODE_BITS != 0 || start_bit < next_start {
                return Err(ParseError::InvalidBitmapNodeOrder { start_bit });
            }
            let word = item.map.get();
            if word == 0 {
                return Err(ParseError::EmptyBitmapNode { start_bit });
            }
            next_start = start_bit
                .checked_add(MAP_NODE_BITS)
                .ok_or(ParseError::InvalidBitmapNodeOrder { start_bit })?;
            nodes.insert(start_bit, word);
        }

        let high_bit = metadata.high_bit.get();
        if high_bit != next_start {
            return Err(ParseError::InvalidBitmapHighBit { expected: next_start, found: high_bit });
        }
        Ok((Self { nodes, high_bit }, tail))
    }

    pub(super) fn write(&self, writer: &mut PolicyWriter) {
        writer.write(&Metadata {
            map_size: le::U32::new(MAP_NODE_BITS),
            high_bit: le::U32::new(self.high_bit),
            count: le::U32::new(self.nodes.len() as u32),
        });
        for (start, word) in self.nodes.iter() {
            writer.write(&MapItem { start_bit: le::U32::new(*start), map: le::U64::new(*word) });
        }
    }
}

impl FromIterator<u32> for ExtensibleBitmap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bitmap = Self::new();
        for index in iter {
            bitmap.set(index, true);
        }
        bitmap
    }
}

fn node_position(index: u32) -> (u32, u32) {
    (index - index % MAP_NODE_BITS, index % MAP_NODE_BITS)
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct Metadata {
    /// How many bits on each `MapItem`.
    map_size: le::U32,
    /// Highest bit, non-inclusive.
    high_bit: le::U32,
    /// The number of map items.
    count: le::U32,
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct MapItem {
    /// The first bit that this [`MapItem`] stores, relative to its [`ExtensibleBitmap`] range.
    start_bit: le::U32,
    /// The bitmap data for this [`MapItem`].
    map: le::U64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    fn encode(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    fn parse_bytes(bytes: &[u8]) -> Result<ExtensibleBitmap, ParseError> {
        ExtensibleBitmap::parse(PolicyCursor::new(bytes)).map(|(bitmap, _)| bitmap)
    }

    #[test_case(0)]
    #[test_case(63)]
    #[test_case(64)]
    #[test_case(1000)]
    fn set_then_get(bit: u32) {
        let mut bitmap = ExtensibleBitmap::new();
        bitmap.set(bit, true);
        assert!(bitmap.is_set(bit));
        assert!(bitmap.high_bit() >= bit + 1);
        assert_eq!(bitmap.high_bit() % MAP_NODE_BITS, 0);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![bit]);
    }

    #[test]
    fn clearing_all_bits_empties_bitmap() {
        let bits = [3, 70, 200, 201];
        let mut bitmap: ExtensibleBitmap = bits.into_iter().collect();
        assert_eq!(bitmap.num_nodes(), 3);
        assert_eq!(bitmap.high_bit(), 256);

        bitmap.set(200, false);
        assert_eq!(bitmap.high_bit(), 256);
        bitmap.set(201, false);
        assert_eq!(bitmap.high_bit(), 128);
        bitmap.set(70, false);
        bitmap.set(3, false);
        assert_eq!(bitmap.high_bit(), 0);
        assert_eq!(bitmap.num_nodes(), 0);
        assert!(bitmap.is_empty());
    }

    #[test]
    fn clearing_unset_bit_is_noop() {
        let mut bitmap: ExtensibleBitmap = [5].into_iter().collect();
        bitmap.set(900, false);
        assert_eq!(bitmap, [5].into_iter().collect::<ExtensibleBitmap>());
    }

    #[test]
    fn union_properties() {
        let a: ExtensibleBitmap = [1, 2, 130].into_iter().collect();
        let b: ExtensibleBitmap = [2, 64, 500].into_iter().collect();
        let union = a.union(&b);
        assert_eq!(union, b.union(&a));
        assert_eq!(union.union(&union), union);
        assert_eq!(a.union(&a), a);
        assert!(union.contains(&a));
        assert!(union.contains(&b));
        assert!(!a.contains(&b));
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 2, 64, 130, 500]);
    }

    #[test]
    fn contains_requires_high_bit() {
        let small: ExtensibleBitmap = [1].into_iter().collect();
        let large: ExtensibleBitmap = [1, 300].into_iter().collect();
        assert!(large.contains(&small));
        assert!(!small.contains(&large));
        assert!(small.contains(&ExtensibleBitmap::new()));
    }

    #[test]
    fn write_then_parse() {
        let bitmap: ExtensibleBitmap = [0, 9, 64, 4000].into_iter().collect();
        let mut writer = PolicyWriter::default();
        bitmap.write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 12 + 3 * 12);
        assert_eq!(parse_bytes(&bytes), Ok(bitmap));
    }

    #[test]
    fn parse_empty() {
        assert_eq!(parse_bytes(&encode(&[64, 0, 0])), Ok(ExtensibleBitmap::new()));
    }

    #[test]
    fn parse_rejects_wrong_map_size() {
        assert_eq!(
            parse_bytes(&encode(&[32, 0, 0])),
            Err(ParseError::InvalidBitmapMapSize { expected: 64, found: 32 })
        );
    }

    #[test_case(&[64, 128, 2, 64, 1, 0, 0, 1, 0]; "out of order")]
    #[test_case(&[64, 128, 2, 0, 1, 0, 0, 1, 0]; "repeated start")]
    #[test_case(&[64, 128, 1, 65, 1, 0]; "misaligned")]
    fn parse_rejects_bad_node_order(words: &[u32]) {
        assert!(matches!(
            parse_bytes(&encode(words)),
            Err(ParseError::InvalidBitmapNodeOrder { .. })
        ));
    }

    #[test]
    fn parse_rejects_empty_word() {
        assert_eq!(
            parse_bytes(&encode(&[64, 64, 1, 0, 0, 0])),
            Err(ParseError::EmptyBitmapNode { start_bit: 0 })
        );
    }

    #[test_case(&[64, 192, 1, 64, 1, 0]; "past last node")]
    #[test_case(&[64, 64, 1, 64, 1, 0]; "before last node")]
    #[test_case(&[64, 64, 0]; "empty with high bit")]
    fn parse_rejects_bad_high_bit(words: &[u32]) {
        assert!(matches!(
            parse_bytes(&encode(words)),
            Err(ParseError::InvalidBitmapHighBit { .. })
        ));
    }

    #[test]
    fn parse_rejects_truncated_nodes() {
        assert!(matches!(
            parse_bytes(&encode(&[64, 64, 2, 0, 1, 0])),
            Err(ParseError::MissingSliceData { .. })
        ));
    }
}
