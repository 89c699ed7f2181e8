// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::ParseError;
use super::metadata::Config;

use std::fmt::Debug;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// A cursor over binary policy data. Parsing consumes the cursor by value and returns the cursor
/// positioned after the parsed bytes, so that a failed parse never advances a cursor that the
/// caller still holds.
///
/// The cursor also carries two feature configurations: `layout` describes which optional fields
/// are present in the byte stream, and `supported` describes which of them should be retained in
/// the parsed output. They differ only when a policy is read in downgraded mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolicyCursor<'a> {
    data: &'a [u8],
    offset: usize,
    layout: Config,
    supported: Config,
}

impl<'a> PolicyCursor<'a> {
    /// Returns a new cursor at the start of `data`, with no optional features configured.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0, layout: Config::default(), supported: Config::default() }
    }

    /// Returns a copy of this cursor that interprets subsequent data according to `layout`,
    /// retaining only the optional fields allowed by `supported`.
    pub fn with_config(self, layout: Config, supported: Config) -> Self {
        Self { layout, supported, ..self }
    }

    /// Features whose fields are present in the byte stream.
    pub fn layout(&self) -> Config {
        self.layout
    }

    /// Features whose fields are retained in parsed output.
    pub fn supported(&self) -> Config {
        self.supported
    }

    /// The offset of this cursor from the start of the policy data.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the number of bytes remaining to be parsed.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remaining_slice(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    fn advance(self, num_bytes: usize) -> Self {
        Self { offset: self.offset + num_bytes, ..self }
    }

    /// Parses a fixed-layout `T` from the next bytes, returning `None` if too few bytes remain.
    pub fn parse<T: FromBytes + KnownLayout + Immutable + Unaligned>(self) -> Option<(T, Self)> {
        let (output, _) = T::read_from_prefix(self.remaining_slice()).ok()?;
        Some((output, self.advance(std::mem::size_of::<T>())))
    }

    /// Parses a fixed-layout `T`, reporting a [`ParseError::MissingData`] if too few bytes remain.
    pub fn parse_or_error<T: FromBytes + KnownLayout + Immutable + Unaligned>(
        self,
    ) -> Result<(T, Self), ParseError> {
        let num_bytes = self.len();
        self.parse::<T>().ok_or(ParseError::MissingData {
            type_name: std::any::type_name::<T>(),
            type_size: std::mem::size_of::<T>(),
            num_bytes,
        })
    }

    /// Parses a little-endian `u32`.
    pub fn parse_u32(self) -> Result<(u32, Self), ParseError> {
        let (value, tail) = self.parse_or_error::<le::U32>()?;
        Ok((value.get(), tail))
    }

    /// Returns the next `count` bytes.
    pub fn parse_bytes(self, count: usize) -> Result<(&'a [u8], Self), ParseError> {
        let num_bytes = self.len();
        if count > num_bytes {
            return Err(ParseError::MissingSliceData {
                type_name: "u8",
                type_size: 1,
                num_items: count,
                num_bytes,
            });
        }
        let bytes = &self.remaining_slice()[..count];
        Ok((bytes, self.advance(count)))
    }

    /// Parses a length-prefixed UTF-8 string.
    pub fn parse_string(self) -> Result<(String, Self), ParseError> {
        let (len, tail) = self.parse_u32()?;
        let (bytes, tail) = tail.parse_bytes(len as usize)?;
        let string = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;
        Ok((string.to_string(), tail))
    }

    /// Verifies that `count` items, each at least `min_item_size` bytes long, could be present in
    /// the remaining data. Used to reject counts that would otherwise drive large allocations.
    pub fn check_count(
        &self,
        type_name: &'static str,
        count: u32,
        min_item_size: usize,
    ) -> Result<(), ParseError> {
        let needed = (count as usize).saturating_mul(min_item_size);
        if needed > self.len() {
            return Err(ParseError::MissingSliceData {
                type_name,
                type_size: min_item_size,
                num_items: count as usize,
                num_bytes: self.len(),
            });
        }
        Ok(())
    }
}

/// Accumulates the binary form of a policy. Mirrors [`PolicyCursor`]: the writer carries the
/// feature configuration that decides which optional fields are emitted.
#[derive(Debug, Default)]
pub struct PolicyWriter {
    bytes: Vec<u8>,
    config: Config,
}

impl PolicyWriter {
    pub fn new(config: Config) -> Self {
        Self { bytes: Vec::new(), config }
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Appends the raw bytes of a fixed-layout value.
    pub fn write<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) {
        self.bytes.extend_from_slice(value.as_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write(&le::U32::new(value));
    }

    /// Appends a length-prefixed string.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.bytes.extend_from_slice(value.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
    #[repr(C, packed)]
    struct SomeNumbers {
        a: u8,
        b: le::U32,
        c: le::U16,
        d: u8,
    }

    #[test]
    fn parse_advances_cursor() {
        let bytes: Vec<u8> = (0..8).collect();
        let cursor = PolicyCursor::new(&bytes);
        let (some_numbers, cursor) = cursor.parse::<SomeNumbers>().expect("some numbers");
        assert_eq!(0, some_numbers.a);
        assert_eq!(7, some_numbers.d);
        assert_eq!(8, cursor.offset());
        assert!(cursor.is_empty());
    }

    #[test]
    fn parse_short_input_leaves_cursor() {
        let bytes: Vec<u8> = (0..7).collect();
        let cursor = PolicyCursor::new(&bytes);
        assert!(cursor.parse::<SomeNumbers>().is_none());
        let error = cursor.parse_or_error::<SomeNumbers>().expect_err("too short");
        assert!(matches!(error, ParseError::MissingData { type_size: 8, num_bytes: 7, .. }));
        assert_eq!(0, cursor.offset());
    }

    #[test]
    fn strings_round_trip() {
        let mut writer = PolicyWriter::new(Config::default());
        writer.write_string("object_r");
        writer.write_u32(17);
        let bytes = writer.into_inner();

        let (name, cursor) = PolicyCursor::new(&bytes).parse_string().expect("string");
        assert_eq!("object_r", name);
        let (value, cursor) = cursor.parse_u32().expect("u32");
        assert_eq!(17, value);
        assert!(cursor.is_empty());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let bytes = [2, 0, 0, 0, 0xff, 0xfe];
        assert_eq!(PolicyCursor::new(&bytes).parse_string(), Err(ParseError::InvalidUtf8));
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let bytes = [0u8; 16];
        let cursor = PolicyCursor::new(&bytes);
        assert!(cursor.check_count("node", 1, 16).is_ok());
        assert!(cursor.check_count("node", u32::MAX, 12).is_err());
    }
}
