// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::ParseError;
use super::parser::{PolicyCursor, PolicyWriter};

use crate::EngineConfig;

use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub(super) const POLICY_MAGIC: u32 = 0xf97cff8c;
pub(super) const POLICY_VERSION: u32 = 1;

pub(super) const CONFIG_MLS_FLAG: u32 = 1;
pub(super) const CONFIG_AUDIT_FLAG: u32 = 2;
pub(super) const CONFIG_NOTIFY_FLAG: u32 = 4;

const CONFIG_ALL_FLAGS: u32 = CONFIG_MLS_FLAG | CONFIG_AUDIT_FLAG | CONFIG_NOTIFY_FLAG;

pub(super) const SYMBOL_KINDS_BASE: u32 = 5;
pub(super) const SYMBOL_KINDS_MLS: u32 = 7;
pub(super) const OCONTEXT_KINDS: u32 = 5;

/// The optional features present in a policy, as declared by its header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Config {
    pub mls: bool,
    pub audit: bool,
    pub notify: bool,
}

impl Config {
    pub fn from_bits(bits: u32) -> Result<Self, ParseError> {
        if bits & !CONFIG_ALL_FLAGS != 0 {
            return Err(ParseError::InvalidConfig { bits });
        }
        Ok(Self {
            mls: bits & CONFIG_MLS_FLAG != 0,
            audit: bits & CONFIG_AUDIT_FLAG != 0,
            notify: bits & CONFIG_NOTIFY_FLAG != 0,
        })
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.mls {
            bits |= CONFIG_MLS_FLAG;
        }
        if self.audit {
            bits |= CONFIG_AUDIT_FLAG;
        }
        if self.notify {
            bits |= CONFIG_NOTIFY_FLAG;
        }
        bits
    }

    /// The features enabled in both `self` and `other`.
    pub fn intersection(&self, other: &Config) -> Config {
        Config {
            mls: self.mls && other.mls,
            audit: self.audit && other.audit,
            notify: self.notify && other.notify,
        }
    }

    pub(super) fn symbol_kinds(&self) -> u32 {
        if self.mls {
            SYMBOL_KINDS_MLS
        } else {
            SYMBOL_KINDS_BASE
        }
    }

    pub(super) fn default_behaviors(&self) -> u32 {
        1 + 2 * (self.audit as u32) + (self.notify as u32)
    }
}

impl From<EngineConfig> for Config {
    fn from(config: EngineConfig) -> Self {
        Self { mls: config.mls, audit: config.audit, notify: config.notify }
    }
}

/// The fixed-size header at the start of every binary policy.
#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(super) struct Header {
    magic: le::U32,
    version: le::U32,
    config: le::U32,
    symbol_kinds: le::U32,
    default_behaviors: le::U32,
    ocontext_kinds: le::U32,
}

impl Header {
    pub fn new(config: &Config) -> Self {
        Self {
            magic: le::U32::new(POLICY_MAGIC),
            version: le::U32::new(POLICY_VERSION),
            config: le::U32::new(config.bits()),
            symbol_kinds: le::U32::new(config.symbol_kinds()),
            default_behaviors: le::U32::new(config.default_behaviors()),
            ocontext_kinds: le::U32::new(OCONTEXT_KINDS),
        }
    }

    /// Parses and validates the header, returning the layout configuration it declares.
    pub fn parse(cursor: PolicyCursor<'_>) -> Result<(Config, PolicyCursor<'_>), ParseError> {
        let (header, tail) = cursor.parse_or_error::<Header>()?;
        let magic = header.magic.get();
        if magic != POLICY_MAGIC {
            return Err(ParseError::InvalidMagic { expected: POLICY_MAGIC, found: magic });
        }
        let version = header.version.get();
        if version != POLICY_VERSION {
            return Err(ParseError::VersionMismatch { expected: POLICY_VERSION, found: version });
        }
        let config = Config::from_bits(header.config.get())?;
        for (kind, expected, found) in [
            ("symbol kinds", config.symbol_kinds(), header.symbol_kinds.get()),
            ("default behaviors", config.default_behaviors(), header.default_behaviors.get()),
            ("object context kinds", OCONTEXT_KINDS, header.ocontext_kinds.get()),
        ] {
            if expected != found {
                return Err(ParseError::InvalidCount { kind, expected, found });
            }
        }
        Ok((config, tail))
    }

    pub fn write(&self, writer: &mut PolicyWriter) {
        writer.write(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    #[test_case(0, Config { mls: false, audit: false, notify: false }; "none")]
    #[test_case(1, Config { mls: true, audit: false, notify: false }; "mls")]
    #[test_case(6, Config { mls: false, audit: true, notify: true }; "audit and notify")]
    #[test_case(7, Config { mls: true, audit: true, notify: true }; "all")]
    fn config_bits(bits: u32, config: Config) {
        assert_eq!(Config::from_bits(bits), Ok(config));
        assert_eq!(config.bits(), bits);
    }

    #[test]
    fn unknown_config_bits_are_rejected() {
        assert_eq!(Config::from_bits(8), Err(ParseError::InvalidConfig { bits: 8 }));
    }

    #[test]
    fn header_table_counts_follow_config() {
        let config = Config { mls: true, audit: true, notify: false };
        let mut writer = PolicyWriter::new(config);
        Header::new(&config).write(&mut writer);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 24);
        let (parsed, tail) = Header::parse(PolicyCursor::new(&bytes)).expect("parse header");
        assert_eq!(parsed, config);
        assert!(tail.is_empty());
    }

    #[test]
    fn header_rejects_wrong_version() {
        let mut bytes = Header::new(&Config::default()).as_bytes().to_vec();
        bytes[4] = 2;
        assert_eq!(
            Header::parse(PolicyCursor::new(&bytes)).map(|(config, _)| config),
            Err(ParseError::VersionMismatch { expected: POLICY_VERSION, found: 2 })
        );
    }

    #[test]
    fn header_rejects_wrong_magic() {
        let mut bytes = Header::new(&Config::default()).as_bytes().to_vec();
        bytes[0] = 0;
        assert!(matches!(
            Header::parse(PolicyCursor::new(&bytes)),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn header_rejects_inconsistent_table_counts() {
        let mut bytes = Header::new(&Config::default()).as_bytes().to_vec();
        // Claim MLS without the two extra symbol tables.
        bytes[8] = 1;
        assert_eq!(
            Header::parse(PolicyCursor::new(&bytes)).map(|(config, _)| config),
            Err(ParseError::InvalidCount { kind: "symbol kinds", expected: 7, found: 5 })
        );
    }
}
