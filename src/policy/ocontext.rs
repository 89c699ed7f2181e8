// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use super::error::ValidateError;
use super::index::Symbols;
use super::parser::{PolicyCursor, PolicyWriter};
use super::security_context::SecurityContext;
use super::{Parse, Write};
use crate::{InitialSid, SecurityId};

use anyhow::Context as _;
use std::collections::HashSet;
use std::sync::OnceLock;
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Smallest encoding of a non-MLS context.
const MIN_CONTEXT_SIZE: usize = 12;

/// SIDs interned for an object context entry, filled in on first lookup.
///
/// Caches never take part in comparisons, and cloning an entry yields an empty cache.
#[derive(Debug)]
pub struct SidCache<T>(OnceLock<T>);

impl<T: Copy> SidCache<T> {
    pub fn get(&self) -> Option<T> {
        self.0.get().copied()
    }

    /// Stores `value` unless another value was stored first, and returns the stored value.
    pub fn get_or_set(&self, value: T) -> T {
        *self.0.get_or_init(|| value)
    }
}

impl<T> Default for SidCache<T> {
    fn default() -> Self {
        Self(OnceLock::new())
    }
}

impl<T> Clone for SidCache<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T> PartialEq for SidCache<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for SidCache<T> {}

/// Parses a context and validates it against the symbols parsed so far.
fn parse_context<'a>(
    cursor: PolicyCursor<'a>,
    symbols: &Symbols,
) -> anyhow::Result<(SecurityContext, PolicyCursor<'a>)> {
    let (context, tail) = SecurityContext::parse(cursor)?;
    context.validate(symbols).map_err(|error| ValidateError::InvalidContext(error.to_string()))?;
    Ok((context, tail))
}

/// The context of an initial SID.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitialContext {
    sid: u32,
    context: SecurityContext,
}

impl InitialContext {
    /// The raw initial SID value. Values outside the reference numbering are retained but never
    /// looked up.
    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }
}

/// Labels for a filesystem: one for the filesystem itself and one for its files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FsContext {
    name: String,
    fs_context: SecurityContext,
    file_context: SecurityContext,
    pub(crate) sids: SidCache<(SecurityId, SecurityId)>,
}

impl FsContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_context(&self) -> &SecurityContext {
        &self.fs_context
    }

    pub fn file_context(&self) -> &SecurityContext {
        &self.file_context
    }
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct PortKey {
    protocol: le::U32,
    low: le::U32,
    high: le::U32,
}

/// The label for an inclusive range of ports of one protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortContext {
    protocol: u32,
    low: u32,
    high: u32,
    context: SecurityContext,
    pub(crate) sid: SidCache<SecurityId>,
}

impl PortContext {
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn ports(&self) -> std::ops::RangeInclusive<u32> {
        self.low..=self.high
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    fn matches(&self, protocol: u32, port: u32) -> bool {
        self.protocol == protocol && self.ports().contains(&port)
    }
}

/// Labels for a network interface and the messages received on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetifContext {
    name: String,
    interface_context: SecurityContext,
    message_context: SecurityContext,
    pub(crate) sids: SidCache<(SecurityId, SecurityId)>,
}

impl NetifContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface_context(&self) -> &SecurityContext {
        &self.interface_context
    }

    pub fn message_context(&self) -> &SecurityContext {
        &self.message_context
    }
}

#[derive(Clone, Debug, KnownLayout, FromBytes, IntoBytes, Immutable, PartialEq, Unaligned)]
#[repr(C, packed)]
struct NodeKey {
    addr: le::U32,
    mask: le::U32,
}

/// The label for an IPv4 network. Addresses are host-order integers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeContext {
    addr: u32,
    mask: u32,
    context: SecurityContext,
    pub(crate) sid: SidCache<SecurityId>,
}

impl NodeContext {
    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    fn matches(&self, addr: u32) -> bool {
        addr & self.mask == self.addr
    }
}

/// The object context lists of a policy. Every lookup returns the first matching entry in policy
/// order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OContexts {
    initial: Vec<InitialContext>,
    filesystems: Vec<FsContext>,
    ports: Vec<PortContext>,
    netifs: Vec<NetifContext>,
    nodes: Vec<NodeContext>,
}

impl OContexts {
    pub fn initial_contexts(&self) -> &[InitialContext] {
        &self.initial
    }

    pub fn initial_context(&self, sid: InitialSid) -> Option<&SecurityContext> {
        self.initial.iter().find(|entry| entry.sid == sid as u32).map(InitialContext::context)
    }

    pub fn filesystem(&self, name: &str) -> Option<&FsContext> {
        self.filesystems.iter().find(|entry| entry.name == name)
    }

    pub fn port(&self, protocol: u32, port: u32) -> Option<&PortContext> {
        self.ports.iter().find(|entry| entry.matches(protocol, port))
    }

    pub fn netif(&self, name: &str) -> Option<&NetifContext> {
        self.netifs.iter().find(|entry| entry.name == name)
    }

    pub fn node(&self, addr: u32) -> Option<&NodeContext> {
        self.nodes.iter().find(|entry| entry.matches(addr))
    }

    /// Parses the object context lists, validating each context against `symbols`.
    pub(super) fn parse<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Self, PolicyCursor<'a>)> {
        let (initial, tail) =
            Self::parse_initial(cursor, symbols).context("parsing initial contexts")?;
        let (filesystems, tail) =
            Self::parse_filesystems(tail, symbols).context("parsing filesystem contexts")?;
        let (ports, tail) = Self::parse_ports(tail, symbols).context("parsing port contexts")?;
        let (netifs, tail) =
            Self::parse_netifs(tail, symbols).context("parsing network interface contexts")?;
        let (nodes, tail) = Self::parse_nodes(tail, symbols).context("parsing node contexts")?;
        Ok((Self { initial, filesystems, ports, netifs, nodes }, tail))
    }

    fn parse_initial<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Vec<InitialContext>, PolicyCursor<'a>)> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("initial context", count, 4 + MIN_CONTEXT_SIZE)?;
        let mut entries = Vec::with_capacity(count as usize);
        let mut seen = HashSet::new();
        for _ in 0..count {
            let (sid, next) = tail.parse_u32()?;
            if sid == 0 {
                let error = ValidateError::UndefinedReference { kind: "initial SID", value: 0 };
                return Err(error.into());
            }
            if !seen.insert(sid) {
                let error = ValidateError::DuplicateValue { kind: "initial SID", value: sid };
                return Err(error.into());
            }
            let (context, next) = parse_context(next, symbols)?;
            tail = next;
            entries.push(InitialContext { sid, context });
        }
        Ok((entries, tail))
    }

    fn parse_filesystems<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Vec<FsContext>, PolicyCursor<'a>)> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("filesystem context", count, 4 + 2 * MIN_CONTEXT_SIZE)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, next) = tail.parse_string()?;
            let (fs_context, next) = parse_context(next, symbols)?;
            let (file_context, next) = parse_context(next, symbols)?;
            tail = next;
            entries.push(FsContext { name, fs_context, file_context, sids: SidCache::default() });
        }
        Ok((entries, tail))
    }

    fn parse_ports<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Vec<PortContext>, PolicyCursor<'a>)> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("port context", count, 12 + MIN_CONTEXT_SIZE)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (key, next) = tail.parse_or_error::<PortKey>()?;
            let (low, high) = (key.low.get(), key.high.get());
            if low > high {
                return Err(ValidateError::InvalidPortRange { low, high }.into());
            }
            let (context, next) = parse_context(next, symbols)?;
            tail = next;
            entries.push(PortContext {
                protocol: key.protocol.get(),
                low,
                high,
                context,
                sid: SidCache::default(),
            });
        }
        Ok((entries, tail))
    }

    fn parse_netifs<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Vec<NetifContext>, PolicyCursor<'a>)> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("network interface context", count, 4 + 2 * MIN_CONTEXT_SIZE)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, next) = tail.parse_string()?;
            let (interface_context, next) = parse_context(next, symbols)?;
            let (message_context, next) = parse_context(next, symbols)?;
            tail = next;
            entries.push(NetifContext {
                name,
                interface_context,
                message_context,
                sids: SidCache::default(),
            });
        }
        Ok((entries, tail))
    }

    fn parse_nodes<'a>(
        cursor: PolicyCursor<'a>,
        symbols: &Symbols,
    ) -> anyhow::Result<(Vec<NodeContext>, PolicyCursor<'a>)> {
        let (count, mut tail) = cursor.parse_u32()?;
        tail.check_count("node context", count, 8 + MIN_CONTEXT_SIZE)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (key, next) = tail.parse_or_error::<NodeKey>()?;
            let (context, next) = parse_context(next, symbols)?;
            tail = next;
            entries.push(NodeContext {
                addr: key.addr.get(),
                mask: key.mask.get(),
                context,
                sid: SidCache::default(),
            });
        }
        Ok((entries, tail))
    }

    pub(super) fn write(&self, writer: &mut PolicyWriter) {
        writer.write_u32(self.initial.len() as u32);
        for entry in self.initial.iter() {
            writer.write_u32(entry.sid);
            entry.context.write(writer);
        }
        writer.write_u32(self.filesystems.len() as u32);
        for entry in self.filesystems.iter() {
            writer.write_string(&entry.name);
            entry.fs_context.write(writer);
            entry.file_context.write(writer);
        }
        writer.write_u32(self.ports.len() as u32);
        for entry in self.ports.iter() {
            writer.write(&PortKey {
                protocol: le::U32::new(entry.protocol),
                low: le::U32::new(entry.low),
                high: le::U32::new(entry.high),
            });
            entry.context.write(writer);
        }
        writer.write_u32(self.netifs.len() as u32);
        for entry in self.netifs.iter() {
            writer.write_string(&entry.name);
            entry.interface_context.write(writer);
            entry.message_context.write(writer);
        }
        writer.write_u32(self.nodes.len() as u32);
        for entry in self.nodes.iter() {
            writer
                .write(&NodeKey { addr: le::U32::new(entry.addr), mask: le::U32::new(entry.mask) });
            entry.context.write(writer);
        }
    }
}
