// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod permission_check;
pub mod policy;
pub mod security_server;
pub mod sid_table;

pub use security_server::{SecurityServer, ServerError};

mod access_vector_cache;
mod sync;

use std::num::NonZeroU32;

/// The Security ID (SID) used internally to refer to a security context.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SecurityId(NonZeroU32);

impl SecurityId {
    /// Returns a `SecurityId` encoding the specified initial Security Context.
    /// These are used when labeling resources created before policy load, allowing the policy to
    /// determine the Security Context to use.
    pub fn initial(initial_sid: InitialSid) -> Self {
        // Every `InitialSid` discriminant is non-zero.
        Self(NonZeroU32::new(initial_sid as u32).unwrap_or(NonZeroU32::MIN))
    }

    /// Returns the `SecurityId` with the given raw value, or `None` for zero.
    pub fn from_u32(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn as_u32(&self) -> u32 {
        self.0.get()
    }
}

/// Initial Security Identifier (SID) values defined by the SELinux Reference Policy.
#[repr(u64)]
enum ReferenceInitialSid {
    Kernel = 1,
    Security = 2,
    Unlabeled = 3,
    Fs = 4,
    File = 5,
    AnySocket = 6,
    Port = 7,
    Netif = 8,
    Netmsg = 9,
    Node = 10,

    FirstUnused,
}

/// Lowest Security Identifier value guaranteed not to be used by this
/// implementation to refer to an initial Security Context.
pub const FIRST_UNUSED_SID: u32 = ReferenceInitialSid::FirstUnused as u32;

macro_rules! initial_sid_enum {
    ($(#[$meta:meta])* $name:ident {
        $($(#[$variant_meta:meta])* $variant:ident ($variant_name: literal)),*,
    }) => {
        $(#[$meta])*
        pub enum $name {
            $($(#[$variant_meta])* $variant = ReferenceInitialSid::$variant as isize),*
        }

        impl $name {
            pub fn all_variants() -> Vec<Self> {
                vec![
                    $($name::$variant),*
                ]
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $variant_name),*
                }
            }

            /// Returns the initial SID with the given numeric value, if any.
            pub fn from_u32(value: u32) -> Option<Self> {
                Self::all_variants().into_iter().find(|sid| *sid as u32 == value)
            }
        }
    }
}

initial_sid_enum! {
/// Initial Security Identifier (SID) values, used to label objects that exist before a policy is
/// loaded, and as the defaults returned by object-context lookups that match no entry.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    InitialSid {
        Kernel("kernel"),
        Security("security"),
        Unlabeled("unlabeled"),
        Fs("fs"),
        File("file"),
        AnySocket("any_socket"),
        Port("port"),
        Netif("netif"),
        Netmsg("netmsg"),
        Node("node"),
    }
}

/// Optional policy features supported by the running engine. A policy that declares a feature
/// the engine does not support is still loaded when the feature does not change the on-disk
/// layout of mandatory fields; its fields for that feature are read and discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Multi-level security ranges. A mismatch with the policy is always fatal.
    pub mls: bool,
    /// Audit-allow and audit-deny vectors.
    pub audit: bool,
    /// Notify vectors.
    pub notify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { mls: true, audit: true, notify: true }
    }
}

/// A borrowed byte slice that contains no `NUL` characters by truncating the input slice at the
/// first `NUL` (if any) upon construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NullessByteStr<'a>(&'a [u8]);

impl<'a> NullessByteStr<'a> {
    /// Returns a non-null-terminated representation of the security context string.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<'a, S: AsRef<[u8]> + ?Sized> From<&'a S> for NullessByteStr<'a> {
    /// Any `AsRef<[u8]>` can be processed into a [`NullessByteStr`]. The [`NullessByteStr`] will
    /// retain everything up to (but not including) a null character, or else the complete byte
    /// string.
    fn from(s: &'a S) -> Self {
        let value = s.as_ref();
        match value.iter().position(|c| *c == 0) {
            Some(end) => Self(&value[..end]),
            None => Self(value),
        }
    }
}
