// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// Structured errors that may be encountered parsing a binary policy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("expected {type_size} bytes for {type_name} but found {num_bytes}")]
    MissingData { type_name: &'static str, type_size: usize, num_bytes: usize },
    #[error("expected {num_items} x {type_size} bytes for {type_name} but found {num_bytes}")]
    MissingSliceData {
        type_name: &'static str,
        type_size: usize,
        num_items: usize,
        num_bytes: usize,
    },
    #[error("expected magic {expected:#x} but found {found:#x}")]
    InvalidMagic { expected: u32, found: u32 },
    #[error("expected policy format version {expected} but found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("policy MLS setting ({policy}) is incompatible with the engine ({engine})")]
    MlsConfigMismatch { policy: bool, engine: bool },
    #[error("unknown policy configuration bits {bits:#x}")]
    InvalidConfig { bits: u32 },
    #[error("expected {expected} {kind} but found {found}")]
    InvalidCount { kind: &'static str, expected: u32, found: u32 },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("extensible bitmap map size {found} differs from the supported size {expected}")]
    InvalidBitmapMapSize { expected: u32, found: u32 },
    #[error("extensible bitmap node at bit {start_bit} is misaligned or out of order")]
    InvalidBitmapNodeOrder { start_bit: u32 },
    #[error("extensible bitmap node at bit {start_bit} has an empty word")]
    EmptyBitmapNode { start_bit: u32 },
    #[error("extensible bitmap high bit {found} should be {expected}")]
    InvalidBitmapHighBit { expected: u32, found: u32 },
    #[error("access vector rule declares {declared} fields but carries {found}")]
    FieldCountMismatch { declared: u32, found: u32 },
    #[error("access vector rule specifies unsupported kinds {specified:#x}")]
    UnsupportedRuleKind { specified: u32 },
    #[error("invalid default behavior value {value}")]
    InvalidDefaultBehavior { value: u32 },
    #[error("{num_bytes} bytes remain after the end of the policy")]
    TrailingData { num_bytes: usize },
}

/// Structured errors that may be encountered validating a parsed policy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidateError {
    #[error("{kind} value {value} is outside 1..={max}")]
    ValueOutOfRange { kind: &'static str, value: u32, max: u32 },
    #[error("duplicate {kind} value {value}")]
    DuplicateValue { kind: &'static str, value: u32 },
    #[error("duplicate {kind} name {name:?}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("class {class:?} inherits undefined common {common:?}")]
    UnknownCommon { class: String, common: String },
    #[error("reference to undefined {kind} value {value}")]
    UndefinedReference { kind: &'static str, value: u32 },
    #[error("port range {low}-{high} is empty")]
    InvalidPortRange { low: u32, high: u32 },
    #[error("class {name:?} is missing from the new policy")]
    ClassMissing { name: String },
    #[error("class {name:?} changed value from {old} to {new}")]
    ClassValueChanged { name: String, old: u32, new: u32 },
    #[error("permission {permission:?} of class {class:?} changed")]
    PermissionChanged { class: String, permission: String },
    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Structured errors that may be encountered querying a policy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum QueryError {
    #[error("the class {name:?} does not exist in policy")]
    UnknownClass { name: String },
    #[error("the permission {permission:?} does not exist on class {class:?}")]
    UnknownPermission { class: String, permission: String },
}
