// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assembles small policies in memory and serializes them, so that tests exercise the same
//! reader as real policies.

use super::avtab::{AvTab, AvTabDatum, AvTabKey};
use super::constraints::{Constraint, ConstraintExpr};
use super::extensible_bitmap::ExtensibleBitmap;
use super::index::{SymbolTable, Symbols};
use super::metadata::{Config, Header};
use super::mls::BaseFlows;
use super::parsed_policy::{DefaultBehavior, DefaultValue, ParsedPolicy};
use super::parser::PolicyWriter;
use super::security_context::{parse_range, SecurityContext};
use super::symbols::{
    Category, Class, CommonSymbol, Permission, Permissions, Role, Sensitivity, Type, User,
};
use super::{AccessVector, ClassId, TypeId, Write};
use crate::InitialSid;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

struct ClassSpec {
    name: String,
    common: Option<String>,
    permissions: Vec<String>,
    read: Vec<String>,
    write: Vec<String>,
    constraints: Vec<(Vec<String>, ConstraintExpr)>,
}

#[derive(Default)]
struct RuleSpec {
    allowed: Option<Vec<String>>,
    audit_allow: Option<Vec<String>>,
    dont_audit: Option<Vec<String>>,
    notify: Option<Vec<String>>,
    transition: Option<String>,
    member: Option<String>,
}

/// Builds a policy from names. Values are assigned in declaration order, starting at 1.
///
/// Unless overridden, nothing is allowed by default, nothing is audited when allowed, and every
/// denial is audited.
pub(crate) struct PolicyBuilder {
    mls: bool,
    commons: Vec<(String, Vec<String>)>,
    classes: Vec<ClassSpec>,
    sensitivities: Vec<(String, Vec<String>)>,
    categories: Vec<String>,
    types: Vec<String>,
    roles: Vec<(String, Vec<String>, Vec<String>)>,
    users: Vec<(String, Vec<String>, String)>,
    rules: BTreeMap<(String, String, String), RuleSpec>,
    default_allowed: (DefaultValue, Vec<String>),
    initial: Vec<(InitialSid, String)>,
    filesystems: Vec<(String, String, String)>,
    ports: Vec<(u32, u32, u32, String)>,
    netifs: Vec<(String, String, String)>,
    nodes: Vec<(u32, u32, String)>,
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn value_of(names: &[String], name: &str) -> u32 {
    let index = names.iter().position(|n| n == name).unwrap_or_else(|| panic!("unknown {name:?}"));
    index as u32 + 1
}

impl PolicyBuilder {
    pub(crate) fn new() -> Self {
        Self {
            mls: false,
            commons: vec![],
            classes: vec![],
            sensitivities: vec![],
            categories: vec![],
            types: vec![],
            roles: vec![],
            users: vec![],
            rules: BTreeMap::new(),
            default_allowed: (DefaultValue::None, vec![]),
            initial: vec![],
            filesystems: vec![],
            ports: vec![],
            netifs: vec![],
            nodes: vec![],
        }
    }

    pub(crate) fn new_mls() -> Self {
        Self { mls: true, ..Self::new() }
    }

    pub(crate) fn common(mut self, name: &str, permissions: &[&str]) -> Self {
        self.commons.push((name.to_string(), names(permissions)));
        self
    }

    pub(crate) fn class(self, name: &str, permissions: &[&str]) -> Self {
        self.add_class(name, None, permissions)
    }

    pub(crate) fn class_with_common(self, name: &str, common: &str, permissions: &[&str]) -> Self {
        self.add_class(name, Some(common), permissions)
    }

    fn add_class(mut self, name: &str, common: Option<&str>, permissions: &[&str]) -> Self {
        self.classes.push(ClassSpec {
            name: name.to_string(),
            common: common.map(str::to_string),
            permissions: names(permissions),
            read: vec![],
            write: vec![],
            constraints: vec![],
        });
        self
    }

    fn class_spec(&mut self, name: &str) -> &mut ClassSpec {
        self.classes
            .iter_mut()
            .find(|class| class.name == name)
            .unwrap_or_else(|| panic!("unknown class {name:?}"))
    }

    /// Marks the permissions of `class` that read from and write to the target.
    pub(crate) fn flows(mut self, class: &str, read: &[&str], write: &[&str]) -> Self {
        let spec = self.class_spec(class);
        spec.read = names(read);
        spec.write = names(write);
        self
    }

    pub(crate) fn constraint(
        mut self,
        class: &str,
        permissions: &[&str],
        expr: ConstraintExpr,
    ) -> Self {
        self.class_spec(class).constraints.push((names(permissions), expr));
        self
    }

    /// Adds a sensitivity, above those already added, allowing the named categories.
    pub(crate) fn sensitivity(mut self, name: &str, categories: &[&str]) -> Self {
        self.sensitivities.push((name.to_string(), names(categories)));
        self
    }

    pub(crate) fn categories(mut self, categories: &[&str]) -> Self {
        self.categories.extend(names(categories));
        self
    }

    pub(crate) fn types(mut self, types: &[&str]) -> Self {
        self.types.extend(names(types));
        self
    }

    pub(crate) fn role(mut self, name: &str, types: &[&str]) -> Self {
        self.roles.push((name.to_string(), names(types), vec![]));
        self
    }

    pub(crate) fn role_dominating(mut self, name: &str, types: &[&str], roles: &[&str]) -> Self {
        self.roles.push((name.to_string(), names(types), names(roles)));
        self
    }

    /// Adds a user authorized for `roles` and, in MLS policies, for `range`.
    pub(crate) fn user(mut self, name: &str, roles: &[&str], range: &str) -> Self {
        self.users.push((name.to_string(), names(roles), range.to_string()));
        self
    }

    fn rule(&mut self, source: &str, target: &str, class: &str) -> &mut RuleSpec {
        self.rules
            .entry((source.to_string(), target.to_string(), class.to_string()))
            .or_default()
    }

    pub(crate) fn allow(mut self, source: &str, target: &str, class: &str, perms: &[&str]) -> Self {
        self.rule(source, target, class).allowed = Some(names(perms));
        self
    }

    pub(crate) fn audit_allow(
        mut self,
        source: &str,
        target: &str,
        class: &str,
        perms: &[&str],
    ) -> Self {
        self.rule(source, target, class).audit_allow = Some(names(perms));
        self
    }

    pub(crate) fn dont_audit(
        mut self,
        source: &str,
        target: &str,
        class: &str,
        perms: &[&str],
    ) -> Self {
        self.rule(source, target, class).dont_audit = Some(names(perms));
        self
    }

    pub(crate) fn notify(
        mut self,
        source: &str,
        target: &str,
        class: &str,
        perms: &[&str],
    ) -> Self {
        self.rule(source, target, class).notify = Some(names(perms));
        self
    }

    pub(crate) fn type_transition(
        mut self,
        source: &str,
        target: &str,
        class: &str,
        new_type: &str,
    ) -> Self {
        self.rule(source, target, class).transition = Some(new_type.to_string());
        self
    }

    pub(crate) fn type_member(
        mut self,
        source: &str,
        target: &str,
        class: &str,
        new_type: &str,
    ) -> Self {
        self.rule(source, target, class).member = Some(new_type.to_string());
        self
    }

    pub(crate) fn default_allowed(mut self, value: DefaultValue, excluded: &[&str]) -> Self {
        self.default_allowed = (value, names(excluded));
        self
    }

    pub(crate) fn initial_context(mut self, sid: InitialSid, context: &str) -> Self {
        self.initial.push((sid, context.to_string()));
        self
    }

    pub(crate) fn filesystem(mut self, name: &str, fs: &str, file: &str) -> Self {
        self.filesystems.push((name.to_string(), fs.to_string(), file.to_string()));
        self
    }

    pub(crate) fn port(mut self, protocol: u32, low: u32, high: u32, context: &str) -> Self {
        self.ports.push((protocol, low, high, context.to_string()));
        self
    }

    pub(crate) fn netif(mut self, name: &str, interface: &str, message: &str) -> Self {
        self.netifs.push((name.to_string(), interface.to_string(), message.to_string()));
        self
    }

    pub(crate) fn node(mut self, addr: Ipv4Addr, mask: Ipv4Addr, context: &str) -> Self {
        self.nodes.push((u32::from(addr), u32::from(mask), context.to_string()));
        self
    }

    /// The configuration the policy is written with.
    pub(crate) fn config(&self) -> Config {
        Config { mls: self.mls, audit: true, notify: true }
    }

    /// Returns the mask of the named permissions of `class`, including inherited permissions.
    fn mask(&self, class: &str, permissions: &[String]) -> AccessVector {
        let spec = self
            .classes
            .iter()
            .find(|spec| spec.name == class)
            .unwrap_or_else(|| panic!("unknown class {class:?}"));
        let mut all = spec
            .common
            .as_ref()
            .map(|common| {
                self.commons.iter().find(|(name, _)| name == common).expect("common").1.clone()
            })
            .unwrap_or_default();
        all.extend(spec.permissions.iter().cloned());
        permissions.iter().fold(AccessVector::NONE, |mask, permission| {
            mask | AccessVector::from_raw(1 << (value_of(&all, permission) - 1))
        })
    }

    fn bitmap(all: &[String], selected: &[String]) -> ExtensibleBitmap {
        selected.iter().map(|name| value_of(all, name) - 1).collect()
    }

    fn symbols(&self) -> Symbols {
        let permissions = |first_value: usize, names: &[String]| {
            let permissions = names
                .iter()
                .enumerate()
                .map(|(i, name)| Permission {
                    name: name.clone(),
                    value: (first_value + i) as u32,
                })
                .collect();
            Permissions::new(names.len() as u32, permissions).expect("valid permissions")
        };

        let commons = self
            .commons
            .iter()
            .enumerate()
            .map(|(i, (name, perms))| CommonSymbol {
                name: name.clone(),
                value: i as u32 + 1,
                permissions: permissions(1, perms),
            })
            .collect::<Vec<_>>();

        let classes = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let inherited = spec
                    .common
                    .as_ref()
                    .and_then(|common| self.commons.iter().find(|(name, _)| name == common))
                    .map_or(0, |(_, perms)| perms.len());
                let constraints = spec
                    .constraints
                    .iter()
                    .map(|(perms, expr)| Constraint {
                        permissions: self.mask(&spec.name, perms),
                        expr: expr.clone(),
                    })
                    .collect();
                let flows = self.mls.then(|| BaseFlows {
                    read: self.mask(&spec.name, &spec.read),
                    write: self.mask(&spec.name, &spec.write),
                    ..Default::default()
                });
                Class {
                    name: spec.name.clone(),
                    value: i as u32 + 1,
                    common: spec.common.clone(),
                    permissions: permissions(inherited + 1, &spec.permissions),
                    constraints,
                    flows,
                }
            })
            .collect::<Vec<_>>();

        let role_names: Vec<String> = self.roles.iter().map(|(name, _, _)| name.clone()).collect();
        let roles = self
            .roles
            .iter()
            .enumerate()
            .map(|(i, (name, types, dominates))| Role {
                name: name.clone(),
                value: i as u32 + 1,
                dominates: Self::bitmap(&role_names, dominates),
                types: Self::bitmap(&self.types, types),
            })
            .collect::<Vec<_>>();

        let types = self
            .types
            .iter()
            .enumerate()
            .map(|(i, name)| Type { name: name.clone(), value: i as u32 + 1 })
            .collect::<Vec<_>>();

        let sensitivities = self
            .sensitivities
            .iter()
            .enumerate()
            .map(|(i, (name, categories))| Sensitivity {
                name: name.clone(),
                value: i as u32 + 1,
                categories: Self::bitmap(&self.categories, categories),
            })
            .collect::<Vec<_>>();

        let categories = self
            .categories
            .iter()
            .enumerate()
            .map(|(i, name)| Category { name: name.clone(), value: i as u32 + 1 })
            .collect::<Vec<_>>();

        let table = |len: usize| len as u32;
        let mut symbols = Symbols {
            mls: self.mls,
            commons: SymbolTable::new(table(commons.len()), commons).expect("commons"),
            classes: SymbolTable::new(table(classes.len()), classes).expect("classes"),
            roles: SymbolTable::new(table(roles.len()), roles).expect("roles"),
            types: SymbolTable::new(table(types.len()), types).expect("types"),
            users: SymbolTable::default(),
            sensitivities: SymbolTable::new(table(sensitivities.len()), sensitivities)
                .expect("sensitivities"),
            categories: SymbolTable::new(table(categories.len()), categories).expect("categories"),
        };

        let users = self
            .users
            .iter()
            .enumerate()
            .map(|(i, (name, roles, range))| User {
                name: name.clone(),
                value: i as u32 + 1,
                roles: Self::bitmap(&role_names, roles),
                ranges: if self.mls {
                    vec![parse_range(&symbols, range).expect("valid user range")]
                } else {
                    vec![]
                },
            })
            .collect::<Vec<_>>();
        symbols.users = SymbolTable::new(table(users.len()), users).expect("users");
        symbols
    }

    fn avtab(&self) -> AvTab {
        let class_names: Vec<String> = self.classes.iter().map(|spec| spec.name.clone()).collect();
        let type_id = |name: &str| TypeId::from_u32(value_of(&self.types, name)).expect("type");
        let mut avtab = AvTab::new();
        for ((source, target, class), rule) in self.rules.iter() {
            let mask = |perms: &Option<Vec<String>>| {
                perms.as_ref().map(|perms| self.mask(class, perms))
            };
            let key = AvTabKey {
                source_type: type_id(source),
                target_type: type_id(target),
                class: ClassId::from_u32(value_of(&class_names, class)).expect("class"),
            };
            let datum = AvTabDatum {
                allowed: mask(&rule.allowed),
                transition: rule.transition.as_deref().map(type_id),
                audit_allow: mask(&rule.audit_allow),
                audit_deny: mask(&rule.dont_audit).map(|mask| !mask),
                notify: mask(&rule.notify),
                member: rule.member.as_deref().map(type_id),
            };
            avtab.insert(key, datum).expect("unique rule");
        }
        avtab
    }

    /// Serializes the policy.
    pub(crate) fn bytes(&self) -> Vec<u8> {
        let config = self.config();
        let symbols = self.symbols();
        let class_names: Vec<String> = self.classes.iter().map(|spec| spec.name.clone()).collect();
        let context = |text: &str| {
            SecurityContext::parse_str(&symbols, text.as_bytes())
                .unwrap_or_else(|error| panic!("invalid context {text:?}: {error}"))
        };

        let mut writer = PolicyWriter::new(config);
        Header::new(&config).write(&mut writer);
        if config.mls {
            writer.write_u32(self.sensitivities.len() as u32);
        }
        symbols.write(&mut writer);

        let (value, excluded) = &self.default_allowed;
        let behaviors = [
            (*value, Self::bitmap(&class_names, excluded)),
            (DefaultValue::None, ExtensibleBitmap::new()),
            (DefaultValue::All, ExtensibleBitmap::new()),
            (DefaultValue::None, ExtensibleBitmap::new()),
        ];
        for (value, excluded_classes) in behaviors {
            DefaultBehavior { value, excluded_classes }.write(&mut writer);
        }

        self.avtab().write(&mut writer);

        writer.write_u32(self.initial.len() as u32);
        for (sid, text) in self.initial.iter() {
            writer.write_u32(*sid as u32);
            context(text).write(&mut writer);
        }
        writer.write_u32(self.filesystems.len() as u32);
        for (name, fs, file) in self.filesystems.iter() {
            writer.write_string(name);
            context(fs).write(&mut writer);
            context(file).write(&mut writer);
        }
        writer.write_u32(self.ports.len() as u32);
        for (protocol, low, high, text) in self.ports.iter() {
            writer.write_u32(*protocol);
            writer.write_u32(*low);
            writer.write_u32(*high);
            context(text).write(&mut writer);
        }
        writer.write_u32(self.netifs.len() as u32);
        for (name, interface, message) in self.netifs.iter() {
            writer.write_string(name);
            context(interface).write(&mut writer);
            context(message).write(&mut writer);
        }
        writer.write_u32(self.nodes.len() as u32);
        for (addr, mask, text) in self.nodes.iter() {
            writer.write_u32(*addr);
            writer.write_u32(*mask);
            context(text).write(&mut writer);
        }
        writer.into_inner()
    }

    /// Serializes the policy and parses it back, with an engine matching the policy's features.
    pub(crate) fn build(&self) -> ParsedPolicy {
        ParsedPolicy::parse(&self.bytes(), self.config()).expect("valid test policy")
    }
}
