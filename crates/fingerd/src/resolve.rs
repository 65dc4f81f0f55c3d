// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System lookups behind injectable seams: reverse resolution of agent
//! peers and password-database details for users.

use std::collections::HashMap;
use std::net::IpAddr;

/// Reverse-resolves an agent peer to a hostname.
pub trait PeerResolver {
    /// Best-effort reverse lookup; `None` when the address has no name.
    fn hostname(&self, ip: IpAddr) -> Option<String>;
}

/// Production resolver backed by the system resolver.
pub struct DnsResolver;

impl PeerResolver for DnsResolver {
    fn hostname(&self, ip: IpAddr) -> Option<String> {
        dns_lookup::lookup_addr(&ip).ok()
    }
}

/// Fixed address-to-name table. Used by tests and by deployments that pin
/// agent names instead of trusting reverse DNS.
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new(names: HashMap<IpAddr, String>) -> Self {
        Self { names }
    }
}

impl PeerResolver for StaticResolver {
    fn hostname(&self, ip: IpAddr) -> Option<String> {
        self.names.get(&ip).cloned()
    }
}

/// The machine identifier is the host part of the FQDN: everything up to
/// the first dot.
pub fn short_hostname(name: &str) -> &str {
    match name.split_once('.') {
        Some((host, _)) => host,
        None => name,
    }
}

/// Details resolved once from the password database when a user is first
/// seen. Absence is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GecosInfo {
    pub fullname: Option<String>,
    pub add_info: Option<String>,
}

/// Looks up gecos details for a username.
pub trait UserDirectory {
    fn lookup(&self, username: &str) -> Option<GecosInfo>;
}

/// Production directory backed by the system password database.
pub struct SystemDirectory;

impl UserDirectory for SystemDirectory {
    fn lookup(&self, username: &str) -> Option<GecosInfo> {
        let user = nix::unistd::User::from_name(username).ok().flatten()?;
        Some(split_gecos(&user.gecos.to_string_lossy()))
    }
}

/// Directory that knows nobody.
pub struct NullDirectory;

impl UserDirectory for NullDirectory {
    fn lookup(&self, _username: &str) -> Option<GecosInfo> {
        None
    }
}

/// Fixed username-to-gecos table for tests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, GecosInfo>,
}

impl StaticDirectory {
    pub fn new(entries: HashMap<String, GecosInfo>) -> Self {
        Self { entries }
    }
}

impl UserDirectory for StaticDirectory {
    fn lookup(&self, username: &str) -> Option<GecosInfo> {
        self.entries.get(username).cloned()
    }
}

/// Split a gecos field: the full name runs to the first comma, anything
/// after it is auxiliary info.
pub fn split_gecos(gecos: &str) -> GecosInfo {
    let (fullname, add_info) = match gecos.split_once(',') {
        Some((name, rest)) => (name, rest),
        None => (gecos, ""),
    };
    GecosInfo {
        fullname: (!fullname.is_empty()).then(|| fullname.to_owned()),
        add_info: (!add_info.is_empty()).then(|| add_info.to_owned()),
    }
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
