//-
// Copyright (c) 2024, the spfcheck developers
//
// This file is part of spfcheck.
//
// Spfcheck is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Spfcheck is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with spfcheck. If not, see <http://www.gnu.org/licenses/>.

//! An in-memory [`Resolver`] over declarative zone data, standing in for a
//! live nameserver in tests.
//!
//! Names absent from the zone behave as NXDOMAIN; names marked broken fail
//! transiently; names present with empty record sets behave as RCODE 0
//! answers with no records.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use crate::support::dns::{DnsError, IpMatcher, Resolver};

#[derive(Clone, Debug, Default)]
pub(crate) struct MockResolver {
    txt: HashMap<String, Vec<String>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
    aaaa: HashMap<String, Vec<Ipv6Addr>>,
    mx: HashMap<String, Vec<String>>,
    broken: HashSet<String>,
}

/// Lookup keys are case-insensitive and ignore the root dot, like real
/// DNS.
fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl MockResolver {
    pub fn new() -> Self {
        MockResolver::default()
    }

    pub fn txt(mut self, name: &str, record: &str) -> Self {
        self.txt.entry(key(name)).or_default().push(record.to_owned());
        self
    }

    /// Adds one TXT record built from multiple character-strings; the
    /// resolver contract is that they arrive concatenated.
    pub fn txt_segments(self, name: &str, segments: &[&str]) -> Self {
        self.txt(name, &segments.concat())
    }

    /// Marks `name` as existing with no TXT records at all.
    pub fn no_txt(mut self, name: &str) -> Self {
        self.txt.entry(key(name)).or_default();
        self
    }

    pub fn a(mut self, name: &str, addr: impl Into<Ipv4Addr>) -> Self {
        self.a.entry(key(name)).or_default().push(addr.into());
        self
    }

    pub fn aaaa(mut self, name: &str, addr: &str) -> Self {
        self.aaaa
            .entry(key(name))
            .or_default()
            .push(addr.parse().unwrap());
        self
    }

    pub fn mx(mut self, name: &str, host: &str) -> Self {
        self.mx.entry(key(name)).or_default().push(host.to_owned());
        self
    }

    /// Makes every lookup of `name` fail transiently.
    pub fn broken(mut self, name: &str) -> Self {
        self.broken.insert(key(name));
        self
    }

    fn check_broken(&self, name: &str) -> Result<(), DnsError> {
        if self.broken.contains(&key(name)) {
            Err(DnsError::Transient)
        } else {
            Ok(())
        }
    }

    fn addresses_match(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        self.check_broken(name)?;

        let name = key(name);
        let a = self.a.get(&name);
        let aaaa = self.aaaa.get(&name);
        if a.is_none() && aaaa.is_none() {
            return Err(DnsError::Permanent);
        }

        let v4 = a
            .into_iter()
            .flatten()
            .any(|&addr| matcher(IpAddr::V4(addr)));
        let v6 = aaaa
            .into_iter()
            .flatten()
            .any(|&addr| matcher(IpAddr::V6(addr)));
        Ok(v4 || v6)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.check_broken(name)?;
        match self.txt.get(&key(name)) {
            Some(records) => Ok(records.clone()),
            None => Err(DnsError::Permanent),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, DnsError> {
        self.check_broken(name)?;
        match self.a.get(&key(name)) {
            Some(records) => Ok(!records.is_empty()),
            None => Err(DnsError::Permanent),
        }
    }

    async fn match_ip(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        self.addresses_match(name, matcher)
    }

    async fn match_mx(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        self.check_broken(name)?;
        let hosts = match self.mx.get(&key(name)) {
            Some(hosts) => hosts,
            None => return Err(DnsError::Permanent),
        };

        for host in hosts {
            if self.addresses_match(host, matcher)? {
                return Ok(true);
            }
        }

        Ok(false)
    }
}
