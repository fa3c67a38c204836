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

//! The DNS capability the SPF evaluator runs against.
//!
//! The evaluator only ever sees the four operations of [`Resolver`] and the
//! three-way error taxonomy of [`DnsError`]; everything transport-specific
//! (sockets, retries, timeouts, RCODE handling) stays behind the trait.
//! [`LimitedResolver`] decorates any resolver with the RFC 7208 § 4.6.4
//! lookup budget shared across an entire recursive evaluation.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_resolver::config::{
    NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

/// How a DNS-level outcome is reported to the evaluator.
///
/// RFC 7208 § 4.3–4.4: NXDOMAIN is a permanent condition, while transport
/// failures, timeouts, and any RCODE other than 0 or 3 are transient. An
/// RCODE 0 answer with no matching records is not an error at all and is
/// reported as an operation-specific empty success instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("temporary DNS error")]
    Transient,
    #[error("permanent DNS error")]
    Permanent,
    #[error("DNS lookup limit exceeded")]
    LimitExceeded,
}

/// Predicate applied to each address produced by [`Resolver::match_ip`] and
/// [`Resolver::match_mx`], so that callers can express "does this host
/// resolve to an address covered by this network?" without seeing raw
/// address lists.
pub type IpMatcher<'a> = &'a (dyn Fn(IpAddr) -> bool + Send + Sync);

/// The narrow DNS interface the SPF evaluator depends on.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns the TXT records of `name`, in resolver order, with each
    /// record's character-strings concatenated without separators.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// Returns whether `name` has at least one A record. Per RFC 7208
    /// § 5.7 the A lookup is used even when the client connected over
    /// IPv6.
    async fn exists(&self, name: &str) -> Result<bool, DnsError>;

    /// Resolves the A and AAAA records of `name` and returns whether any
    /// of the addresses satisfies `matcher`.
    async fn match_ip(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError>;

    /// Performs an MX lookup on `name`, then an address lookup on each MX
    /// host, and returns whether any of the addresses satisfies `matcher`.
    async fn match_mx(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for &R {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        (**self).lookup_txt(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, DnsError> {
        (**self).exists(name).await
    }

    async fn match_ip(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        (**self).match_ip(name, matcher).await
    }

    async fn match_mx(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        (**self).match_mx(name, matcher).await
    }
}

/// Decorates a [`Resolver`] with the RFC 7208 § 4.6.4 lookup budget.
///
/// The counter is shared by every query of one recursive evaluation,
/// including those issued concurrently by a single mechanism's A/AAAA or
/// per-MX fan-out, so it is decremented atomically. Once the budget is
/// spent, every further call fails with [`DnsError::LimitExceeded`] without
/// reaching the wrapped resolver.
pub struct LimitedResolver<R> {
    limit: AtomicI32,
    resolver: R,
}

impl<R: Resolver> LimitedResolver<R> {
    pub fn new(resolver: R, limit: i32) -> Self {
        LimitedResolver {
            limit: AtomicI32::new(limit),
            resolver,
        }
    }

    fn check_and_decrement(&self) -> Result<(), DnsError> {
        let mut seen = self.limit.load(Ordering::Relaxed);
        loop {
            if seen < 1 {
                return Err(DnsError::LimitExceeded);
            }

            match self.limit.compare_exchange_weak(
                seen,
                seen - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => seen = actual,
            }
        }
    }
}

#[async_trait]
impl<R: Resolver> Resolver for LimitedResolver<R> {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.check_and_decrement()?;
        self.resolver.lookup_txt(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, DnsError> {
        self.check_and_decrement()?;
        self.resolver.exists(name).await
    }

    async fn match_ip(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        self.check_and_decrement()?;
        self.resolver.match_ip(name, matcher).await
    }

    async fn match_mx(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        self.check_and_decrement()?;
        self.resolver.match_mx(name, matcher).await
    }
}

/// A [`Resolver`] backed by `hickory-resolver` pointed at a single UDP
/// nameserver.
///
/// Every evaluation constructs its own instance, so nothing is cached
/// across evaluations. Timeout behaviour is whatever the underlying
/// resolver does; the evaluator sees it as [`DnsError::Transient`].
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(dns_addr: SocketAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(dns_addr, Protocol::Udp));

        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.cache_size = 0;

        HickoryResolver {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    async fn match_a(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().any(|a| matcher(IpAddr::V4(a.0)))),
            Err(e) => empty_or(e, false),
        }
    }

    async fn match_aaaa(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        match self.resolver.ipv6_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().any(|a| matcher(IpAddr::V6(a.0)))),
            Err(e) => empty_or(e, false),
        }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|record| {
                    let len = record.iter().map(|part| part.len()).sum();
                    let mut combined = Vec::with_capacity(len);
                    for part in record.iter() {
                        combined.extend_from_slice(part);
                    }

                    String::from_utf8_lossy(&combined).into_owned()
                })
                .collect()),
            Err(e) => empty_or(e, Vec::new()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, DnsError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(e) => empty_or(e, false),
        }
    }

    async fn match_ip(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        // The two address families are queried concurrently; a positive
        // match from either side wins over an error from the other.
        let (a, aaaa) = tokio::join!(
            self.match_a(name, matcher),
            self.match_aaaa(name, matcher),
        );

        match (a, aaaa) {
            (Ok(true), _) | (_, Ok(true)) => Ok(true),
            (Err(e), _) | (_, Err(e)) => Err(e),
            _ => Ok(false),
        }
    }

    async fn match_mx(
        &self,
        name: &str,
        matcher: IpMatcher<'_>,
    ) -> Result<bool, DnsError> {
        let hosts = match self.resolver.mx_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .map(|mx| mx.exchange().to_ascii())
                .collect::<Vec<_>>(),
            Err(e) => return empty_or(e, false),
        };

        // One address-matching worker per MX host, funnelled into a single
        // stream; the first positive match (or first error) settles the
        // whole mechanism.
        let mut hits = hosts
            .iter()
            .map(|host| self.match_ip(host, matcher))
            .collect::<FuturesUnordered<_>>();
        while let Some(hit) = hits.next().await {
            if hit != Ok(false) {
                return hit;
            }
        }

        Ok(false)
    }
}

/// Maps a hickory error into the SPF error taxonomy, with `empty` standing
/// in for the RCODE 0, no-records case.
fn empty_or<T>(e: ResolveError, empty: T) -> Result<T, DnsError> {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound {
            response_code: ResponseCode::NXDomain,
            ..
        } => Err(DnsError::Permanent),
        ResolveErrorKind::NoRecordsFound { .. } => Ok(empty),
        _ => Err(DnsError::Transient),
    }
}

/// Validates `s` against the RFC 1035 / RFC 3696 rules for domain names:
/// at most 255 octets in total, labels of 1 to 63 octets, no dot or dash
/// adjacency violations, and at least one letter somewhere (a purely
/// numeric name is an address, not a domain).
pub fn is_domain_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }

    let mut last = b'.';
    let mut seen_letter = false;
    let mut label_len = 0usize;
    for &c in s.as_bytes() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                seen_letter = true;
                label_len += 1;
            },
            b'0'..=b'9' => {
                label_len += 1;
            },
            b'-' => {
                // A label cannot start with a dash.
                if last == b'.' {
                    return false;
                }
                label_len += 1;
            },
            b'.' => {
                if last == b'.' || last == b'-' {
                    return false;
                }
                if label_len > 63 {
                    return false;
                }
                label_len = 0;
            },
            _ => return false,
        }
        last = c;
    }

    if last == b'-' || label_len > 63 {
        return false;
    }

    seen_letter
}

/// Appends the root dot to `name` if it does not already carry one.
pub fn normalize_fqdn(name: &str) -> Cow<'_, str> {
    if name.is_empty() || name.ends_with('.') {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}."))
    }
}
