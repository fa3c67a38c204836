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

//! Evaluation of a lexed policy against a client address.
//!
//! A [`Session`] is created per `check_host()` invocation (including each
//! `include`/`redirect` recursion). It classifies the token stream into the
//! ordered mechanism list plus the one-shot `redirect` and `exp` modifiers,
//! then walks the mechanisms left to right. The first mechanism that
//! matches ends the walk and its qualifier selects the verdict; a
//! non-matching mechanism leaves its verdict as the running result, which
//! is how `include` carries an inner `temperror`/`permerror` out to the
//! end of the list.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::debug;

use super::macros;
use super::syntax::{self, Qualifier, Token, TokenKind};
use super::{check_host_with, CheckHostResult, Error, SpfResult};
use crate::support::dns::{self, DnsError, Resolver};

/// The `(matched, verdict, error)` triple produced by each mechanism.
///
/// When `matched` is true the walk stops and the verdict stands; when it is
/// false the verdict becomes the running result of the session.
type MechResult = (bool, SpfResult, Option<Error>);

/// The evaluation state for one policy record.
pub(super) struct Session<'a> {
    sender: &'a str,
    domain: &'a str,
    ip: IpAddr,
    resolver: &'a dyn Resolver,
    mechanisms: Vec<Token>,
    redirect: Option<Token>,
    explanation: Option<Token>,
}

impl<'a> Session<'a> {
    pub(super) fn new(
        sender: &'a str,
        domain: &'a str,
        ip: IpAddr,
        resolver: &'a dyn Resolver,
    ) -> Self {
        Session {
            sender,
            domain,
            ip,
            resolver,
            mechanisms: Vec::new(),
            redirect: None,
            explanation: None,
        }
    }

    /// Evaluates the policy record `policy` and produces the session
    /// verdict, explanation, and diagnostic error.
    pub(super) async fn run(mut self, policy: &str) -> CheckHostResult {
        if let Some(error) = self.classify(syntax::lex(policy)) {
            return CheckHostResult {
                result: SpfResult::Permerror,
                explanation: None,
                error: Some(error),
            };
        }

        let mut result = SpfResult::None;
        let mut error = None;
        for token in &self.mechanisms {
            let (matched, verdict, err) = match token.kind {
                TokenKind::Version => self.eval_version(token),
                TokenKind::All => self.eval_all(token),
                TokenKind::Ip4 => self.eval_ip4(token),
                TokenKind::Ip6 => self.eval_ip6(token),
                TokenKind::Ptr => self.eval_ptr(token),
                TokenKind::A => self.eval_a(token).await,
                TokenKind::Mx => self.eval_mx(token).await,
                TokenKind::Include => self.eval_include(token).await,
                TokenKind::Exists => self.eval_exists(token).await,
                // Modifiers and error tokens never survive classification
                // into the mechanism list.
                _ => continue,
            };

            if matched {
                debug!(
                    "SPF {}: {} matched, verdict {}",
                    self.domain, token, verdict,
                );
                let explanation = if verdict == SpfResult::Fail {
                    self.build_explanation().await
                } else {
                    None
                };
                return CheckHostResult {
                    result: verdict,
                    explanation,
                    error: err,
                };
            }

            result = verdict;
            error = err;
        }

        self.handle_redirect(result, error).await
    }

    /// Separates the lexed tokens into the ordered mechanism list and the
    /// at-most-one `redirect` and `exp` modifiers.
    ///
    /// Mechanisms after an `all` are discarded, but modifier bookkeeping
    /// (including the duplicate check) still applies to everything after
    /// it. When an `all` is present the `redirect` modifier is
    /// meaningless and dropped; `exp` is kept.
    fn classify(&mut self, tokens: Vec<Token>) -> Option<Error> {
        let mut all = false;
        for token in tokens {
            if token.kind.is_err() {
                return Some(Error::Syntax {
                    token,
                    reason: "unrecognized term",
                });
            } else if token.kind.is_mechanism() && !all {
                if token.kind == TokenKind::All {
                    all = true;
                }
                self.mechanisms.push(token);
            } else if token.kind == TokenKind::Redirect {
                if self.redirect.is_some() {
                    return Some(Error::Syntax {
                        token,
                        reason: "more than one redirect modifier",
                    });
                }
                self.redirect = Some(token);
            } else if token.kind == TokenKind::Exp {
                if self.explanation.is_some() {
                    return Some(Error::Syntax {
                        token,
                        reason: "more than one exp modifier",
                    });
                }
                self.explanation = Some(token);
            }
        }

        if all {
            self.redirect = None;
        }

        match self.mechanisms.first() {
            Some(first) if first.kind != TokenKind::Version => {
                Some(Error::Syntax {
                    token: first.clone(),
                    reason: "record does not start with v=spf1",
                })
            },
            _ => None,
        }
    }

    fn eval_version(&self, token: &Token) -> MechResult {
        if token.value == "spf1" {
            (false, SpfResult::None, None)
        } else {
            (
                true,
                SpfResult::Permerror,
                Some(Error::Syntax {
                    token: token.clone(),
                    reason: "unsupported SPF version",
                }),
            )
        }
    }

    fn eval_all(&self, token: &Token) -> MechResult {
        match matching_result(token.qualifier) {
            Some(result) => (true, result, None),
            None => (
                true,
                SpfResult::Permerror,
                Some(Error::Syntax {
                    token: token.clone(),
                    reason: "invalid qualifier",
                }),
            ),
        }
    }

    fn eval_ip4(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        let (addr, prefix) = match token.value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (token.value.as_str(), None),
        };
        let Ok(network) = addr.parse::<Ipv4Addr>() else {
            return syntax_error(token, "not an IPv4 address");
        };
        let prefix = match prefix.map(|p| parse_prefix(p, 32)) {
            None => 32,
            Some(Ok(prefix)) => prefix,
            Some(Err(reason)) => return syntax_error(token, reason),
        };

        let matched = match self.ip {
            IpAddr::V4(client) => ipv4_addr_matches(client, network, prefix),
            IpAddr::V6(_) => false,
        };
        (matched, result, None)
    }

    fn eval_ip6(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        let (addr, prefix) = match token.value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (token.value.as_str(), None),
        };
        let Ok(network) = addr.parse::<Ipv6Addr>() else {
            return syntax_error(token, "not an IPv6 address");
        };
        if network.to_ipv4_mapped().is_some() {
            return syntax_error(token, "not an IPv6 address");
        }
        let prefix = match prefix.map(|p| parse_prefix(p, 128)) {
            None => 128,
            Some(Ok(prefix)) => prefix,
            Some(Err(reason)) => return syntax_error(token, reason),
        };

        let matched = match self.ip {
            IpAddr::V4(_) => false,
            IpAddr::V6(client) => ipv6_addr_matches(client, network, prefix),
        };
        (matched, result, None)
    }

    /// `ptr` is deprecated by RFC 7208 § 5.5 and never matches here.
    fn eval_ptr(&self, token: &Token) -> MechResult {
        (false, qualifier_verdict(token.qualifier), None)
    }

    async fn eval_a(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        // A bare `a` term yields its qualifier's verdict directly, so
        // `-a` and `~a` produce fail/softfail without any DNS traffic.
        if token.value.is_empty() {
            return (true, result, None);
        }

        let (host, v4_prefix, v6_prefix) =
            match split_host_network(&token.value) {
                Ok(split) => split,
                Err(reason) => return syntax_error(token, reason),
            };

        self.match_host(result, host, v4_prefix, v6_prefix).await
    }

    async fn eval_mx(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        let value = if token.value.is_empty() {
            self.domain
        } else {
            token.value.as_str()
        };
        let (host, v4_prefix, v6_prefix) = match split_host_network(value) {
            Ok(split) => split,
            Err(reason) => return syntax_error(token, reason),
        };

        let matcher = self.network_matcher(v4_prefix, v6_prefix);
        let fqdn = dns::normalize_fqdn(host);
        match self.resolver.match_mx(&fqdn, &matcher).await {
            Ok(matched) => (matched, result, None),
            // A nonexistent name or empty MX set is no match, not an
            // error.
            Err(DnsError::Permanent) => (false, result, None),
            Err(e @ DnsError::Transient) => {
                (true, SpfResult::Temperror, Some(Error::Dns(e)))
            },
            Err(e @ DnsError::LimitExceeded) => {
                (true, SpfResult::Permerror, Some(Error::Dns(e)))
            },
        }
    }

    async fn eval_include(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        if token.value.is_empty() {
            return syntax_error(token, "include requires a domain");
        }

        let inner =
            check_host_with(self.ip, &token.value, self.sender, self.resolver)
                .await;
        if matches!(inner.error, Some(Error::Dns(DnsError::LimitExceeded))) {
            return (true, SpfResult::Permerror, inner.error);
        }

        // RFC 7208 § 5.2
        match inner.result {
            SpfResult::Pass => (true, result, None),
            SpfResult::Fail | SpfResult::Softfail | SpfResult::Neutral => {
                (false, SpfResult::None, None)
            },
            SpfResult::Temperror => {
                (false, SpfResult::Temperror, inner.error)
            },
            SpfResult::Permerror | SpfResult::None => {
                (false, SpfResult::Permerror, inner.error)
            },
        }
    }

    async fn eval_exists(&self, token: &Token) -> MechResult {
        let result = qualifier_verdict(token.qualifier);

        let Ok(target) =
            macros::expand(self.sender, self.domain, self.ip, &token.value)
        else {
            return syntax_error(token, "invalid macro string");
        };
        if target.is_empty() {
            return syntax_error(token, "exists requires a domain");
        }

        let fqdn = dns::normalize_fqdn(&target);
        match self.resolver.exists(&fqdn).await {
            Ok(matched) => (matched, result, None),
            Err(DnsError::Permanent) => (false, result, None),
            Err(e @ DnsError::Transient) => {
                (true, SpfResult::Temperror, Some(Error::Dns(e)))
            },
            Err(e @ DnsError::LimitExceeded) => {
                (true, SpfResult::Permerror, Some(Error::Dns(e)))
            },
        }
    }

    /// Shared tail of `a`: does `host` resolve to an address whose masked
    /// form covers the client?
    async fn match_host(
        &self,
        result: SpfResult,
        host: &str,
        v4_prefix: u32,
        v6_prefix: u32,
    ) -> MechResult {
        let matcher = self.network_matcher(v4_prefix, v6_prefix);
        let fqdn = dns::normalize_fqdn(host);
        match self.resolver.match_ip(&fqdn, &matcher).await {
            Ok(matched) => (matched, result, None),
            Err(DnsError::Permanent) => (false, SpfResult::None, None),
            Err(e @ DnsError::Transient) => {
                (true, SpfResult::Temperror, Some(Error::Dns(e)))
            },
            Err(e @ DnsError::LimitExceeded) => {
                (true, SpfResult::Permerror, Some(Error::Dns(e)))
            },
        }
    }

    /// Builds the predicate testing whether a resolved address, masked by
    /// the per-family prefix, covers the client address.
    fn network_matcher(
        &self,
        v4_prefix: u32,
        v6_prefix: u32,
    ) -> impl Fn(IpAddr) -> bool + Send + Sync {
        let client = self.ip;
        move |addr| match (client, addr) {
            (IpAddr::V4(client), IpAddr::V4(network)) => {
                ipv4_addr_matches(client, network, v4_prefix)
            },
            (IpAddr::V6(client), IpAddr::V6(network)) => {
                ipv6_addr_matches(client, network, v6_prefix)
            },
            _ => false,
        }
    }

    /// Applies the `redirect` modifier once the mechanism walk has ended
    /// without a conclusive verdict.
    async fn handle_redirect(
        &self,
        result: SpfResult,
        error: Option<Error>,
    ) -> CheckHostResult {
        let redirect = match &self.redirect {
            Some(redirect) if result == SpfResult::None => redirect,
            _ => {
                return CheckHostResult {
                    result,
                    explanation: None,
                    error,
                }
            },
        };

        let inner = check_host_with(
            self.ip,
            &redirect.value,
            self.sender,
            self.resolver,
        )
        .await;
        let result = match inner.result {
            // RFC 7208 § 6.1: no policy (or a broken one) at the redirect
            // target is a permanent error, unlike at the initial query.
            SpfResult::None | SpfResult::Permerror => SpfResult::Permerror,
            other => other,
        };

        CheckHostResult {
            result,
            explanation: None,
            error: inner.error,
        }
    }

    /// Produces the `exp` explanation string for a `fail` verdict, or
    /// `None` if there is no `exp` modifier or any step of the flow fails.
    async fn build_explanation(&self) -> Option<String> {
        let token = self.explanation.as_ref()?;
        let target =
            macros::expand(self.sender, self.domain, self.ip, &token.value)
                .ok()?;
        if target.is_empty() {
            return None;
        }

        let fqdn = dns::normalize_fqdn(&target);
        let texts = self.resolver.lookup_txt(&fqdn).await.ok()?;
        // RFC 7208 § 6.2: the strings are concatenated without spaces, and
        // the result is itself a macro string.
        let combined = texts.concat();
        if combined.is_empty() {
            return None;
        }

        macros::expand(self.sender, self.domain, self.ip, &combined).ok()
    }
}

/// Maps a matching mechanism's qualifier to the session verdict.
fn matching_result(qualifier: Qualifier) -> Option<SpfResult> {
    match qualifier {
        Qualifier::Plus => Some(SpfResult::Pass),
        Qualifier::Minus => Some(SpfResult::Fail),
        Qualifier::Question => Some(SpfResult::Neutral),
        Qualifier::Tilde => Some(SpfResult::Softfail),
        Qualifier::Err => None,
    }
}

/// As `matching_result`, but collapses the unreachable error sentinel into
/// `permerror` for mechanisms that do not special-case it.
fn qualifier_verdict(qualifier: Qualifier) -> SpfResult {
    matching_result(qualifier).unwrap_or(SpfResult::Permerror)
}

fn syntax_error(token: &Token, reason: &'static str) -> MechResult {
    (
        true,
        SpfResult::Permerror,
        Some(Error::Syntax {
            token: token.clone(),
            reason,
        }),
    )
}

/// Splits the `[host][/v4][/v6]` form used by `a` and `mx`, defaulting
/// absent or empty prefixes to the full /32 and /128 masks.
fn split_host_network(
    value: &str,
) -> Result<(&str, u32, u32), &'static str> {
    let mut parts = value.splitn(3, '/');
    let host = parts.next().unwrap_or("");
    let v4 = parts.next().unwrap_or("");
    let v6 = parts.next().unwrap_or("");

    if !dns::is_domain_name(host) {
        return Err("invalid hostname");
    }

    Ok((host, parse_prefix(v4, 32)?, parse_prefix(v6, 128)?))
}

fn parse_prefix(s: &str, max: u32) -> Result<u32, &'static str> {
    if s.is_empty() {
        return Ok(max);
    }

    match s.parse::<u32>() {
        Ok(n) if n <= max => Ok(n),
        Ok(_) => Err("network prefix out of range"),
        Err(_) => Err("unparseable network prefix"),
    }
}

fn ipv4_addr_matches(
    client: Ipv4Addr,
    network: Ipv4Addr,
    prefix: u32,
) -> bool {
    match u32::MAX.checked_shl(32 - prefix) {
        Some(mask) => {
            (u32::from(client) & mask) == (u32::from(network) & mask)
        },
        // A /0 prefix covers everything.
        None => true,
    }
}

fn ipv6_addr_matches(
    client: Ipv6Addr,
    network: Ipv6Addr,
    prefix: u32,
) -> bool {
    match u128::MAX.checked_shl(128 - prefix) {
        Some(mask) => {
            (u128::from(client) & mask) == (u128::from(network) & mask)
        },
        None => true,
    }
}
