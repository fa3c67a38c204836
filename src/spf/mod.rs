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

//! The RFC 7208 `check_host()` function.
//!
//! [`check_host`] is the embedder-facing entry point: it wires the
//! configured nameserver and lookup budget together and evaluates the
//! sender policy of one `<ip, domain, sender>` triple. [`check_host_with`]
//! is the same function over an injected [`Resolver`], which is also how
//! the engine recurses for `include` and `redirect`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use futures::future::BoxFuture;
use log::debug;
use thiserror::Error as ThisError;

mod eval;
pub mod macros;
pub mod syntax;
#[cfg(test)]
mod testing;

use crate::support::config::Config;
use crate::support::dns::{
    self, DnsError, HickoryResolver, LimitedResolver, Resolver,
};
use eval::Session;
use syntax::Token;

/// The result of an SPF evaluation, as defined by RFC 7208 § 2.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpfResult {
    /// No valid domain was given, or the domain publishes no SPF policy.
    None,
    /// The ADMD explicitly states nothing about the client address.
    Neutral,
    /// The client is authorized to inject mail for the domain.
    Pass,
    /// The client is explicitly not authorized.
    Fail,
    /// The client is probably not authorized, but the ADMD is not willing
    /// to make the stronger statement.
    Softfail,
    /// A transient (generally DNS) failure prevented a conclusion; a
    /// retry may succeed.
    Temperror,
    /// The published policy could not be correctly interpreted; operator
    /// action is required.
    Permerror,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::Softfail => "softfail",
            SpfResult::Temperror => "temperror",
            SpfResult::Permerror => "permerror",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("not an SPF result: {0:?}")]
pub struct ParseSpfResultError(String);

impl FromStr for SpfResult {
    type Err = ParseSpfResultError;

    fn from_str(s: &str) -> Result<Self, ParseSpfResultError> {
        match s {
            "none" => Ok(SpfResult::None),
            "neutral" => Ok(SpfResult::Neutral),
            "pass" => Ok(SpfResult::Pass),
            "fail" => Ok(SpfResult::Fail),
            "softfail" => Ok(SpfResult::Softfail),
            "temperror" => Ok(SpfResult::Temperror),
            "permerror" => Ok(SpfResult::Permerror),
            _ => Err(ParseSpfResultError(s.to_owned())),
        }
    }
}

/// Diagnostic detail accompanying a verdict.
///
/// The verdict itself is always authoritative; the error only explains how
/// it came about.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("invalid domain name")]
    InvalidDomain,
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error("syntax error in \"{token}\": {reason}")]
    Syntax {
        token: Token,
        reason: &'static str,
    },
}

/// What one `check_host()` evaluation concluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckHostResult {
    /// The verdict.
    pub result: SpfResult,
    /// The `exp` explanation string; only ever set on a `fail` verdict
    /// whose record carries a working `exp` modifier.
    pub explanation: Option<String>,
    /// Diagnostic detail for error verdicts.
    pub error: Option<Error>,
}

impl CheckHostResult {
    fn bare(result: SpfResult) -> Self {
        CheckHostResult {
            result,
            explanation: None,
            error: None,
        }
    }

    fn with_error(result: SpfResult, error: Error) -> Self {
        CheckHostResult {
            result,
            explanation: None,
            error: Some(error),
        }
    }
}

/// Evaluates the SPF policy of `domain` against the client address `ip`,
/// per RFC 7208 § 4.
///
/// `ip` is the address of the connecting SMTP client, `domain` the domain
/// taken from the `MAIL FROM` (or `HELO`) identity, and `sender` the
/// identity itself; all three are assumed to have been extracted from the
/// envelope already. DNS goes to the nameserver in `config`, capped at
/// `config.lookup_budget` resolver calls for the entire evaluation.
pub async fn check_host(
    ip: IpAddr,
    domain: &str,
    sender: &str,
    config: &Config,
) -> CheckHostResult {
    let resolver = LimitedResolver::new(
        HickoryResolver::new(config.dns_addr),
        config.lookup_budget,
    );
    check_host_with(ip, domain, sender, &resolver).await
}

/// As [`check_host`], but against a caller-supplied resolver.
///
/// The resolver is expected to already enforce the lookup budget (see
/// [`LimitedResolver`]); recursive evaluations for `include` and
/// `redirect` re-enter through this function sharing the same resolver,
/// which is what makes the budget global to the evaluation.
pub fn check_host_with<'a>(
    ip: IpAddr,
    domain: &'a str,
    sender: &'a str,
    resolver: &'a dyn Resolver,
) -> BoxFuture<'a, CheckHostResult> {
    Box::pin(async move {
        // RFC 7208 § 4.3: a malformed domain yields none before any DNS
        // traffic happens.
        if !dns::is_domain_name(domain) {
            return CheckHostResult::with_error(
                SpfResult::None,
                Error::InvalidDomain,
            );
        }

        let fqdn = dns::normalize_fqdn(domain);
        let policy = match resolver.lookup_txt(&fqdn).await {
            Ok(texts) => texts.concat(),
            Err(e @ DnsError::LimitExceeded) => {
                return CheckHostResult::with_error(
                    SpfResult::Permerror,
                    Error::Dns(e),
                );
            },
            // RFC 7208 § 4.3: NXDOMAIN means no policy, not an error.
            Err(DnsError::Permanent) => {
                return CheckHostResult::bare(SpfResult::None);
            },
            Err(e @ DnsError::Transient) => {
                return CheckHostResult::with_error(
                    SpfResult::Temperror,
                    Error::Dns(e),
                );
            },
        };

        debug!("SPF {domain}: evaluating {policy:?}");
        Session::new(sender, domain, ip, resolver).run(&policy).await
    })
}

#[cfg(test)]
mod test {
    use super::testing::MockResolver;
    use super::*;

    #[test]
    fn result_strings_round_trip() {
        let results = [
            SpfResult::None,
            SpfResult::Neutral,
            SpfResult::Pass,
            SpfResult::Fail,
            SpfResult::Softfail,
            SpfResult::Temperror,
            SpfResult::Permerror,
        ];
        let strs = [
            "none",
            "neutral",
            "pass",
            "fail",
            "softfail",
            "temperror",
            "permerror",
        ];

        for (result, s) in results.into_iter().zip(strs) {
            assert_eq!(s, result.to_string());
            assert_eq!(Ok(result), s.parse());
        }
        assert_matches!(Err(ParseSpfResultError(_)), "Pass".parse::<SpfResult>());
        assert_matches!(Err(ParseSpfResultError(_)), "".parse::<SpfResult>());
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_check(
        resolver: &MockResolver,
        budget: i32,
        ip: IpAddr,
        domain: &str,
        sender: &str,
    ) -> CheckHostResult {
        let limited = LimitedResolver::new(resolver, budget);
        check_host_with(ip, domain, sender, &limited).await
    }

    fn check(
        resolver: &MockResolver,
        ip: IpAddr,
        domain: &str,
    ) -> CheckHostResult {
        run_check(resolver, 10, ip, domain, "stub")
    }

    /// The zone driving the whole-record scenarios.
    fn zone(policy: &str) -> MockResolver {
        MockResolver::new()
            .txt("matching.com", policy)
            .mx("matching.com", "matching.com")
            .a("matching.com", [172, 20, 20, 20])
            .a("matching.com", [172, 18, 0, 1])
            .a("matching.com", [172, 18, 0, 2])
            .mx("matching.net", "matching.net")
            .a("matching.net", [173, 18, 0, 2])
            .a("matching.net", [173, 20, 20, 20])
            .txt(
                "_spf.matching.net",
                "v=spf1 a:positive.matching.net -a:negative.matching.net ~mx -all",
            )
            .a("positive.matching.net", [172, 100, 100, 1])
            .a("positive.matching.net", [173, 18, 0, 2])
            .a("positive.matching.net", [173, 20, 20, 1])
            .a("positive.matching.net", [173, 20, 21, 1])
            .a("negative.matching.net", [172, 100, 100, 1])
            .a("negative.matching.net", [173, 18, 0, 2])
            .a("lb.matching.com", [172, 101, 101, 1])
            .txt("loop.matching.net", "v=spf1 include:loop.matching.com -all")
            .txt("loop.matching.com", "v=spf1 include:loop.matching.net -all")
            .broken("yyz.matching.com")
    }

    #[test]
    fn whole_record_scenarios() {
        let localhost = IpAddr::from([127, 0, 0, 1]);
        let cases: &[(&str, IpAddr, SpfResult)] = &[
            ("v=spf1 -all", localhost, SpfResult::Fail),
            ("v=spf1 mx -all", [172, 20, 20, 20].into(), SpfResult::Pass),
            ("v=spf1 ?mx -all", [172, 20, 20, 20].into(), SpfResult::Neutral),
            ("v=spf1 ~mx -all", [172, 20, 20, 20].into(), SpfResult::Softfail),
            ("v=spf1 a -mx -all", [172, 18, 0, 2].into(), SpfResult::Pass),
            ("v=spf1 -mx a -all", [172, 18, 0, 2].into(), SpfResult::Fail),
            (
                "v=spf1 +mx:matching.net -a -all",
                [173, 18, 0, 2].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 +mx:matching.net -a -all",
                [172, 17, 0, 2].into(),
                SpfResult::Fail,
            ),
            (
                "v=spf1 a:matching.net -all",
                [173, 18, 0, 2].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 +ip4:128.14.15.16 -all",
                [128, 14, 15, 16].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 ~ip6:2001:56::2 -all",
                "2001:56::2".parse().unwrap(),
                SpfResult::Softfail,
            ),
            // 172.20.20.1 is not covered by _spf.matching.net, so the
            // record falls through to -all.
            (
                "v=spf1 ip4:127.0.0.1 +include:_spf.matching.net -all",
                [172, 20, 20, 1].into(),
                SpfResult::Fail,
            ),
            // ... while 172.100.100.1 is one of positive.matching.net's
            // addresses.
            (
                "v=spf1 ip4:127.0.0.1 +include:_spf.matching.net -all",
                [172, 100, 100, 1].into(),
                SpfResult::Pass,
            ),
            // include must carry a target domain.
            (
                "v=spf1 ip4:127.0.0.1 +include -all",
                [172, 100, 100, 1].into(),
                SpfResult::Permerror,
            ),
            (
                "v=spf1 ip4:127.0.0.1 ?include -all",
                [172, 100, 100, 1].into(),
                SpfResult::Permerror,
            ),
            // The include target's lookup fails transiently; the include
            // is no match and evaluation proceeds to -all.
            (
                "v=spf1 +include:yyz.matching.com -all",
                [172, 100, 100, 1].into(),
                SpfResult::Fail,
            ),
            // ... but with nothing after it, the carried temperror
            // surfaces.
            (
                "v=spf1 +include:yyz.matching.com",
                [172, 100, 100, 1].into(),
                SpfResult::Temperror,
            ),
            ("v=spf1 ?exists:lb.%{d} -all", localhost, SpfResult::Neutral),
            // %{d1r} keeps the first label counting from the right of the
            // reversed domain, i.e. "matching", giving lb.matching.com
            // again.
            (
                "v=spf1 ?exists:lb.%{d1r}.com -all",
                localhost,
                SpfResult::Neutral,
            ),
            // A lexing failure anywhere in the record poisons it.
            ("v=spf1 include=example.org -all", localhost, SpfResult::Permerror),
            ("v=spf1 qowie -all", localhost, SpfResult::Permerror),
            // Mutual inclusion burns the whole lookup budget.
            (
                "v=spf1 include:loop.matching.com -all",
                [10, 0, 0, 1].into(),
                SpfResult::Permerror,
            ),
        ];

        for &(policy, ip, expected) in cases {
            let outcome = check(&zone(policy), ip, "matching.com");
            assert_eq!(
                expected, outcome.result,
                "{policy:?} against {ip}: {outcome:?}",
            );
        }
    }

    #[test]
    fn no_policy_means_none() {
        // NXDOMAIN on the TXT lookup.
        assert_eq!(
            CheckHostResult::bare(SpfResult::None),
            check(
                &MockResolver::new(),
                [127, 0, 0, 1].into(),
                "matching.com",
            ),
        );
        // A name that exists with no TXT content at all.
        assert_eq!(
            SpfResult::None,
            check(
                &MockResolver::new().no_txt("matching.com"),
                [127, 0, 0, 1].into(),
                "matching.com",
            )
            .result,
        );
        // Foreign TXT content lexes to error tokens.
        assert_eq!(
            SpfResult::Permerror,
            check(
                &MockResolver::new().txt("matching.com", "no spf here"),
                [127, 0, 0, 1].into(),
                "matching.com",
            )
            .result,
        );
    }

    #[test]
    fn invalid_domain_is_rejected_up_front() {
        let resolver = MockResolver::new();
        for domain in ["", "dash-.com", "exa mple.com", "ex..ample.com"] {
            assert_eq!(
                CheckHostResult::with_error(
                    SpfResult::None,
                    Error::InvalidDomain,
                ),
                check(&resolver, [127, 0, 0, 1].into(), domain),
            );
        }
    }

    #[test]
    fn transient_txt_failure_is_temperror() {
        assert_eq!(
            CheckHostResult::with_error(
                SpfResult::Temperror,
                Error::Dns(DnsError::Transient),
            ),
            check(
                &MockResolver::new().broken("matching.com"),
                [127, 0, 0, 1].into(),
                "matching.com",
            ),
        );
    }

    #[test]
    fn multi_string_txt_records_are_concatenated() {
        let resolver = MockResolver::new()
            .txt_segments("matching.com", &["v=spf1 ip4:", "128.14.15.16 -all"])
            .a("matching.com", [10, 0, 0, 1]);
        assert_eq!(
            SpfResult::Pass,
            check(&resolver, [128, 14, 15, 16].into(), "matching.com").result,
        );
    }

    #[test]
    fn trailing_dot_domains_are_accepted() {
        let resolver = zone("v=spf1 -all");
        assert_eq!(
            SpfResult::Fail,
            check(&resolver, [127, 0, 0, 1].into(), "matching.com.").result,
        );
    }

    #[test]
    fn redirect_scenarios() {
        let redirect_zone = || {
            zone("unused")
                .txt("nospf.matching.net", "no spf here")
                .txt(
                    "redirect.matching.net",
                    "v=spf1 redirect=mx.matching.com",
                )
                .txt(
                    "redirect.matching.com",
                    "v=spf1 redirect=redirect.matching.net",
                )
                .txt("mx.matching.com", "v=spf1 mx:matching.com -all")
        };

        let cases: &[(&str, IpAddr, SpfResult)] = &[
            // The -all matches before the redirect is ever consulted.
            (
                "v=spf1 -all redirect=_spf.matching.net",
                [172, 100, 100, 1].into(),
                SpfResult::Fail,
            ),
            (
                "v=spf1 redirect=_spf.matching.net -all",
                [172, 100, 100, 1].into(),
                SpfResult::Fail,
            ),
            // No all: the redirect target decides.
            (
                "v=spf1 redirect=_spf.matching.net",
                [172, 100, 100, 1].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 redirect=_spf.matching.net",
                [127, 0, 0, 1].into(),
                SpfResult::Fail,
            ),
            // An invalid target (inner none) escalates to permerror.
            (
                "v=spf1 redirect=malformed--",
                [172, 100, 100, 1].into(),
                SpfResult::Permerror,
            ),
            // So does a target without an SPF policy.
            (
                "v=spf1 redirect=nospf.matching.net",
                [127, 0, 0, 1].into(),
                SpfResult::Permerror,
            ),
            // A matching mechanism short-circuits the redirect entirely.
            (
                "v=spf1 +ip4:127.0.0.1 redirect=nospf.matching.net",
                [127, 0, 0, 1].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 -ip4:127.0.0.1 redirect=nospf.matching.net",
                [127, 0, 0, 1].into(),
                SpfResult::Fail,
            ),
            // Chained redirects resolve recursively.
            (
                "v=spf1 redirect=redirect.matching.com",
                [172, 18, 0, 1].into(),
                SpfResult::Pass,
            ),
            (
                "v=spf1 redirect=redirect.matching.com",
                [127, 0, 0, 1].into(),
                SpfResult::Fail,
            ),
        ];

        for &(policy, ip, expected) in cases {
            let resolver = redirect_zone().txt("start.matching.com", policy);
            let outcome = check(&resolver, ip, "start.matching.com");
            assert_eq!(
                expected, outcome.result,
                "{policy:?} against {ip}: {outcome:?}",
            );
        }
    }

    #[test]
    fn explanation_scenarios() {
        let resolver = zone("unused")
            .txt("static.exp.matching.com", "Invalid SPF record")
            .txt(
                "ip.exp.matching.com",
                "%{i} is not one of %{d}'s designated mail servers.",
            )
            .txt_segments(
                "split.exp.matching.com",
                &["%{i} is not one of %{d}'s", " designated mail servers."],
            );

        let check_exp = |policy: &str| {
            let resolver = resolver.clone().txt("exp.matching.com", policy);
            run_check(
                &resolver,
                10,
                [127, 0, 0, 1].into(),
                "exp.matching.com",
                "stub",
            )
        };

        let outcome = check_exp("v=spf1 -all exp=static.exp.matching.com");
        assert_eq!(SpfResult::Fail, outcome.result);
        assert_eq!(Some("Invalid SPF record".to_owned()), outcome.explanation);

        let outcome = check_exp("v=spf1 -all exp=ip.exp.matching.com");
        assert_eq!(SpfResult::Fail, outcome.result);
        assert_eq!(
            Some(
                "127.0.0.1 is not one of exp.matching.com's designated mail \
                 servers."
                    .to_owned(),
            ),
            outcome.explanation,
        );

        // RFC 7208 § 6.2: the TXT strings are concatenated without
        // separators before expansion.
        let outcome = check_exp("v=spf1 -all exp=split.exp.matching.com");
        assert_eq!(
            Some(
                "127.0.0.1 is not one of exp.matching.com's designated mail \
                 servers."
                    .to_owned(),
            ),
            outcome.explanation,
        );

        // A missing or failing exp target suppresses the explanation but
        // never the verdict.
        let outcome = check_exp("v=spf1 -all exp=missing.exp.matching.com");
        assert_eq!(SpfResult::Fail, outcome.result);
        assert_eq!(None, outcome.explanation);

        // The explanation only applies to fail.
        let outcome = check_exp("v=spf1 ~all exp=static.exp.matching.com");
        assert_eq!(SpfResult::Softfail, outcome.result);
        assert_eq!(None, outcome.explanation);
    }

    #[test]
    fn duplicate_modifiers_are_permerror() {
        let localhost = IpAddr::from([127, 0, 0, 1]);
        for policy in [
            "v=spf1 redirect=a.example redirect=b.example",
            "v=spf1 exp=a.example exp=b.example -all",
            "v=spf1 redirect=a.example -all redirect=b.example",
        ] {
            assert_eq!(
                SpfResult::Permerror,
                check(&zone(policy), localhost, "matching.com").result,
                "{policy:?}",
            );
        }
    }

    #[test]
    fn lookup_budget_bounds_the_evaluation() {
        let resolver = zone("v=spf1 include:loop.matching.com -all");

        // The mutual inclusion spends one TXT lookup per hop and then
        // aborts; a bigger budget changes nothing.
        for budget in [2, 10, 50] {
            let outcome = run_check(
                &resolver,
                budget,
                [10, 0, 0, 1].into(),
                "matching.com",
                "stub",
            );
            assert_eq!(SpfResult::Permerror, outcome.result, "budget {budget}");
            assert_eq!(Some(Error::Dns(DnsError::LimitExceeded)), outcome.error);
        }

        // An exhausted budget fails even the initial TXT lookup.
        let outcome = run_check(
            &resolver,
            0,
            [10, 0, 0, 1].into(),
            "matching.com",
            "stub",
        );
        assert_eq!(SpfResult::Permerror, outcome.result);

        // A simple record fits comfortably: one TXT lookup plus one MX
        // walk.
        let outcome = run_check(
            &zone("v=spf1 mx -all"),
            2,
            [172, 20, 20, 20].into(),
            "matching.com",
            "stub",
        );
        assert_eq!(SpfResult::Pass, outcome.result);
    }

    #[test]
    fn sender_macros_use_the_mail_from_identity() {
        // The %{l1r+-} transform picks the first hyphen-or-plus-separated
        // chunk of the local part.
        let resolver = MockResolver::new()
            .txt(
                "email.example.com",
                "v=spf1 exists:%{ir}.%{l1r+-}._spf.%{d2} -all",
            )
            .a("3.2.0.192.strong._spf.example.com", [1, 2, 3, 4]);

        let outcome = run_check(
            &resolver,
            10,
            [192, 0, 2, 3].into(),
            "email.example.com",
            "strong-bad@email.example.com",
        );
        assert_eq!(SpfResult::Pass, outcome.result);
    }
}
