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

//! Expansion of RFC 7208 § 7 macro strings.
//!
//! The expander is a small character-driven machine with three states:
//! plain text, the character after a `%`, and the body of a `%{...}`
//! expression. Macro strings are short and rarely nested in practice, so
//! nothing is tokenised up front.

use std::net::IpAddr;

use itertools::Itertools;
use thiserror::Error;

use crate::support::mail;

/// The delimiter characters RFC 7208 § 7.1 permits in a transform.
const DELIMITERS: &str = ".-+,/_=";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("macro string ended unexpectedly")]
    UnexpectedEnd,
    #[error("forbidden character after '%': {0:?}")]
    BadEscape(char),
    #[error("unknown macro letter: {0:?}")]
    UnknownMacro(char),
    #[error("invalid character in macro transform: {0:?}")]
    BadTransform(char),
    #[error("macro cardinality must be positive")]
    ZeroCardinality,
    #[error("unparseable macro cardinality")]
    BadCardinality,
}

/// Expands every macro in `input` against the given session state.
///
/// `sender` is the full identity (used verbatim for `%{s}` and split for
/// `%{l}`/`%{o}`), `domain` the current evaluation domain (`%{d}`/`%{h}`),
/// and `ip` the client address (`%{i}`, `%{v}`).
pub fn expand(
    sender: &str,
    domain: &str,
    ip: IpAddr,
    input: &str,
) -> Result<String, Error> {
    Expander {
        rest: input,
        output: String::with_capacity(input.len()),
        sender,
        domain,
        ip,
    }
    .run()
}

struct Expander<'a> {
    rest: &'a str,
    output: String,
    sender: &'a str,
    domain: &'a str,
    ip: IpAddr,
}

impl Expander<'_> {
    fn run(mut self) -> Result<String, Error> {
        while !self.rest.is_empty() {
            match self.rest.find('%') {
                None => {
                    self.output.push_str(self.rest);
                    self.rest = "";
                },
                Some(n) => {
                    self.output.push_str(&self.rest[..n]);
                    self.rest = &self.rest[n + 1..];
                    self.scan_percent()?;
                },
            }
        }

        Ok(self.output)
    }

    fn scan_percent(&mut self) -> Result<(), Error> {
        let mut chars = self.rest.chars();
        match chars.next() {
            None => return Err(Error::UnexpectedEnd),
            Some('%') => self.output.push('%'),
            Some('_') => self.output.push(' '),
            Some('-') => self.output.push_str("%20"),
            Some('{') => {
                self.rest = chars.as_str();
                return self.scan_macro();
            },
            Some(c) => return Err(Error::BadEscape(c)),
        }

        self.rest = chars.as_str();
        Ok(())
    }

    fn scan_macro(&mut self) -> Result<(), Error> {
        let mut chars = self.rest.chars();
        let letter = chars.next().ok_or(Error::UnexpectedEnd)?;
        self.rest = chars.as_str();

        match letter {
            's' => self.scan_transform(self.sender),
            'l' => self
                .scan_transform(mail::split_sender(self.sender, self.sender).local),
            'o' => self
                .scan_transform(mail::split_sender(self.sender, self.sender).domain),
            'd' | 'h' => self.scan_transform(self.domain),
            'i' => self.scan_transform(&self.ip.to_string()),
            'v' => {
                let version = match self.ip {
                    IpAddr::V4(_) => "in-addr",
                    IpAddr::V6(_) => "ip6",
                };
                self.output.push_str(version);
                self.close_macro()
            },
            // RFC 7208 § 7.3 deprecates the validated-name macro; it
            // expands to nothing here.
            'p' => self.close_macro(),
            c => Err(Error::UnknownMacro(c)),
        }
    }

    /// Consumes a `}` terminating a transform-less macro body.
    fn close_macro(&mut self) -> Result<(), Error> {
        let mut chars = self.rest.chars();
        match chars.next() {
            None => Err(Error::UnexpectedEnd),
            Some('}') => {
                self.rest = chars.as_str();
                Ok(())
            },
            Some(c) => Err(Error::BadTransform(c)),
        }
    }

    /// Parses `[cardinality]['r'][delimiters]'}'` and emits the transformed
    /// `source`.
    fn scan_transform(&mut self, source: &str) -> Result<(), Error> {
        let digits = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or(Error::UnexpectedEnd)?;
        let keep = if digits > 0 {
            let n = self.rest[..digits]
                .parse::<usize>()
                .map_err(|_| Error::BadCardinality)?;
            if n == 0 {
                return Err(Error::ZeroCardinality);
            }
            self.rest = &self.rest[digits..];
            Some(n)
        } else {
            None
        };

        let reverse = self.rest.starts_with('r');
        if reverse {
            self.rest = &self.rest[1..];
        }

        let end = self.rest.find('}').ok_or(Error::UnexpectedEnd)?;
        let delimiters = &self.rest[..end];
        if let Some(c) = delimiters.chars().find(|&c| !DELIMITERS.contains(c)) {
            return Err(Error::BadTransform(c));
        }
        self.rest = &self.rest[end + 1..];

        if keep.is_none() && !reverse && delimiters.is_empty() {
            self.output.push_str(source);
            return Ok(());
        }

        let effective = if delimiters.is_empty() { "." } else { delimiters };
        let is_delimiter = |c: char| effective.contains(c);
        let keep = keep.unwrap_or(usize::MAX);

        // Splitting is naive per RFC 7208 § 7.3: adjacent delimiters
        // produce empty parts, and the join is always on dots.
        if reverse {
            let parts = source.rsplit(is_delimiter);
            let n = parts.clone().count();
            self.output
                .push_str(&parts.skip(n.saturating_sub(keep)).join("."));
        } else {
            let parts = source.split(is_delimiter);
            let n = parts.clone().count();
            self.output
                .push_str(&parts.skip(n.saturating_sub(keep)).join("."));
        }

        Ok(())
    }
}
