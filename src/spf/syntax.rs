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

//! The term syntax of SPF TXT records.
//! RFC 7208 § 12
//!
//! A record is a whitespace-separated sequence of terms, each of the shape
//! `[qualifier]name[delimiter value]`. Mechanisms take their value after a
//! `:`, modifiers (and the `v=spf1` preamble) after a `=`. Anything that
//! does not fit produces an [`TokenKind::Err`] token which the classifier
//! later turns into `permerror`; lexing itself never fails.

use std::fmt;

/// The name of a term, plus the [`TokenKind::Err`] sentinel for terms that
/// could not be lexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// The `v=spf1` preamble. Only ever valid as the first term.
    Version,
    All,
    A,
    Ip4,
    Ip6,
    Mx,
    /// Lexed for completeness; RFC 7208 § 5.5 says it SHOULD NOT be used,
    /// and it never matches during evaluation.
    Ptr,
    Include,
    Exists,
    Redirect,
    Exp,
    Err,
}

impl TokenKind {
    fn from_name(name: &str) -> Self {
        match name {
            "v" => TokenKind::Version,
            "all" => TokenKind::All,
            "a" => TokenKind::A,
            "ip4" => TokenKind::Ip4,
            "ip6" => TokenKind::Ip6,
            "mx" => TokenKind::Mx,
            "ptr" => TokenKind::Ptr,
            "include" => TokenKind::Include,
            "exists" => TokenKind::Exists,
            "redirect" => TokenKind::Redirect,
            "exp" | "explanation" => TokenKind::Exp,
            _ => TokenKind::Err,
        }
    }

    pub fn is_mechanism(self) -> bool {
        matches!(
            self,
            TokenKind::Version
                | TokenKind::All
                | TokenKind::A
                | TokenKind::Ip4
                | TokenKind::Ip6
                | TokenKind::Mx
                | TokenKind::Ptr
                | TokenKind::Include
                | TokenKind::Exists
        )
    }

    pub fn is_modifier(self) -> bool {
        matches!(self, TokenKind::Redirect | TokenKind::Exp)
    }

    pub fn is_err(self) -> bool {
        matches!(self, TokenKind::Err)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            TokenKind::Version => "v",
            TokenKind::All => "all",
            TokenKind::A => "a",
            TokenKind::Ip4 => "ip4",
            TokenKind::Ip6 => "ip6",
            TokenKind::Mx => "mx",
            TokenKind::Ptr => "ptr",
            TokenKind::Include => "include",
            TokenKind::Exists => "exists",
            TokenKind::Redirect => "redirect",
            TokenKind::Exp => "exp",
            TokenKind::Err => "err",
        })
    }
}

/// The qualifier prefixed to a mechanism, selecting the verdict produced on
/// a match. `Plus` is implied when absent; `Err` is the sentinel carried by
/// unlexable terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Plus,
    Minus,
    Tilde,
    Question,
    Err,
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Qualifier::Plus => "",
            Qualifier::Minus => "-",
            Qualifier::Tilde => "~",
            Qualifier::Question => "?",
            Qualifier::Err => "",
        })
    }
}

/// One lexed term: its kind, its qualifier, and the post-delimiter payload
/// (domain, address, CIDR, macro string...).
///
/// For modifiers the qualifier position carries no semantics and is left at
/// its `Plus` default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub qualifier: Qualifier,
    pub value: String,
}

impl Token {
    pub fn new(kind: TokenKind, qualifier: Qualifier, value: &str) -> Self {
        Token {
            kind,
            qualifier,
            value: value.to_owned(),
        }
    }

    fn err() -> Self {
        Token::new(TokenKind::Err, Qualifier::Err, "")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Err => f.write_str("<invalid term>"),
            _ if self.value.is_empty() => {
                write!(f, "{}{}", self.qualifier, self.kind)
            },
            TokenKind::Version | TokenKind::Redirect | TokenKind::Exp => {
                write!(f, "{}={}", self.kind, self.value)
            },
            _ => write!(f, "{}{}:{}", self.qualifier, self.kind, self.value),
        }
    }
}

/// Lexes a whole policy record into its ordered term sequence.
pub fn lex(record: &str) -> Vec<Token> {
    record.split_whitespace().map(scan_term).collect()
}

/// Lexes a single whitespace-free term.
fn scan_term(word: &str) -> Token {
    let mut chars = word.chars();
    let (qualifier, rest) = match chars.next() {
        None => return Token::err(),
        Some('+') => (Qualifier::Plus, chars.as_str()),
        Some('-') => (Qualifier::Minus, chars.as_str()),
        Some('?') => (Qualifier::Question, chars.as_str()),
        Some('~') => (Qualifier::Tilde, chars.as_str()),
        Some(_) => (Qualifier::Plus, word),
    };

    let (name, delimiter, value) = match rest.find([':', '=']) {
        Some(pos) => (
            &rest[..pos],
            Some(rest.as_bytes()[pos] as char),
            &rest[pos + 1..],
        ),
        None => (rest, None, ""),
    };

    let kind = TokenKind::from_name(name);
    if kind.is_err() {
        return Token::err();
    }

    // The preamble is exempt from the delimiter-side rules below.
    if kind == TokenKind::Version {
        return Token::new(kind, qualifier, value);
    }

    match delimiter {
        // A delimiter with nothing after it is always malformed.
        Some(_) if value.is_empty() => Token::err(),
        Some('=') if kind.is_mechanism() => Token::err(),
        Some(':') if kind.is_modifier() => Token::err(),
        // Modifiers only exist in `name=value` form.
        None if kind.is_modifier() => Token::err(),
        _ => Token::new(kind, qualifier, value),
    }
}
