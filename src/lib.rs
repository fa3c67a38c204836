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

//! An asynchronous implementation of the RFC 7208 `check_host()` function.
//!
//! Given the IP address of a connecting SMTP client, the domain taken from
//! the `MAIL FROM` (or `HELO`) identity, and the identity itself, the
//! [`spf::check_host`] entry point fetches the domain's TXT policy record,
//! evaluates its mechanisms against the client address (recursing through
//! `include` and `redirect` under a shared DNS lookup budget), and returns
//! one of the seven SPF verdicts together with the optional `exp`
//! explanation string.
//!
//! The engine talks to DNS exclusively through the narrow
//! [`support::dns::Resolver`] capability, so embedders may substitute their
//! own transport; a UDP resolver backed by `hickory-resolver` is provided.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
    ($expected:pat, $actual:expr,) => {
        assert_matches!($expected, $actual)
    };
}

pub mod spf;
pub mod support;
