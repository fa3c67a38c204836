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

//! Splitting sender identities into their local and domain parts.

const POSTMASTER: &str = "postmaster";

/// The local and domain parts of a sender identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Email<'a> {
    pub local: &'a str,
    pub domain: &'a str,
}

/// Splits `sender` into its local and domain parts.
///
/// RFC 7208 § 4.3: an empty local part becomes `postmaster`, and a sender
/// without an `@` (or no sender at all, as with a bare `HELO` check) is
/// treated as `postmaster` at the identity itself, falling back to `helo`
/// when the sender is empty.
pub fn split_sender<'a>(sender: &'a str, helo: &'a str) -> Email<'a> {
    if sender.is_empty() {
        return Email {
            local: POSTMASTER,
            domain: helo,
        };
    }

    match sender.split_once('@') {
        Some(("", domain)) => Email {
            local: POSTMASTER,
            domain,
        },
        Some((local, domain)) => Email { local, domain },
        None => Email {
            local: POSTMASTER,
            domain: sender,
        },
    }
}
