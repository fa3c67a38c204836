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

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Configuration for SPF evaluation.
///
/// The crate reads no files or environment variables itself; the embedder
/// constructs (or deserialises) this structure and passes it to
/// [`crate::spf::check_host`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// The UDP endpoint, in `address:port` form, that all DNS queries for
    /// an evaluation are sent to.
    pub dns_addr: SocketAddr,

    /// The maximum number of resolver calls one evaluation (including all
    /// `include` and `redirect` recursion) may make before it is aborted
    /// with `permerror`.
    ///
    /// RFC 7208 § 4.6.4 fixes this at 10; values below 1 are treated as
    /// already exhausted.
    #[serde(default = "default_lookup_budget")]
    pub lookup_budget: i32,
}

fn default_lookup_budget() -> i32 {
    10
}

impl Config {
    pub fn new(dns_addr: SocketAddr) -> Self {
        Config {
            dns_addr,
            lookup_budget: default_lookup_budget(),
        }
    }
}
