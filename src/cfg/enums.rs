// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

/// Order in which an adapter's allow/deny IP lists are evaluated (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclOrder {
    #[default]
    AllowDeny,
    DenyAllow,
}

impl fmt::Display for AclOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AclOrder::AllowDeny => "allow,deny",
            AclOrder::DenyAllow => "deny,allow",
        })
    }
}

impl std::str::FromStr for AclOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "allow,deny" => Ok(AclOrder::AllowDeny),
            "deny,allow" => Ok(AclOrder::DenyAllow),
            other => Err(anyhow::anyhow!("invalid acl order {other:?}")),
        }
    }
}

/// Transport named by an adapter's endpoint string (`tcp|udp -h <ip> -p
/// <port> -t <ms>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        })
    }
}

impl std::str::FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(anyhow::anyhow!("invalid transport {other:?}")),
        }
    }
}

/// Consistent-hash algorithm selectable per ring instance (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    /// MD5(key), four little-endian 32-bit groups, 4 ring entries/replica.
    Ketama,
    /// MD5(key) folded by XOR of its four 32-bit words.
    #[default]
    Default,
}

/// Client-side invocation routing mode (§4.8.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    RoundRobin,
    ConsistentHash,
    Static,
}
