//! IP access control lists
//!
//! Parses "all", "a.b.c.d", "a.b.c.d/bits", or "a.b.c.d/e.f.g.h" entries
//! and evaluates a peer against allow/deny lists in a configured order.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// One allow or deny entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControl {
    /// IPv4 address as a host-order integer.
    pub ip: u32,
    /// Subnet mask in the same order. 0 means "match all".
    pub mask: u32,
}

impl AccessControl {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.mask == 0 || (ip & self.mask) == (self.ip & self.mask)
    }
}

/// ACL evaluation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOrder {
    /// A deny match refuses; everyone else is let in.
    #[default]
    DenyAllow,
    /// An allow match admits even when a deny entry also matches; unlisted
    /// peers are let in.
    AllowDeny,
    /// Must match allow and must not match deny; unlisted peers are refused.
    MutualFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid access list entry: '{0}'")]
pub struct AclError(pub String);

/// Parse one list entry: `all`, a host, `host/bits` or `host/dotted-mask`.
pub fn parse_ipmask(s: &str) -> Option<AccessControl> {
    if s == "all" {
        return Some(AccessControl { ip: 0, mask: 0 });
    }

    if let Some((addr_part, mask_part)) = s.split_once('/') {
        let ip = parse_ipv4(addr_part)?;
        if mask_part.contains('.') {
            let mask = parse_ipv4(mask_part)?;
            return Some(AccessControl { ip, mask });
        }
        let bits: u32 = mask_part.parse().ok()?;
        if bits > 32 {
            return None;
        }
        return Some(AccessControl {
            ip,
            mask: prefix_to_mask(bits),
        });
    }

    let ip = parse_ipv4(s)?;
    Some(AccessControl {
        ip,
        mask: 0xFFFF_FFFF,
    })
}

fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

fn prefix_to_mask(bits: u32) -> u32 {
    match bits {
        0 => 0,
        n => u32::MAX << (32 - n),
    }
}

/// Allow and deny lists plus the order they are consulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessList {
    allow: Vec<AccessControl>,
    deny: Vec<AccessControl>,
    order: AclOrder,
}

impl AccessList {
    /// Let everyone in.
    pub fn open() -> Self {
        Self {
            allow: vec![AccessControl { ip: 0, mask: 0 }],
            deny: Vec::new(),
            order: AclOrder::DenyAllow,
        }
    }

    pub fn parse<S: AsRef<str>>(allow: &[S], deny: &[S], order: AclOrder) -> Result<Self, AclError> {
        let parse_all = |entries: &[S]| {
            entries
                .iter()
                .map(|e| parse_ipmask(e.as_ref()).ok_or_else(|| AclError(e.as_ref().to_string())))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: parse_all(allow)?,
            deny: parse_all(deny)?,
            order,
        })
    }

    /// Whether a peer at `addr` may connect. IPv6 peers are only checked
    /// when they carry a mapped IPv4 address; otherwise only `all` entries apply.
    pub fn permits(&self, addr: IpAddr) -> bool {
        let ip = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let allowed = self.allow.iter().any(|a| a.matches(ip));
        let denied = self.deny.iter().any(|a| a.matches(ip));

        match self.order {
            AclOrder::DenyAllow => !denied,
            AclOrder::AllowDeny => allowed || !denied,
            AclOrder::MutualFailure => allowed && !denied,
        }
    }
}

impl Default for AccessList {
    fn default() -> Self {
        Self::open()
    }
}
