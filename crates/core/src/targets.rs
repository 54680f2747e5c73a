//! Target policy: which addresses and networks a job may address.
//!
//! [`TargetPolicy::validate`] is pure. It consults a fixed set of
//! always-blocked ranges first, then the admin-managed deny and allow lists
//! captured when the policy was built. Deny wins over allow on any overlap,
//! and a network is only allowed when a single allow entry contains all of
//! it.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fixed ranges
// ---------------------------------------------------------------------------

/// Ranges rejected regardless of admin configuration, with the reason
/// reported to the submitter.
static HARD_DENY: LazyLock<Vec<(IpNetwork, &'static str)>> = LazyLock::new(|| {
    [
        ("127.0.0.0/8", "loopback blocked"),
        ("169.254.0.0/16", "link-local blocked"),
        ("240.0.0.0/4", "reserved range blocked"),
        ("0.0.0.0/8", "reserved range blocked"),
        ("::1/128", "loopback blocked"),
        ("::/128", "reserved range blocked"),
        ("fe80::/10", "link-local blocked"),
        ("::ffff:0:0/96", "ipv4-mapped addresses blocked"),
    ]
    .into_iter()
    .map(|(cidr, reason)| (cidr.parse().expect("valid network literal"), reason))
    .collect()
});

/// Multicast space. Allowed only through an allow entry that is itself
/// multicast.
static MULTICAST: LazyLock<[IpNetwork; 2]> = LazyLock::new(|| {
    [
        "224.0.0.0/4".parse().expect("valid network literal"),
        "ff00::/8".parse().expect("valid network literal"),
    ]
});

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum TargetVerdict {
    Allowed,
    Rejected(String),
}

impl TargetVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TargetVerdict::Allowed)
    }
}

/// Which admin list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Allow,
    Deny,
}

impl ListKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListKind::Allow => "allow",
            ListKind::Deny => "deny",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "allow" => Some(ListKind::Allow),
            "deny" => Some(ListKind::Deny),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing and set relations
// ---------------------------------------------------------------------------

/// Parse an address or CIDR, normalising host bits away.
///
/// A bare address becomes a single-host network.
pub fn parse_target(raw: &str) -> Result<IpNetwork, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("invalid target: empty".to_string());
    }

    let parsed = if raw.contains('/') {
        raw.parse::<IpNetwork>()
            .map_err(|e| format!("invalid target '{raw}': {e}"))?
    } else {
        let addr: IpAddr = raw
            .parse()
            .map_err(|e| format!("invalid target '{raw}': {e}"))?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        IpNetwork::new(addr, prefix).map_err(|e| format!("invalid target '{raw}': {e}"))?
    };

    IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|e| format!("invalid target '{raw}': {e}"))
}

fn same_family(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Whether the two networks share at least one address.
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    same_family(a, b) && (a.contains(b.network()) || b.contains(a.network()))
}

/// Whether `outer` contains every address of `inner`.
pub fn contains_network(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    same_family(outer, inner) && outer.prefix() <= inner.prefix() && outer.contains(inner.network())
}

fn is_multicast(net: &IpNetwork) -> bool {
    MULTICAST.iter().any(|m| contains_network(m, net))
}

fn touches_multicast(net: &IpNetwork) -> bool {
    MULTICAST.iter().any(|m| overlaps(m, net))
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Immutable view of the admin allow/deny lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetPolicy {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
}

impl TargetPolicy {
    pub fn new(allow: Vec<IpNetwork>, deny: Vec<IpNetwork>) -> Self {
        let normalise = |nets: Vec<IpNetwork>| {
            nets.into_iter()
                .filter_map(|n| IpNetwork::new(n.network(), n.prefix()).ok())
                .collect()
        };
        Self {
            allow: normalise(allow),
            deny: normalise(deny),
        }
    }

    pub fn allow_entries(&self) -> &[IpNetwork] {
        &self.allow
    }

    pub fn deny_entries(&self) -> &[IpNetwork] {
        &self.deny
    }

    /// Classify a raw target string.
    pub fn validate(&self, target: &str) -> TargetVerdict {
        match parse_target(target) {
            Ok(net) => self.validate_network(&net),
            Err(reason) => TargetVerdict::Rejected(reason),
        }
    }

    /// Classify an already parsed network.
    pub fn validate_network(&self, net: &IpNetwork) -> TargetVerdict {
        if let Some((_, reason)) = HARD_DENY.iter().find(|(range, _)| overlaps(range, net)) {
            return TargetVerdict::Rejected((*reason).to_string());
        }

        if touches_multicast(net) {
            let allowed = self
                .allow
                .iter()
                .any(|entry| is_multicast(entry) && contains_network(entry, net));
            if !allowed {
                return TargetVerdict::Rejected("multicast blocked".to_string());
            }
        }

        if let Some(entry) = self.deny.iter().find(|entry| overlaps(entry, net)) {
            return TargetVerdict::Rejected(format!("denied by policy ({entry})"));
        }

        if self.allow.iter().any(|entry| contains_network(entry, net)) {
            TargetVerdict::Allowed
        } else {
            TargetVerdict::Rejected("not in allow list".to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Host expansion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpansionError {
    #[error("targets expand to more than {max} hosts")]
    TooManyHosts { max: usize },
}

fn host_count(net: &IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(v4) => {
            let total = 1u128 << (32 - u32::from(v4.prefix()));
            if v4.prefix() < 31 {
                total - 2
            } else {
                total
            }
        }
        IpNetwork::V6(v6) => {
            let bits = 128 - u32::from(v6.prefix());
            if bits >= 127 {
                u128::MAX
            } else {
                1u128 << bits
            }
        }
    }
}

/// Expand networks into an ordered, de-duplicated host list.
///
/// IPv4 network and broadcast addresses are skipped for prefixes shorter
/// than /31.
pub fn expand_hosts(targets: &[IpNetwork], max_hosts: usize) -> Result<Vec<IpAddr>, ExpansionError> {
    let limit = max_hosts as u128;
    let mut total: u128 = 0;
    for net in targets {
        total = total.saturating_add(host_count(net));
        if total > limit {
            return Err(ExpansionError::TooManyHosts { max: max_hosts });
        }
    }

    let mut seen = HashSet::new();
    let mut hosts = Vec::with_capacity(total as usize);
    for net in targets {
        match net {
            IpNetwork::V4(v4) => {
                let base = u32::from(v4.network());
                let size = 1u64 << (32 - u32::from(v4.prefix()));
                let (first, last) = if v4.prefix() < 31 {
                    (1, size - 1)
                } else {
                    (0, size)
                };
                for offset in first..last {
                    let addr = IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset as u32)));
                    if seen.insert(addr) {
                        hosts.push(addr);
                    }
                }
            }
            IpNetwork::V6(v6) => {
                let base = u128::from(v6.network());
                let size = host_count(net);
                for offset in 0..size {
                    let addr = IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)));
                    if seen.insert(addr) {
                        hosts.push(addr);
                    }
                }
            }
        }
    }
    Ok(hosts)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
