use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A configured watchlist pattern as written in `monitoring_sites`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPattern {
    /// Literal subnet; a bare address becomes a host route.
    Subnet(IpNet),
    /// DNS name, resolved periodically.
    Hostname(String),
}

impl WatchPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(String::from("empty watchlist entry"));
        }
        if raw.contains('/') {
            return IpNet::from_str(raw)
                .map(|net| WatchPattern::Subnet(net.trunc()))
                .map_err(|e| format!("'{}' is not a valid CIDR subnet: {}", raw, e));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(WatchPattern::Subnet(IpNet::from(ip)));
        }
        if is_plausible_hostname(raw) {
            return Ok(WatchPattern::Hostname(raw.to_ascii_lowercase()));
        }
        Err(format!("'{}' is neither a subnet nor a hostname", raw))
    }
}

impl fmt::Display for WatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchPattern::Subnet(net) => write!(f, "{}", net),
            WatchPattern::Hostname(name) => write!(f, "{}", name),
        }
    }
}

fn is_plausible_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Runtime state of one watchlist pattern.
#[derive(Debug, Clone)]
pub enum WatchlistEntry {
    Subnet(IpNet),
    Hostname {
        name: String,
        addresses: HashSet<IpAddr>,
        last_resolved: Option<DateTime<Utc>>,
    },
}

impl WatchlistEntry {
    pub fn pattern(&self) -> String {
        match self {
            WatchlistEntry::Subnet(net) => net.to_string(),
            WatchlistEntry::Hostname { name, .. } => name.clone(),
        }
    }

    pub fn matches(&self, destination: &IpAddr) -> bool {
        match self {
            WatchlistEntry::Subnet(net) => net.contains(destination),
            WatchlistEntry::Hostname { addresses, .. } => addresses.contains(destination),
        }
    }
}

impl From<WatchPattern> for WatchlistEntry {
    fn from(pattern: WatchPattern) -> Self {
        match pattern {
            WatchPattern::Subnet(net) => WatchlistEntry::Subnet(net),
            WatchPattern::Hostname(name) => WatchlistEntry::Hostname {
                name,
                addresses: HashSet::new(),
                last_resolved: None,
            },
        }
    }
}

/// One session touching one watchlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WatchlistHit {
    pub real_address: IpAddr,
    pub pattern: String,
    pub destination: IpAddr,
}

/// Session fields the monitor needs to attribute observed traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    pub real_address: IpAddr,
    pub virtual_address: IpAddr,
}
