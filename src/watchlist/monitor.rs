use crate::error_handling::types::WatchError;
use crate::watchlist::observer::Destinations;
use crate::watchlist::types::{TrackedSession, WatchPattern, WatchlistEntry, WatchlistHit};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::IpAddr;

/// Matches observed destinations of active sessions against the watchlist.
#[derive(Debug, Clone, Default)]
pub struct WatchlistMonitor {
    entries: Vec<WatchlistEntry>,
}

impl WatchlistMonitor {
    pub fn new(patterns: &[WatchPattern]) -> Self {
        Self {
            entries: patterns.iter().cloned().map(WatchlistEntry::from).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WatchlistEntry] {
        &self.entries
    }

    /// Names of all hostname entries, in configuration order.
    pub fn hostnames(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                WatchlistEntry::Hostname { name, .. } => Some(name.clone()),
                WatchlistEntry::Subnet(_) => None,
            })
            .collect()
    }

    /// Networks worth capturing: every subnet plus each resolved host address.
    pub fn destination_nets(&self) -> Vec<IpNet> {
        self.entries
            .iter()
            .flat_map(|e| match e {
                WatchlistEntry::Subnet(net) => vec![*net],
                WatchlistEntry::Hostname { addresses, .. } => {
                    addresses.iter().copied().map(IpNet::from).collect()
                }
            })
            .collect()
    }

    /// Stores fresh address sets for hostname entries.
    ///
    /// A failed or empty resolution leaves the previous set in place, so a
    /// flaky resolver never silently disables an entry.
    pub fn apply_resolutions(
        &mut self,
        results: Vec<(String, Result<HashSet<IpAddr>, WatchError>)>,
        now: DateTime<Utc>,
    ) {
        for (resolved_name, outcome) in results {
            for entry in self.entries.iter_mut() {
                let WatchlistEntry::Hostname {
                    name,
                    addresses,
                    last_resolved,
                } = entry
                else {
                    continue;
                };
                if *name != resolved_name {
                    continue;
                }
                match &outcome {
                    Ok(fresh) if !fresh.is_empty() => {
                        if *fresh != *addresses {
                            info!("Watchlist host {} now resolves to {:?}", name, fresh);
                        }
                        *addresses = fresh.clone();
                        *last_resolved = Some(now);
                    }
                    Ok(_) => warn!(
                        "Watchlist host {} resolved to nothing, keeping {} known addresses",
                        name,
                        addresses.len()
                    ),
                    Err(e) => warn!("{}, keeping {} known addresses", e, addresses.len()),
                }
            }
        }
    }

    /// Returns one hit per (session, entry, destination) observed.
    pub fn evaluate(&self, sessions: &[TrackedSession], observed: &Destinations) -> Vec<WatchlistHit> {
        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        for session in sessions {
            let Some(destinations) = observed.get(&session.virtual_address) else {
                continue;
            };
            let mut destinations: Vec<&IpAddr> = destinations.iter().collect();
            destinations.sort();
            for destination in destinations {
                for entry in self.entries.iter().filter(|e| e.matches(destination)) {
                    let hit = WatchlistHit {
                        real_address: session.real_address,
                        pattern: entry.pattern(),
                        destination: *destination,
                    };
                    if seen.insert(hit.clone()) {
                        hits.push(hit);
                    }
                }
            }
        }
        if !hits.is_empty() {
            debug!("Watchlist cycle produced {} hits", hits.len());
        }
        hits
    }
}
