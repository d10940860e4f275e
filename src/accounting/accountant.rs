use crate::accounting::types::*;
use crate::registry::types::IdentityLookup;
use crate::status::types::SessionSnapshot;
use crate::watchlist::types::{TrackedSession, WatchlistHit};
use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

pub const COUNTER_RESET: &str = "counter reset";

/// Turns successive status snapshots into traffic records.
///
/// State is kept per [`SessionKey`] and only for sessions present in the
/// latest snapshot; a session that disappears gets one final record and is
/// dropped. Identity is resolved at emission time, so registry changes show
/// up on the next record without touching accounting state.
#[derive(Debug, Default)]
pub struct TrafficAccountant {
    sessions: BTreeMap<SessionKey, SessionAccountingState>,
    pending_hits: HashMap<IpAddr, Vec<WatchlistHit>>,
}

impl TrafficAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one snapshot and returns the records it produces.
    pub fn observe(
        &mut self,
        snapshot: &[SessionSnapshot],
        identities: &dyn IdentityLookup,
        now: DateTime<Utc>,
    ) -> Vec<TrafficRecord> {
        let mut records = Vec::new();
        let mut present: HashSet<SessionKey> = HashSet::with_capacity(snapshot.len());

        for session in snapshot {
            let key = SessionKey {
                real_address: session.real_address,
                connected_since: session.connected_since,
            };
            if !present.insert(key) {
                trace!("Ignoring repeated session {:?} within one snapshot", key);
                continue;
            }

            match self.sessions.get(&key) {
                None => {
                    let state = fresh_state(session, now, 1);
                    info!(
                        "Session started: {} from {}",
                        session.common_name, session.real_address
                    );
                    records.push(self.record(
                        &key,
                        &state,
                        RecordKind::Started,
                        session.bytes_received,
                        session.bytes_sent,
                        None,
                        identities,
                        now,
                    ));
                    self.sessions.insert(key, state);
                }
                Some(previous) => {
                    let previous = previous.clone();
                    if session.bytes_received < previous.last_bytes_received
                        || session.bytes_sent < previous.last_bytes_sent
                    {
                        info!(
                            "Counters of {} went backwards ({} -> {} received, {} -> {} sent), starting generation {}",
                            session.real_address,
                            previous.last_bytes_received,
                            session.bytes_received,
                            previous.last_bytes_sent,
                            session.bytes_sent,
                            previous.generation + 1
                        );
                        records.push(self.record(
                            &key,
                            &previous,
                            RecordKind::Ended,
                            0,
                            0,
                            Some(COUNTER_RESET),
                            identities,
                            now,
                        ));
                        let state = fresh_state(session, now, previous.generation + 1);
                        records.push(self.record(
                            &key,
                            &state,
                            RecordKind::Started,
                            session.bytes_received,
                            session.bytes_sent,
                            Some(COUNTER_RESET),
                            identities,
                            now,
                        ));
                        self.sessions.insert(key, state);
                        continue;
                    }

                    let delta_received = session.bytes_received - previous.last_bytes_received;
                    let delta_sent = session.bytes_sent - previous.last_bytes_sent;
                    let state = SessionAccountingState {
                        last_bytes_received: session.bytes_received,
                        last_bytes_sent: session.bytes_sent,
                        cumulative_received: previous.cumulative_received + delta_received,
                        cumulative_sent: previous.cumulative_sent + delta_sent,
                        reported_common_name: session.common_name.clone(),
                        virtual_address: session.virtual_address.or(previous.virtual_address),
                        ..previous
                    };
                    let hits_pending = self
                        .pending_hits
                        .get(&key.real_address)
                        .is_some_and(|h| !h.is_empty());
                    if delta_received > 0 || delta_sent > 0 || hits_pending {
                        records.push(self.record(
                            &key,
                            &state,
                            RecordKind::Updated,
                            delta_received,
                            delta_sent,
                            None,
                            identities,
                            now,
                        ));
                    }
                    self.sessions.insert(key, state);
                }
            }
        }

        let ended: Vec<SessionKey> = self
            .sessions
            .keys()
            .filter(|k| !present.contains(k))
            .copied()
            .collect();
        for key in ended {
            if let Some(state) = self.sessions.remove(&key) {
                info!(
                    "Session ended: {} from {} ({} received, {} sent)",
                    state.reported_common_name,
                    key.real_address,
                    state.cumulative_received,
                    state.cumulative_sent
                );
                records.push(self.record(
                    &key,
                    &state,
                    RecordKind::Ended,
                    0,
                    0,
                    None,
                    identities,
                    now,
                ));
            }
        }

        if !self.pending_hits.is_empty() {
            debug!(
                "Discarding watchlist hits for {} addresses without a session",
                self.pending_hits.len()
            );
            self.pending_hits.clear();
        }
        records
    }

    /// Queues hits to be attached to the next record of their session.
    pub fn queue_watchlist_hits(&mut self, hits: Vec<WatchlistHit>) {
        for hit in hits {
            let queue = self.pending_hits.entry(hit.real_address).or_default();
            if !queue.contains(&hit) {
                queue.push(hit);
            }
        }
    }

    pub fn pending_hit_count(&self) -> usize {
        self.pending_hits.values().map(Vec::len).sum()
    }

    /// Sessions with a known tunnel address, for destination observation.
    pub fn active_sessions(&self) -> Vec<TrackedSession> {
        let mut tracked: Vec<TrackedSession> = Vec::new();
        for (key, state) in &self.sessions {
            if let Some(virtual_address) = state.virtual_address {
                let session = TrackedSession {
                    real_address: key.real_address,
                    virtual_address,
                };
                if !tracked.contains(&session) {
                    tracked.push(session);
                }
            }
        }
        tracked
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state(&self, key: &SessionKey) -> Option<&SessionAccountingState> {
        self.sessions.get(key)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        key: &SessionKey,
        state: &SessionAccountingState,
        kind: RecordKind,
        delta_received: u64,
        delta_sent: u64,
        boundary: Option<&str>,
        identities: &dyn IdentityLookup,
        now: DateTime<Utc>,
    ) -> TrafficRecord {
        let watchlist_hits = self.pending_hits.remove(&key.real_address).unwrap_or_default();
        TrafficRecord {
            timestamp: now,
            kind,
            generation: state.generation,
            identity: Identity::from(identities.lookup(&key.real_address)),
            reported_common_name: state.reported_common_name.clone(),
            real_address: key.real_address,
            virtual_address: state.virtual_address,
            connected_since: key.connected_since,
            delta_received,
            delta_sent,
            cumulative_received: state.cumulative_received,
            cumulative_sent: state.cumulative_sent,
            watchlist_hits,
            boundary: boundary.map(str::to_string),
        }
    }
}

fn fresh_state(session: &SessionSnapshot, now: DateTime<Utc>, generation: u32) -> SessionAccountingState {
    SessionAccountingState {
        last_bytes_received: session.bytes_received,
        last_bytes_sent: session.bytes_sent,
        cumulative_received: session.bytes_received,
        cumulative_sent: session.bytes_sent,
        first_seen: now,
        generation,
        reported_common_name: session.common_name.clone(),
        virtual_address: session.virtual_address,
    }
}
