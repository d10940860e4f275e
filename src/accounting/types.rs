use crate::registry::types::UserRecord;
use crate::watchlist::types::WatchlistHit;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use uuid::Uuid;

/// Identifies one connected period of a client.
///
/// Two connections from the same real address are told apart by the
/// server-reported connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub real_address: IpAddr,
    pub connected_since: Option<NaiveDateTime>,
}

/// Running totals for one session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAccountingState {
    pub last_bytes_received: u64,
    pub last_bytes_sent: u64,
    pub cumulative_received: u64,
    pub cumulative_sent: u64,
    pub first_seen: DateTime<Utc>,
    /// Bumped every time the counters go backwards under the same key.
    pub generation: u32,
    pub reported_common_name: String,
    pub virtual_address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Started,
    Updated,
    Ended,
}

/// Who a session belongs to, according to the user registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Identity {
    Registered {
        user_id: Uuid,
        common_name: String,
        virtual_address: IpAddr,
    },
    Unknown,
}

impl Identity {
    pub fn display_name(&self) -> &str {
        match self {
            Identity::Registered { common_name, .. } => common_name,
            Identity::Unknown => "unknown",
        }
    }
}

impl From<Option<&UserRecord>> for Identity {
    fn from(record: Option<&UserRecord>) -> Self {
        match record {
            Some(r) => Identity::Registered {
                user_id: r.id,
                common_name: r.common_name.clone(),
                virtual_address: r.virtual_address,
            },
            None => Identity::Unknown,
        }
    }
}

/// One line of the traffic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub generation: u32,
    pub identity: Identity,
    pub reported_common_name: String,
    pub real_address: IpAddr,
    pub virtual_address: Option<IpAddr>,
    pub connected_since: Option<NaiveDateTime>,
    pub delta_received: u64,
    pub delta_sent: u64,
    pub cumulative_received: u64,
    pub cumulative_sent: u64,
    pub watchlist_hits: Vec<WatchlistHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary: Option<String>,
}
