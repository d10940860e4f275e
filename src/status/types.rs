use chrono::NaiveDateTime;
use std::fmt;
use std::net::IpAddr;

/// One client row of the status file, joined with its routing-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub common_name: String,
    pub real_address: IpAddr,
    pub virtual_address: Option<IpAddr>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: Option<NaiveDateTime>,
}

/// Everything extracted from one readable status file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub updated: Option<NaiveDateTime>,
    pub sessions: Vec<SessionSnapshot>,
    /// Lines that were skipped because they did not fit their section.
    pub warnings: usize,
    /// Common names of rows dropped because an earlier row had the same
    /// real address and connection time.
    pub duplicates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    Missing,
    Timeout,
    /// An earlier read that timed out is still blocked in the kernel.
    Stalled,
    Io(String),
    Truncated,
    Unrecognized,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::Missing => write!(f, "status file does not exist"),
            UnavailableReason::Timeout => write!(f, "status file read timed out"),
            UnavailableReason::Stalled => write!(f, "previous status file read is still blocked"),
            UnavailableReason::Io(e) => write!(f, "status file unreadable: {}", e),
            UnavailableReason::Truncated => write!(f, "status file is truncated"),
            UnavailableReason::Unrecognized => write!(f, "status file has no client list"),
        }
    }
}

/// Result of one read of the status file.
///
/// `Unavailable` is distinct from a snapshot with zero sessions: it means
/// nothing was learned this cycle and accounting state must stay untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Snapshot(StatusSnapshot),
    Unavailable(UnavailableReason),
}
