//! OpenVPN status file parsing.
//!
//! Both the version 1 layout (`OpenVPN CLIENT LIST` / `ROUTING TABLE` sections
//! introduced by a bare title line) and the version 2/3 layout (every line
//! tagged `CLIENT_LIST`, `ROUTING_TABLE`, ... with `HEADER` lines naming the
//! columns, comma or tab delimited) are understood. Columns are always
//! located through their header label.

use super::types::*;
use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

const COMMON_NAME: &str = "Common Name";
const REAL_ADDRESS: &str = "Real Address";
const VIRTUAL_ADDRESS: &str = "Virtual Address";
const BYTES_RECEIVED: &str = "Bytes Received";
const BYTES_SENT: &str = "Bytes Sent";
const CONNECTED_SINCE: &str = "Connected Since";
const CONNECTED_SINCE_EPOCH: &str = "Connected Since (time_t)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Clients,
    Routes,
    Global,
}

#[derive(Debug, Default)]
struct Columns {
    labels: Vec<String>,
}

impl Columns {
    fn new(labels: &[&str]) -> Self {
        Self {
            labels: labels.iter().map(|l| l.trim().to_string()).collect(),
        }
    }

    fn index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Default)]
struct RawTables<'a> {
    updated: Option<NaiveDateTime>,
    client_columns: Option<Columns>,
    route_columns: Option<Columns>,
    clients: Vec<(usize, Vec<&'a str>)>,
    routes: Vec<(usize, Vec<&'a str>)>,
    warnings: usize,
    complete: bool,
}

/// Parses the raw content of a status file.
///
/// Malformed rows are skipped and counted in [`StatusSnapshot::warnings`].
/// Content without a client list header, or without the closing `END` line,
/// yields [`Observation::Unavailable`] so a half-written file is never taken
/// for "no clients".
pub fn parse_status(content: &str) -> Observation {
    if content.trim().is_empty() {
        return Observation::Unavailable(UnavailableReason::Truncated);
    }

    let delimiter = if content.lines().next().is_some_and(|l| l.contains('\t')) {
        '\t'
    } else {
        ','
    };

    let tables = collect_tables(content, delimiter);

    let Some(client_columns) = tables.client_columns.as_ref() else {
        return Observation::Unavailable(UnavailableReason::Unrecognized);
    };
    if !tables.complete {
        return Observation::Unavailable(UnavailableReason::Truncated);
    }

    let required = [COMMON_NAME, REAL_ADDRESS, BYTES_RECEIVED, BYTES_SENT];
    if required.iter().any(|label| client_columns.index(label).is_none()) {
        debug!("Client list header lacks a required column: {:?}", client_columns.labels);
        return Observation::Unavailable(UnavailableReason::Unrecognized);
    }

    let routes = route_map(&tables);
    let mut warnings = tables.warnings;
    let mut seen = HashSet::new();
    let mut sessions = Vec::with_capacity(tables.clients.len());
    let mut duplicates = Vec::new();

    for (line_no, row) in &tables.clients {
        match session_from_row(row, client_columns, &routes) {
            Some(session) => {
                if seen.insert((session.real_address, session.connected_since)) {
                    sessions.push(session);
                } else {
                    warn!(
                        "Line {}: second session {} for {} at the same connection time, its traffic is not counted",
                        line_no, session.common_name, session.real_address
                    );
                    warnings += 1;
                    duplicates.push(session.common_name);
                }
            }
            None => {
                debug!("Line {}: malformed client row skipped", line_no);
                warnings += 1;
            }
        }
    }

    Observation::Snapshot(StatusSnapshot {
        updated: tables.updated,
        sessions,
        warnings,
        duplicates,
    })
}

fn collect_tables(content: &str, delimiter: char) -> RawTables<'_> {
    let mut tables = RawTables::default();
    let mut section = Section::Preamble;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(delimiter).collect();

        match fields[0].trim() {
            "END" => {
                tables.complete = true;
                break;
            }
            "OpenVPN CLIENT LIST" => section = Section::Clients,
            "ROUTING TABLE" => section = Section::Routes,
            "GLOBAL STATS" | "GLOBAL_STATS" => section = Section::Global,
            "TITLE" => {}
            "Updated" | "TIME" => {
                tables.updated = fields.get(1).and_then(|raw| parse_timestamp(raw));
            }
            "HEADER" => match fields.get(1).map(|s| s.trim()) {
                Some("CLIENT_LIST") => tables.client_columns = Some(Columns::new(&fields[2..])),
                Some("ROUTING_TABLE") => tables.route_columns = Some(Columns::new(&fields[2..])),
                _ => {}
            },
            "CLIENT_LIST" => push_row(&mut tables, Section::Clients, line_no, fields[1..].to_vec()),
            "ROUTING_TABLE" => push_row(&mut tables, Section::Routes, line_no, fields[1..].to_vec()),
            _ => match section {
                Section::Clients if tables.client_columns.is_none() => {
                    if fields.iter().any(|f| f.trim() == COMMON_NAME) {
                        tables.client_columns = Some(Columns::new(&fields));
                    } else {
                        tables.warnings += 1;
                    }
                }
                Section::Routes if tables.route_columns.is_none() => {
                    if fields.iter().any(|f| f.trim() == VIRTUAL_ADDRESS) {
                        tables.route_columns = Some(Columns::new(&fields));
                    } else {
                        tables.warnings += 1;
                    }
                }
                Section::Clients | Section::Routes => push_row(&mut tables, section, line_no, fields),
                Section::Preamble | Section::Global => {}
            },
        }
    }

    tables
}

fn push_row<'a>(tables: &mut RawTables<'a>, section: Section, line_no: usize, row: Vec<&'a str>) {
    let columns = match section {
        Section::Clients => tables.client_columns.as_ref(),
        _ => tables.route_columns.as_ref(),
    };
    match columns {
        Some(columns) if columns.len() == row.len() => match section {
            Section::Clients => tables.clients.push((line_no, row)),
            _ => tables.routes.push((line_no, row)),
        },
        _ => {
            debug!("Line {}: {} fields do not match the section header", line_no, row.len());
            tables.warnings += 1;
        }
    }
}

/// Raw real address text -> first plain virtual address routed to it.
fn route_map<'a>(tables: &RawTables<'a>) -> HashMap<&'a str, IpAddr> {
    let mut routes = HashMap::new();
    let Some(columns) = tables.route_columns.as_ref() else {
        return routes;
    };
    let (Some(virt_idx), Some(real_idx)) = (columns.index(VIRTUAL_ADDRESS), columns.index(REAL_ADDRESS))
    else {
        return routes;
    };
    for (_, row) in &tables.routes {
        // iroute entries look like "10.0.1.0/24" or carry a trailing 'C'; skip them
        if let Ok(ip) = row[virt_idx].trim().parse::<IpAddr>() {
            routes.entry(row[real_idx].trim()).or_insert(ip);
        }
    }
    routes
}

fn session_from_row(
    row: &[&str],
    columns: &Columns,
    routes: &HashMap<&str, IpAddr>,
) -> Option<SessionSnapshot> {
    let field = |label: &str| columns.index(label).map(|i| row[i].trim());

    let raw_real = field(REAL_ADDRESS)?;
    let real_address = parse_real_address(raw_real)?;
    let bytes_received = field(BYTES_RECEIVED)?.parse::<u64>().ok()?;
    let bytes_sent = field(BYTES_SENT)?.parse::<u64>().ok()?;

    let virtual_address = field(VIRTUAL_ADDRESS)
        .and_then(|v| v.parse::<IpAddr>().ok())
        .or_else(|| routes.get(raw_real).copied());

    let connected_since = field(CONNECTED_SINCE_EPOCH)
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc())
        .or_else(|| field(CONNECTED_SINCE).and_then(parse_timestamp));

    Some(SessionSnapshot {
        common_name: field(COMMON_NAME)?.to_string(),
        real_address,
        virtual_address,
        bytes_received,
        bytes_sent,
        connected_since,
    })
}

/// Accepts `ip:port`, `[v6]:port`, a bare address and an optional `proto:`
/// prefix such as `udp4:` or `tcp4-server:`.
pub fn parse_real_address(raw: &str) -> Option<IpAddr> {
    let mut s = raw.trim();
    if let Some((prefix, rest)) = s.split_once(':') {
        let is_proto = prefix.starts_with(|c: char| c.is_ascii_alphabetic())
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !prefix.chars().all(|c| c.is_ascii_hexdigit());
        if is_proto {
            s = rest;
        }
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    let (host, port) = s.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    host.trim_matches(|c| c == '[' || c == ']').parse().ok()
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%a %b %e %H:%M:%S %Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const V1: &str = "OpenVPN CLIENT LIST
Updated,2024-03-01 12:00:00
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
alice,10.0.0.5:51234,1000,500,2024-03-01 11:00:00
bob,203.0.113.9:40000,2048,4096,2024-03-01 11:30:00
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
10.8.0.6,alice,10.0.0.5:51234,2024-03-01 11:59:58
10.8.0.10,bob,203.0.113.9:40000,2024-03-01 11:59:50
GLOBAL STATS
Max bcast/mcast queue length,0
END
";

    const V2: &str = "TITLE,OpenVPN 2.6.8 x86_64-pc-linux-gnu
TIME,2024-03-01 12:00:00,1709294400
HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,Virtual IPv6 Address,Bytes Received,Bytes Sent,Connected Since,Connected Since (time_t),Username,Client ID,Peer ID,Data Channel Cipher
CLIENT_LIST,alice,10.0.0.5:51234,10.8.0.6,,1000,500,2024-03-01 11:00:00,1709290800,UNDEF,0,0,AES-256-GCM
HEADER,ROUTING_TABLE,Virtual Address,Common Name,Real Address,Last Ref,Last Ref (time_t)
ROUTING_TABLE,10.8.0.6,alice,10.0.0.5:51234,2024-03-01 11:59:58,1709294398
GLOBAL_STATS,Max bcast/mcast queue length,0
END
";

    fn snapshot(obs: Observation) -> StatusSnapshot {
        match obs {
            Observation::Snapshot(s) => s,
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[test]
    fn parses_version_one_and_joins_routing_table() {
        let snap = snapshot(parse_status(V1));
        assert_eq!(snap.warnings, 0);
        assert_eq!(snap.sessions.len(), 2);
        assert_eq!(
            snap.updated,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(12, 0, 0)
        );

        let alice = &snap.sessions[0];
        assert_eq!(alice.common_name, "alice");
        assert_eq!(alice.real_address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(alice.virtual_address, Some("10.8.0.6".parse().unwrap()));
        assert_eq!(alice.bytes_received, 1000);
        assert_eq!(alice.bytes_sent, 500);
        assert_eq!(
            alice.connected_since,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(11, 0, 0)
        );
        assert_eq!(snap.sessions[1].virtual_address, Some("10.8.0.10".parse().unwrap()));
    }

    #[test]
    fn parses_version_two_by_header_labels() {
        let snap = snapshot(parse_status(V2));
        assert_eq!(snap.sessions.len(), 1);
        let alice = &snap.sessions[0];
        assert_eq!(alice.virtual_address, Some("10.8.0.6".parse().unwrap()));
        assert_eq!(alice.bytes_received, 1000);
        assert_eq!(
            alice.connected_since,
            DateTime::from_timestamp(1709290800, 0).map(|d| d.naive_utc())
        );
    }

    #[test]
    fn parses_tab_delimited_version_three() {
        let v3 = V2.replace(',', "\t");
        let snap = snapshot(parse_status(&v3));
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.sessions[0].bytes_sent, 500);
    }

    #[test]
    fn tolerates_reordered_columns() {
        let content = "OpenVPN CLIENT LIST
Updated,2024-03-01 12:00:00
Bytes Sent,Common Name,Connected Since,Bytes Received,Real Address
77,carol,2024-03-01 10:00:00,88,198.51.100.3:1194
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
GLOBAL STATS
END
";
        let snap = snapshot(parse_status(content));
        assert_eq!(snap.sessions[0].common_name, "carol");
        assert_eq!(snap.sessions[0].bytes_received, 88);
        assert_eq!(snap.sessions[0].bytes_sent, 77);
        assert_eq!(snap.sessions[0].virtual_address, None);
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let content = V1
            .replace(
                "alice,10.0.0.5:51234,1000,500,2024-03-01 11:00:00",
                "alice,10.0.0.5:51234,lots,500,2024-03-01 11:00:00\ntruncated,row\nmallory,not-an-ip,1,2,2024-03-01 11:00:00",
            );
        let snap = snapshot(parse_status(&content));
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.sessions[0].common_name, "bob");
        assert_eq!(snap.warnings, 3);
    }

    #[test]
    fn unparseable_timestamp_keeps_the_row() {
        let content = V1.replace("2024-03-01 11:30:00", "sometime");
        let snap = snapshot(parse_status(&content));
        assert_eq!(snap.sessions.len(), 2);
        assert_eq!(snap.sessions[1].connected_since, None);
    }

    #[test]
    fn legacy_timestamp_format() {
        let content = V1.replace("2024-03-01 11:00:00", "Mon Jan 15 10:00:00 2024");
        let snap = snapshot(parse_status(&content));
        assert_eq!(
            snap.sessions[0].connected_since,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(10, 0, 0)
        );
    }

    #[test]
    fn duplicate_session_keys_keep_first_row() {
        let content = V1.replace(
            "bob,203.0.113.9:40000,2048,4096,2024-03-01 11:30:00",
            "alice,10.0.0.5:51299,7,7,2024-03-01 11:00:00",
        );
        let snap = snapshot(parse_status(&content));
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.sessions[0].bytes_received, 1000);
        assert_eq!(snap.warnings, 1);
        assert_eq!(snap.duplicates, vec!["alice".to_string()]);
    }

    #[test]
    fn clients_behind_one_nat_without_timestamps_are_reported() {
        let content = V1
            .replace("alice,10.0.0.5:51234,1000,500,2024-03-01 11:00:00", "alice,10.0.0.5:51234,1000,500,garbage")
            .replace("bob,203.0.113.9:40000,2048,4096,2024-03-01 11:30:00", "bob,10.0.0.5:40000,2048,4096,garbage");
        let snap = snapshot(parse_status(&content));
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.sessions[0].common_name, "alice");
        assert_eq!(snap.duplicates, vec!["bob".to_string()]);
    }

    #[test]
    fn empty_client_list_is_an_observation() {
        let content = "OpenVPN CLIENT LIST
Updated,2024-03-01 12:00:00
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
GLOBAL STATS
END
";
        let snap = snapshot(parse_status(content));
        assert!(snap.sessions.is_empty());
    }

    #[test]
    fn unreadable_content_is_no_observation() {
        assert_eq!(
            parse_status(""),
            Observation::Unavailable(UnavailableReason::Truncated)
        );
        let cut = &V1[..V1.find("ROUTING TABLE").unwrap()];
        assert_eq!(
            parse_status(cut),
            Observation::Unavailable(UnavailableReason::Truncated)
        );
        assert_eq!(
            parse_status("hello\nworld\nEND\n"),
            Observation::Unavailable(UnavailableReason::Unrecognized)
        );
    }

    #[test]
    fn real_address_forms() {
        let v4: IpAddr = "203.0.113.5".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(parse_real_address("203.0.113.5:1194"), Some(v4));
        assert_eq!(parse_real_address("203.0.113.5"), Some(v4));
        assert_eq!(parse_real_address("udp4:203.0.113.5:1194"), Some(v4));
        assert_eq!(parse_real_address("tcp4-server:203.0.113.5:1194"), Some(v4));
        assert_eq!(parse_real_address("[2001:db8::1]:1194"), Some(v6));
        assert_eq!(parse_real_address("2001:db8::1"), Some(v6));
        assert_eq!(parse_real_address("udp6:2001:db8::1"), Some(v6));
        assert_eq!(parse_real_address("nonsense"), None);
    }
}
