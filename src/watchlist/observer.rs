//! Sources of "which tunnel address talked to which destination".

use crate::error_handling::types::WatchError;
use ipnet::IpNet;
use log::{debug, info, trace, warn};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Destinations kept per source address between two drains.
pub const MAX_DESTINATIONS_PER_SOURCE: usize = 4096;

pub type Destinations = HashMap<IpAddr, HashSet<IpAddr>>;

/// Which packets are worth looking at: traffic from a tracked tunnel
/// address towards a watched network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureFilter {
    pub sources: BTreeSet<IpAddr>,
    pub destinations: BTreeSet<IpNet>,
}

impl CaptureFilter {
    pub fn new(
        sources: impl IntoIterator<Item = IpAddr>,
        destinations: impl IntoIterator<Item = IpNet>,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            destinations: destinations.into_iter().collect(),
        }
    }

    /// True when no packet can match.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() || self.destinations.is_empty()
    }

    /// The filter as a pcap expression, `None` when it is empty.
    pub fn to_bpf(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let sources: Vec<String> = self.sources.iter().map(|s| format!("src host {}", s)).collect();
        let destinations: Vec<String> = self
            .destinations
            .iter()
            .map(|net| {
                if net.prefix_len() == net.max_prefix_len() {
                    format!("dst host {}", net.addr())
                } else {
                    format!("dst net {}", net)
                }
            })
            .collect();
        Some(format!(
            "({}) and ({})",
            sources.join(" or "),
            destinations.join(" or ")
        ))
    }
}

/// Reports destination addresses contacted by tunnel clients.
pub trait DestinationObserver: Send {
    /// Restricts observation to the given sources and destinations.
    fn set_filter(&mut self, filter: &CaptureFilter);

    /// Takes everything observed since the previous drain, by source.
    fn drain(&mut self) -> Destinations;

    fn stop(&mut self) {}
}

/// Observer that never sees anything, used when capture is unavailable.
#[derive(Debug, Default)]
pub struct NullObserver;

impl DestinationObserver for NullObserver {
    fn set_filter(&mut self, _filter: &CaptureFilter) {}

    fn drain(&mut self) -> Destinations {
        HashMap::new()
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    tracked: HashSet<IpAddr>,
    seen: Destinations,
}

/// Builds the capture command for an interface and a pcap expression.
pub type Launcher = fn(interface: &str, expression: &str) -> Command;

fn tcpdump(interface: &str, expression: &str) -> Command {
    let mut cmd = Command::new("tcpdump");
    cmd.args(["-i", interface, "-n", "-l", "-q", expression]);
    cmd
}

struct Capture {
    child: Child,
    reader: JoinHandle<()>,
}

/// Packet capture through a `tcpdump` child process.
///
/// The child is started with a kernel-side filter and restarted whenever
/// the filter changes. While the filter is empty no child runs. Observed
/// destinations survive restarts until drained.
pub struct TcpdumpObserver {
    interface: String,
    launcher: Launcher,
    filter: CaptureFilter,
    state: Arc<Mutex<CaptureState>>,
    running: Arc<AtomicBool>,
    capture: Option<Capture>,
    launches: usize,
}

impl TcpdumpObserver {
    /// Captures on `interface` once a non-empty filter is set.
    pub fn new(interface: &str) -> Self {
        Self::with_launcher(interface, tcpdump)
    }

    pub fn with_launcher(interface: &str, launcher: Launcher) -> Self {
        Self {
            interface: interface.to_string(),
            launcher,
            filter: CaptureFilter::default(),
            state: Arc::new(Mutex::new(CaptureState::default())),
            running: Arc::new(AtomicBool::new(false)),
            capture: None,
            launches: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of capture processes started so far.
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Must be called inside a tokio runtime.
    fn launch(&mut self, expression: &str) -> Result<(), WatchError> {
        let mut cmd = (self.launcher)(&self.interface, expression);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| WatchError::ObserverUnavailable(format!("cannot start capture: {}", e)))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            WatchError::ObserverUnavailable(String::from("capture process has no stdout"))
        })?;

        self.running.store(true, Ordering::SeqCst);
        let task_state = Arc::clone(&self.state);
        let task_running = Arc::clone(&self.running);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => ingest(&task_state, &line),
                    Ok(None) => {
                        warn!("Destination capture exited, watchlist hits stop until the next restart");
                        break;
                    }
                    Err(e) => {
                        warn!("Destination capture read failed: {}", e);
                        break;
                    }
                }
            }
            task_running.store(false, Ordering::SeqCst);
        });

        self.launches += 1;
        self.capture = Some(Capture { child, reader });
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.reader.abort();
            if let Err(e) = capture.child.start_kill() {
                debug!("Capture process already gone: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl DestinationObserver for TcpdumpObserver {
    fn set_filter(&mut self, filter: &CaptureFilter) {
        {
            let mut state = lock(&self.state);
            state.tracked = filter.sources.iter().copied().collect();
            let CaptureState { tracked, seen } = &mut *state;
            seen.retain(|source, _| tracked.contains(source));
        }
        if *filter == self.filter {
            return;
        }
        self.filter = filter.clone();
        self.halt();

        let Some(expression) = filter.to_bpf() else {
            debug!("Nothing to capture, destination capture idle");
            return;
        };
        trace!("Capture filter: {}", expression);
        match self.launch(&expression) {
            Ok(()) => info!(
                "Capturing on {} for {} sources and {} destinations",
                self.interface,
                filter.sources.len(),
                filter.destinations.len()
            ),
            Err(e) => warn!("{}, watchlist matching disabled", e),
        }
    }

    fn drain(&mut self) -> Destinations {
        std::mem::take(&mut lock(&self.state).seen)
    }

    fn stop(&mut self) {
        self.halt();
    }
}

impl Drop for TcpdumpObserver {
    fn drop(&mut self) {
        self.halt();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ingest(state: &Mutex<CaptureState>, line: &str) {
    let Some((source, destination)) = parse_capture_line(line) else {
        return;
    };
    let mut state = lock(state);
    if !state.tracked.contains(&source) {
        return;
    }
    let destinations = state.seen.entry(source).or_default();
    if destinations.len() < MAX_DESTINATIONS_PER_SOURCE {
        destinations.insert(destination);
    }
}

fn packet_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bIP6?\s+(\S+)\s+>\s+(\S+?):(?:\s|$)").ok())
        .as_ref()
}

/// Extracts `(source, destination)` from one line of `tcpdump -n -q` output.
pub fn parse_capture_line(line: &str) -> Option<(IpAddr, IpAddr)> {
    let caps = packet_regex()?.captures(line)?;
    let source = parse_endpoint(caps.get(1)?.as_str())?;
    let destination = parse_endpoint(caps.get(2)?.as_str())?;
    Some((source, destination))
}

// tcpdump appends the port after a final dot, for both families.
fn parse_endpoint(raw: &str) -> Option<IpAddr> {
    if let Ok(ip) = raw.parse() {
        return Some(ip);
    }
    let (host, port) = raw.rsplit_once('.')?;
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_common_capture_lines() {
        assert_eq!(
            parse_capture_line("12:00:01.000001 IP 10.8.0.6.51234 > 198.51.100.7.443: tcp 0"),
            Some((ip("10.8.0.6"), ip("198.51.100.7")))
        );
        assert_eq!(
            parse_capture_line(
                "12:00:01.000002 IP 10.8.0.6 > 198.51.100.9: ICMP echo request, id 3, seq 1, length 64"
            ),
            Some((ip("10.8.0.6"), ip("198.51.100.9")))
        );
        assert_eq!(
            parse_capture_line("12:00:01.000003 IP6 fd00::6.40000 > 2001:db8::1.53: UDP, length 40"),
            Some((ip("fd00::6"), ip("2001:db8::1")))
        );
        assert_eq!(
            parse_capture_line("12:00:01.000004 tun0 Out IP 10.8.0.6.1 > 192.0.2.1.80: tcp 0"),
            Some((ip("10.8.0.6"), ip("192.0.2.1")))
        );
    }

    #[test]
    fn ignores_lines_it_cannot_classify() {
        assert_eq!(parse_capture_line("ARP, Request who-has 10.8.0.1 tell 10.8.0.6"), None);
        assert_eq!(parse_capture_line("listening on tun0, link-type RAW"), None);
        assert_eq!(parse_capture_line("12:00:01 IP garbage > 1.2.3.4.80: tcp"), None);
    }

    #[test]
    fn ingest_keeps_tracked_sources_only_and_caps_them() {
        let state = Mutex::new(CaptureState::default());
        lock(&state).tracked.insert(ip("10.8.0.6"));

        ingest(&state, "t IP 10.8.0.7.1 > 198.51.100.1.80: tcp 0");
        for i in 0..(MAX_DESTINATIONS_PER_SOURCE + 10) {
            let dst = std::net::Ipv4Addr::from(0xC000_0000u32 + i as u32);
            ingest(&state, &format!("t IP 10.8.0.6.1 > {}.80: tcp 0", dst));
        }

        let state = lock(&state);
        assert!(!state.seen.contains_key(&ip("10.8.0.7")));
        assert_eq!(state.seen[&ip("10.8.0.6")].len(), MAX_DESTINATIONS_PER_SOURCE);
    }

    fn filter(sources: &[&str], destinations: &[&str]) -> CaptureFilter {
        CaptureFilter::new(
            sources.iter().map(|s| ip(s)),
            destinations.iter().map(|d| d.parse::<IpNet>().unwrap()),
        )
    }

    #[test]
    fn filter_expression_narrows_sources_and_destinations() {
        let f = filter(&["10.8.0.10", "10.8.0.6"], &["198.51.100.0/24", "93.184.216.34/32"]);
        assert_eq!(
            f.to_bpf().unwrap(),
            "(src host 10.8.0.6 or src host 10.8.0.10) and \
             (dst host 93.184.216.34 or dst net 198.51.100.0/24)"
        );
        assert_eq!(
            filter(&["fd00::6"], &["2001:db8::/32"]).to_bpf().unwrap(),
            "(src host fd00::6) and (dst net 2001:db8::/32)"
        );
        assert!(filter(&[], &["198.51.100.0/24"]).to_bpf().is_none());
        assert!(filter(&["10.8.0.6"], &[]).to_bpf().is_none());
    }

    #[test]
    fn null_observer_sees_nothing() {
        let mut observer = NullObserver;
        observer.set_filter(&filter(&["10.8.0.6"], &["198.51.100.0/24"]));
        assert!(observer.drain().is_empty());
    }

    // Emits canned tcpdump output, including a line the kernel filter would
    // have dropped, then idles.
    fn scripted(_interface: &str, expression: &str) -> Command {
        assert!(expression.contains("src host 10.8.0.6"));
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c",
            "sleep 0.3; echo '1 IP 10.8.0.6.5000 > 198.51.100.7.443: tcp 0'; \
             echo '2 IP 10.8.0.9.5000 > 198.51.100.8.443: tcp 0'; sleep 5",
        ]);
        cmd
    }

    #[tokio::test]
    async fn child_output_is_attributed_and_drained() {
        let mut observer = TcpdumpObserver::with_launcher("tun0", scripted);
        observer.set_filter(&filter(&["10.8.0.6"], &["198.51.100.0/24"]));
        assert!(observer.is_running());

        let mut seen = Destinations::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            seen = observer.drain();
            if !seen.is_empty() {
                break;
            }
        }
        assert_eq!(seen.len(), 1);
        assert!(seen[&ip("10.8.0.6")].contains(&ip("198.51.100.7")));
        assert!(observer.drain().is_empty());

        observer.stop();
        assert!(!observer.is_running());
    }

    #[tokio::test]
    async fn capture_restarts_only_when_the_filter_changes() {
        let mut observer = TcpdumpObserver::with_launcher("tun0", scripted);
        observer.set_filter(&filter(&[], &["198.51.100.0/24"]));
        assert_eq!(observer.launches(), 0);
        assert!(!observer.is_running());

        let first = filter(&["10.8.0.6"], &["198.51.100.0/24"]);
        observer.set_filter(&first);
        observer.set_filter(&first);
        assert_eq!(observer.launches(), 1);

        observer.set_filter(&filter(&["10.8.0.6", "10.8.0.10"], &["198.51.100.0/24"]));
        assert_eq!(observer.launches(), 2);

        observer.set_filter(&filter(&[], &["198.51.100.0/24"]));
        assert!(!observer.is_running());
        assert_eq!(observer.launches(), 2);
    }

    fn missing_program(_interface: &str, _expression: &str) -> Command {
        Command::new("/nonexistent/capture-tool")
    }

    #[tokio::test]
    async fn missing_program_leaves_capture_idle() {
        let mut observer = TcpdumpObserver::with_launcher("tun0", missing_program);
        let err = observer.launch("ip").unwrap_err();
        assert!(matches!(err, WatchError::ObserverUnavailable(_)));

        observer.set_filter(&filter(&["10.8.0.6"], &["198.51.100.0/24"]));
        assert!(!observer.is_running());
        assert_eq!(observer.launches(), 0);
    }
}
