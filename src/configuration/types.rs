use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Raw layout of the TOML configuration file, before validation.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub paths: PathsSection,
    pub logging: LoggingSection,
    pub monitor: MonitorSection,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

#[derive(Debug, Deserialize)]
pub struct PathsSection {
    pub openvpn_status_file: PathBuf,
    pub users_file: PathBuf,
    pub traffic_monitor_log: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub log_file: PathBuf,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    String::from("info")
}

#[derive(Debug, Deserialize)]
pub struct MonitorSection {
    pub network_interface: String,
    #[serde(default)]
    pub monitoring_sites: SiteList,
}

/// `monitoring_sites` may be written either as one comma separated string
/// or as a TOML array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SiteList {
    Joined(String),
    List(Vec<String>),
}

impl Default for SiteList {
    fn default() -> Self {
        SiteList::List(Vec::new())
    }
}

impl SiteList {
    pub fn entries(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            SiteList::Joined(s) => s.split(',').collect(),
            SiteList::List(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Timing and retry knobs of the daemon loop. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub debounce_ms: u64,
    pub poll_interval_secs: u64,
    pub watchlist_interval_secs: u64,
    pub resolve_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub resolve_timeout_secs: u64,
    pub sink_retry_limit: u32,
    pub sink_backoff_ms: u64,
    pub file_notifications: bool,
    pub lock_timeout_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            poll_interval_secs: 10,
            watchlist_interval_secs: 30,
            resolve_interval_secs: 300,
            read_timeout_secs: 5,
            resolve_timeout_secs: 5,
            sink_retry_limit: 5,
            sink_backoff_ms: 200,
            file_notifications: true,
            lock_timeout_ms: 5000,
        }
    }
}

impl DaemonSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watchlist_interval(&self) -> Duration {
        Duration::from_secs(self.watchlist_interval_secs)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
