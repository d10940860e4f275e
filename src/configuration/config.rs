use super::types::*;
use crate::error_handling::types::ConfigError;
use crate::watchlist::types::WatchPattern;
use log::{debug, LevelFilter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Validated, immutable runtime configuration.
///
/// Loaded once at startup from a TOML file and handed to each component's
/// constructor (usually behind an `Arc`). Nothing in the crate reads
/// configuration from ambient global state.
///
/// ```toml
/// [paths]
/// openvpn_status_file = "/var/log/openvpn/status.log"
/// users_file = "/etc/ovpn-monitor/users.json"
/// traffic_monitor_log = "/var/log/ovpn-monitor/traffic.log"
///
/// [logging]
/// log_file = "/var/log/ovpn-monitor/monitor.log"
///
/// [monitor]
/// network_interface = "tun0"
/// monitoring_sites = "example.com, 198.51.100.0/24"
/// ```
///
/// An optional `[daemon]` table tunes the loop timings, see [`DaemonSettings`].
#[derive(Debug, Clone)]
pub struct Config {
    pub status_file: PathBuf,
    pub users_file: PathBuf,
    pub traffic_log: PathBuf,
    pub log_file: PathBuf,
    pub log_level: LevelFilter,
    pub network_interface: String,
    pub watchlist: Vec<WatchPattern>,
    pub daemon: DaemonSettings,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, ConfigError> {
        let raw: ConfigFile = toml::from_str(content)?;
        Self::validate(raw)
    }

    fn validate(raw: ConfigFile) -> Result<Config, ConfigError> {
        require_path("paths.openvpn_status_file", &raw.paths.openvpn_status_file)?;
        require_path("paths.users_file", &raw.paths.users_file)?;
        require_path("paths.traffic_monitor_log", &raw.paths.traffic_monitor_log)?;
        require_path("logging.log_file", &raw.logging.log_file)?;

        let network_interface = raw.monitor.network_interface.trim().to_string();
        if network_interface.is_empty() {
            return Err(ConfigError::MissingValue(String::from(
                "monitor.network_interface",
            )));
        }

        let log_level = LevelFilter::from_str(raw.logging.level.trim()).map_err(|_| {
            ConfigError::NotInRange(format!(
                "logging.level '{}' is not one of off, error, warn, info, debug, trace",
                raw.logging.level
            ))
        })?;

        let watchlist = raw
            .monitor
            .monitoring_sites
            .entries()
            .iter()
            .map(|site| WatchPattern::parse(site).map_err(ConfigError::BadWatchlistEntry))
            .collect::<Result<Vec<_>, _>>()?;

        let daemon = raw.daemon;
        for (name, value) in [
            ("daemon.poll_interval_secs", daemon.poll_interval_secs),
            ("daemon.watchlist_interval_secs", daemon.watchlist_interval_secs),
            ("daemon.resolve_interval_secs", daemon.resolve_interval_secs),
            ("daemon.read_timeout_secs", daemon.read_timeout_secs),
            ("daemon.resolve_timeout_secs", daemon.resolve_timeout_secs),
            ("daemon.sink_retry_limit", u64::from(daemon.sink_retry_limit)),
        ] {
            if value == 0 {
                return Err(ConfigError::NotInRange(format!("{} must be > 0", name)));
            }
        }

        Ok(Config {
            status_file: raw.paths.openvpn_status_file,
            users_file: raw.paths.users_file,
            traffic_log: raw.paths.traffic_monitor_log,
            log_file: raw.logging.log_file,
            log_level,
            network_interface,
            watchlist,
            daemon,
        })
    }
}

fn require_path(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::MissingValue(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[paths]
openvpn_status_file = "/var/log/openvpn/status.log"
users_file = "/etc/ovpn-monitor/users.json"
traffic_monitor_log = "/var/log/ovpn-monitor/traffic.log"

[logging]
log_file = "/var/log/ovpn-monitor/monitor.log"

[monitor]
network_interface = "tun0"
monitoring_sites = "example.com, 198.51.100.0/24"
"#;

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.status_file, PathBuf::from("/var/log/openvpn/status.log"));
        assert_eq!(config.users_file, PathBuf::from("/etc/ovpn-monitor/users.json"));
        assert_eq!(config.network_interface, "tun0");
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(
            config.watchlist,
            vec![
                WatchPattern::Hostname("example.com".into()),
                WatchPattern::Subnet("198.51.100.0/24".parse().unwrap()),
            ]
        );
        assert_eq!(config.daemon, DaemonSettings::default());
    }

    #[test]
    fn test_sites_as_array_and_daemon_overrides() {
        let content = MINIMAL.replace(
            "monitoring_sites = \"example.com, 198.51.100.0/24\"",
            "monitoring_sites = [\"203.0.113.0/24\"]\n\n[daemon]\npoll_interval_secs = 2\nfile_notifications = false",
        );
        let config = Config::from_toml_str(&content).unwrap();
        assert_eq!(config.watchlist.len(), 1);
        assert_eq!(config.daemon.poll_interval_secs, 2);
        assert!(!config.daemon.file_notifications);
        assert_eq!(config.daemon.debounce_ms, 500);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/ovpn-monitor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_missing_section() {
        let err = Config::from_toml_str("[paths]\nusers_file = \"/tmp/u.json\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn test_bad_watchlist_entry() {
        let content = MINIMAL.replace("198.51.100.0/24", "198.51.100.0/99");
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::BadWatchlistEntry(_)));
    }

    #[test]
    fn test_empty_interface() {
        let content = MINIMAL.replace("\"tun0\"", "\"  \"");
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let content = format!("{}\n[daemon]\nwatchlist_interval_secs = 0\n", MINIMAL);
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::NotInRange(_)));
    }
}
