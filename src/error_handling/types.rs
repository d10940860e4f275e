use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingValue(String),
    BadWatchlistEntry(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingValue(e) => write!(f, "Missing configuration value: {}", e),
            ConfigError::BadWatchlistEntry(e) => write!(f, "Watchlist entry error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

#[derive(Debug)]
pub enum RegistryError {
    DuplicateKey(IpAddr),
    NotFound(IpAddr),
    IoError(std::io::Error),
    Corrupt(String),
    LockTimeout(PathBuf),
    WriteFailed(String),
    InvalidRecord(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateKey(ip) => write!(f, "User {} is already registered", ip),
            RegistryError::NotFound(ip) => write!(f, "User {} is not registered", ip),
            RegistryError::IoError(e) => write!(f, "Registry IO error: {}", e),
            RegistryError::Corrupt(e) => write!(f, "Registry file is corrupt: {}", e),
            RegistryError::LockTimeout(p) => {
                write!(f, "Timed out waiting for registry lock {}", p.display())
            }
            RegistryError::WriteFailed(e) => write!(f, "Registry write failed: {}", e),
            RegistryError::InvalidRecord(e) => write!(f, "Invalid user record: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::IoError(err)
    }
}

#[derive(Debug)]
pub enum WatchError {
    ResolutionFailed(String),
    ResolutionTimeout(String),
    ObserverUnavailable(String),
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::ResolutionFailed(e) => write!(f, "Hostname resolution failed: {}", e),
            WatchError::ResolutionTimeout(e) => write!(f, "Hostname resolution timed out: {}", e),
            WatchError::ObserverUnavailable(e) => {
                write!(f, "Destination observer unavailable: {}", e)
            }
        }
    }
}

impl std::error::Error for WatchError {}

#[derive(Debug)]
pub enum SinkError {
    WriteFailed(std::io::Error),
    Serialization(String),
    RetriesExhausted { attempts: u32, last: std::io::Error },
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::WriteFailed(e) => write!(f, "Traffic log write failed: {}", e),
            SinkError::Serialization(e) => write!(f, "Traffic record serialization failed: {}", e),
            SinkError::RetriesExhausted { attempts, last } => write!(
                f,
                "Traffic log unwritable after {} attempts, last error: {}",
                attempts, last
            ),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::WriteFailed(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    RegistryError(RegistryError),
    SinkError(SinkError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::RegistryError(e) => write!(f, "Registry error: {}", e),
            ControllerError::SinkError(e) => write!(f, "Traffic log error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<RegistryError> for ControllerError {
    fn from(err: RegistryError) -> Self {
        ControllerError::RegistryError(err)
    }
}

impl From<SinkError> for ControllerError {
    fn from(err: SinkError) -> Self {
        ControllerError::SinkError(err)
    }
}
