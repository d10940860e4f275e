//! Watchlist matching: which sessions contacted a flagged site or subnet.

pub mod monitor;
pub mod observer;
pub mod resolver;
pub mod types;

pub use monitor::WatchlistMonitor;
pub use observer::{CaptureFilter, DestinationObserver, NullObserver, TcpdumpObserver};
pub use resolver::{HostResolver, SystemResolver};
pub use types::{TrackedSession, WatchPattern, WatchlistEntry, WatchlistHit};
