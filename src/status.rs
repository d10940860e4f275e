//! Status file input: parsing, bounded reads and change detection.

pub mod parser;
pub mod reader;
pub mod types;
pub mod watcher;

pub use parser::parse_status;
pub use reader::StatusReader;
pub use types::{Observation, SessionSnapshot, StatusSnapshot, UnavailableReason};
pub use watcher::{StatusFileWatcher, WatchTrigger};
