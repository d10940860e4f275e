pub mod logger;

pub use logger::{FileSink, LogSink, TrafficLogger};
