//! Daemon event loop.
//!
//! [`Controller`] wires the status watcher, accountant, watchlist and traffic
//! logger together and runs them until shutdown.

pub mod controller_handler;

pub use controller_handler::{shutdown_signal, Controller};
