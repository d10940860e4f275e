//! Per-user traffic accounting for an OpenVPN server.
//!
//! The daemon follows the server's status file, turns successive snapshots
//! into per-session traffic deltas attributed to registered users, flags
//! sessions that contact watchlisted destinations and appends everything to
//! a JSON-lines traffic log.

pub mod accounting;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod logging;
pub mod registry;
pub mod status;
pub mod traffic_log;
pub mod watchlist;
