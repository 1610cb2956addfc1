//! Trailguard Library
//!
//! Position and protective-order reconciliation for perpetual futures: a
//! trader that opens at most one protected trade per instrument, the
//! monitors that keep its trailing stop in place, a sweeper that converges
//! local state with the venue, and the scan scheduler that feeds it signals.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
