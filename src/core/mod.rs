//! Core engine: config, scheduling, staleness, ledger and artifacts.

pub mod artifact;
pub mod clock;
pub mod context;
pub mod digest;
pub mod error;
pub mod ledger;
pub mod parser;
pub mod registry;
pub mod runner;
pub mod staleness;
pub mod types;
