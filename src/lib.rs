//! Stagecache: incremental execution of data-pipeline stages.
//!
//! Runs a DAG of named stages, reuses previous results when code, config and
//! upstream data are unchanged, and keeps the execution history in SQLite.

pub mod cli;
pub mod core;
pub mod stages;
