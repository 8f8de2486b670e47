//! SC-008: Cache validity of a ledger row.
//!
//! A row is reusable only if code, upstream data and config are all unchanged
//! since it was recorded.

use super::types::{ImplVersion, StageExecution};
use chrono::{DateTime, Utc};
use std::fmt;

/// Current facts about a stage, gathered just before its cache lookup.
#[derive(Debug, Clone)]
pub struct StageProbe<'a> {
    pub version: ImplVersion,
    pub freeze: bool,
    pub newest_dependency: Option<DateTime<Utc>>,
    pub config_digest: &'a str,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Hit,
    Miss(MissReason),
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NoHistory,
    Forced,
    CodeChanged {
        current: ImplVersion,
        recorded: ImplVersion,
    },
    UpstreamNewer {
        upstream: DateTime<Utc>,
        executed: DateTime<Utc>,
    },
    ConfigChanged,
    /// The row is valid but its artifact file is gone.
    ArtifactMissing(String),
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHistory => write!(f, "no previous execution"),
            Self::Forced => write!(f, "forced"),
            Self::CodeChanged { current, recorded } => {
                write!(f, "implementation changed ({} > {})", current, recorded)
            }
            Self::UpstreamNewer { upstream, executed } => write!(
                f,
                "upstream completed {} after execution at {}",
                upstream.to_rfc3339(),
                executed.to_rfc3339()
            ),
            Self::ConfigChanged => write!(f, "parameters changed"),
            Self::ArtifactMissing(file) => write!(f, "artifact {} is missing", file),
        }
    }
}

/// Decide whether `row` (the latest ledger row for the stage) may be reused.
pub fn evaluate(probe: &StageProbe<'_>, row: Option<&StageExecution>) -> CacheDecision {
    if probe.forced {
        return CacheDecision::Miss(MissReason::Forced);
    }
    let Some(row) = row else {
        return CacheDecision::Miss(MissReason::NoHistory);
    };

    // Code freshness
    if !probe.freeze && probe.version > row.module_updated {
        return CacheDecision::Miss(MissReason::CodeChanged {
            current: probe.version,
            recorded: row.module_updated,
        });
    }

    // Dependency freshness
    if let Some(upstream) = probe.newest_dependency {
        if upstream > row.executed {
            return CacheDecision::Miss(MissReason::UpstreamNewer {
                upstream,
                executed: row.executed,
            });
        }
    }

    // Config equality
    if probe.config_digest != row.config_digest {
        return CacheDecision::Miss(MissReason::ConfigChanged);
    }

    CacheDecision::Hit
}
