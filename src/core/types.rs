//! SC-001: Core types for the config document, ledger rows and run reports.
//!
//! All config types derive Serialize/Deserialize so the same structs load from
//! YAML, JSON, or TOML documents.

use super::error::PipelineError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Top-level config document
// ============================================================================

/// Root configuration: stages and the workflows built from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Ledger and artifact locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Global stage declarations
    #[serde(default)]
    pub stages: Vec<StageDefinition>,

    /// Named targets over the declared stages
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

/// Where the ledger database and artifact files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite ledger file, relative to the state directory unless absolute
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,

    /// Artifact directory, relative to the state directory unless absolute
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger(),
            artifacts: default_artifacts(),
        }
    }
}

fn default_ledger() -> PathBuf {
    PathBuf::from("ledger.sqlite3")
}

fn default_artifacts() -> PathBuf {
    PathBuf::from("artifacts")
}

impl StorageConfig {
    pub fn ledger_path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(&self.ledger)
    }

    pub fn artifact_dir(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(&self.artifacts)
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Static description of one stage. Loaded once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name
    pub name: String,

    /// Registry key of the implementation (`module.operation`); `None` marks a placeholder
    #[serde(default)]
    pub implementation: Option<String>,

    /// Declared output type tag
    #[serde(default)]
    pub output: OutputType,

    /// Parameters handed to the implementation
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    /// Exempt from implementation-version invalidation
    #[serde(default)]
    pub freeze: bool,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, implementation: Option<&str>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.map(str::to_string),
            output: OutputType::default(),
            params: IndexMap::new(),
            freeze: false,
        }
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// The configuration that participates in cache validity.
    /// Excludes `freeze`.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "implementation": self.implementation,
            "output": self.output.tag(),
            "params": self.params,
        })
    }
}

/// Declared output kind of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputType {
    /// Tabular / geospatial table
    Table,
    /// Generic serialized object
    #[default]
    Object,
    /// Raw byte blob
    Bytes,
    /// Tag that no encoder understands; fails at get/serialize time
    Unknown(String),
}

impl OutputType {
    pub fn tag(&self) -> &str {
        match self {
            Self::Table => "table",
            Self::Object => "object",
            Self::Bytes => "bytes",
            Self::Unknown(tag) => tag,
        }
    }

    /// File extension for this kind, or a serialization error for unknown tags.
    pub fn extension(&self) -> Result<&'static str, PipelineError> {
        match self {
            Self::Table => Ok("table.json"),
            Self::Object => Ok("json"),
            Self::Bytes => Ok("bin"),
            Self::Unknown(tag) => Err(PipelineError::Serialization(format!(
                "unrecognized output type '{}'",
                tag
            ))),
        }
    }
}

impl From<String> for OutputType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "table" | "geotable" | "dataframe" => Self::Table,
            "object" | "json" | "pickle" => Self::Object,
            "bytes" | "blob" => Self::Bytes,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<&str> for OutputType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<OutputType> for String {
    fn from(t: OutputType) -> Self {
        t.tag().to_string()
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Ordered marker for the version of a stage implementation.
/// Microseconds since the Unix epoch, so file mtimes map onto it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImplVersion(pub i64);

impl ImplVersion {
    pub fn fixed(v: i64) -> Self {
        Self(v)
    }

    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.timestamp_micros())
    }

    /// Last-modified time of a file.
    pub fn from_path_mtime(path: &Path) -> std::io::Result<Self> {
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(Self::from_timestamp(DateTime::<Utc>::from(modified)))
    }
}

impl fmt::Display for ImplVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_micros(self.0) {
            Some(ts) if self.0 > 0 => write!(f, "{}", ts.to_rfc3339()),
            _ => write!(f, "v{}", self.0),
        }
    }
}

// ============================================================================
// Workflows (as declared)
// ============================================================================

/// A named target stage plus the dependency edges reachable from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,

    #[serde(rename = "final")]
    pub final_stage: String,

    #[serde(default)]
    pub stages: Vec<WorkflowStage>,
}

/// One stage entry within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub stage: String,

    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ============================================================================
// Ledger rows
// ============================================================================

/// Outcome recorded for one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct StageExecution {
    pub id: i64,
    pub name: String,
    pub executed: DateTime<Utc>,
    pub status: ExecutionStatus,
    /// Canonical JSON of the parameter snapshot
    pub stage_config: String,
    /// BLAKE3 digest of `stage_config`
    pub config_digest: String,
    /// Artifact file name, relative to the artifact directory
    pub filename: Option<String>,
    pub module_updated: ImplVersion,
    /// Superseded by garbage collection; never a cache source
    pub collected: bool,
}

/// A row about to be appended.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub name: String,
    pub executed: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub stage_config: String,
    pub config_digest: String,
    pub filename: Option<String>,
    pub module_updated: ImplVersion,
}

/// Result of a ledger garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub stages_kept: u32,
    pub rows_collected: u32,
    pub files_removed: u32,
    pub files_missing: u32,
    /// Collected files that could not be removed
    pub files_failed: u32,
}

// ============================================================================
// Run report
// ============================================================================

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Reused a ledger row recorded at `executed_at`.
    CacheHit { executed_at: DateTime<Utc> },
    /// Implementation ran and produced a stored artifact.
    Executed,
    /// Implementation ran and reported itself unimplemented.
    Incomplete,
    /// No implementation configured.
    Placeholder,
    /// Implementation failed, or a cached failure was replayed.
    Failed { message: String },
    /// Not invoked because an upstream stage failed.
    Skipped { upstream: String },
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "CACHED",
            Self::Executed => "EXECUTED",
            Self::Incomplete => "INCOMPLETE",
            Self::Placeholder => "PLACEHOLDER",
            Self::Failed { .. } => "FAILED",
            Self::Skipped { .. } => "SKIPPED",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Skipped { .. })
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit { executed_at } => {
                write!(f, "{} (from {})", self.label(), executed_at.to_rfc3339())
            }
            Self::Failed { message } => write!(f, "{}: {}", self.label(), message),
            Self::Skipped { upstream } => {
                write!(f, "{} (upstream '{}' failed)", self.label(), upstream)
            }
            _ => write!(f, "{}", self.label()),
        }
    }
}

/// Summary of one workflow run.
#[derive(Debug)]
pub struct RunReport {
    pub workflow: String,
    /// Outcomes in completion order
    pub outcomes: IndexMap<String, StageOutcome>,
    pub iterations: usize,
    /// Number of external stage invocations
    pub invocations: u32,
    pub results: super::context::Results,
}

impl RunReport {
    pub fn count(&self, pred: impl Fn(&StageOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn cache_hits(&self) -> usize {
        self.count(|o| matches!(o, StageOutcome::CacheHit { .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(StageOutcome::is_failure)
    }

    /// Failed and skipped stages, in completion order.
    pub fn stage_errors(&self) -> Vec<PipelineError> {
        self.outcomes
            .iter()
            .filter_map(|(stage, outcome)| {
                let message = match outcome {
                    StageOutcome::Failed { message } => message.clone(),
                    StageOutcome::Skipped { upstream } => {
                        format!("upstream stage '{}' failed", upstream)
                    }
                    _ => return None,
                };
                Some(PipelineError::StageExecution {
                    stage: stage.clone(),
                    message,
                })
            })
            .collect()
    }
}
