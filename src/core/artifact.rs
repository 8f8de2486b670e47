//! SC-004: Artifacts: typed, possibly lazy handles to stage outputs.
//!
//! An artifact holds at most one of an in-memory value or a file reference,
//! optionally an error, and the completion timestamp downstream freshness
//! checks compare against.

use super::error::{PipelineError, Result};
use super::types::OutputType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// A tabular result. Geometry travels as an ordinary column (e.g. WKT).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; its width must match the column count.
    pub fn push_row(&mut self, row: Vec<serde_json::Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::Serialization(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// An in-memory stage result.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactValue {
    Table(Table),
    Object(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ArtifactValue {
    pub fn kind(&self) -> OutputType {
        match self {
            Self::Table(_) => OutputType::Table,
            Self::Object(_) => OutputType::Object,
            Self::Bytes(_) => OutputType::Bytes,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Table(t) => Ok(serde_json::to_vec(t)?),
            Self::Object(v) => Ok(serde_json::to_vec(v)?),
            Self::Bytes(b) => Ok(b.clone()),
        }
    }

    fn decode(bytes: Vec<u8>, output_type: &OutputType) -> Result<Self> {
        match output_type {
            OutputType::Table => Ok(Self::Table(serde_json::from_slice(&bytes)?)),
            OutputType::Object => Ok(Self::Object(serde_json::from_slice(&bytes)?)),
            OutputType::Bytes => Ok(Self::Bytes(bytes)),
            OutputType::Unknown(tag) => Err(PipelineError::Serialization(format!(
                "unrecognized output type '{}'",
                tag
            ))),
        }
    }
}

/// The output of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    value: Option<ArtifactValue>,
    file: Option<(PathBuf, OutputType)>,
    error: Option<String>,
    incomplete: bool,
    completed_at: Option<DateTime<Utc>>,
}

impl Artifact {
    /// A freshly computed result.
    pub fn new(value: ArtifactValue) -> Self {
        Self {
            value: Some(value),
            file: None,
            error: None,
            incomplete: false,
            completed_at: None,
        }
    }

    pub fn table(table: Table) -> Self {
        Self::new(ArtifactValue::Table(table))
    }

    pub fn object(value: serde_json::Value) -> Self {
        Self::new(ArtifactValue::Object(value))
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(ArtifactValue::Bytes(bytes.into()))
    }

    /// A lazy reference to a stored artifact. The timestamp is the original
    /// execution time of the row that produced the file, not now.
    pub fn cached(path: PathBuf, output_type: OutputType, executed_at: DateTime<Utc>) -> Self {
        Self {
            value: None,
            file: Some((path, output_type)),
            error: None,
            incomplete: false,
            completed_at: Some(executed_at),
        }
    }

    /// A result a stage already wrote to disk itself.
    pub fn from_file(path: PathBuf, output_type: OutputType) -> Self {
        Self {
            value: None,
            file: Some((path, output_type)),
            error: None,
            incomplete: false,
            completed_at: None,
        }
    }

    /// Marker for a stage that is intentionally unimplemented.
    pub fn incomplete() -> Self {
        Self {
            value: None,
            file: None,
            error: None,
            incomplete: true,
            completed_at: None,
        }
    }

    /// A failed result carrying its message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: None,
            file: None,
            error: Some(message.into()),
            incomplete: false,
            completed_at: None,
        }
    }

    /// True if neither an in-memory value nor a file reference is set.
    pub fn empty(&self) -> bool {
        self.value.is_none() && self.file.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn with_completed_at(mut self, ts: DateTime<Utc>) -> Self {
        self.completed_at = Some(ts);
        self
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_ref().map(|(p, _)| p.as_path())
    }

    /// The value, materializing it from the file reference if needed.
    pub fn get(&self) -> Result<Cow<'_, ArtifactValue>> {
        if let Some(ref value) = self.value {
            return Ok(Cow::Borrowed(value));
        }
        if let Some(ref message) = self.error {
            return Err(PipelineError::Serialization(format!(
                "artifact is an error result: {}",
                message
            )));
        }
        let (path, output_type) = self.file.as_ref().ok_or_else(|| {
            PipelineError::Serialization("artifact holds neither a value nor a file".to_string())
        })?;
        output_type.extension()?;
        let bytes = std::fs::read(path)?;
        Ok(Cow::Owned(ArtifactValue::decode(bytes, output_type)?))
    }

    /// Persist the in-memory value under a fresh unique name in `dir`.
    /// Returns the generated file name, or `None` for an incomplete marker.
    pub fn serialize(&self, dir: &Path, output_type: &OutputType) -> Result<Option<String>> {
        if self.incomplete {
            return Ok(None);
        }
        let ext = output_type.extension()?;
        let value = self.value.as_ref().ok_or_else(|| {
            PipelineError::Serialization("no in-memory value to serialize".to_string())
        })?;
        if value.kind() != *output_type {
            return Err(PipelineError::Serialization(format!(
                "stage produced {} but declares output type {}",
                value.kind(),
                output_type
            )));
        }
        let bytes = value.encode()?;

        std::fs::create_dir_all(dir)?;
        let filename = format!("{}.{}", uuid::Uuid::new_v4(), ext);
        let path = dir.join(&filename);

        // Atomic write: temp file + rename
        let tmp_path = dir.join(format!(".{}.tmp", filename));
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &path)?;

        Ok(Some(filename))
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref e) = self.error {
            return write!(f, "error {}", e);
        }
        if self.incomplete {
            return write!(f, "incomplete");
        }
        match (&self.value, &self.file) {
            (Some(ArtifactValue::Table(t)), _) => {
                write!(f, "table {} cols x {} rows", t.columns.len(), t.len())
            }
            (Some(ArtifactValue::Object(_)), _) => write!(f, "object"),
            (Some(ArtifactValue::Bytes(b)), _) => write!(f, "bytes ({})", b.len()),
            (None, Some((path, ty))) => write!(f, "{} file {}", ty, path.display()),
            (None, None) => write!(f, "empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_table() -> Table {
        let mut t = Table::new(["street", "geometry"]);
        t.push_row(vec![json!("Milwaukee Ave"), json!("LINESTRING (0 0, 1 1)")])
            .unwrap();
        t
    }

    #[test]
    fn test_sc004_empty() {
        assert!(Artifact::incomplete().empty());
        assert!(Artifact::error("boom").empty());
        assert!(!Artifact::bytes(vec![1u8]).empty());
        let cached = Artifact::cached("/x".into(), OutputType::Bytes, Utc::now());
        assert!(!cached.empty());
    }

    #[test]
    fn test_sc004_constructors_are_distinct() {
        let inc = Artifact::incomplete();
        assert!(inc.is_incomplete() && !inc.is_error());
        let err = Artifact::error("no route");
        assert!(err.is_error() && !err.is_incomplete());
        assert_eq!(err.error_message(), Some("no route"));
        let ok = Artifact::object(json!({"k": 1}));
        assert!(!ok.is_error() && !ok.is_incomplete() && !ok.empty());
    }

    #[test]
    fn test_sc004_get_in_memory() {
        let a = Artifact::table(sample_table());
        let v = a.get().unwrap();
        assert!(matches!(v, Cow::Borrowed(_)));
        assert_eq!(v.as_table().unwrap().column("geometry"), Some(1));
    }

    #[test]
    fn test_sc004_serialize_and_lazy_get() {
        let dir = tempfile::tempdir().unwrap();
        let a = Artifact::table(sample_table());
        let name = a.serialize(dir.path(), &OutputType::Table).unwrap().unwrap();
        assert!(name.ends_with(".table.json"));
        assert!(dir.path().join(&name).exists());

        let ts = Utc::now();
        let lazy = Artifact::cached(dir.path().join(&name), OutputType::Table, ts);
        assert_eq!(lazy.completed_at(), Some(ts));
        let v = lazy.get().unwrap();
        assert_eq!(v.as_table().unwrap(), &sample_table());
    }

    #[test]
    fn test_sc004_serialize_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = Artifact::bytes(b"abc".to_vec());
        let n1 = a.serialize(dir.path(), &OutputType::Bytes).unwrap().unwrap();
        let n2 = a.serialize(dir.path(), &OutputType::Bytes).unwrap().unwrap();
        assert_ne!(n1, n2);
        // No temp files left behind
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_sc004_serialize_incomplete_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let name = Artifact::incomplete()
            .serialize(dir.path(), &OutputType::Table)
            .unwrap();
        assert!(name.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sc004_unknown_output_type() {
        let dir = tempfile::tempdir().unwrap();
        let a = Artifact::bytes(vec![0u8]);
        let err = a
            .serialize(dir.path(), &OutputType::from("shapefile"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));

        std::fs::write(dir.path().join("x.shp"), b"data").unwrap();
        let lazy = Artifact::cached(dir.path().join("x.shp"), OutputType::from("shapefile"), Utc::now());
        assert!(matches!(lazy.get(), Err(PipelineError::Serialization(_))));
    }

    #[test]
    fn test_sc004_kind_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = Artifact::object(json!([1, 2]));
        let err = a.serialize(dir.path(), &OutputType::Table).unwrap_err();
        assert!(err.to_string().contains("declares output type table"));
    }

    #[test]
    fn test_sc004_get_error_artifact() {
        let err = Artifact::error("upstream hung up").get().unwrap_err();
        assert!(err.to_string().contains("upstream hung up"));
    }

    #[test]
    fn test_sc004_push_row_width() {
        let mut t = Table::new(["a"]);
        assert!(t.push_row(vec![json!(1), json!(2)]).is_err());
        assert!(t.is_empty());
    }

    #[test]
    fn test_sc004_display() {
        assert_eq!(Artifact::table(sample_table()).to_string(), "table 2 cols x 1 rows");
        assert_eq!(Artifact::incomplete().to_string(), "incomplete");
        assert_eq!(Artifact::error("x").to_string(), "error x");
    }
}
