//! `builtin.read_file`: load `params.path`. The file's mtime is the version
//! marker, so editing the file invalidates the stage.

use crate::core::artifact::Artifact;
use crate::core::context::Results;
use crate::core::error::StageError;
use crate::core::registry::{Stage, StageFactory};
use crate::core::types::{ImplVersion, StageDefinition};
use std::path::PathBuf;

pub struct ReadFileFactory;

struct ReadFileStage {
    definition: StageDefinition,
    path: PathBuf,
}

impl StageFactory for ReadFileFactory {
    fn version(&self, definition: &StageDefinition) -> Result<ImplVersion, StageError> {
        let path = super::require_str(definition, "path")?;
        ImplVersion::from_path_mtime(path.as_ref())
            .map_err(|e| StageError::new(format!("cannot stat {}: {}", path, e)))
    }

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError> {
        let path = PathBuf::from(super::require_str(definition, "path")?);
        Ok(Box::new(ReadFileStage {
            definition: definition.clone(),
            path,
        }))
    }
}

impl Stage for ReadFileStage {
    fn run(&mut self, _inputs: &Results) -> Result<Artifact, StageError> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| StageError::new(format!("cannot read {}: {}", self.path.display(), e)))?;
        super::decode_output(&self.definition, bytes)
    }
}
