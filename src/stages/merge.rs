//! `builtin.merge`: combine upstream results into one JSON object keyed by
//! stage name. Stages to merge are listed in `params.inputs`.

use crate::core::artifact::{Artifact, ArtifactValue};
use crate::core::context::Results;
use crate::core::error::StageError;
use crate::core::registry::{Stage, StageFactory};
use crate::core::types::{ImplVersion, StageDefinition};

pub struct MergeFactory;

struct MergeStage {
    inputs: Vec<String>,
}

impl StageFactory for MergeFactory {
    fn version(&self, _definition: &StageDefinition) -> Result<ImplVersion, StageError> {
        Ok(super::BUILTIN_VERSION)
    }

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError> {
        let inputs = definition
            .param("inputs")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                StageError::new(format!(
                    "stage '{}' requires list parameter 'inputs'",
                    definition.name
                ))
            })?
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    StageError::new(format!("stage '{}': inputs must be names", definition.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(MergeStage { inputs }))
    }
}

impl Stage for MergeStage {
    fn run(&mut self, inputs: &Results) -> Result<Artifact, StageError> {
        let mut merged = serde_json::Map::new();
        for name in &self.inputs {
            let artifact = inputs
                .get(name)
                .ok_or_else(|| StageError::new(format!("input '{}' has no result", name)))?;
            if let Some(message) = artifact.error_message() {
                return Err(StageError::new(format!("input '{}' failed: {}", name, message)));
            }
            if artifact.is_incomplete() {
                merged.insert(name.clone(), serde_json::Value::Null);
                continue;
            }
            let value = match artifact.get()?.into_owned() {
                ArtifactValue::Object(v) => v,
                ArtifactValue::Table(t) => serde_json::to_value(t)
                    .map_err(|e| StageError::new(format!("input '{}': {}", name, e)))?,
                ArtifactValue::Bytes(b) => String::from_utf8(b)
                    .map(serde_json::Value::String)
                    .map_err(|_| StageError::new(format!("input '{}' is not UTF-8", name)))?,
            };
            merged.insert(name.clone(), value);
        }
        Ok(Artifact::object(serde_json::Value::Object(merged)))
    }
}
