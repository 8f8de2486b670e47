//! `builtin.literal`: publish `params.value` as the stage output.

use crate::core::artifact::{Artifact, Table};
use crate::core::context::Results;
use crate::core::error::StageError;
use crate::core::registry::{Stage, StageFactory};
use crate::core::types::{ImplVersion, OutputType, StageDefinition};

pub struct LiteralFactory;

struct LiteralStage {
    name: String,
    output: OutputType,
    value: serde_json::Value,
}

impl StageFactory for LiteralFactory {
    fn version(&self, _definition: &StageDefinition) -> Result<ImplVersion, StageError> {
        Ok(super::BUILTIN_VERSION)
    }

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError> {
        let value = definition.param("value").cloned().ok_or_else(|| {
            StageError::new(format!(
                "stage '{}' requires parameter 'value'",
                definition.name
            ))
        })?;
        Ok(Box::new(LiteralStage {
            name: definition.name.clone(),
            output: definition.output.clone(),
            value,
        }))
    }
}

impl Stage for LiteralStage {
    fn run(&mut self, _inputs: &Results) -> Result<Artifact, StageError> {
        match self.output {
            // {columns: [...], rows: [[...], ...]}
            OutputType::Table => serde_json::from_value::<Table>(self.value.clone())
                .map(Artifact::table)
                .map_err(|e| StageError::new(format!("'{}' value is not a table: {}", self.name, e))),
            OutputType::Bytes => match self.value {
                serde_json::Value::String(ref s) => Ok(Artifact::bytes(s.as_bytes())),
                _ => Err(StageError::new(format!(
                    "'{}' declares bytes output but value is not a string",
                    self.name
                ))),
            },
            _ => Ok(Artifact::object(self.value.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(value: serde_json::Value, output: OutputType) -> StageDefinition {
        let mut d = StageDefinition::new("lit", Some("builtin.literal"));
        d.params.insert("value".into(), value);
        d.output = output;
        d
    }

    fn run(d: &StageDefinition) -> Result<Artifact, StageError> {
        LiteralFactory.build(d)?.run(&Results::new())
    }

    #[test]
    fn test_sc012_literal_object() {
        let a = run(&def(json!({"zones": 4}), OutputType::Object)).unwrap();
        assert_eq!(a.get().unwrap().as_object(), Some(&json!({"zones": 4})));
    }

    #[test]
    fn test_sc012_literal_table() {
        let value = json!({"columns": ["id", "geometry"], "rows": [[1, "POINT (0 0)"]]});
        let a = run(&def(value, OutputType::Table)).unwrap();
        let v = a.get().unwrap();
        let table = v.as_table().unwrap();
        assert_eq!(table.columns, vec!["id", "geometry"]);
        assert_eq!(table.len(), 1);

        assert!(run(&def(json!([1]), OutputType::Table)).is_err());
    }

    #[test]
    fn test_sc012_literal_bytes() {
        let a = run(&def(json!("hello"), OutputType::Bytes)).unwrap();
        assert_eq!(a.get().unwrap().as_bytes(), Some(&b"hello"[..]));
        assert!(run(&def(json!(3), OutputType::Bytes)).is_err());
    }

    #[test]
    fn test_sc012_literal_requires_value() {
        let d = StageDefinition::new("lit", Some("builtin.literal"));
        let err = LiteralFactory.build(&d).err().unwrap();
        assert!(err.message.contains("requires parameter 'value'"));
        assert_eq!(LiteralFactory.version(&d).unwrap(), super::super::BUILTIN_VERSION);
    }
}
