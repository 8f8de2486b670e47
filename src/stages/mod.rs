//! Built-in stage implementations.
//!
//! Each built-in registers under a `builtin.*` key and follows the same
//! contract as an external stage: a factory reports a version marker and
//! builds an instance from the stage definition.

pub mod command;
pub mod file;
pub mod literal;
pub mod merge;

use crate::core::artifact::{Artifact, Table};
use crate::core::error::StageError;
use crate::core::registry::{FnFactory, StageRegistry};
use crate::core::types::{ImplVersion, OutputType, StageDefinition};

/// Version marker of the built-ins that carry no external code.
pub const BUILTIN_VERSION: ImplVersion = ImplVersion(1);

/// Register every `builtin.*` stage.
pub fn register_builtins(registry: &mut StageRegistry) {
    registry.register("builtin.literal", literal::LiteralFactory);
    registry.register("builtin.read_file", file::ReadFileFactory);
    registry.register("builtin.command", command::CommandFactory);
    registry.register("builtin.merge", merge::MergeFactory);
    registry.register(
        "builtin.incomplete",
        FnFactory::new(BUILTIN_VERSION, |_, _| Ok(Artifact::incomplete())),
    );
}

/// Interpret raw bytes according to the stage's declared output type.
pub(crate) fn decode_output(def: &StageDefinition, bytes: Vec<u8>) -> Result<Artifact, StageError> {
    match def.output {
        OutputType::Bytes => Ok(Artifact::bytes(bytes)),
        OutputType::Object => serde_json::from_slice(&bytes)
            .map(Artifact::object)
            .map_err(|e| StageError::new(format!("output is not valid JSON: {}", e))),
        OutputType::Table => serde_json::from_slice::<Table>(&bytes)
            .map(Artifact::table)
            .map_err(|e| StageError::new(format!("output is not a JSON table: {}", e))),
        OutputType::Unknown(ref tag) => Err(StageError::new(format!(
            "unrecognized output type '{}'",
            tag
        ))),
    }
}

/// A required string parameter.
pub(crate) fn require_str<'a>(def: &'a StageDefinition, key: &str) -> Result<&'a str, StageError> {
    def.param_str(key).ok_or_else(|| {
        StageError::new(format!(
            "stage '{}' requires string parameter '{}'",
            def.name, key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Results;

    #[test]
    fn test_sc012_incomplete_builtin() {
        let registry = StageRegistry::with_builtins();
        let def = StageDefinition::new("todo", Some("builtin.incomplete"));
        let mut stage = registry.get("builtin.incomplete").unwrap().build(&def).unwrap();
        assert!(stage.run(&Results::new()).unwrap().is_incomplete());
    }

    #[test]
    fn test_sc012_decode_output() {
        let mut def = StageDefinition::new("s", None);
        def.output = OutputType::Bytes;
        let a = decode_output(&def, b"raw".to_vec()).unwrap();
        assert_eq!(a.get().unwrap().as_bytes(), Some(&b"raw"[..]));

        def.output = OutputType::Object;
        let a = decode_output(&def, br#"{"k": 1}"#.to_vec()).unwrap();
        assert_eq!(a.get().unwrap().as_object(), Some(&serde_json::json!({"k": 1})));
        assert!(decode_output(&def, b"not json".to_vec()).is_err());

        def.output = OutputType::Table;
        let a = decode_output(&def, br#"{"columns": ["x"], "rows": [[1], [2]]}"#.to_vec()).unwrap();
        assert_eq!(a.get().unwrap().as_table().unwrap().len(), 2);

        def.output = OutputType::from("shapefile");
        assert!(decode_output(&def, Vec::new()).is_err());
    }

    #[test]
    fn test_sc012_require_str() {
        let mut def = StageDefinition::new("s", None);
        assert!(require_str(&def, "path").unwrap_err().message.contains("'path'"));
        def.params.insert("path".into(), serde_json::json!("/tmp/x"));
        assert_eq!(require_str(&def, "path").unwrap(), "/tmp/x");
    }
}
