//! SC-009: Stage registry.
//!
//! Implementation keys (`module.operation`) resolve to factories at startup.
//! A factory reports the implementation's version marker and builds a stage
//! instance from a definition.

use super::artifact::Artifact;
use super::context::Results;
use super::error::StageError;
use super::types::{ImplVersion, StageDefinition};
use indexmap::IndexMap;

/// A constructed stage, ready to run once.
pub trait Stage {
    /// Produce the stage's output from its dependencies' published results.
    fn run(&mut self, inputs: &Results) -> Result<Artifact, StageError>;
}

/// Knows how to version and construct one kind of stage.
pub trait StageFactory {
    /// Current implementation version; compared against the ledger row.
    fn version(&self, definition: &StageDefinition) -> Result<ImplVersion, StageError>;

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError>;
}

/// Factory over a plain function or closure, with a fixed version.
pub struct FnFactory<F> {
    version: ImplVersion,
    run: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&StageDefinition, &Results) -> Result<Artifact, StageError> + Clone + 'static,
{
    pub fn new(version: ImplVersion, run: F) -> Self {
        Self { version, run }
    }
}

struct FnStage<F> {
    definition: StageDefinition,
    run: F,
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&StageDefinition, &Results) -> Result<Artifact, StageError>,
{
    fn run(&mut self, inputs: &Results) -> Result<Artifact, StageError> {
        (self.run)(&self.definition, inputs)
    }
}

impl<F> StageFactory for FnFactory<F>
where
    F: Fn(&StageDefinition, &Results) -> Result<Artifact, StageError> + Clone + 'static,
{
    fn version(&self, _definition: &StageDefinition) -> Result<ImplVersion, StageError> {
        Ok(self.version)
    }

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError> {
        Ok(Box::new(FnStage {
            definition: definition.clone(),
            run: self.run.clone(),
        }))
    }
}

/// Implementation key -> factory.
#[derive(Default)]
pub struct StageRegistry {
    factories: IndexMap<String, Box<dyn StageFactory>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the `builtin.*` stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::stages::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a factory under `key`.
    pub fn register(&mut self, key: impl Into<String>, factory: impl StageFactory + 'static) {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn get(&self, key: &str) -> Option<&dyn StageFactory> {
        self.factories.get(key).map(|f| f.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
