//! SC-007: Per-run stage state machine.
//!
//! NOT_READY -> READY -> DONE. A context reads the run's results map to
//! decide readiness and writes its own entry exactly once.

use super::artifact::Artifact;
use super::types::StageDefinition;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;

/// Published stage outputs of one run, keyed by stage name.
pub type Results = IndexMap<String, Artifact>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    NotReady,
    Ready,
    Done,
}

#[derive(Debug)]
pub struct WorkContext {
    definition: Arc<StageDefinition>,
    dependencies: Vec<String>,
    state: WorkState,
    newest_dependency: Option<DateTime<Utc>>,
}

impl WorkContext {
    pub fn new(definition: Arc<StageDefinition>, dependencies: Vec<String>) -> Self {
        Self {
            definition,
            dependencies,
            state: WorkState::NotReady,
            newest_dependency: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    /// Newest completion time among dependencies, fixed when the context
    /// became ready. `None` if no dependency carries a timestamp.
    pub fn newest_dependency(&self) -> Option<DateTime<Utc>> {
        self.newest_dependency
    }

    /// Re-check readiness against the published results. Idempotent.
    pub fn update_state(&mut self, results: &Results) -> WorkState {
        if self.state != WorkState::NotReady {
            return self.state;
        }
        let mut newest: Option<DateTime<Utc>> = None;
        for dep in &self.dependencies {
            let Some(artifact) = results.get(dep) else {
                return self.state;
            };
            newest = newest.max(artifact.completed_at());
        }
        self.newest_dependency = newest;
        self.state = WorkState::Ready;
        self.state
    }

    /// Resolve and publish this stage's output. Only acts when READY;
    /// returns false otherwise.
    pub fn process<E>(
        &mut self,
        results: &mut Results,
        resolve: impl FnOnce(&WorkContext, &Results) -> Result<Artifact, E>,
    ) -> Result<bool, E> {
        if self.state != WorkState::Ready {
            return Ok(false);
        }
        let artifact = resolve(self, results)?;
        results.insert(self.definition.name.clone(), artifact);
        self.state = WorkState::Done;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_760_000_000 + secs, 0).unwrap()
    }

    fn ctx(name: &str, deps: &[&str]) -> WorkContext {
        WorkContext::new(
            Arc::new(StageDefinition::new(name, Some("builtin.literal"))),
            deps.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn test_sc007_no_deps_is_ready() {
        let mut c = ctx("a", &[]);
        assert_eq!(c.update_state(&Results::new()), WorkState::Ready);
        assert!(c.newest_dependency().is_none());
    }

    #[test]
    fn test_sc007_waits_for_all_deps() {
        let mut results = Results::new();
        let mut c = ctx("c", &["a", "b"]);
        results.insert("a".into(), Artifact::object(json!(1)).with_completed_at(ts(5)));
        assert_eq!(c.update_state(&results), WorkState::NotReady);
        assert!(c.newest_dependency().is_none());

        results.insert("b".into(), Artifact::object(json!(2)).with_completed_at(ts(3)));
        assert_eq!(c.update_state(&results), WorkState::Ready);
        assert_eq!(c.newest_dependency(), Some(ts(5)));
    }

    #[test]
    fn test_sc007_newest_fixed_at_transition() {
        let mut results = Results::new();
        results.insert("a".into(), Artifact::object(json!(1)).with_completed_at(ts(1)));
        let mut c = ctx("b", &["a"]);
        c.update_state(&results);
        results.insert("a".into(), Artifact::object(json!(1)).with_completed_at(ts(9)));
        assert_eq!(c.update_state(&results), WorkState::Ready);
        assert_eq!(c.newest_dependency(), Some(ts(1)));
    }

    #[test]
    fn test_sc007_error_and_incomplete_satisfy_readiness() {
        let mut results = Results::new();
        results.insert("a".into(), Artifact::error("boom"));
        results.insert("p".into(), Artifact::incomplete());
        let mut c = ctx("b", &["a", "p"]);
        assert_eq!(c.update_state(&results), WorkState::Ready);
        assert!(c.newest_dependency().is_none());
    }

    #[test]
    fn test_sc007_process_writes_once() {
        let mut results = Results::new();
        let mut c = ctx("a", &[]);

        let ran = c
            .process(&mut results, |_, _| Ok::<_, String>(Artifact::object(json!(0))))
            .unwrap();
        assert!(!ran, "not ready yet");
        assert!(results.is_empty());

        c.update_state(&results);
        let ran = c
            .process(&mut results, |w, _| {
                assert_eq!(w.name(), "a");
                Ok::<_, String>(Artifact::object(json!(1)))
            })
            .unwrap();
        assert!(ran);
        assert_eq!(c.state(), WorkState::Done);
        assert_eq!(c.update_state(&results), WorkState::Done);

        let again = c
            .process(&mut results, |_, _| Ok::<_, String>(Artifact::object(json!(2))))
            .unwrap();
        assert!(!again);
        assert_eq!(results.len(), 1);
        assert_eq!(results["a"].get().unwrap().as_object(), Some(&json!(1)));
    }

    #[test]
    fn test_sc007_process_error_keeps_ready() {
        let mut results = Results::new();
        let mut c = ctx("a", &[]);
        c.update_state(&results);
        let err = c.process(&mut results, |_, _| Err::<Artifact, _>("fatal"));
        assert_eq!(err, Err("fatal"));
        assert_eq!(c.state(), WorkState::Ready);
        assert!(results.is_empty());
    }
}
