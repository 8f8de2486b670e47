//! SC-011: Queue-driven scheduler with ledger-backed caching.
//!
//! Seeds a FIFO queue with the workflow's final stage and lazily discovers
//! the rest of the graph: a stage that is not ready queues its missing
//! dependencies and parks until they publish. Ready stages consult the
//! ledger and only invoke their implementation on a cache miss. A cycle
//! leaves the final stage parked once the queue drains.

use super::artifact::Artifact;
use super::clock::Clock;
use super::context::{Results, WorkContext, WorkState};
use super::digest::config_digest;
use super::error::{PipelineError, Result};
use super::ledger::Ledger;
use super::parser::Workflow;
use super::registry::{StageFactory, StageRegistry};
use super::staleness::{evaluate, CacheDecision, MissReason, StageProbe};
use super::types::*;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default scheduler iteration bound.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// How dependents treat an upstream error result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamErrors {
    /// An error result satisfies readiness; the dependent runs with it as input.
    #[default]
    PassThrough,
    /// Dependents of a failed stage are not invoked and publish an error.
    Propagate,
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_iterations: usize,
    /// Stages that must miss the cache this run
    pub force: HashSet<String>,
    pub upstream_errors: UpstreamErrors,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            force: HashSet::new(),
            upstream_errors: UpstreamErrors::default(),
        }
    }
}

impl RunnerOptions {
    pub fn force<S: Into<String>>(mut self, stages: impl IntoIterator<Item = S>) -> Self {
        self.force.extend(stages.into_iter().map(Into::into));
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn upstream_errors(mut self, policy: UpstreamErrors) -> Self {
        self.upstream_errors = policy;
        self
    }
}

/// Executes workflows against one ledger and artifact directory.
pub struct Runner<'a> {
    registry: &'a StageRegistry,
    ledger: &'a Ledger,
    artifact_dir: &'a Path,
    clock: &'a dyn Clock,
    options: RunnerOptions,
}

/// Identity of one stage execution attempt, shared by the row writers.
struct Attempt<'a> {
    definition: &'a StageDefinition,
    stage_config: String,
    digest: String,
    version: ImplVersion,
}

impl<'a> Runner<'a> {
    pub fn new(
        registry: &'a StageRegistry,
        ledger: &'a Ledger,
        artifact_dir: &'a Path,
        clock: &'a dyn Clock,
        options: RunnerOptions,
    ) -> Self {
        Self {
            registry,
            ledger,
            artifact_dir,
            clock,
            options,
        }
    }

    /// Drive `workflow` to completion.
    pub fn run(&self, workflow: &Workflow) -> Result<RunReport> {
        let start = Instant::now();
        let mut contexts = workflow.contexts();
        let mut results = Results::new();
        let mut outcomes: IndexMap<String, StageOutcome> = IndexMap::new();
        let mut invocations = 0u32;
        let mut iterations = 0usize;

        info!(workflow = %workflow.name, final_stage = %workflow.final_stage, "starting run");

        let mut queue = Schedule::default();
        queue.enqueue(&workflow.final_stage);

        while let Some(name) = queue.pop() {
            if iterations >= self.options.max_iterations {
                return Err(PipelineError::CycleOrStarvation {
                    workflow: workflow.name.clone(),
                    iterations,
                    pending: pending_stages(&contexts),
                });
            }
            iterations += 1;

            let ctx = contexts.get_mut(&name).ok_or_else(|| {
                PipelineError::Config(format!(
                    "stage '{}' is not part of workflow '{}'",
                    name, workflow.name
                ))
            })?;

            match ctx.update_state(&results) {
                WorkState::Done => debug!(stage = %name, "already done, dropping"),
                WorkState::Ready => {
                    let mut outcome = StageOutcome::Executed;
                    ctx.process(&mut results, |c, r| {
                        let (artifact, o) = self.resolve(c, r, &mut invocations)?;
                        outcome = o;
                        Ok::<_, PipelineError>(artifact)
                    })?;
                    info!(stage = %name, outcome = %outcome, "stage done");
                    queue.wake_dependents(&name);
                    outcomes.insert(name, outcome);
                }
                WorkState::NotReady => {
                    let missing: Vec<String> = ctx
                        .dependencies()
                        .iter()
                        .filter(|d| !results.contains_key(d.as_str()))
                        .cloned()
                        .collect();
                    debug!(stage = %name, waiting_on = ?missing, "not ready, parking");
                    queue.park(&name, &missing);
                }
            }
        }

        // Everything still parked waits on itself through a cycle
        if contexts
            .get(&workflow.final_stage)
            .is_some_and(|c| c.state() != WorkState::Done)
        {
            return Err(PipelineError::CycleOrStarvation {
                workflow: workflow.name.clone(),
                iterations,
                pending: pending_stages(&contexts),
            });
        }

        let report = RunReport {
            workflow: workflow.name.clone(),
            outcomes,
            iterations,
            invocations,
            results,
        };
        info!(
            workflow = %report.workflow,
            stages = report.outcomes.len(),
            cached = report.cache_hits(),
            invoked = report.invocations,
            failed = report.failures(),
            iterations = report.iterations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run complete"
        );
        Ok(report)
    }

    /// Produce a READY stage's output: cached, freshly executed, or failed.
    fn resolve(
        &self,
        ctx: &WorkContext,
        results: &Results,
        invocations: &mut u32,
    ) -> Result<(Artifact, StageOutcome)> {
        let def = ctx.definition();

        let Some(key) = def.implementation.as_deref() else {
            debug!(stage = %def.name, "placeholder stage");
            return Ok((Artifact::incomplete(), StageOutcome::Placeholder));
        };

        if self.options.upstream_errors == UpstreamErrors::Propagate {
            let failed = ctx
                .dependencies()
                .iter()
                .find(|d| results.get(d.as_str()).is_some_and(Artifact::is_error));
            if let Some(upstream) = failed {
                warn!(stage = %def.name, upstream = %upstream, "skipping, upstream failed");
                return Ok((
                    Artifact::error(format!("upstream stage '{}' failed", upstream)),
                    StageOutcome::Skipped {
                        upstream: upstream.clone(),
                    },
                ));
            }
        }

        let factory = self.registry.get(key).ok_or_else(|| {
            PipelineError::Config(format!(
                "stage '{}' has unknown implementation '{}'",
                def.name, key
            ))
        })?;

        let (stage_config, digest) = config_digest(&def.snapshot());
        let mut attempt = Attempt {
            definition: def,
            stage_config,
            digest,
            version: ImplVersion::fixed(0),
        };

        attempt.version = match factory.version(def) {
            Ok(v) => v,
            Err(e) => return self.record_failure(&attempt, e.message),
        };

        let row = self.ledger.latest(&def.name)?;
        let probe = StageProbe {
            version: attempt.version,
            freeze: def.freeze,
            newest_dependency: ctx.newest_dependency(),
            config_digest: &attempt.digest,
            forced: self.options.force.contains(&def.name),
        };
        let decision = match (evaluate(&probe, row.as_ref()), row.as_ref()) {
            (CacheDecision::Hit, Some(row)) => self.check_artifact(row),
            (decision, _) => decision,
        };

        if let (CacheDecision::Hit, Some(row)) = (&decision, row.as_ref()) {
            info!(stage = %def.name, executed = %row.executed.to_rfc3339(), "cache hit");
            return Ok(self.replay(def, row));
        }
        if let CacheDecision::Miss(ref reason) = decision {
            info!(stage = %def.name, reason = %reason, "cache miss, executing");
        }
        *invocations += 1;
        self.execute(factory, &attempt, results)
    }

    /// A hit whose artifact file has disappeared must re-execute.
    fn check_artifact(&self, row: &StageExecution) -> CacheDecision {
        match row.filename {
            Some(ref f) if row.status == ExecutionStatus::Ok && !self.artifact_dir.join(f).exists() => {
                CacheDecision::Miss(MissReason::ArtifactMissing(f.clone()))
            }
            _ => CacheDecision::Hit,
        }
    }

    /// Rebuild a stage's result from a ledger row, stamped with the row's time.
    fn replay(&self, def: &StageDefinition, row: &StageExecution) -> (Artifact, StageOutcome) {
        let executed_at = row.executed;
        match (row.status, row.filename.as_deref()) {
            (ExecutionStatus::Error, _) => {
                let message = format!("failed at {} (cached)", executed_at.to_rfc3339());
                (
                    Artifact::error(message.clone()).with_completed_at(executed_at),
                    StageOutcome::Failed { message },
                )
            }
            (ExecutionStatus::Ok, Some(file)) => (
                Artifact::cached(self.artifact_dir.join(file), def.output.clone(), executed_at),
                StageOutcome::CacheHit { executed_at },
            ),
            (ExecutionStatus::Ok, None) => (
                Artifact::incomplete().with_completed_at(executed_at),
                StageOutcome::CacheHit { executed_at },
            ),
        }
    }

    /// Invoke the implementation and record the outcome.
    fn execute(
        &self,
        factory: &dyn StageFactory,
        attempt: &Attempt<'_>,
        results: &Results,
    ) -> Result<(Artifact, StageOutcome)> {
        let def = attempt.definition;
        let produced = factory.build(def).and_then(|mut stage| stage.run(results));
        let artifact = match produced {
            Err(e) => return self.record_failure(attempt, e.message),
            Ok(a) => a,
        };
        if let Some(message) = artifact.error_message() {
            return self.record_failure(attempt, message.to_string());
        }
        if artifact.is_incomplete() {
            let executed = self.append(attempt, ExecutionStatus::Ok, None)?;
            return Ok((
                Artifact::incomplete().with_completed_at(executed),
                StageOutcome::Incomplete,
            ));
        }
        if artifact.empty() {
            return self.record_failure(attempt, "stage returned an empty result".to_string());
        }

        let filename = match self.store(def, &artifact) {
            Ok(Some(f)) => f,
            Ok(None) => return self.record_failure(attempt, "nothing was stored".to_string()),
            Err(e) => return self.record_failure(attempt, e.to_string()),
        };
        let executed = self.append(attempt, ExecutionStatus::Ok, Some(filename.clone()))?;

        let published = if artifact.file().is_some() {
            Artifact::cached(self.artifact_dir.join(&filename), def.output.clone(), executed)
        } else {
            artifact.with_completed_at(executed)
        };
        Ok((published, StageOutcome::Executed))
    }

    /// Persist a stage result into the artifact directory and return its
    /// file name. Files a stage wrote elsewhere are copied in.
    fn store(&self, def: &StageDefinition, artifact: &Artifact) -> Result<Option<String>> {
        let Some(path) = artifact.file() else {
            return artifact.serialize(self.artifact_dir, &def.output);
        };
        if let Ok(relative) = path.strip_prefix(self.artifact_dir) {
            return Ok(Some(relative.to_string_lossy().to_string()));
        }
        let ext = def.output.extension()?;
        std::fs::create_dir_all(self.artifact_dir)?;
        let filename = format!("{}.{}", uuid::Uuid::new_v4(), ext);
        std::fs::copy(path, self.artifact_dir.join(&filename))?;
        Ok(Some(filename))
    }

    fn record_failure(
        &self,
        attempt: &Attempt<'_>,
        message: String,
    ) -> Result<(Artifact, StageOutcome)> {
        warn!(stage = %attempt.definition.name, error = %message, "stage failed");
        let executed = self.append(attempt, ExecutionStatus::Error, None)?;
        Ok((
            Artifact::error(message.clone()).with_completed_at(executed),
            StageOutcome::Failed { message },
        ))
    }

    /// Append a ledger row stamped with the current time; returns that time.
    fn append(
        &self,
        attempt: &Attempt<'_>,
        status: ExecutionStatus,
        filename: Option<String>,
    ) -> Result<chrono::DateTime<chrono::Utc>> {
        let executed = self.clock.now();
        self.ledger.append(&NewExecution {
            name: attempt.definition.name.clone(),
            executed,
            status,
            stage_config: attempt.stage_config.clone(),
            config_digest: attempt.digest.clone(),
            filename,
            module_updated: attempt.version,
        })?;
        Ok(executed)
    }
}

/// FIFO work queue in which each stage is queued at most once. A stage
/// that is not ready parks on its missing dependencies and is re-queued
/// when one of them publishes a result.
#[derive(Default)]
struct Schedule {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    parked: HashSet<String>,
    waiters: HashMap<String, Vec<String>>,
}

impl Schedule {
    fn enqueue(&mut self, name: &str) {
        if self.queued.insert(name.to_string()) {
            self.parked.remove(name);
            self.queue.push_back(name.to_string());
        }
    }

    fn pop(&mut self) -> Option<String> {
        let name = self.queue.pop_front()?;
        self.queued.remove(&name);
        Some(name)
    }

    /// Wait on `missing`, scheduling any dependency not yet visited.
    fn park(&mut self, name: &str, missing: &[String]) {
        self.parked.insert(name.to_string());
        for dep in missing {
            let waiters = self.waiters.entry(dep.clone()).or_default();
            if !waiters.iter().any(|w| w == name) {
                waiters.push(name.to_string());
            }
            if !self.parked.contains(dep) {
                self.enqueue(dep);
            }
        }
    }

    fn wake_dependents(&mut self, name: &str) {
        for waiter in self.waiters.remove(name).unwrap_or_default() {
            self.enqueue(&waiter);
        }
    }
}

fn pending_stages(contexts: &IndexMap<String, WorkContext>) -> Vec<String> {
    contexts
        .values()
        .filter(|c| c.state() != WorkState::Done)
        .map(|c| c.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::TickClock;
    use crate::core::error::StageError;
    use crate::core::parser::WorkflowSet;
    use crate::core::registry::Stage;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Records every invocation; can be told to fail or bump its version.
    #[derive(Clone, Default)]
    struct Probe {
        calls: Rc<RefCell<Vec<String>>>,
        failing: Rc<RefCell<HashSet<String>>>,
        version: Rc<Cell<i64>>,
    }

    struct ProbeStage {
        definition: StageDefinition,
        probe: Probe,
    }

    impl StageFactory for Probe {
        fn version(&self, _definition: &StageDefinition) -> std::result::Result<ImplVersion, StageError> {
            Ok(ImplVersion::fixed(self.version.get()))
        }

        fn build(&self, definition: &StageDefinition) -> std::result::Result<Box<dyn Stage>, StageError> {
            Ok(Box::new(ProbeStage {
                definition: definition.clone(),
                probe: self.clone(),
            }))
        }
    }

    impl Stage for ProbeStage {
        fn run(&mut self, inputs: &Results) -> std::result::Result<Artifact, StageError> {
            let name = self.definition.name.clone();
            self.probe.calls.borrow_mut().push(name.clone());
            if self.probe.failing.borrow().contains(&name) {
                return Err(StageError::new(format!("{} exploded", name)));
            }
            let upstream_errors: Vec<&String> = inputs
                .iter()
                .filter(|(_, a)| a.is_error())
                .map(|(n, _)| n)
                .collect();
            Ok(Artifact::object(json!({
                "stage": name,
                "params": self.definition.params,
                "upstream_errors": upstream_errors,
            })))
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        ledger: Ledger,
        clock: TickClock,
        registry: StageRegistry,
        probe: Probe,
        config: PipelineConfig,
    }

    impl Harness {
        /// `stages`: (name, dependencies). Every stage uses the probe.
        fn new(stages: &[(&str, &[&str])], final_stage: &str) -> Self {
            let probe = Probe::default();
            probe.version.set(1);
            let mut registry = StageRegistry::with_builtins();
            registry.register("test.probe", probe.clone());

            let config = PipelineConfig {
                version: "1.0".into(),
                name: "test".into(),
                description: None,
                storage: StorageConfig::default(),
                stages: stages
                    .iter()
                    .map(|(n, _)| StageDefinition::new(*n, Some("test.probe")))
                    .collect(),
                workflows: vec![WorkflowConfig {
                    name: "w".into(),
                    final_stage: final_stage.into(),
                    stages: stages
                        .iter()
                        .map(|(n, deps)| WorkflowStage {
                            stage: n.to_string(),
                            dependencies: deps.iter().map(|d| d.to_string()).collect(),
                        })
                        .collect(),
                }],
            };

            let start = chrono::DateTime::<chrono::Utc>::from_timestamp(1_760_000_000, 0).unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                ledger: Ledger::in_memory().unwrap(),
                clock: TickClock::new(start),
                registry,
                probe,
                config,
            }
        }

        fn stage_mut(&mut self, name: &str) -> &mut StageDefinition {
            self.config.stages.iter_mut().find(|s| s.name == name).unwrap()
        }

        fn artifact_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("artifacts")
        }

        fn run_with(&self, options: RunnerOptions) -> Result<RunReport> {
            let set = WorkflowSet::from_config(&self.config, Some(&self.registry))?;
            let dir = self.artifact_dir();
            let runner = Runner::new(&self.registry, &self.ledger, &dir, &self.clock, options);
            runner.run(set.workflow("w")?)
        }

        fn run(&self) -> RunReport {
            self.run_with(RunnerOptions::default()).unwrap()
        }

        /// Invocations recorded since the last call.
        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.probe.calls.borrow_mut())
        }

        fn files(&self) -> usize {
            match std::fs::read_dir(self.artifact_dir()) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }
    }

    fn abc() -> Harness {
        Harness::new(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])], "c")
    }

    #[test]
    fn test_sc011_abc_scenario() {
        let mut h = abc();

        // Run 1: everything executes once
        let r1 = h.run();
        assert_eq!(h.take_calls(), vec!["a", "b", "c"]);
        assert_eq!(r1.invocations, 3);
        assert_eq!(h.ledger.row_count().unwrap(), 3);
        for name in ["a", "b", "c"] {
            let row = h.ledger.latest(name).unwrap().unwrap();
            assert_eq!(row.status, ExecutionStatus::Ok);
        }
        assert_eq!(r1.outcomes.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        // Run 2: no changes, all cached
        let r2 = h.run();
        assert!(h.take_calls().is_empty());
        assert_eq!(r2.invocations, 0);
        assert_eq!(r2.cache_hits(), 3);
        assert_eq!(h.ledger.row_count().unwrap(), 3);

        // Run 3: A's params change, so the whole chain reruns
        h.stage_mut("a").params.insert("year".into(), json!(2024));
        let r3 = h.run();
        assert_eq!(h.take_calls(), vec!["a", "b", "c"]);
        assert_eq!(r3.invocations, 3);
        assert_eq!(h.ledger.row_count().unwrap(), 6);
    }

    #[test]
    fn test_sc011_cache_hit_propagates_row_time() {
        let h = abc();
        let r1 = h.run();
        let first = r1.results["a"].completed_at().unwrap();
        let r2 = h.run();
        assert_eq!(r2.results["a"].completed_at(), Some(first));
        assert_eq!(
            r2.outcomes["a"],
            StageOutcome::CacheHit { executed_at: first }
        );
        // Lazy reference materializes the stored value
        let value = r2.results["c"].get().unwrap();
        assert_eq!(value.as_object().unwrap()["stage"], json!("c"));
        assert!(r2.results["c"].file().is_some());
    }

    #[test]
    fn test_sc011_forced_upstream_invalidates_downstream() {
        let h = abc();
        h.run();
        h.take_calls();

        let r = h.run_with(RunnerOptions::default().force(["a"])).unwrap();
        assert_eq!(h.take_calls(), vec!["a", "b", "c"]);
        assert_eq!(r.invocations, 3);

        h.run();
        assert!(h.take_calls().is_empty());
    }

    #[test]
    fn test_sc011_forced_leaf_keeps_upstream_cached() {
        let h = abc();
        h.run();
        h.take_calls();
        let r = h.run_with(RunnerOptions::default().force(["c"])).unwrap();
        assert_eq!(h.take_calls(), vec!["c"]);
        assert_eq!(r.cache_hits(), 2);
    }

    #[test]
    fn test_sc011_config_change_locality() {
        let mut h = Harness::new(
            &[
                ("a", &[]),
                ("b", &["a"]),
                ("sibling", &[]),
                ("f", &["b", "sibling"]),
            ],
            "f",
        );
        h.run();
        h.take_calls();

        h.stage_mut("b").params.insert("buffer_m".into(), json!(15));
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["b", "f"]);
        assert!(matches!(r.outcomes["a"], StageOutcome::CacheHit { .. }));
        assert!(matches!(r.outcomes["sibling"], StageOutcome::CacheHit { .. }));
    }

    #[test]
    fn test_sc011_freeze_override() {
        let mut h = Harness::new(&[("frozen", &[]), ("thawed", &[]), ("m", &["frozen", "thawed"])], "m");
        h.stage_mut("frozen").freeze = true;
        h.run();
        h.take_calls();

        h.probe.version.set(2);
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["thawed", "m"]);
        assert!(matches!(r.outcomes["frozen"], StageOutcome::CacheHit { .. }));
    }

    #[test]
    fn test_sc011_freeze_toggle_alone_keeps_cache() {
        let mut h = abc();
        h.run();
        h.take_calls();
        h.stage_mut("a").freeze = true;
        h.run();
        assert!(h.take_calls().is_empty());
    }

    #[test]
    fn test_sc011_cycle_detection() {
        let h = Harness::new(&[("a", &["b"]), ("b", &["a"])], "a");
        let err = h.run_with(RunnerOptions::default()).unwrap_err();
        match err {
            PipelineError::CycleOrStarvation {
                workflow,
                iterations,
                pending,
            } => {
                assert_eq!(workflow, "w");
                assert_eq!(iterations, 2);
                assert_eq!(pending, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(h.take_calls().is_empty());
        assert_eq!(h.ledger.row_count().unwrap(), 0);
    }

    #[test]
    fn test_sc011_cycle_behind_valid_stage() {
        let h = Harness::new(&[("top", &["x"]), ("x", &["y"]), ("y", &["x"])], "top");
        let err = h.run_with(RunnerOptions::default()).unwrap_err();
        match err {
            PipelineError::CycleOrStarvation { iterations, pending, .. } => {
                assert_eq!(iterations, 3);
                assert_eq!(pending, vec!["top", "x", "y"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_sc011_iteration_bound_is_enforced() {
        let h = abc();
        let err = h
            .run_with(RunnerOptions::default().max_iterations(2))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CycleOrStarvation { iterations: 2, .. }
        ));
    }

    #[test]
    fn test_sc011_deep_chain_settles_linearly() {
        let n = 50;
        let names: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
        let deps: Vec<Vec<&str>> = (0..n)
            .map(|i| if i == 0 { vec![] } else { vec![names[i - 1].as_str()] })
            .collect();
        let stages: Vec<(&str, &[&str])> = names
            .iter()
            .zip(&deps)
            .map(|(name, d)| (name.as_str(), d.as_slice()))
            .collect();
        let h = Harness::new(&stages, "s49");

        let r = h.run();
        assert_eq!(r.outcomes.len(), n);
        assert_eq!(r.iterations, 2 * n - 1);
        assert_eq!(h.take_calls(), names);

        let r = h.run();
        assert_eq!(r.cache_hits(), n);
        assert!(h.take_calls().is_empty());
    }

    #[test]
    fn test_sc011_shared_dependency_queued_once() {
        // Wide fan-in: every mid stage waits on the same root
        let h = Harness::new(
            &[
                ("root", &[]),
                ("m1", &["root"]),
                ("m2", &["root"]),
                ("m3", &["root"]),
                ("top", &["m1", "m2", "m3"]),
            ],
            "top",
        );
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["root", "m1", "m2", "m3", "top"]);
        // top, m1, m2, m3, root, then m1..m3 and top again
        assert_eq!(r.iterations, 9);
    }

    #[test]
    fn test_sc011_gc_leaves_one_file_per_stage() {
        let mut h = abc();
        h.run();
        h.stage_mut("a").params.insert("v".into(), json!(1));
        h.run();
        h.stage_mut("a").params.insert("v".into(), json!(2));
        h.run();
        assert_eq!(h.files(), 9);

        let report = h.ledger.collect_garbage(&h.artifact_dir()).unwrap();
        assert_eq!(report.stages_kept, 3);
        assert_eq!(report.files_removed, 6);
        assert_eq!(h.files(), 3);

        // Surviving files still back a fully cached run
        h.take_calls();
        let r = h.run();
        assert!(h.take_calls().is_empty());
        assert_eq!(r.cache_hits(), 3);
        assert!(r.results["c"].get().is_ok());
    }

    #[test]
    fn test_sc011_error_passes_through_by_default() {
        let h = abc();
        h.probe.failing.borrow_mut().insert("a".into());
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["a", "b", "c"]);
        assert!(matches!(r.outcomes["a"], StageOutcome::Failed { ref message } if message == "a exploded"));
        assert_eq!(r.outcomes["b"], StageOutcome::Executed);
        assert_eq!(
            h.ledger.latest("a").unwrap().unwrap().status,
            ExecutionStatus::Error
        );
        assert!(h.ledger.latest("a").unwrap().unwrap().filename.is_none());

        // b consumed the error as data
        let b = r.results["b"].get().unwrap();
        assert_eq!(b.as_object().unwrap()["upstream_errors"], json!(["a"]));
        assert_eq!(r.failures(), 1);
    }

    #[test]
    fn test_sc011_error_propagates_when_requested() {
        let h = abc();
        h.probe.failing.borrow_mut().insert("a".into());
        let r = h
            .run_with(RunnerOptions::default().upstream_errors(UpstreamErrors::Propagate))
            .unwrap();
        assert_eq!(h.take_calls(), vec!["a"]);
        assert_eq!(
            r.outcomes["b"],
            StageOutcome::Skipped {
                upstream: "a".into()
            }
        );
        assert!(matches!(r.outcomes["c"], StageOutcome::Skipped { .. }));
        assert!(r.results["c"].is_error());
        assert!(h.ledger.latest("b").unwrap().is_none());
        assert_eq!(h.ledger.row_count().unwrap(), 1);
        assert_eq!(r.failures(), 3);

        let errors: Vec<String> = r.stage_errors().iter().map(ToString::to_string).collect();
        assert_eq!(
            errors,
            vec![
                "stage 'a' failed: a exploded",
                "stage 'b' failed: upstream stage 'a' failed",
                "stage 'c' failed: upstream stage 'a' failed",
            ]
        );
    }

    #[test]
    fn test_sc011_cached_error_row_is_replayed() {
        let h = Harness::new(&[("a", &[])], "a");
        h.probe.failing.borrow_mut().insert("a".into());
        h.run();
        assert_eq!(h.take_calls(), vec!["a"]);
        let row = h.ledger.latest("a").unwrap().unwrap();

        // Error rows pass the freshness checks like ok rows do
        let r = h.run();
        assert!(h.take_calls().is_empty());
        assert!(r.results["a"].is_error());
        assert_eq!(r.results["a"].completed_at(), Some(row.executed));
        assert!(matches!(r.outcomes["a"], StageOutcome::Failed { .. }));

        // Fixed and forced: runs again and succeeds
        h.probe.failing.borrow_mut().clear();
        let r = h.run_with(RunnerOptions::default().force(["a"])).unwrap();
        assert_eq!(h.take_calls(), vec!["a"]);
        assert_eq!(r.outcomes["a"], StageOutcome::Executed);
    }

    #[test]
    fn test_sc011_placeholder_stage() {
        let mut h = Harness::new(&[("p", &[]), ("b", &["p"])], "b");
        h.stage_mut("p").implementation = None;
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["b"]);
        assert_eq!(r.outcomes["p"], StageOutcome::Placeholder);
        assert!(r.results["p"].is_incomplete());
        assert!(r.results["p"].completed_at().is_none());
        assert!(h.ledger.latest("p").unwrap().is_none());

        h.run();
        assert!(h.take_calls().is_empty());
    }

    #[test]
    fn test_sc011_incomplete_stage_records_row_without_file() {
        let mut h = Harness::new(&[("todo", &[]), ("b", &["todo"])], "b");
        h.stage_mut("todo").implementation = Some("builtin.incomplete".into());
        let r = h.run();
        assert_eq!(r.outcomes["todo"], StageOutcome::Incomplete);
        let row = h.ledger.latest("todo").unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Ok);
        assert!(row.filename.is_none());
        assert_eq!(h.files(), 1);

        let r = h.run();
        assert!(r.results["todo"].is_incomplete());
        assert!(matches!(r.outcomes["todo"], StageOutcome::CacheHit { .. }));
        assert_eq!(r.invocations, 0);
    }

    #[test]
    fn test_sc011_output_kind_mismatch_is_stage_error() {
        let mut h = Harness::new(&[("a", &[])], "a");
        h.stage_mut("a").output = OutputType::Table;
        let r = h.run();
        match &r.outcomes["a"] {
            StageOutcome::Failed { message } => assert!(message.contains("declares output type table")),
            other => panic!("unexpected outcome {}", other),
        }
        assert_eq!(
            h.ledger.latest("a").unwrap().unwrap().status,
            ExecutionStatus::Error
        );
        assert_eq!(h.files(), 0);
    }

    #[test]
    fn test_sc011_missing_artifact_file_forces_rerun() {
        let h = abc();
        h.run();
        h.take_calls();
        let row = h.ledger.latest("b").unwrap().unwrap();
        std::fs::remove_file(h.artifact_dir().join(row.filename.unwrap())).unwrap();

        h.run();
        assert_eq!(h.take_calls(), vec!["b", "c"]);
    }

    #[test]
    fn test_sc011_version_failure_recorded() {
        let mut h = Harness::new(&[("streets", &[])], "streets");
        let def = h.stage_mut("streets");
        def.implementation = Some("builtin.read_file".into());
        def.output = OutputType::Bytes;
        def.params
            .insert("path".into(), json!("/nonexistent/streets.geojson"));
        let r = h.run();
        assert!(matches!(r.outcomes["streets"], StageOutcome::Failed { ref message } if message.contains("cannot stat")));
        assert_eq!(r.invocations, 0);
        assert_eq!(h.ledger.row_count().unwrap(), 1);
    }

    #[test]
    fn test_sc011_read_file_edit_invalidates() {
        let mut h = Harness::new(&[("streets", &[]), ("routes", &["streets"])], "routes");
        let input = h.dir.path().join("streets.geojson");
        std::fs::write(&input, "v1").unwrap();
        let def = h.stage_mut("streets");
        def.implementation = Some("builtin.read_file".into());
        def.output = OutputType::Bytes;
        def.params.insert("path".into(), json!(input.to_string_lossy()));

        h.run();
        assert_eq!(h.take_calls(), vec!["routes"]);
        h.run();
        assert!(h.take_calls().is_empty());

        // Push the mtime well past the recorded version
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(3600);
        let file = std::fs::File::options().write(true).open(&input).unwrap();
        file.set_modified(later).unwrap();
        drop(file);

        let r = h.run();
        assert_eq!(r.outcomes["streets"], StageOutcome::Executed);
        assert_eq!(h.take_calls(), vec!["routes"]);
    }

    #[test]
    fn test_sc011_only_workflow_closure_runs() {
        let h = Harness::new(&[("a", &[]), ("b", &["a"]), ("unrelated", &[])], "b");
        let r = h.run();
        assert_eq!(h.take_calls(), vec!["a", "b"]);
        assert!(!r.results.contains_key("unrelated"));
        assert_eq!(r.iterations, 3);
    }

    #[test]
    fn test_sc011_diamond_runs_shared_dependency_once() {
        let h = Harness::new(
            &[("src", &[]), ("l", &["src"]), ("r", &["src"]), ("join", &["l", "r"])],
            "join",
        );
        h.run();
        let calls = h.take_calls();
        assert_eq!(calls.iter().filter(|c| *c == "src").count(), 1);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last().map(String::as_str), Some("join"));
    }
}
