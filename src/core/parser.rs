//! SC-010: Config parsing, validation, and workflow construction.
//!
//! Parses the pipeline document and validates structural constraints:
//! - Version must be "1.0"
//! - Stage and workflow names must be unique
//! - Final stages, workflow entries and dependencies must name declared stages
//! - A stage appears at most once per workflow
//! - Implementation keys must be registered

use super::context::WorkContext;
use super::error::{PipelineError, Result, ValidationError};
use super::registry::StageRegistry;
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Parse a pipeline config file from disk. `.toml` files are TOML; anything
/// else goes through the YAML parser, which also accepts JSON.
pub fn parse_config_file(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_config_toml(&content),
        _ => parse_config(&content),
    }
}

/// Parse a YAML (or JSON) document.
pub fn parse_config(yaml: &str) -> Result<PipelineConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| PipelineError::Config(format!("YAML parse error: {}", e)))
}

/// Parse a TOML document.
pub fn parse_config_toml(source: &str) -> Result<PipelineConfig> {
    toml::from_str(source).map_err(|e| PipelineError::Config(format!("TOML parse error: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
/// Implementation keys are only checked when a registry is given.
pub fn validate_config(
    config: &PipelineConfig,
    registry: Option<&StageRegistry>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.name.is_empty() {
        errors.push(ValidationError::new("name must not be empty"));
    }

    let mut declared: HashSet<&str> = HashSet::new();
    for stage in &config.stages {
        if stage.name.is_empty() {
            errors.push(ValidationError::new("stage name must not be empty"));
        }
        if !declared.insert(stage.name.as_str()) {
            errors.push(ValidationError::new(format!(
                "stage '{}' is declared more than once",
                stage.name
            )));
        }
        if let (Some(key), Some(registry)) = (stage.implementation.as_deref(), registry) {
            if !registry.contains(key) {
                errors.push(ValidationError::new(format!(
                    "stage '{}' has unknown implementation '{}'",
                    stage.name, key
                )));
            }
        }
    }

    let mut workflow_names: HashSet<&str> = HashSet::new();
    for wf in &config.workflows {
        if !workflow_names.insert(wf.name.as_str()) {
            errors.push(ValidationError::new(format!(
                "workflow '{}' is declared more than once",
                wf.name
            )));
        }
        validate_workflow(wf, &declared, &mut errors);
    }

    errors
}

fn validate_workflow(
    wf: &WorkflowConfig,
    declared: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let listed: HashSet<&str> = wf.stages.iter().map(|s| s.stage.as_str()).collect();

    if !declared.contains(wf.final_stage.as_str()) {
        errors.push(ValidationError::new(format!(
            "workflow '{}' final stage '{}' is not declared",
            wf.name, wf.final_stage
        )));
    } else if !listed.contains(wf.final_stage.as_str()) {
        errors.push(ValidationError::new(format!(
            "workflow '{}' final stage '{}' is not in its stage list",
            wf.name, wf.final_stage
        )));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &wf.stages {
        if !seen.insert(entry.stage.as_str()) {
            errors.push(ValidationError::new(format!(
                "workflow '{}' lists stage '{}' more than once",
                wf.name, entry.stage
            )));
        }
        if !declared.contains(entry.stage.as_str()) {
            errors.push(ValidationError::new(format!(
                "workflow '{}' references unknown stage '{}'",
                wf.name, entry.stage
            )));
        }
        for dep in &entry.dependencies {
            if dep == &entry.stage {
                errors.push(ValidationError::new(format!(
                    "stage '{}' depends on itself in workflow '{}'",
                    entry.stage, wf.name
                )));
            } else if !declared.contains(dep.as_str()) {
                errors.push(ValidationError::new(format!(
                    "stage '{}' depends on unknown stage '{}' in workflow '{}'",
                    entry.stage, dep, wf.name
                )));
            } else if !listed.contains(dep.as_str()) {
                errors.push(ValidationError::new(format!(
                    "stage '{}' depends on '{}', which workflow '{}' does not list",
                    entry.stage, dep, wf.name
                )));
            }
        }
    }
}

/// One stage within a workflow: its shared definition and its edges.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    pub definition: Arc<StageDefinition>,
    pub dependencies: Vec<String>,
}

/// A validated workflow, ready to run.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub final_stage: String,
    pub nodes: IndexMap<String, WorkflowNode>,
}

impl Workflow {
    /// Fresh per-run state machines, one per stage.
    pub fn contexts(&self) -> IndexMap<String, WorkContext> {
        self.nodes
            .iter()
            .map(|(name, node)| {
                (
                    name.clone(),
                    WorkContext::new(Arc::clone(&node.definition), node.dependencies.clone()),
                )
            })
            .collect()
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }
}

/// All stage definitions and workflows of one config document.
/// Definitions are shared between the workflows that reference them.
#[derive(Debug, Clone)]
pub struct WorkflowSet {
    stages: IndexMap<String, Arc<StageDefinition>>,
    workflows: IndexMap<String, Workflow>,
}

impl WorkflowSet {
    /// Validate `config` and build its workflows.
    pub fn from_config(config: &PipelineConfig, registry: Option<&StageRegistry>) -> Result<Self> {
        let errors = validate_config(config, registry);
        if !errors.is_empty() {
            return Err(PipelineError::from_validation(&errors));
        }

        let stages: IndexMap<String, Arc<StageDefinition>> = config
            .stages
            .iter()
            .map(|s| (s.name.clone(), Arc::new(s.clone())))
            .collect();

        let mut workflows = IndexMap::new();
        for wf in &config.workflows {
            let mut nodes = IndexMap::new();
            for entry in &wf.stages {
                let definition = stages.get(&entry.stage).ok_or_else(|| {
                    PipelineError::Config(format!("unknown stage '{}'", entry.stage))
                })?;
                nodes.insert(
                    entry.stage.clone(),
                    WorkflowNode {
                        definition: Arc::clone(definition),
                        dependencies: entry.dependencies.clone(),
                    },
                );
            }
            workflows.insert(
                wf.name.clone(),
                Workflow {
                    name: wf.name.clone(),
                    final_stage: wf.final_stage.clone(),
                    nodes,
                },
            );
        }

        Ok(Self { stages, workflows })
    }

    pub fn workflow(&self, name: &str) -> Result<&Workflow> {
        self.workflows
            .get(name)
            .ok_or_else(|| PipelineError::UnknownWorkflow(name.to_string()))
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<StageDefinition>> {
        self.stages.get(name)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Arc<StageDefinition>> {
        self.stages.values()
    }
}
