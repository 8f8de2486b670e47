//! SC-013: CLI subcommands (init, validate, run, status, history) plus --cleanup.

use crate::core::clock::SystemClock;
use crate::core::ledger::Ledger;
use crate::core::parser::{self, WorkflowSet};
use crate::core::registry::StageRegistry;
use crate::core::runner::{Runner, RunnerOptions, UpstreamErrors, DEFAULT_MAX_ITERATIONS};
use crate::core::types::{PipelineConfig, RunReport, StageExecution, StageOutcome};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new pipeline project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate the pipeline config without running anything
    Validate,

    /// Run a workflow to completion
    Run {
        /// Workflow name
        workflow: String,

        /// Force a cache miss for a stage (repeatable)
        #[arg(long = "force", value_name = "STAGE")]
        force: Vec<String>,

        /// Scheduler iteration bound
        #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
        max_iterations: usize,

        /// Do not invoke stages whose dependencies failed
        #[arg(long)]
        block_on_upstream_error: bool,
    },

    /// Show the latest ledger row of every stage
    Status,

    /// Show every ledger row of one stage
    History {
        /// Stage name
        stage: String,
    },
}

/// Flags shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub file: PathBuf,
    pub state_dir: PathBuf,
    pub cleanup: bool,
}

/// Dispatch a CLI command.
pub fn dispatch(opts: &GlobalOptions, cmd: Option<Commands>) -> Result<(), String> {
    if opts.cleanup {
        return cmd_cleanup(&opts.file, &opts.state_dir);
    }
    match cmd {
        Some(Commands::Init { path }) => cmd_init(&path),
        Some(Commands::Validate) => cmd_validate(&opts.file),
        Some(Commands::Run {
            workflow,
            force,
            max_iterations,
            block_on_upstream_error,
        }) => {
            let options = RunnerOptions::default()
                .force(force)
                .max_iterations(max_iterations)
                .upstream_errors(if block_on_upstream_error {
                    UpstreamErrors::Propagate
                } else {
                    UpstreamErrors::PassThrough
                });
            cmd_run(&opts.file, &opts.state_dir, &workflow, options)
        }
        Some(Commands::Status) => cmd_status(&opts.file, &opts.state_dir),
        Some(Commands::History { stage }) => cmd_history(&opts.file, &opts.state_dir, &stage),
        None => Err("no command given (see --help)".to_string()),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("pipeline.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
name: my-pipeline
description: "Managed by stagecache"

stages:
  - name: source
    implementation: builtin.literal
    params:
      value: {greeting: hello}
  - name: report
    implementation: builtin.merge
    params:
      inputs: [source]

workflows:
  - name: default
    final: report
    stages:
      - stage: source
      - stage: report
        dependencies: [source]
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized stagecache project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    let registry = StageRegistry::with_builtins();
    let errors = parser::validate_config(&config, Some(&registry));

    if errors.is_empty() {
        println!(
            "OK: {} ({} stages, {} workflows)",
            config.name,
            config.stages.len(),
            config.workflows.len()
        );
        for wf in &config.workflows {
            println!("  {} -> {} ({} stages)", wf.name, wf.final_stage, wf.stages.len());
        }
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a config file, returning errors if invalid.
fn parse_and_validate(
    file: &Path,
    registry: &StageRegistry,
) -> Result<(PipelineConfig, WorkflowSet), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_config(&config, Some(registry));
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err("validation failed".to_string());
    }
    let set = WorkflowSet::from_config(&config, Some(registry)).map_err(|e| e.to_string())?;
    Ok((config, set))
}

fn open_ledger(config: &PipelineConfig, state_dir: &Path) -> Result<Ledger, String> {
    let path = config.storage.ledger_path(state_dir);
    Ledger::open(&path).map_err(|e| format!("cannot open ledger {}: {}", path.display(), e))
}

fn cmd_run(
    file: &Path,
    state_dir: &Path,
    workflow_name: &str,
    options: RunnerOptions,
) -> Result<(), String> {
    let registry = StageRegistry::with_builtins();
    let (config, set) = parse_and_validate(file, &registry)?;
    let workflow = set.workflow(workflow_name).map_err(|e| e.to_string())?;

    for stage in &options.force {
        if !workflow.nodes.contains_key(stage) {
            return Err(format!(
                "cannot force '{}': not a stage of workflow '{}'",
                stage, workflow.name
            ));
        }
    }

    let artifact_dir = config.storage.artifact_dir(state_dir);
    let ledger = open_ledger(&config, state_dir)?;
    let result = Runner::new(&registry, &ledger, &artifact_dir, &SystemClock, options).run(workflow);
    let closed = ledger.close();

    let report = result.map_err(|e| e.to_string())?;
    closed.map_err(|e| e.to_string())?;

    print_report(&report);
    let errors = report.stage_errors();
    match errors.first() {
        Some(first) => Err(format!("{} stage(s) failed; first: {}", errors.len(), first)),
        None => Ok(()),
    }
}

/// Display a run report to stdout.
fn print_report(report: &RunReport) {
    println!("Workflow: {} ({} stages)", report.workflow, report.outcomes.len());
    for (name, outcome) in &report.outcomes {
        let detail = match outcome {
            StageOutcome::CacheHit { executed_at } => format!(" (from {})", executed_at.to_rfc3339()),
            StageOutcome::Failed { message } => format!(": {}", message),
            StageOutcome::Skipped { upstream } => format!(" (upstream '{}' failed)", upstream),
            _ => String::new(),
        };
        let summary = report
            .results
            .get(name)
            .filter(|a| !a.is_error())
            .map(|a| format!(" [{}]", a))
            .unwrap_or_default();
        println!("  {:<11} {}{}{}", outcome.label(), name, detail, summary);
    }
    println!();

    let executed = report.count(|o| matches!(o, StageOutcome::Executed | StageOutcome::Incomplete));
    let failed = report.failures();
    if failed > 0 {
        println!(
            "Run completed with errors: {} executed, {} cached, {} FAILED ({} iterations)",
            executed,
            report.cache_hits(),
            failed,
            report.iterations
        );
    } else {
        println!(
            "Run complete: {} executed, {} cached ({} iterations).",
            executed,
            report.cache_hits(),
            report.iterations
        );
    }
}

fn print_row(row: &StageExecution) {
    let file = row.filename.as_deref().unwrap_or("-");
    let collected = if row.collected { " (collected)" } else { "" };
    println!(
        "  {} #{}: {} at {} [{}] impl {}{}",
        row.name,
        row.id,
        row.status,
        row.executed.to_rfc3339(),
        file,
        row.module_updated,
        collected
    );
}

fn cmd_status(file: &Path, state_dir: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    if !config.storage.ledger_path(state_dir).exists() {
        println!("No executions recorded.");
        return Ok(());
    }
    let ledger = open_ledger(&config, state_dir)?;
    let rows = ledger.latest_per_stage().map_err(|e| e.to_string())?;
    let total = ledger.row_count().map_err(|e| e.to_string())?;
    ledger.close().map_err(|e| e.to_string())?;

    println!("Ledger: {} ({} rows)", config.storage.ledger_path(state_dir).display(), total);
    for row in &rows {
        print_row(row);
    }
    let declared: Vec<&str> = config
        .stages
        .iter()
        .map(|s| s.name.as_str())
        .filter(|n| !rows.iter().any(|r| r.name == *n))
        .collect();
    if !declared.is_empty() {
        println!("  Never executed: {}", declared.join(", "));
    }
    Ok(())
}

fn cmd_history(file: &Path, state_dir: &Path, stage: &str) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    if !config.stages.iter().any(|s| s.name == stage) {
        return Err(format!("unknown stage '{}'", stage));
    }
    if !config.storage.ledger_path(state_dir).exists() {
        println!("No executions recorded.");
        return Ok(());
    }
    let ledger = open_ledger(&config, state_dir)?;
    let rows = ledger.history(stage).map_err(|e| e.to_string())?;
    ledger.close().map_err(|e| e.to_string())?;

    println!("History: {} ({} executions)", stage, rows.len());
    for row in &rows {
        print_row(row);
    }
    Ok(())
}

fn cmd_cleanup(file: &Path, state_dir: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file).map_err(|e| e.to_string())?;
    if !config.storage.ledger_path(state_dir).exists() {
        println!("Nothing to clean up.");
        return Ok(());
    }
    let ledger = open_ledger(&config, state_dir)?;
    let report = ledger
        .collect_garbage(&config.storage.artifact_dir(state_dir))
        .map_err(|e| e.to_string());
    ledger.close().map_err(|e| e.to_string())?;
    let report = report?;

    println!(
        "Cleanup complete: {} stages kept, {} rows collected, {} files removed, {} missing.",
        report.stages_kept, report.rows_collected, report.files_removed, report.files_missing
    );
    if report.files_failed > 0 {
        eprintln!("warning: {} collected file(s) could not be removed", report.files_failed);
    }
    Ok(())
}
