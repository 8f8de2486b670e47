//! `builtin.command`: run a bash script and capture its stdout.
//!
//! `params.script` is piped to `bash` on stdin. `params.script_file` runs a
//! script from disk instead, and its mtime becomes the stage version.
//! Declared output type decides how stdout is decoded.

use crate::core::artifact::Artifact;
use crate::core::context::Results;
use crate::core::error::StageError;
use crate::core::registry::{Stage, StageFactory};
use crate::core::types::{ImplVersion, StageDefinition};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Output of a finished bash process.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

enum Script {
    Inline(String),
    File(PathBuf),
}

/// Run a script through `bash`. Inline scripts go through stdin.
fn exec_bash(script: &Script, workdir: Option<&str>) -> Result<ExecOutput, StageError> {
    let mut cmd = Command::new("bash");
    if let Script::File(ref path) = *script {
        cmd.arg(path);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StageError::new(format!("failed to spawn bash: {}", e)))?;

    let stdin = child.stdin.take();
    let body = match *script {
        Script::Inline(ref body) => Some(body.as_bytes()),
        Script::File(_) => None,
    };

    // stdin is fed from its own thread while stdout and stderr drain here
    std::thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            if let (Some(mut stdin), Some(body)) = (stdin, body) {
                stdin.write_all(body)?;
            }
            Ok(())
        });

        let output = child
            .wait_with_output()
            .map_err(|e| StageError::new(format!("wait error: {}", e)))?;

        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("bash exited before reading the whole script");
            }
            Ok(Err(e)) => return Err(StageError::new(format!("stdin write error: {}", e))),
            Err(_) => return Err(StageError::new("stdin writer panicked")),
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    })
}

fn script_of(definition: &StageDefinition) -> Result<Script, StageError> {
    match (
        definition.param_str("script"),
        definition.param_str("script_file"),
    ) {
        (Some(body), None) => Ok(Script::Inline(body.to_string())),
        (None, Some(path)) => Ok(Script::File(PathBuf::from(path))),
        (Some(_), Some(_)) => Err(StageError::new(format!(
            "stage '{}' sets both 'script' and 'script_file'",
            definition.name
        ))),
        (None, None) => Err(StageError::new(format!(
            "stage '{}' requires 'script' or 'script_file'",
            definition.name
        ))),
    }
}

pub struct CommandFactory;

struct CommandStage {
    definition: StageDefinition,
    script: Script,
}

impl StageFactory for CommandFactory {
    fn version(&self, definition: &StageDefinition) -> Result<ImplVersion, StageError> {
        match script_of(definition)? {
            Script::Inline(_) => Ok(super::BUILTIN_VERSION),
            Script::File(path) => ImplVersion::from_path_mtime(&path)
                .map_err(|e| StageError::new(format!("cannot stat {}: {}", path.display(), e))),
        }
    }

    fn build(&self, definition: &StageDefinition) -> Result<Box<dyn Stage>, StageError> {
        Ok(Box::new(CommandStage {
            definition: definition.clone(),
            script: script_of(definition)?,
        }))
    }
}

impl Stage for CommandStage {
    fn run(&mut self, _inputs: &Results) -> Result<Artifact, StageError> {
        let out = exec_bash(&self.script, self.definition.param_str("workdir"))?;
        debug!(
            stage = %self.definition.name,
            exit = out.exit_code,
            bytes = out.stdout.len(),
            "command finished"
        );
        if !out.success() {
            return Err(StageError::new(format!(
                "exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        super::decode_output(&self.definition, out.stdout)
    }
}
