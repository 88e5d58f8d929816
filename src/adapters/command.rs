//! Agent and critic backed by external programs.
//!
//! The request is written to the child's stdin as JSON. The agent replies on
//! stdout with an [`AgentOutput`] record; the critic replies with free text
//! that contains its critique JSON. Children are spawned with
//! `kill_on_drop`, so a caller that times out also kills the process.

use serde::Serialize;
use std::io::ErrorKind;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::{AgentExecutor, Critic, CritiqueRequest};
use crate::app_config::CommandConfig;
use crate::errors::{AgentExecutionError, QaError};
use crate::pipeline::types::{AgentOutput, AgentRequest};

const MAX_STDERR_CHARS: usize = 2000;

#[derive(Serialize)]
struct AgentInvocation<'a> {
    #[serde(flatten)]
    request: &'a AgentRequest,
    prompt: String,
}

pub struct CommandAgent {
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CommandConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait::async_trait]
impl AgentExecutor for CommandAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput, AgentExecutionError> {
        let invocation = AgentInvocation {
            request,
            prompt: request.prompt(),
        };
        let input = serde_json::to_vec(&invocation)
            .map_err(|e| AgentExecutionError::Rejected(format!("cannot encode request: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("REELRS_RUN_ID", request.run_id.as_str())
            .env("REELRS_STAGE", request.stage.as_str())
            .env("REELRS_ATTEMPT", request.attempt.to_string());

        let child = spawn_piped(command).map_err(|source| AgentExecutionError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let output = collect_with_stdin(child, &input).await?;

        if !output.status.success() {
            return Err(AgentExecutionError::NonZeroExit {
                code: output.status.code(),
                stderr: stderr_excerpt(&output),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(AgentExecutionError::MalformedOutput)
    }

    fn name(&self) -> &str {
        &self.program
    }
}

pub struct CommandCritic {
    program: String,
    args: Vec<String>,
}

impl CommandCritic {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CommandConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait::async_trait]
impl Critic for CommandCritic {
    async fn dispatch(&self, request: &CritiqueRequest) -> Result<String, QaError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| QaError::Dispatch(format!("cannot encode critique request: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("REELRS_RUN_ID", request.run_id.as_str())
            .env("REELRS_STAGE", request.stage.as_str())
            .env("REELRS_GATE", &request.criteria.gate);

        let child = spawn_piped(command)?;
        let output = collect_with_stdin(child, &input).await?;
        if !output.status.success() {
            return Err(QaError::Dispatch(format!(
                "critic `{}` exited with {:?}: {}",
                self.program,
                output.status.code(),
                stderr_excerpt(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn spawn_piped(mut command: Command) -> std::io::Result<Child> {
    command
        .kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Feeds `input` to the child while draining its stdout and stderr, so a
/// child that writes before it finishes reading cannot stall on a full pipe.
async fn collect_with_stdin(mut child: Child, input: &[u8]) -> std::io::Result<Output> {
    let stdin = child.stdin.take();
    let feed = async move {
        let Some(mut stdin) = stdin else {
            return Ok(());
        };
        match stdin.write_all(input).await {
            Ok(()) => Ok(()),
            // Child exited without reading its input; its status says why.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                log::debug!("child closed stdin early");
                Ok(())
            }
            Err(e) => Err(e),
        }
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    fed?;
    Ok(output)
}

fn stderr_excerpt(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= MAX_STDERR_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(MAX_STDERR_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}
