use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::transitions::EventKind;
use crate::state::{EscalationState, Stage};

/// An FSM transition or run record that breaks the pipeline rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Run {run_id} is terminal at stage {stage}; no further transitions are legal")]
    TerminalStage { run_id: String, stage: Stage },

    #[error("No transition for event {event} from stage {stage}")]
    UndefinedTransition { stage: Stage, event: EventKind },

    #[error("Rework rejected at attempt {attempt}: cap of {max} attempts reached")]
    AttemptCapReached { attempt: u32, max: u32 },

    #[error("Event {event} rejected while escalation {escalation} is pending")]
    EscalationPending {
        event: EventKind,
        escalation: EscalationState,
    },

    #[error("No escalation is pending for run {run_id}")]
    NoEscalationPending { run_id: String },

    #[error("Invalid run state: {0}")]
    InvalidState(String),
}

/// A critic response that cannot be turned into a critique.
#[derive(Error, Debug)]
pub enum CritiqueParseError {
    #[error("Critique response contains no JSON object")]
    NoJson,

    #[error("Critique response is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Critique response must be a JSON object")]
    NotAnObject,

    #[error("Critique is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Critique field {field} has the wrong type: expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Unknown critique decision: {0}")]
    UnknownDecision(String),

    #[error("Unknown blocker severity: {0}")]
    UnknownSeverity(String),

    #[error("Score {0} is outside 0..=100")]
    ScoreOutOfRange(i64),

    #[error("Confidence {0} is outside 0.0..=1.0")]
    ConfidenceOutOfRange(f64),

    #[error("Attempt {0} must be a positive integer")]
    InvalidAttempt(i64),

    #[error("Critique gate must not be empty")]
    EmptyGate,
}

/// The critic failed to evaluate an attempt. Consumes the attempt.
#[derive(Error, Debug)]
pub enum QaError {
    #[error("Critic dispatch failed: {0}")]
    Dispatch(String),

    #[error("Critic timed out after {0:?}")]
    Timeout(Duration),

    #[error("Critic I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Critic response rejected: {0}")]
    Parse(#[from] CritiqueParseError),
}

/// Running the agent itself failed. Routed through the recovery chain.
#[derive(Error, Debug)]
pub enum AgentExecutionError {
    #[error("Failed to spawn agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Agent produced unreadable output: {0}")]
    MalformedOutput(#[source] serde_json::Error),

    #[error("Agent reported failure: {0}")]
    Reported(String),

    #[error("No agent session is available to fork")]
    NoSessionToFork,

    #[error("Agent rejected the request: {0}")]
    Rejected(String),

    #[error("Agent I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentExecutionError {
    /// Transient failures are worth another attempt; structural ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            Self::Rejected(_) => false,
            _ => true,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Record {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record {path} violates run invariants: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error("Refusing to persist run with unsafe id {0:?}")]
    UnsafeRunId(String),

    #[error("Invalid record pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Fatal at startup; blocks all processing.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read stage catalog {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage catalog {path} is invalid: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Stage catalog has no entry for stage {0}")]
    MissingStage(Stage),

    #[error("Stage catalog entry {0} has an empty gate name")]
    EmptyGate(Stage),

    #[error("{section}.program must not be empty")]
    EmptyProgram { section: &'static str },

    #[error("{section}.timeout_seconds must be greater than zero")]
    ZeroTimeout { section: &'static str },

    #[error("Notifier webhook URL must be http(s): {0}")]
    InvalidWebhook(String),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned status {0}")]
    Status(u16),
}

/// Errors surfaced by the orchestrator to its caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {run_id} is paused awaiting operator resolution ({escalation})")]
    AwaitingResolution {
        run_id: String,
        escalation: EscalationState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_agent_binary_is_structural() {
        let err = AgentExecutionError::Spawn {
            program: "missing-agent".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!err.is_transient());
        assert!(!AgentExecutionError::Rejected("bad request".into()).is_transient());
    }

    #[test]
    fn crashes_and_timeouts_are_transient() {
        assert!(AgentExecutionError::Timeout(Duration::from_secs(5)).is_transient());
        // Pipe failures after a successful spawn.
        let pipe: AgentExecutionError =
            std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(pipe, AgentExecutionError::Io(_)));
        assert!(pipe.is_transient());
        assert!(
            AgentExecutionError::NonZeroExit {
                code: None,
                stderr: String::new()
            }
            .is_transient()
        );
        assert!(AgentExecutionError::NoSessionToFork.is_transient());
    }

    #[test]
    fn exit_label_mentions_signal_when_code_missing() {
        let err = AgentExecutionError::NonZeroExit {
            code: None,
            stderr: "segfault".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Agent exited with no exit code (killed by signal): segfault"
        );
    }

    #[test]
    fn qa_error_keeps_parse_cause() {
        let err = QaError::from(CritiqueParseError::ScoreOutOfRange(140));
        let source = std::error::Error::source(&err).expect("parse cause");
        assert_eq!(source.to_string(), "Score 140 is outside 0..=100");
    }
}
