//! Interfaces to the collaborators the orchestration core drives: the agent
//! that produces artifacts, the critic that grades them and the channel
//! that reaches a human operator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod command;
pub mod notify;
pub mod scripted;

use crate::errors::{AgentExecutionError, NotifyError, QaError};
use crate::pipeline::catalog::GateCriteria;
use crate::pipeline::types::{AgentOutput, AgentRequest};
use crate::state::Stage;
use crate::types::{ArtifactSet, RunId};

pub use command::{CommandAgent, CommandCritic};
pub use notify::{LogNotifier, WebhookNotifier};
pub use scripted::{
    RecordingNotifier, ScriptedAgent, ScriptedCritic, ScriptedStep, ScriptedVerdict, critique_json,
};

/// Runs the AI agent for one attempt.
#[async_trait::async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput, AgentExecutionError>;

    fn name(&self) -> &str;
}

/// What the critic is asked to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub run_id: RunId,
    pub stage: Stage,
    pub attempt: u32,
    pub artifacts: ArtifactSet,
    pub criteria: GateCriteria,
}

/// Grades an artifact set against a gate. Returns the raw critique text.
#[async_trait::async_trait]
pub trait Critic: Send + Sync {
    async fn dispatch(&self, request: &CritiqueRequest) -> Result<String, QaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Escalation,
    RunFailed,
    RunCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub run_id: RunId,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] run {} at {}: {}",
            self.kind, self.run_id, self.stage, self.message
        )
    }
}

/// Fire-and-forget operator notification. Callers log failures and move on.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Runs the agent with a hard deadline. The pending execution is dropped on
/// timeout, which kills any child process spawned with `kill_on_drop`.
pub async fn execute_bounded(
    executor: &dyn AgentExecutor,
    request: &AgentRequest,
    limit: Duration,
) -> Result<AgentOutput, AgentExecutionError> {
    match tokio::time::timeout(limit, executor.execute(request)).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!(
                "agent {} timed out after {limit:?} on {} attempt {}",
                executor.name(),
                request.stage,
                request.attempt
            );
            Err(AgentExecutionError::Timeout(limit))
        }
    }
}

pub async fn dispatch_bounded(
    critic: &dyn Critic,
    request: &CritiqueRequest,
    limit: Duration,
) -> Result<String, QaError> {
    match tokio::time::timeout(limit, critic.dispatch(request)).await {
        Ok(result) => result,
        Err(_) => Err(QaError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> AgentRequest {
        AgentRequest::initial(
            RunId::new("run-1"),
            Stage::Render,
            1,
            "Encode clips",
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn hung_agent_times_out() {
        let agent = ScriptedAgent::new(vec![ScriptedStep::Hang]);
        let err = execute_bounded(&agent, &request(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentExecutionError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn hung_critic_times_out() {
        let critic = ScriptedCritic::hanging();
        let req = CritiqueRequest {
            run_id: RunId::new("run-1"),
            stage: Stage::Render,
            attempt: 1,
            artifacts: ArtifactSet::default(),
            criteria: GateCriteria {
                gate: "render_gate".into(),
                criteria: String::new(),
            },
        };
        let err = dispatch_bounded(&critic, &req, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Timeout(_)));
    }

    #[test]
    fn notification_display_names_run_and_stage() {
        let n = Notification {
            kind: NotificationKind::Escalation,
            run_id: RunId::new("run-3"),
            stage: Stage::Layout,
            message: "layout unknown".into(),
        };
        assert_eq!(
            n.to_string(),
            "[Escalation] run run-3 at layout: layout unknown"
        );
    }
}
