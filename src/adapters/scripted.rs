//! Scripted collaborators that record their calls and replay canned
//! responses. Intended for tests of the reflection loop and orchestrator.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use super::{AgentExecutor, Critic, CritiqueRequest, Notification, Notifier};
use crate::errors::{AgentExecutionError, NotifyError, QaError};
use crate::pipeline::types::{AgentOutput, AgentRequest, AgentStatus};
use crate::qa::critique::Decision;
use crate::types::ArtifactSet;

pub enum ScriptedStep {
    Output(AgentOutput),
    Fail(AgentExecutionError),
    LayoutUnknown,
    /// Never completes; exercises timeouts.
    Hang,
}

/// Replays queued steps, then succeeds with a synthetic artifact per call.
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn push(&self, step: ScriptedStep) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait::async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput, AgentExecutionError> {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(request.clone());
            calls.len()
        };
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match step {
            Some(ScriptedStep::Output(output)) => Ok(output),
            Some(ScriptedStep::Fail(err)) => Err(err),
            Some(ScriptedStep::LayoutUnknown) => Ok(AgentOutput {
                status: AgentStatus::LayoutUnknown,
                artifacts: ArtifactSet::default(),
                identifier: format!("sess-{call}"),
            }),
            Some(ScriptedStep::Hang) => std::future::pending().await,
            None => Ok(AgentOutput::completed(
                [format!(
                    "work/{}/{}-{}.out",
                    request.run_id, request.stage, request.attempt
                )]
                .into_iter()
                .collect(),
                format!("sess-{call}"),
            )),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub enum ScriptedVerdict {
    /// Rendered against the request's gate and attempt.
    Verdict(Decision, u8),
    Raw(String),
    Error(QaError),
}

/// Replays queued verdicts, then passes everything with score 90.
pub struct ScriptedCritic {
    verdicts: Mutex<VecDeque<ScriptedVerdict>>,
    calls: Mutex<Vec<CritiqueRequest>>,
    hang: bool,
}

impl ScriptedCritic {
    pub fn new(verdicts: Vec<ScriptedVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    pub fn from_scores(scores: &[(Decision, u8)]) -> Self {
        Self::new(
            scores
                .iter()
                .map(|(decision, score)| ScriptedVerdict::Verdict(*decision, *score))
                .collect(),
        )
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::passing()
        }
    }

    pub fn push(&self, verdict: ScriptedVerdict) {
        self.verdicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(verdict);
    }

    pub fn calls(&self) -> Vec<CritiqueRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Critic for ScriptedCritic {
    async fn dispatch(&self, request: &CritiqueRequest) -> Result<String, QaError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if self.hang {
            return std::future::pending().await;
        }
        let verdict = self
            .verdicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match verdict {
            Some(ScriptedVerdict::Verdict(decision, score)) => Ok(critique_json(
                decision,
                score,
                &request.criteria.gate,
                request.attempt,
            )),
            Some(ScriptedVerdict::Raw(raw)) => Ok(raw),
            Some(ScriptedVerdict::Error(err)) => Err(err),
            None => Ok(critique_json(
                Decision::Pass,
                90,
                &request.criteria.gate,
                request.attempt,
            )),
        }
    }
}

/// A well-formed critique as a critic would print it.
pub fn critique_json(decision: Decision, score: u8, gate: &str, attempt: u32) -> String {
    let (blockers, fixes) = match decision {
        Decision::Pass => (json!([]), json!([])),
        Decision::Rework | Decision::Fail => (
            json!([{"severity": "high", "description": format!("score {score} below gate")}]),
            json!([format!("Raise quality on attempt {attempt}")]),
        ),
    };
    json!({
        "decision": decision.as_str(),
        "score": score,
        "gate": gate,
        "attempt": attempt,
        "blockers": blockers,
        "prescriptive_fixes": fixes,
        "confidence": 0.9,
    })
    .to_string()
}

/// Records notifications; optionally fails every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        if self.fail {
            return Err(NotifyError::Status(503));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::catalog::GateCriteria;
    use crate::qa::critique::QaCritique;
    use crate::state::Stage;
    use crate::types::RunId;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn agent_replays_steps_then_succeeds() {
        let agent = ScriptedAgent::new(vec![ScriptedStep::Fail(AgentExecutionError::Reported(
            "crash".into(),
        ))]);
        let req = AgentRequest::initial(RunId::new("r"), Stage::Render, 1, "x", BTreeMap::new());

        assert!(agent.execute(&req).await.is_err());
        let output = agent.execute(&req).await.unwrap();
        assert_eq!(output.identifier, "sess-2");
        assert_eq!(
            output.artifacts.paths()[0],
            std::path::PathBuf::from("work/r/render-1.out")
        );
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn critic_verdicts_parse_as_critiques() {
        let critic = ScriptedCritic::from_scores(&[(Decision::Rework, 55)]);
        let req = CritiqueRequest {
            run_id: RunId::new("r"),
            stage: Stage::Content,
            attempt: 2,
            artifacts: ArtifactSet::default(),
            criteria: GateCriteria {
                gate: "content_gate".into(),
                criteria: String::new(),
            },
        };
        let critique = QaCritique::parse(&critic.dispatch(&req).await.unwrap()).unwrap();
        assert_eq!(critique.decision, Decision::Rework);
        assert_eq!(critique.score, 55);
        assert_eq!(critique.attempt, 2);
        assert_eq!(critique.prescriptive_fixes.len(), 1);

        let fallback = QaCritique::parse(&critic.dispatch(&req).await.unwrap()).unwrap();
        assert_eq!(fallback.decision, Decision::Pass);
        assert_eq!(critic.calls().len(), 2);
    }
}
