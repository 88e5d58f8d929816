//! Generator-critic loop for one stage.
//!
//! The agent produces artifacts, the critic grades them and REWORK feeds the
//! critic's prescriptive fixes back into the next attempt. A stage gets at
//! most [`MAX_QA_ATTEMPTS`] attempts in total, counted from the run's
//! persisted attempt number, so a resumed run never exceeds the cap. When no
//! attempt passes, the highest-scoring attempt wins (earliest on ties) and is
//! flagged for escalation if it scored below [`MIN_SCORE_THRESHOLD`].

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::adapters::{AgentExecutor, Critic, CritiqueRequest, dispatch_bounded, execute_bounded};
use crate::config::{
    DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_CRITIC_TIMEOUT_SECS, MAX_QA_ATTEMPTS, MIN_SCORE_THRESHOLD,
    needs_escalation,
};
use crate::errors::{PipelineError, QaError};
use crate::pipeline::catalog::GateCriteria;
use crate::pipeline::logging::EventLog;
use crate::pipeline::types::{AgentOutput, AgentRequest, AgentStatus, SessionMode};
use crate::qa::critique::{Decision, QaCritique};
use crate::recovery::chain::{ChainOutcome, FailureReport, RecoveryChain, RecoveryContext};
use crate::state::Stage;
use crate::types::ArtifactSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub agent_timeout: Duration,
    pub critic_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            critic_timeout: Duration::from_secs(DEFAULT_CRITIC_TIMEOUT_SECS),
        }
    }
}

/// One graded attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAttempt {
    pub attempt: u32,
    pub critique: QaCritique,
    pub artifacts: ArtifactSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionOutcome {
    /// The critic returned PASS.
    Passed,
    /// No PASS within the cap; the best attempt was selected.
    Arbitrated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionResult {
    pub outcome: ReflectionOutcome,
    /// Critique of the selected attempt.
    pub critique: QaCritique,
    pub artifacts: ArtifactSet,
    pub selected_attempt: u32,
    pub attempts_used: u32,
    pub escalation_needed: bool,
}

#[derive(Debug, Error)]
pub enum ReflectionError {
    #[error("agent could not determine the source layout at {stage}")]
    LayoutUnknown { stage: Stage, attempts_used: u32 },

    #[error("no attempt at {stage} could be evaluated")]
    Unevaluated {
        stage: Stage,
        attempts_used: u32,
        #[source]
        last: QaError,
    },

    #[error("agent execution at {stage} escalated to an operator")]
    ExecutionEscalated {
        stage: Stage,
        attempts_used: u32,
        #[source]
        report: FailureReport,
    },

    #[error("agent execution at {stage} failed unrecoverably")]
    ExecutionExhausted {
        stage: Stage,
        attempts_used: u32,
        #[source]
        report: FailureReport,
    },

    #[error("attempt {attempt} at {stage} could not be recorded")]
    AttemptNotRecorded {
        stage: Stage,
        attempt: u32,
        attempts_used: u32,
        #[source]
        source: PipelineError,
    },
}

impl ReflectionError {
    pub fn attempts_used(&self) -> u32 {
        match self {
            ReflectionError::LayoutUnknown { attempts_used, .. }
            | ReflectionError::Unevaluated { attempts_used, .. }
            | ReflectionError::ExecutionEscalated { attempts_used, .. }
            | ReflectionError::ExecutionExhausted { attempts_used, .. }
            | ReflectionError::AttemptNotRecorded { attempts_used, .. } => *attempts_used,
        }
    }
}

/// Highest score wins; the earliest attempt wins a tie.
pub fn select_best(attempts: &[ScoredAttempt]) -> Option<&ScoredAttempt> {
    attempts.iter().fold(None, |best, candidate| match best {
        Some(current) if current.critique.score >= candidate.critique.score => Some(current),
        _ => Some(candidate),
    })
}

enum Execution {
    Output(AgentOutput),
    Escalated(FailureReport),
    Exhausted(FailureReport),
}

pub struct ReflectionLoop {
    agent: Arc<dyn AgentExecutor>,
    critic: Arc<dyn Critic>,
    recovery: RecoveryChain,
    limits: Limits,
    log: Option<Arc<EventLog>>,
}

impl ReflectionLoop {
    pub fn new(
        agent: Arc<dyn AgentExecutor>,
        critic: Arc<dyn Critic>,
        recovery: RecoveryChain,
        limits: Limits,
    ) -> Self {
        Self {
            agent,
            critic,
            recovery,
            limits,
            log: None,
        }
    }

    pub fn with_event_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Runs the stage from `request.attempt` until PASS or the attempt cap.
    pub async fn run(
        &self,
        request: AgentRequest,
        criteria: &GateCriteria,
    ) -> Result<ReflectionResult, ReflectionError> {
        self.run_recorded(request, criteria, |_| Ok(())).await
    }

    /// Same as [`run`](Self::run), but `advance` receives each next attempt
    /// number before that attempt's agent call starts. An `advance` error
    /// stops the stage without invoking the agent again.
    pub async fn run_recorded<F>(
        &self,
        request: AgentRequest,
        criteria: &GateCriteria,
        mut advance: F,
    ) -> Result<ReflectionResult, ReflectionError>
    where
        F: FnMut(u32) -> Result<(), PipelineError>,
    {
        let first = request.attempt.clamp(1, MAX_QA_ATTEMPTS);
        let stage = request.stage;
        let mut request = AgentRequest {
            attempt: first,
            ..request
        };
        let mut last_session = match &request.session {
            SessionMode::Resume(id) | SessionMode::Fork(id) => Some(id.clone()),
            SessionMode::New => None,
        };
        let mut scored: Vec<ScoredAttempt> = Vec::new();
        let mut last_qa_error: Option<QaError> = None;

        loop {
            let attempt = request.attempt;
            let attempts_used = attempt - first + 1;
            log::info!("{stage} attempt {attempt}/{MAX_QA_ATTEMPTS}");

            let output = match self.execute(&request, last_session.as_deref()).await {
                Execution::Output(output) => output,
                Execution::Escalated(report) => {
                    return Err(ReflectionError::ExecutionEscalated {
                        stage,
                        attempts_used,
                        report,
                    });
                }
                Execution::Exhausted(report) => {
                    return Err(ReflectionError::ExecutionExhausted {
                        stage,
                        attempts_used,
                        report,
                    });
                }
            };

            if output.status == AgentStatus::LayoutUnknown {
                log::warn!("{stage} attempt {attempt}: agent reported unknown layout");
                return Err(ReflectionError::LayoutUnknown {
                    stage,
                    attempts_used,
                });
            }
            if !output.identifier.is_empty() {
                last_session = Some(output.identifier.clone());
            }

            let critique_request = CritiqueRequest {
                run_id: request.run_id.clone(),
                stage,
                attempt,
                artifacts: output.artifacts.clone(),
                criteria: criteria.clone(),
            };
            let next = match self.evaluate(&critique_request).await {
                Ok(critique) => {
                    self.record_critique(&request, &critique);
                    if critique.decision == Decision::Pass {
                        return Ok(ReflectionResult {
                            outcome: ReflectionOutcome::Passed,
                            escalation_needed: false,
                            selected_attempt: attempt,
                            attempts_used,
                            critique,
                            artifacts: output.artifacts,
                        });
                    }
                    let decision = critique.decision;
                    let next = request.rework(&critique.prescriptive_fixes, last_session.as_deref());
                    scored.push(ScoredAttempt {
                        attempt,
                        critique,
                        artifacts: output.artifacts,
                    });
                    // FAIL has no fixes worth applying; arbitrate now.
                    if decision == Decision::Fail {
                        break;
                    }
                    next
                }
                Err(err) => {
                    log::warn!("{stage} attempt {attempt} could not be evaluated: {err}");
                    if let Some(log) = &self.log {
                        log.emit(
                            "qa",
                            "critique_failed",
                            stage,
                            json!({
                                "run_id": request.run_id,
                                "attempt": attempt,
                                "error": err.to_string(),
                            }),
                        );
                    }
                    last_qa_error = Some(err);
                    request.repeat()
                }
            };

            if attempt >= MAX_QA_ATTEMPTS {
                break;
            }
            if let Err(source) = advance(next.attempt) {
                return Err(ReflectionError::AttemptNotRecorded {
                    stage,
                    attempt: next.attempt,
                    attempts_used,
                    source,
                });
            }
            request = next;
        }

        let attempts_used = request.attempt - first + 1;
        let Some(best) = select_best(&scored).cloned() else {
            return Err(ReflectionError::Unevaluated {
                stage,
                attempts_used,
                last: last_qa_error
                    .unwrap_or_else(|| QaError::Dispatch("no critique recorded".to_string())),
            });
        };

        let escalation_needed = needs_escalation(best.critique.score);
        log::info!(
            "{stage}: no PASS after {attempts_used} attempt(s); selected attempt {} (score {}){}",
            best.attempt,
            best.critique.score,
            if escalation_needed {
                format!(", below {MIN_SCORE_THRESHOLD}: escalating")
            } else {
                String::new()
            }
        );
        if let Some(log) = &self.log {
            log.emit(
                "qa",
                "arbitrated",
                stage,
                json!({
                    "run_id": request.run_id,
                    "selected_attempt": best.attempt,
                    "score": best.critique.score,
                    "scores": scored.iter().map(|s| s.critique.score).collect::<Vec<_>>(),
                    "escalation_needed": escalation_needed,
                }),
            );
        }

        Ok(ReflectionResult {
            outcome: ReflectionOutcome::Arbitrated,
            selected_attempt: best.attempt,
            attempts_used,
            escalation_needed,
            critique: best.critique,
            artifacts: best.artifacts,
        })
    }

    async fn execute(&self, request: &AgentRequest, last_session: Option<&str>) -> Execution {
        let agent = self.agent.as_ref();
        match execute_bounded(agent, request, self.limits.agent_timeout).await {
            Ok(output) => Execution::Output(output),
            Err(err) => {
                log::warn!(
                    "{} attempt {} execution failed: {err}",
                    request.stage,
                    request.attempt
                );
                let ctx = RecoveryContext {
                    request,
                    last_session,
                    executor: agent,
                    timeout: self.limits.agent_timeout,
                };
                match self.recovery.recover(&ctx, err).await {
                    ChainOutcome::Recovered { output, .. } => Execution::Output(output),
                    ChainOutcome::Escalated(report) => Execution::Escalated(report),
                    ChainOutcome::Exhausted(report) => Execution::Exhausted(report),
                }
            }
        }
    }

    async fn evaluate(&self, request: &CritiqueRequest) -> Result<QaCritique, QaError> {
        let raw = dispatch_bounded(self.critic.as_ref(), request, self.limits.critic_timeout).await?;
        let critique = QaCritique::parse(&raw)?;
        if critique.attempt != request.attempt {
            log::debug!(
                "critic labelled attempt {} as {}",
                request.attempt,
                critique.attempt
            );
        }
        Ok(critique)
    }

    fn record_critique(&self, request: &AgentRequest, critique: &QaCritique) {
        log::info!(
            "{} attempt {}: {} score={} confidence={:.2} blockers={}",
            request.stage,
            request.attempt,
            critique.decision,
            critique.score,
            critique.confidence,
            critique.blockers.len()
        );
        if let Some(log) = &self.log {
            log.emit(
                "qa",
                "critique",
                request.stage,
                json!({
                    "run_id": request.run_id,
                    "attempt": request.attempt,
                    "decision": critique.decision,
                    "score": critique.score,
                    "gate": critique.gate,
                    "confidence": critique.confidence,
                    "blockers": critique.blockers.len(),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        RecordingNotifier, ScriptedAgent, ScriptedCritic, ScriptedStep, ScriptedVerdict,
    };
    use crate::errors::AgentExecutionError;
    use crate::types::RunId;
    use std::collections::BTreeMap;

    fn criteria() -> GateCriteria {
        GateCriteria {
            gate: "content_gate".into(),
            criteria: String::new(),
        }
    }

    fn request(attempt: u32) -> AgentRequest {
        AgentRequest::initial(
            RunId::new("run-1"),
            Stage::Content,
            attempt,
            "Write titles",
            BTreeMap::new(),
        )
    }

    fn reflection(agent: Arc<ScriptedAgent>, critic: Arc<ScriptedCritic>) -> ReflectionLoop {
        ReflectionLoop::new(
            agent,
            critic,
            RecoveryChain::standard(Arc::new(RecordingNotifier::new())),
            Limits::default(),
        )
    }

    fn scored(attempt: u32, score: u8) -> ScoredAttempt {
        ScoredAttempt {
            attempt,
            critique: QaCritique {
                decision: Decision::Rework,
                score,
                gate: "g".into(),
                attempt,
                blockers: Vec::new(),
                prescriptive_fixes: Vec::new(),
                confidence: 0.5,
            },
            artifacts: ArtifactSet::default(),
        }
    }

    #[test]
    fn select_best_prefers_highest_then_earliest() {
        let attempts = vec![scored(1, 55), scored(2, 38), scored(3, 61)];
        assert_eq!(select_best(&attempts).unwrap().attempt, 3);

        let tied = vec![scored(1, 70), scored(2, 70), scored(3, 65)];
        assert_eq!(select_best(&tied).unwrap().attempt, 1);

        assert!(select_best(&[]).is_none());
    }

    #[tokio::test]
    async fn pass_on_first_attempt_stops_immediately() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::passing());
        let result = reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap();
        assert_eq!(result.outcome, ReflectionOutcome::Passed);
        assert_eq!(result.attempts_used, 1);
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn rework_never_exceeds_three_invocations() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 55),
            (Decision::Rework, 38),
            (Decision::Rework, 61),
            (Decision::Pass, 99),
        ]));
        let result = reflection(agent.clone(), critic.clone())
            .run(request(1), &criteria())
            .await
            .unwrap();

        assert_eq!(agent.call_count(), 3);
        assert_eq!(critic.calls().len(), 3);
        assert_eq!(result.outcome, ReflectionOutcome::Arbitrated);
        assert_eq!(result.selected_attempt, 3);
        assert_eq!(result.critique.score, 61);
        assert_eq!(result.attempts_used, 3);
        assert!(!result.escalation_needed);
        assert_eq!(
            result.artifacts,
            ["work/run-1/content-3.out"].into_iter().collect::<ArtifactSet>()
        );
    }

    #[tokio::test]
    async fn rework_carries_fixes_into_next_attempt() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 50),
            (Decision::Pass, 80),
        ]));
        reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap();

        let calls = agent.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].attempt, 2);
        assert_eq!(calls[1].rework, vec!["Raise quality on attempt 1".to_string()]);
        assert_eq!(calls[1].session, SessionMode::Resume("sess-1".into()));
    }

    #[tokio::test]
    async fn low_best_score_requires_escalation() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 20),
            (Decision::Rework, 30),
            (Decision::Rework, 25),
        ]));
        let result = reflection(agent, critic)
            .run(request(1), &criteria())
            .await
            .unwrap();
        assert_eq!(result.critique.score, 30);
        assert_eq!(result.selected_attempt, 2);
        assert!(result.escalation_needed);
    }

    #[tokio::test]
    async fn fail_goes_straight_to_arbitration() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 45),
            (Decision::Fail, 10),
        ]));
        let result = reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap();
        assert_eq!(agent.call_count(), 2);
        assert_eq!(result.attempts_used, 2);
        assert_eq!(result.selected_attempt, 1);
        assert!(!result.escalation_needed);
    }

    #[tokio::test]
    async fn unparseable_critique_consumes_an_attempt() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::new(vec![
            ScriptedVerdict::Raw("looks fine".into()),
            ScriptedVerdict::Verdict(Decision::Pass, 85),
        ]));
        let result = reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap();
        assert_eq!(result.outcome, ReflectionOutcome::Passed);
        assert_eq!(result.attempts_used, 2);
        assert_eq!(agent.calls()[1].attempt, 2);
    }

    #[tokio::test]
    async fn no_evaluable_attempt_is_an_error() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::new(vec![
            ScriptedVerdict::Raw("?".into()),
            ScriptedVerdict::Error(QaError::Dispatch("down".into())),
            ScriptedVerdict::Raw("{}".into()),
        ]));
        let err = reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap_err();
        assert!(matches!(err, ReflectionError::Unevaluated { .. }));
        assert_eq!(err.attempts_used(), 3);
        assert_eq!(agent.call_count(), 3);
    }

    #[tokio::test]
    async fn resumed_stage_only_uses_remaining_attempts() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 40),
            (Decision::Rework, 41),
        ]));
        let result = reflection(agent.clone(), critic)
            .run(request(3), &criteria())
            .await
            .unwrap();
        assert_eq!(agent.call_count(), 1);
        assert_eq!(result.attempts_used, 1);
        assert_eq!(result.selected_attempt, 3);
    }

    #[tokio::test]
    async fn layout_unknown_stops_the_loop() {
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedStep::LayoutUnknown]));
        let critic = Arc::new(ScriptedCritic::passing());
        let err = reflection(agent, critic.clone())
            .run(request(1), &criteria())
            .await
            .unwrap_err();
        assert!(matches!(err, ReflectionError::LayoutUnknown { attempts_used: 1, .. }));
        assert!(critic.calls().is_empty());
    }

    #[tokio::test]
    async fn execution_failure_recovers_within_the_same_attempt() {
        let agent = Arc::new(ScriptedAgent::new(vec![ScriptedStep::Fail(
            AgentExecutionError::Reported("crash".into()),
        )]));
        let critic = Arc::new(ScriptedCritic::passing());
        let result = reflection(agent.clone(), critic)
            .run(request(1), &criteria())
            .await
            .unwrap();
        assert_eq!(result.attempts_used, 1);
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn unrecoverable_execution_is_reported() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            ScriptedStep::Fail(AgentExecutionError::Reported("a".into())),
            ScriptedStep::Fail(AgentExecutionError::Reported("b".into())),
            ScriptedStep::Fail(AgentExecutionError::Reported("c".into())),
            ScriptedStep::Fail(AgentExecutionError::Reported("d".into())),
        ]));
        let critic = Arc::new(ScriptedCritic::passing());
        let err = reflection(agent, critic)
            .run(request(1), &criteria())
            .await
            .unwrap_err();
        match err {
            ReflectionError::ExecutionEscalated { report, .. } => {
                assert_eq!(report.failures.len(), 3)
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn each_attempt_is_advanced_before_its_agent_call() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[
            (Decision::Rework, 50),
            (Decision::Rework, 50),
            (Decision::Pass, 90),
        ]));
        let mut advanced = Vec::new();
        let result = reflection(agent.clone(), critic)
            .run_recorded(request(1), &criteria(), |attempt| {
                advanced.push((attempt, agent.call_count()));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.selected_attempt, 3);
        assert_eq!(advanced, vec![(2, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn failed_advance_stops_before_the_next_agent_call() {
        let agent = Arc::new(ScriptedAgent::succeeding());
        let critic = Arc::new(ScriptedCritic::from_scores(&[(Decision::Rework, 50)]));
        let err = reflection(agent.clone(), critic)
            .run_recorded(request(1), &criteria(), |_| {
                Err(PipelineError::RunNotFound("run-1".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReflectionError::AttemptNotRecorded {
                attempt: 2,
                attempts_used: 1,
                ..
            }
        ));
        assert_eq!(agent.call_count(), 1);
    }
}
