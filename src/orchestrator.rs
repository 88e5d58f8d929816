//! Drives runs stage by stage.
//!
//! Every state change goes through the same path: the state machine
//! validates the event and produces a new record, the record is persisted,
//! the transition is logged, and only then does the in-memory context move
//! forward. A crash at any point leaves the last persisted record intact.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{AgentExecutor, Critic, Notification, NotificationKind, Notifier};
use crate::checkpoint::{ArtifactLedger, CheckpointStore};
use crate::errors::{ConfigurationError, PipelineError};
use crate::events::{EventContext, EventManager, LifecycleEvent};
use crate::pipeline::catalog::StageCatalog;
use crate::pipeline::logging::EventLog;
use crate::pipeline::machine::PipelineStateMachine;
use crate::pipeline::transitions::{self, PipelineEvent};
use crate::pipeline::types::AgentRequest;
use crate::qa::reflection::{
    Limits, ReflectionError, ReflectionLoop, ReflectionOutcome, ReflectionResult,
};
use crate::recovery::chain::RecoveryChain;
use crate::recovery::crash::{CrashRecoveryHandler, RecoveryPlan};
use crate::state::{EscalationReason, RunState, Stage};
use crate::types::{ArtifactSet, RunId};

/// A run plus the artifacts its completed stages produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    state: RunState,
    artifacts: BTreeMap<Stage, ArtifactSet>,
}

impl RunContext {
    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn artifacts(&self) -> &BTreeMap<Stage, ArtifactSet> {
        &self.artifacts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunState),
    Failed(RunState),
    /// Waiting on an operator; see [`Orchestrator::resolve_escalation`].
    Paused(RunState),
}

impl RunOutcome {
    pub fn state(&self) -> &RunState {
        match self {
            RunOutcome::Completed(state) | RunOutcome::Failed(state) | RunOutcome::Paused(state) => {
                state
            }
        }
    }
}

enum StageStep {
    Advanced,
    Paused,
    Failed,
}

/// The external collaborators a pipeline drives.
pub struct Collaborators {
    pub agent: Arc<dyn AgentExecutor>,
    pub critic: Arc<dyn Critic>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    ledger: ArtifactLedger,
    catalog: StageCatalog,
    reflection: ReflectionLoop,
    notifier: Arc<dyn Notifier>,
    log: Option<Arc<EventLog>>,
    /// In-process lifecycle listeners. Register before driving runs.
    pub events: EventManager,
    in_flight: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        ledger: ArtifactLedger,
        catalog: StageCatalog,
        collaborators: Collaborators,
        limits: Limits,
        log: Option<Arc<EventLog>>,
    ) -> Self {
        let mut recovery = RecoveryChain::standard(collaborators.notifier.clone());
        if let Some(log) = &log {
            recovery = recovery.with_event_log(log.clone());
        }
        let mut reflection =
            ReflectionLoop::new(collaborators.agent, collaborators.critic, recovery, limits);
        if let Some(log) = &log {
            reflection = reflection.with_event_log(log.clone());
        }
        Self {
            store,
            ledger,
            catalog,
            reflection,
            notifier: collaborators.notifier,
            log,
            events: EventManager::new(),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Creates and persists a new run at the first stage.
    pub fn start_run(&self, source_reference: &str) -> Result<RunContext, PipelineError> {
        let state = RunState::new(RunId::generate(), source_reference)?;
        self.store.save(&state)?;
        log::info!("started {} for {source_reference}", state.run_id());
        self.emit(
            "run_started",
            state.current_stage(),
            json!({"run_id": state.run_id(), "source_reference": source_reference}),
        );
        self.events.fire(
            LifecycleEvent::RunStarted,
            &EventContext::new()
                .with_run_id(state.run_id().as_str())
                .with_stage(state.current_stage())
                .with_message(source_reference),
        );
        Ok(RunContext {
            state,
            artifacts: BTreeMap::new(),
        })
    }

    /// Persisted state and artifacts for an existing run.
    pub fn load_run(&self, run_id: &RunId) -> Result<RunContext, PipelineError> {
        let state = self
            .store
            .load(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;
        let artifacts = self.ledger.load(run_id)?;
        Ok(RunContext { state, artifacts })
    }

    /// Runs stages until the run completes, fails or pauses for an operator.
    /// Only one run is driven at a time per orchestrator.
    pub async fn drive(&self, ctx: &mut RunContext) -> Result<RunOutcome, PipelineError> {
        let _flight = self.in_flight.lock().await;

        loop {
            let stage = ctx.state.current_stage();
            match stage {
                Stage::Completed => {
                    self.notify(Notification {
                        kind: NotificationKind::RunCompleted,
                        run_id: ctx.state.run_id().clone(),
                        stage,
                        message: format!(
                            "all {} stage(s) delivered",
                            ctx.state.stages_completed().len()
                        ),
                    })
                    .await;
                    return Ok(self.finish(ctx, RunOutcome::Completed));
                }
                Stage::Failed => return Ok(self.finish(ctx, RunOutcome::Failed)),
                _ => {}
            }
            if ctx.state.escalation_state().is_pending() {
                log::info!(
                    "{} is awaiting operator resolution ({})",
                    ctx.state.run_id(),
                    ctx.state.escalation_state()
                );
                return Ok(RunOutcome::Paused(ctx.state.clone()));
            }

            let spec = self
                .catalog
                .spec(stage)
                .ok_or(ConfigurationError::MissingStage(stage))?;
            self.events.fire(
                LifecycleEvent::StageStarted,
                &EventContext::new()
                    .with_run_id(ctx.state.run_id().as_str())
                    .with_stage(stage)
                    .with_attempt(ctx.state.current_attempt()),
            );

            let request = AgentRequest::initial(
                ctx.state.run_id().clone(),
                stage,
                ctx.state.current_attempt(),
                spec.requirements.clone(),
                ctx.artifacts.clone(),
            );
            // Each rework is on disk before the attempt it starts, so a crash
            // mid-stage resumes at the attempt that was running.
            let result = self
                .reflection
                .run_recorded(request, &spec.gate_criteria(), |_| {
                    self.transition(ctx, PipelineEvent::QaRework)
                })
                .await;

            let step = match result {
                Ok(result) => self.settle_stage(ctx, stage, result).await?,
                Err(err) => self.settle_failure(ctx, stage, err).await?,
            };
            match step {
                StageStep::Advanced => continue,
                StageStep::Paused => return Ok(RunOutcome::Paused(ctx.state.clone())),
                StageStep::Failed => return Ok(self.finish(ctx, RunOutcome::Failed)),
            }
        }
    }

    async fn settle_stage(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        result: ReflectionResult,
    ) -> Result<StageStep, PipelineError> {
        if result.outcome == ReflectionOutcome::Passed {
            return self.advance(ctx, stage, result, None);
        }

        self.transition(ctx, PipelineEvent::QaFail)?;
        if result.escalation_needed {
            let message = format!(
                "best of {} attempt(s) at {stage} scored {} (attempt {}); operator review required",
                result.attempts_used, result.critique.score, result.selected_attempt
            );
            self.escalate(ctx, EscalationReason::QaExhausted, message, true)
                .await?;
            return Ok(StageStep::Paused);
        }
        let gate = result.critique.gate.clone();
        self.advance(ctx, stage, result, Some(gate))
    }

    async fn settle_failure(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        err: ReflectionError,
    ) -> Result<StageStep, PipelineError> {
        log::warn!("{} at {stage}: {err}", ctx.state.run_id());

        match err {
            ReflectionError::LayoutUnknown { .. } => {
                let message = format!("agent could not classify the source layout at {stage}");
                self.escalate(ctx, EscalationReason::LayoutUnknown, message, true)
                    .await?;
                Ok(StageStep::Paused)
            }
            ReflectionError::Unevaluated { last, .. } => {
                self.transition(ctx, PipelineEvent::QaFail)?;
                let message = format!("no attempt at {stage} could be evaluated: {last}");
                self.escalate(ctx, EscalationReason::QaExhausted, message, true)
                    .await?;
                Ok(StageStep::Paused)
            }
            ReflectionError::ExecutionEscalated { report, .. } => {
                // The recovery chain has already notified the operator.
                self.escalate(ctx, EscalationReason::ErrorEscalated, report.to_string(), false)
                    .await?;
                Ok(StageStep::Paused)
            }
            ReflectionError::AttemptNotRecorded { source, .. } => Err(source),
            ReflectionError::ExecutionExhausted { report, .. } => {
                self.transition(ctx, PipelineEvent::UnrecoverableError)?;
                self.notify(Notification {
                    kind: NotificationKind::RunFailed,
                    run_id: ctx.state.run_id().clone(),
                    stage,
                    message: report.to_string(),
                })
                .await;
                Ok(StageStep::Failed)
            }
        }
    }

    fn advance(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        result: ReflectionResult,
        arbitrated_gate: Option<String>,
    ) -> Result<StageStep, PipelineError> {
        let mut artifacts = ctx.artifacts.clone();
        artifacts.insert(stage, result.artifacts);
        self.ledger.record(ctx.state.run_id(), &artifacts)?;
        ctx.artifacts = artifacts;

        let event = if transitions::is_final(stage) {
            PipelineEvent::StageComplete { arbitrated_gate }
        } else {
            PipelineEvent::QaPass { arbitrated_gate }
        };
        self.transition(ctx, event)?;

        self.events.fire(
            LifecycleEvent::StageResolved,
            &EventContext::new()
                .with_run_id(ctx.state.run_id().as_str())
                .with_stage(stage)
                .with_attempt(result.selected_attempt)
                .with_metadata("score", result.critique.score.to_string())
                .with_metadata("outcome", format!("{:?}", result.outcome)),
        );
        Ok(StageStep::Advanced)
    }

    async fn escalate(
        &self,
        ctx: &mut RunContext,
        reason: EscalationReason,
        message: String,
        notify: bool,
    ) -> Result<(), PipelineError> {
        let stage = ctx.state.current_stage();
        self.transition(ctx, PipelineEvent::EscalationRequested(reason))?;
        if notify {
            self.notify(Notification {
                kind: NotificationKind::Escalation,
                run_id: ctx.state.run_id().clone(),
                stage,
                message: message.clone(),
            })
            .await;
        }
        self.events.fire(
            LifecycleEvent::EscalationRaised,
            &EventContext::new()
                .with_run_id(ctx.state.run_id().as_str())
                .with_stage(stage)
                .with_message(message)
                .with_metadata("reason", reason.to_string()),
        );
        Ok(())
    }

    /// Validate, persist, log, then swap. Nothing changes in memory unless
    /// the new record is on disk.
    fn transition(&self, ctx: &mut RunContext, event: PipelineEvent) -> Result<(), PipelineError> {
        let next = PipelineStateMachine::apply_transition(&ctx.state, &event)?;
        self.store.save(&next)?;
        log::debug!(
            "{} {event}: {} -> {}",
            next.run_id(),
            ctx.state.current_stage(),
            next.current_stage()
        );
        self.emit(
            event.kind().as_str(),
            ctx.state.current_stage(),
            json!({
                "run_id": next.run_id(),
                "from": ctx.state.current_stage(),
                "to": next.current_stage(),
                "attempt": next.current_attempt(),
                "qa_status": next.qa_status(),
                "escalation": next.escalation_state(),
                "arbitrated_gate": event.arbitrated_gate(),
            }),
        );
        ctx.state = next;
        Ok(())
    }

    fn finish(&self, ctx: &RunContext, outcome: fn(RunState) -> RunOutcome) -> RunOutcome {
        self.events.fire(
            LifecycleEvent::RunFinished,
            &EventContext::new()
                .with_run_id(ctx.state.run_id().as_str())
                .with_stage(ctx.state.current_stage()),
        );
        outcome(ctx.state.clone())
    }

    async fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification).await {
            log::warn!("notification for {} failed: {err}", notification.run_id);
        }
    }

    fn emit(&self, event: &str, stage: Stage, data: serde_json::Value) {
        if let Some(log) = &self.log {
            log.emit("pipeline", event, stage, data);
        }
    }

    /// Operator clears a pending escalation; the run becomes resumable.
    pub async fn resolve_escalation(&self, run_id: &RunId) -> Result<RunState, PipelineError> {
        let _flight = self.in_flight.lock().await;
        let mut ctx = self.load_run(run_id)?;
        let escalation = ctx.state.escalation_state();
        self.transition(&mut ctx, PipelineEvent::EscalationResolved)?;
        log::info!("{run_id}: escalation {escalation} resolved");
        Ok(ctx.state)
    }

    /// Operator stops a run for good.
    pub async fn abort(&self, run_id: &RunId, reason: &str) -> Result<RunState, PipelineError> {
        let _flight = self.in_flight.lock().await;
        let mut ctx = self.load_run(run_id)?;
        let stage = ctx.state.current_stage();
        self.transition(&mut ctx, PipelineEvent::UnrecoverableError)?;
        log::warn!("{run_id} aborted at {stage}: {reason}");
        self.notify(Notification {
            kind: NotificationKind::RunFailed,
            run_id: run_id.clone(),
            stage,
            message: format!("aborted by operator: {reason}"),
        })
        .await;
        Ok(ctx.state)
    }

    /// Plans for every interrupted run, oldest first.
    pub fn recover(&self) -> Result<Vec<RecoveryPlan>, PipelineError> {
        Ok(CrashRecoveryHandler::new(self.store.clone()).scan_and_recover()?)
    }

    /// Continues one interrupted run from its persisted stage and attempt.
    pub async fn resume(&self, plan: &RecoveryPlan) -> Result<RunOutcome, PipelineError> {
        let mut ctx = self.load_run(&plan.run_id)?;
        let escalation = ctx.state.escalation_state();
        if escalation.is_pending() {
            return Err(PipelineError::AwaitingResolution {
                run_id: plan.run_id.to_string(),
                escalation,
            });
        }
        if ctx.state.current_stage() != plan.resume_from_stage {
            log::warn!(
                "{} moved from {} to {} since the scan",
                plan.run_id,
                plan.resume_from_stage,
                ctx.state.current_stage()
            );
        }
        log::info!("resuming {}: {}", plan.run_id, plan.reason);
        self.emit(
            "run_resumed",
            ctx.state.current_stage(),
            json!({"run_id": plan.run_id, "attempt": ctx.state.current_attempt()}),
        );
        self.drive(&mut ctx).await
    }

    /// Startup recovery: resumes every interrupted run that is not waiting on
    /// an operator, one at a time, oldest first.
    pub async fn resume_interrupted(&self) -> Result<Vec<RunOutcome>, PipelineError> {
        let mut outcomes = Vec::new();
        for plan in self.recover()? {
            if plan.awaiting_resolution {
                log::info!("{} left paused: {}", plan.run_id, plan.reason);
                continue;
            }
            outcomes.push(self.resume(&plan).await?);
        }
        Ok(outcomes)
    }
}
