use chrono::{DateTime, Utc};

use crate::config::MAX_QA_ATTEMPTS;
use crate::errors::ValidationError;
use crate::pipeline::transitions::{self, EventKind, PipelineEvent};
use crate::state::{EscalationState, QaStatus, RunState, Stage};

/// Applies events to run states. Holds no state of its own: every call
/// borrows the current record and hands back a new one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStateMachine;

impl PipelineStateMachine {
    /// Checks table membership and guards, returning the target stage.
    pub fn check_transition(
        state: &RunState,
        event: &PipelineEvent,
    ) -> Result<Stage, ValidationError> {
        let kind = event.kind();
        if state.is_terminal() {
            return Err(ValidationError::TerminalStage {
                run_id: state.run_id().to_string(),
                stage: state.current_stage(),
            });
        }

        let target = transitions::target(state.current_stage(), kind).ok_or(
            ValidationError::UndefinedTransition {
                stage: state.current_stage(),
                event: kind,
            },
        )?;

        let escalation = state.escalation_state();
        if kind.is_quality_progress() && escalation.is_pending() {
            return Err(ValidationError::EscalationPending {
                event: kind,
                escalation,
            });
        }

        match kind {
            EventKind::QaRework if state.current_attempt() >= MAX_QA_ATTEMPTS => {
                Err(ValidationError::AttemptCapReached {
                    attempt: state.current_attempt(),
                    max: MAX_QA_ATTEMPTS,
                })
            }
            EventKind::EscalationRequested if escalation.is_pending() => {
                Err(ValidationError::EscalationPending {
                    event: kind,
                    escalation,
                })
            }
            EventKind::EscalationResolved if !escalation.is_pending() => {
                Err(ValidationError::NoEscalationPending {
                    run_id: state.run_id().to_string(),
                })
            }
            _ => Ok(target),
        }
    }

    pub fn validate_transition(state: &RunState, event: &PipelineEvent) -> bool {
        Self::check_transition(state, event).is_ok()
    }

    pub fn apply_transition(
        state: &RunState,
        event: &PipelineEvent,
    ) -> Result<RunState, ValidationError> {
        Self::apply_transition_at(state, event, Utc::now())
    }

    /// Same as [`Self::apply_transition`] with an explicit clock reading.
    pub fn apply_transition_at(
        state: &RunState,
        event: &PipelineEvent,
        now: DateTime<Utc>,
    ) -> Result<RunState, ValidationError> {
        let target = Self::check_transition(state, event)?;
        let mut next = state.clone();
        next.updated_at = now.max(state.updated_at);

        match event {
            PipelineEvent::QaPass { arbitrated_gate } => {
                next.stages_completed.push(state.current_stage);
                next.current_stage = target;
                next.current_attempt = 1;
                next.qa_status = QaStatus::Pending;
                next.best_of_three_overrides.extend(arbitrated_gate.clone());
            }
            PipelineEvent::QaRework => {
                next.current_attempt += 1;
                next.qa_status = QaStatus::Rework;
            }
            PipelineEvent::QaFail => {
                next.qa_status = QaStatus::Failed;
            }
            PipelineEvent::StageComplete { arbitrated_gate } => {
                next.stages_completed.push(state.current_stage);
                next.current_stage = target;
                next.qa_status = QaStatus::Passed;
                next.best_of_three_overrides.extend(arbitrated_gate.clone());
            }
            PipelineEvent::UnrecoverableError => {
                next.current_stage = target;
            }
            PipelineEvent::EscalationRequested(reason) => {
                next.escalation_state = EscalationState::from(*reason);
            }
            PipelineEvent::EscalationResolved => {
                next.escalation_state = EscalationState::None;
            }
        }

        Ok(next)
    }
}

#[cfg(test)]
pub(crate) mod strategies {
    use super::*;
    use crate::state::EscalationReason;
    use crate::types::RunId;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    pub(crate) fn arb_stage() -> impl Strategy<Value = Stage> {
        proptest::sample::select(Stage::ALL.to_vec())
    }

    pub(crate) fn arb_escalation() -> impl Strategy<Value = EscalationState> {
        proptest::sample::select(vec![
            EscalationState::None,
            EscalationState::LayoutUnknown,
            EscalationState::QaExhausted,
            EscalationState::ErrorEscalated,
        ])
    }

    pub(crate) fn arb_reason() -> impl Strategy<Value = EscalationReason> {
        proptest::sample::select(vec![
            EscalationReason::LayoutUnknown,
            EscalationReason::QaExhausted,
            EscalationReason::ErrorEscalated,
        ])
    }

    pub(crate) fn arb_gate() -> impl Strategy<Value = Option<String>> {
        proptest::option::of("[a-z_]{1,12}")
    }

    pub(crate) fn arb_event() -> impl Strategy<Value = PipelineEvent> {
        prop_oneof![
            arb_gate().prop_map(|g| PipelineEvent::QaPass { arbitrated_gate: g }),
            Just(PipelineEvent::QaRework),
            Just(PipelineEvent::QaFail),
            arb_gate().prop_map(|g| PipelineEvent::StageComplete { arbitrated_gate: g }),
            Just(PipelineEvent::UnrecoverableError),
            arb_reason().prop_map(PipelineEvent::EscalationRequested),
            Just(PipelineEvent::EscalationResolved),
        ]
    }

    /// States reachable from a fresh run by any sequence of events;
    /// events the machine rejects are skipped.
    pub(crate) fn arb_reachable_state() -> impl Strategy<Value = RunState> {
        proptest::collection::vec(arb_event(), 0..32).prop_map(|events| {
            let start = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap();
            let mut state =
                RunState::new_at(RunId::new("run-reachable"), "src", start).unwrap();
            for (i, event) in events.iter().enumerate() {
                let now = start + Duration::seconds(i as i64 + 1);
                if let Ok(next) = PipelineStateMachine::apply_transition_at(&state, event, now) {
                    state = next;
                }
            }
            state
        })
    }
}
