//! Startup scan for runs interrupted mid-flight.

use serde::Serialize;
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::errors::CheckpointError;
use crate::state::{RunState, Stage};
use crate::types::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryPlan {
    pub run_id: RunId,
    pub resume_from_stage: Stage,
    pub reason: String,
    /// Paused for an operator; must not be resumed automatically.
    pub awaiting_resolution: bool,
}

impl RecoveryPlan {
    fn for_state(state: &RunState) -> Self {
        let stage = state.current_stage();
        let escalation = state.escalation_state();
        let reason = if escalation.is_pending() {
            format!("paused at {stage} awaiting operator resolution ({escalation})")
        } else {
            format!(
                "interrupted at {stage} attempt {} (qa {}) with {} stage(s) completed",
                state.current_attempt(),
                state.qa_status(),
                state.stages_completed().len()
            )
        };
        Self {
            run_id: state.run_id().clone(),
            resume_from_stage: stage,
            reason,
            awaiting_resolution: escalation.is_pending(),
        }
    }
}

pub struct CrashRecoveryHandler {
    store: Arc<dyn CheckpointStore>,
}

impl CrashRecoveryHandler {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// One plan per non-terminal run, oldest update first. Completed stages
    /// are never re-run: each plan resumes at the run's current stage.
    pub fn scan_and_recover(&self) -> Result<Vec<RecoveryPlan>, CheckpointError> {
        let plans: Vec<RecoveryPlan> = self
            .store
            .list_incomplete()?
            .iter()
            .map(RecoveryPlan::for_state)
            .collect();
        for plan in &plans {
            log::info!("recovery: {} {}", plan.run_id, plan.reason);
        }
        Ok(plans)
    }
}
