//! Run state record. One per run, replaced wholesale on every transition and
//! persisted by the checkpoint store as `<checkpoint_dir>/<run_id>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::MAX_QA_ATTEMPTS;
use crate::errors::ValidationError;
use crate::pipeline::transitions;
use crate::types::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Research,
    Transcript,
    Content,
    Layout,
    Render,
    Assembly,
    Delivery,
    Completed,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Research,
        Stage::Transcript,
        Stage::Content,
        Stage::Layout,
        Stage::Render,
        Stage::Assembly,
        Stage::Delivery,
        Stage::Completed,
        Stage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Research => "research",
            Stage::Transcript => "transcript",
            Stage::Content => "content",
            Stage::Layout => "layout",
            Stage::Render => "render",
            Stage::Assembly => "assembly",
            Stage::Delivery => "delivery",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        transitions::is_terminal(*self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Pending,
    Passed,
    Rework,
    Failed,
}

impl QaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaStatus::Pending => "pending",
            QaStatus::Passed => "passed",
            QaStatus::Rework => "rework",
            QaStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    #[default]
    None,
    LayoutUnknown,
    QaExhausted,
    ErrorEscalated,
}

impl EscalationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationState::None => "none",
            EscalationState::LayoutUnknown => "layout_unknown",
            EscalationState::QaExhausted => "qa_exhausted",
            EscalationState::ErrorEscalated => "error_escalated",
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, EscalationState::None)
    }
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was handed to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    LayoutUnknown,
    QaExhausted,
    ErrorEscalated,
}

impl From<EscalationReason> for EscalationState {
    fn from(reason: EscalationReason) -> Self {
        match reason {
            EscalationReason::LayoutUnknown => EscalationState::LayoutUnknown,
            EscalationReason::QaExhausted => EscalationState::QaExhausted,
            EscalationReason::ErrorEscalated => EscalationState::ErrorEscalated,
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        EscalationState::from(*self).fmt(f)
    }
}

/// Snapshot of one run. Fields are read through accessors; new values come
/// from [`crate::pipeline::machine::PipelineStateMachine::apply_transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub(crate) run_id: RunId,
    pub(crate) source_reference: String,
    pub(crate) current_stage: Stage,
    pub(crate) current_attempt: u32,
    pub(crate) qa_status: QaStatus,
    #[serde(default)]
    pub(crate) stages_completed: Vec<Stage>,
    #[serde(default)]
    pub(crate) escalation_state: EscalationState,
    #[serde(default)]
    pub(crate) best_of_three_overrides: Vec<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl RunState {
    /// A run positioned at the first stage, attempt 1.
    pub fn new(
        run_id: RunId,
        source_reference: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::new_at(run_id, source_reference, Utc::now())
    }

    pub fn new_at(
        run_id: RunId,
        source_reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let state = Self {
            run_id,
            source_reference: source_reference.into(),
            current_stage: transitions::first_stage(),
            current_attempt: 1,
            qa_status: QaStatus::Pending,
            stages_completed: Vec::new(),
            escalation_state: EscalationState::None,
            best_of_three_overrides: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.validate()?;
        Ok(state)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn source_reference(&self) -> &str {
        &self.source_reference
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn qa_status(&self) -> QaStatus {
        self.qa_status
    }

    pub fn stages_completed(&self) -> &[Stage] {
        &self.stages_completed
    }

    pub fn escalation_state(&self) -> EscalationState {
        self.escalation_state
    }

    pub fn best_of_three_overrides(&self) -> &[String] {
        &self.best_of_three_overrides
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Checks the record invariants. Applied to freshly created runs and to
    /// every record read back from disk.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.run_id.is_empty() {
            return Err(ValidationError::InvalidState(
                "run_id must not be empty".to_string(),
            ));
        }
        if !self.run_id.is_path_safe() {
            return Err(ValidationError::InvalidState(format!(
                "run_id {:?} contains path syntax",
                self.run_id.as_str()
            )));
        }
        if self.source_reference.trim().is_empty() {
            return Err(ValidationError::InvalidState(
                "source_reference must not be empty".to_string(),
            ));
        }
        if self.current_attempt < 1 || self.current_attempt > MAX_QA_ATTEMPTS {
            return Err(ValidationError::InvalidState(format!(
                "current_attempt {} outside 1..={MAX_QA_ATTEMPTS}",
                self.current_attempt
            )));
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::InvalidState(
                "updated_at precedes created_at".to_string(),
            ));
        }
        Ok(())
    }
}
