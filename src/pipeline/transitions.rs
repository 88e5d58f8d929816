//! Static stage transition table.
//!
//! The table is built once on first use and never mutated, so it can be
//! shared freely between concurrent runs and test instances.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::state::{EscalationReason, Stage};

/// Working stages in pipeline order.
pub const STAGE_ORDER: [Stage; 7] = [
    Stage::Research,
    Stage::Transcript,
    Stage::Content,
    Stage::Layout,
    Stage::Render,
    Stage::Assembly,
    Stage::Delivery,
];

pub const TERMINAL_STAGES: [Stage; 2] = [Stage::Completed, Stage::Failed];

/// Table key for a [`PipelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    QaPass,
    QaRework,
    QaFail,
    StageComplete,
    UnrecoverableError,
    EscalationRequested,
    EscalationResolved,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::QaPass,
        EventKind::QaRework,
        EventKind::QaFail,
        EventKind::StageComplete,
        EventKind::UnrecoverableError,
        EventKind::EscalationRequested,
        EventKind::EscalationResolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::QaPass => "qa_pass",
            EventKind::QaRework => "qa_rework",
            EventKind::QaFail => "qa_fail",
            EventKind::StageComplete => "stage_complete",
            EventKind::UnrecoverableError => "unrecoverable_error",
            EventKind::EscalationRequested => "escalation_requested",
            EventKind::EscalationResolved => "escalation_resolved",
        }
    }

    /// Events that move the quality gate forward; refused while escalated.
    pub fn is_quality_progress(&self) -> bool {
        matches!(
            self,
            EventKind::QaPass | EventKind::QaRework | EventKind::QaFail | EventKind::StageComplete
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event applied to a run by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Gate passed. `arbitrated_gate` is set when best-of-three picked the attempt.
    QaPass { arbitrated_gate: Option<String> },
    QaRework,
    QaFail,
    /// Final stage passed; the run completes.
    StageComplete { arbitrated_gate: Option<String> },
    UnrecoverableError,
    EscalationRequested(EscalationReason),
    EscalationResolved,
}

impl PipelineEvent {
    pub fn qa_pass() -> Self {
        PipelineEvent::QaPass {
            arbitrated_gate: None,
        }
    }

    pub fn stage_complete() -> Self {
        PipelineEvent::StageComplete {
            arbitrated_gate: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::QaPass { .. } => EventKind::QaPass,
            PipelineEvent::QaRework => EventKind::QaRework,
            PipelineEvent::QaFail => EventKind::QaFail,
            PipelineEvent::StageComplete { .. } => EventKind::StageComplete,
            PipelineEvent::UnrecoverableError => EventKind::UnrecoverableError,
            PipelineEvent::EscalationRequested(_) => EventKind::EscalationRequested,
            PipelineEvent::EscalationResolved => EventKind::EscalationResolved,
        }
    }

    pub fn arbitrated_gate(&self) -> Option<&str> {
        match self {
            PipelineEvent::QaPass { arbitrated_gate }
            | PipelineEvent::StageComplete { arbitrated_gate } => arbitrated_gate.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

static TABLE: LazyLock<HashMap<(Stage, EventKind), Stage>> = LazyLock::new(build_table);

fn build_table() -> HashMap<(Stage, EventKind), Stage> {
    let mut table = HashMap::new();
    for (idx, &stage) in STAGE_ORDER.iter().enumerate() {
        match STAGE_ORDER.get(idx + 1) {
            Some(&next) => {
                table.insert((stage, EventKind::QaPass), next);
            }
            None => {
                table.insert((stage, EventKind::StageComplete), Stage::Completed);
            }
        }
        table.insert((stage, EventKind::QaRework), stage);
        table.insert((stage, EventKind::QaFail), stage);
        table.insert((stage, EventKind::UnrecoverableError), Stage::Failed);
        table.insert((stage, EventKind::EscalationRequested), stage);
        table.insert((stage, EventKind::EscalationResolved), stage);
    }
    table
}

/// Stage reached by applying `event` in `stage`, if the pair is in the table.
pub fn target(stage: Stage, event: EventKind) -> Option<Stage> {
    TABLE.get(&(stage, event)).copied()
}

pub fn first_stage() -> Stage {
    STAGE_ORDER[0]
}

pub fn final_stage() -> Stage {
    STAGE_ORDER[STAGE_ORDER.len() - 1]
}

pub fn is_final(stage: Stage) -> bool {
    stage == final_stage()
}

pub fn is_terminal(stage: Stage) -> bool {
    TERMINAL_STAGES.contains(&stage)
}

/// Next working stage, `None` for the final and terminal stages.
pub fn next_stage(stage: Stage) -> Option<Stage> {
    let idx = STAGE_ORDER.iter().position(|s| *s == stage)?;
    STAGE_ORDER.get(idx + 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qa_pass_advances_in_order() {
        assert_eq!(
            target(Stage::Research, EventKind::QaPass),
            Some(Stage::Transcript)
        );
        assert_eq!(
            target(Stage::Assembly, EventKind::QaPass),
            Some(Stage::Delivery)
        );
        assert_eq!(target(Stage::Delivery, EventKind::QaPass), None);
    }

    #[test]
    fn only_final_stage_completes() {
        assert_eq!(
            target(Stage::Delivery, EventKind::StageComplete),
            Some(Stage::Completed)
        );
        for stage in &STAGE_ORDER[..STAGE_ORDER.len() - 1] {
            assert_eq!(target(*stage, EventKind::StageComplete), None);
        }
    }

    #[test]
    fn terminal_stages_have_no_transitions() {
        for stage in TERMINAL_STAGES {
            for event in EventKind::ALL {
                assert_eq!(target(stage, event), None, "{stage} + {event}");
            }
        }
    }

    #[test]
    fn unrecoverable_error_fails_every_working_stage() {
        for stage in STAGE_ORDER {
            assert_eq!(
                target(stage, EventKind::UnrecoverableError),
                Some(Stage::Failed)
            );
        }
    }

    #[test]
    fn next_stage_follows_order() {
        assert_eq!(next_stage(Stage::Content), Some(Stage::Layout));
        assert_eq!(next_stage(Stage::Delivery), None);
        assert_eq!(next_stage(Stage::Failed), None);
        assert_eq!(first_stage(), Stage::Research);
        assert!(is_final(Stage::Delivery));
    }

    #[test]
    fn event_kind_names_match_wire_format() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
