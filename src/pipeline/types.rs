use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::state::Stage;
use crate::types::{ArtifactSet, RunId};

/// Which agent session an execution continues from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "id", rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    New,
    Resume(String),
    Fork(String),
}

/// One unit of work handed to the agent executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub stage: Stage,
    pub attempt: u32,
    pub requirements: String,
    #[serde(default)]
    pub prior_artifacts: BTreeMap<Stage, ArtifactSet>,
    /// Previous critique's prescriptive fixes, verbatim.
    #[serde(default)]
    pub rework: Vec<String>,
    #[serde(default)]
    pub session: SessionMode,
}

impl AgentRequest {
    pub fn initial(
        run_id: RunId,
        stage: Stage,
        attempt: u32,
        requirements: impl Into<String>,
        prior_artifacts: BTreeMap<Stage, ArtifactSet>,
    ) -> Self {
        Self {
            run_id,
            stage,
            attempt,
            requirements: requirements.into(),
            prior_artifacts,
            rework: Vec::new(),
            session: SessionMode::New,
        }
    }

    /// Next attempt carrying the critic's fixes, continuing the last session.
    pub fn rework(&self, fixes: &[String], session: Option<&str>) -> Self {
        Self {
            attempt: self.attempt + 1,
            rework: fixes.to_vec(),
            session: session
                .map(|id| SessionMode::Resume(id.to_string()))
                .unwrap_or(SessionMode::New),
            ..self.clone()
        }
    }

    /// Next attempt with the same instructions (used after a critic failure).
    pub fn repeat(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn forked(&self, session: &str) -> Self {
        Self {
            session: SessionMode::Fork(session.to_string()),
            ..self.clone()
        }
    }

    pub fn fresh(&self) -> Self {
        Self {
            session: SessionMode::New,
            ..self.clone()
        }
    }

    /// Instruction text for the agent.
    pub fn prompt(&self) -> String {
        let mut out = format!(
            "Stage: {} (attempt {})\n\n{}",
            self.stage, self.attempt, self.requirements
        );
        if !self.prior_artifacts.is_empty() {
            out.push_str("\n\n## Inputs from earlier stages");
            for (stage, artifacts) in &self.prior_artifacts {
                for path in artifacts.iter() {
                    let _ = write!(out, "\n- [{stage}] {}", path.display());
                }
            }
        }
        if !self.rework.is_empty() {
            out.push_str("\n\n## Rework required\nApply exactly these fixes:");
            for fix in &self.rework {
                let _ = write!(out, "\n- {fix}");
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    /// The agent could not classify the source layout; needs an operator.
    LayoutUnknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub status: AgentStatus,
    #[serde(default)]
    pub artifacts: ArtifactSet,
    /// Agent session identifier, used to resume or fork later.
    pub identifier: String,
}

impl AgentOutput {
    pub fn completed(artifacts: ArtifactSet, identifier: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Completed,
            artifacts,
            identifier: identifier.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AgentRequest {
        let mut prior = BTreeMap::new();
        prior.insert(
            Stage::Research,
            ["work/research.md"].into_iter().collect::<ArtifactSet>(),
        );
        AgentRequest::initial(
            RunId::new("run-1"),
            Stage::Transcript,
            1,
            "Produce a timed transcript.",
            prior,
        )
    }

    #[test]
    fn rework_appends_fixes_verbatim_and_resumes_session() {
        let fixes = vec![
            "Replace line 4 with: \"Welcome back\"".to_string(),
            "Trim the final 2 seconds".to_string(),
        ];
        let next = request().rework(&fixes, Some("sess-9"));
        assert_eq!(next.attempt, 2);
        assert_eq!(next.rework, fixes);
        assert_eq!(next.session, SessionMode::Resume("sess-9".to_string()));

        let prompt = next.prompt();
        assert!(prompt.contains("- Replace line 4 with: \"Welcome back\""));
        assert!(prompt.contains("- Trim the final 2 seconds"));
        assert!(prompt.contains("[research] work/research.md"));
    }

    #[test]
    fn repeat_keeps_instructions() {
        let first = request().rework(&["fix".to_string()], None);
        let again = first.repeat();
        assert_eq!(again.attempt, 3);
        assert_eq!(again.rework, first.rework);
        assert_eq!(again.session, SessionMode::New);
    }

    #[test]
    fn fork_and_fresh_only_change_session() {
        let base = request();
        assert_eq!(base.forked("sess-1").session, SessionMode::Fork("sess-1".into()));
        assert_eq!(base.forked("sess-1").attempt, base.attempt);
        assert_eq!(base.forked("sess-1").fresh(), base);
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = request().rework(&["x".to_string()], Some("s"));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""session":{"mode":"resume","id":"s"}"#));
        let back: AgentRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn output_status_parses() {
        let out: AgentOutput = serde_json::from_str(
            r#"{"status":"layout_unknown","artifacts":[],"identifier":"sess-2"}"#,
        )
        .unwrap();
        assert_eq!(out.status, AgentStatus::LayoutUnknown);
    }
}
