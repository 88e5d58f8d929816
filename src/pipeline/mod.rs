//! Stage state machine and the pieces that feed it.

pub mod catalog;
pub mod logging;
pub mod machine;
pub mod transitions;
pub mod types;

pub use catalog::{GateCriteria, StageCatalog, StageSpec};
pub use logging::EventLog;
pub use machine::PipelineStateMachine;
pub use transitions::{EventKind, PipelineEvent};
pub use types::{AgentOutput, AgentRequest, AgentStatus, SessionMode};
