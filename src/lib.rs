pub mod adapters;
pub mod app_config;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod qa;
pub mod recovery;
pub mod state;
pub mod types;
pub mod ui;

pub use crate::app_config::AppConfig;
pub use crate::checkpoint::{ArtifactLedger, CheckpointStore, FileCheckpointStore};
pub use crate::errors::PipelineError;
pub use crate::orchestrator::{Collaborators, Orchestrator, RunContext, RunOutcome};
pub use crate::pipeline::machine::PipelineStateMachine;
pub use crate::state::{RunState, Stage};
pub use crate::types::RunId;
