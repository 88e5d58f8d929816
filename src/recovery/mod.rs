//! Failure handling at two scales: the per-execution recovery chain and
//! startup recovery of runs interrupted by a crash.

pub mod chain;
pub mod crash;

pub use chain::{
    ChainOutcome, FailureReport, ForkHandler, FreshHandler, HandlerFailure, HandlerOutcome,
    RecoveryChain, RecoveryContext, RecoveryHandler, RecoveryLevel, RetryHandler,
};
pub use crash::{CrashRecoveryHandler, RecoveryPlan};
