pub mod critique;
pub mod reflection;

pub use critique::{Blocker, Decision, QaCritique, Severity};
pub use reflection::{
    Limits, ReflectionError, ReflectionLoop, ReflectionOutcome, ReflectionResult, ScoredAttempt,
    select_best,
};
