//! Escalating recovery for failed agent executions:
//! retry → fork session → fresh session → operator.
//!
//! Each handler either recovers (the chain stops), fails retryably (the next
//! level runs) or fails fatally (the chain stops with no further attempts).
//! Every failure is kept, in order, together with the original cause.

use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::adapters::{
    AgentExecutor, Notification, NotificationKind, Notifier, execute_bounded,
};
use crate::errors::AgentExecutionError;
use crate::pipeline::logging::EventLog;
use crate::pipeline::types::{AgentOutput, AgentRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLevel {
    /// Same request again; assumes a transient fault.
    Retry,
    /// Branch from the last known-good session, keeping its context.
    Fork,
    /// Brand-new session with no inherited context.
    Fresh,
    /// Hand off to a human operator.
    Escalate,
}

impl RecoveryLevel {
    pub fn sequence() -> &'static [RecoveryLevel] {
        &[
            RecoveryLevel::Retry,
            RecoveryLevel::Fork,
            RecoveryLevel::Fresh,
            RecoveryLevel::Escalate,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryLevel::Retry => "retry",
            RecoveryLevel::Fork => "fork",
            RecoveryLevel::Fresh => "fresh",
            RecoveryLevel::Escalate => "escalate",
        }
    }
}

impl fmt::Display for RecoveryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum HandlerOutcome {
    Success(AgentOutput),
    Retryable(AgentExecutionError),
    Fatal(AgentExecutionError),
}

impl HandlerOutcome {
    pub fn from_result(result: Result<AgentOutput, AgentExecutionError>) -> Self {
        match result {
            Ok(output) => HandlerOutcome::Success(output),
            Err(err) if err.is_transient() => HandlerOutcome::Retryable(err),
            Err(err) => HandlerOutcome::Fatal(err),
        }
    }
}

/// Everything a handler needs to re-run the failed execution.
pub struct RecoveryContext<'a> {
    pub request: &'a AgentRequest,
    /// Session of the last execution that produced output.
    pub last_session: Option<&'a str>,
    pub executor: &'a dyn AgentExecutor,
    pub timeout: Duration,
}

#[async_trait::async_trait]
pub trait RecoveryHandler: Send + Sync {
    fn level(&self) -> RecoveryLevel;

    async fn handle(&self, ctx: &RecoveryContext<'_>) -> HandlerOutcome;
}

pub struct RetryHandler;

#[async_trait::async_trait]
impl RecoveryHandler for RetryHandler {
    fn level(&self) -> RecoveryLevel {
        RecoveryLevel::Retry
    }

    async fn handle(&self, ctx: &RecoveryContext<'_>) -> HandlerOutcome {
        HandlerOutcome::from_result(execute_bounded(ctx.executor, ctx.request, ctx.timeout).await)
    }
}

pub struct ForkHandler;

#[async_trait::async_trait]
impl RecoveryHandler for ForkHandler {
    fn level(&self) -> RecoveryLevel {
        RecoveryLevel::Fork
    }

    async fn handle(&self, ctx: &RecoveryContext<'_>) -> HandlerOutcome {
        let Some(session) = ctx.last_session else {
            return HandlerOutcome::Retryable(AgentExecutionError::NoSessionToFork);
        };
        let forked = ctx.request.forked(session);
        HandlerOutcome::from_result(execute_bounded(ctx.executor, &forked, ctx.timeout).await)
    }
}

pub struct FreshHandler;

#[async_trait::async_trait]
impl RecoveryHandler for FreshHandler {
    fn level(&self) -> RecoveryLevel {
        RecoveryLevel::Fresh
    }

    async fn handle(&self, ctx: &RecoveryContext<'_>) -> HandlerOutcome {
        let fresh = ctx.request.fresh();
        HandlerOutcome::from_result(execute_bounded(ctx.executor, &fresh, ctx.timeout).await)
    }
}

#[derive(Debug)]
pub struct HandlerFailure {
    pub level: RecoveryLevel,
    pub error: AgentExecutionError,
}

/// The original failure plus every handler failure, in the order they ran.
#[derive(Debug, Error)]
#[error("agent execution failed ({original}); {} recovery level(s) failed", .failures.len())]
pub struct FailureReport {
    #[source]
    pub original: AgentExecutionError,
    pub failures: Vec<HandlerFailure>,
}

impl FailureReport {
    pub fn causes(&self) -> Vec<String> {
        std::iter::once(format!("original: {}", self.original))
            .chain(
                self.failures
                    .iter()
                    .map(|f| format!("{}: {}", f.level, f.error)),
            )
            .collect()
    }
}

#[derive(Debug)]
pub enum ChainOutcome {
    Recovered {
        output: AgentOutput,
        level: RecoveryLevel,
        report: FailureReport,
    },
    /// Every handler failed retryably; an operator has been notified.
    Escalated(FailureReport),
    /// A structural failure; no further attempts are useful.
    Exhausted(FailureReport),
}

pub struct RecoveryChain {
    handlers: Vec<Box<dyn RecoveryHandler>>,
    notifier: Arc<dyn Notifier>,
    log: Option<Arc<EventLog>>,
}

impl RecoveryChain {
    /// Retry, fork, fresh; then escalate through `notifier`.
    pub fn standard(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_handlers(
            vec![
                Box::new(RetryHandler),
                Box::new(ForkHandler),
                Box::new(FreshHandler),
            ],
            notifier,
        )
    }

    pub fn with_handlers(handlers: Vec<Box<dyn RecoveryHandler>>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            handlers,
            notifier,
            log: None,
        }
    }

    pub fn with_event_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn levels(&self) -> Vec<RecoveryLevel> {
        self.handlers
            .iter()
            .map(|h| h.level())
            .chain(std::iter::once(RecoveryLevel::Escalate))
            .collect()
    }

    pub async fn recover(
        &self,
        ctx: &RecoveryContext<'_>,
        original: AgentExecutionError,
    ) -> ChainOutcome {
        let mut report = FailureReport {
            original,
            failures: Vec::new(),
        };

        if !report.original.is_transient() {
            log::error!(
                "{} attempt {} failed structurally, skipping recovery: {}",
                ctx.request.stage,
                ctx.request.attempt,
                report.original
            );
            self.record(ctx, "exhausted", &report, None);
            return ChainOutcome::Exhausted(report);
        }

        for handler in &self.handlers {
            let level = handler.level();
            log::info!(
                "recovering {} attempt {} via {level}",
                ctx.request.stage,
                ctx.request.attempt
            );
            match handler.handle(ctx).await {
                HandlerOutcome::Success(output) => {
                    if !report.failures.is_empty() {
                        log::warn!(
                            "recovered at {level} after: {}",
                            report.causes().join("; ")
                        );
                    }
                    self.record(ctx, "recovered", &report, Some(level));
                    return ChainOutcome::Recovered {
                        output,
                        level,
                        report,
                    };
                }
                HandlerOutcome::Retryable(error) => {
                    log::warn!("{level} failed: {error}");
                    report.failures.push(HandlerFailure { level, error });
                }
                HandlerOutcome::Fatal(error) => {
                    log::error!("{level} failed structurally: {error}");
                    report.failures.push(HandlerFailure { level, error });
                    self.record(ctx, "exhausted", &report, Some(level));
                    return ChainOutcome::Exhausted(report);
                }
            }
        }

        let notification = Notification {
            kind: NotificationKind::Escalation,
            run_id: ctx.request.run_id.clone(),
            stage: ctx.request.stage,
            message: format!("agent execution could not be recovered: {report}"),
        };
        if let Err(err) = self.notifier.notify(&notification).await {
            log::warn!("escalation notification failed: {err}");
        }
        self.record(ctx, "escalated", &report, Some(RecoveryLevel::Escalate));
        ChainOutcome::Escalated(report)
    }

    fn record(
        &self,
        ctx: &RecoveryContext<'_>,
        event: &str,
        report: &FailureReport,
        level: Option<RecoveryLevel>,
    ) {
        if let Some(log) = &self.log {
            log.emit(
                "recovery",
                event,
                ctx.request.stage,
                json!({
                    "run_id": ctx.request.run_id,
                    "attempt": ctx.request.attempt,
                    "level": level,
                    "causes": report.causes(),
                }),
            );
        }
    }
}
