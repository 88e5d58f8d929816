use std::collections::HashMap;

use crate::state::Stage;

/// Run lifecycle events delivered to in-process listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// New run persisted at the first stage
    RunStarted,
    /// Stage loop about to begin
    StageStarted,
    /// Stage passed (cleanly or by arbitration) and the run advanced
    StageResolved,
    /// Run paused for an operator
    EscalationRaised,
    /// Run reached `completed` or `failed`
    RunFinished,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RunStarted => "RunStarted",
            LifecycleEvent::StageStarted => "StageStarted",
            LifecycleEvent::StageResolved => "StageResolved",
            LifecycleEvent::EscalationRaised => "EscalationRaised",
            LifecycleEvent::RunFinished => "RunFinished",
        }
    }
}

/// Context data that flows through events
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub run_id: Option<String>,
    pub stage: Option<Stage>,
    pub attempt: Option<u32>,
    /// Free-form detail (escalation reason, final stage, ...)
    pub message: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Handler for events - will be called when events fire
pub type EventHandler = Box<dyn Fn(LifecycleEvent, &EventContext) + Send + Sync>;

/// Manager for dispatching events
#[derive(Default)]
pub struct EventManager {
    handlers: HashMap<LifecycleEvent, Vec<EventHandler>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event
    pub fn on<F>(&mut self, event: LifecycleEvent, handler: F)
    where
        F: Fn(LifecycleEvent, &EventContext) + Send + Sync + 'static,
    {
        self.handlers
            .entry(event)
            .or_default()
            .push(Box::new(handler));
    }

    /// Fire an event and call all registered handlers
    pub fn fire(&self, event: LifecycleEvent, context: &EventContext) {
        if let Some(handlers) = self.handlers.get(&event) {
            for handler in handlers {
                handler(event, context);
            }
        }
    }

    pub fn clear(&mut self, event: LifecycleEvent) {
        self.handlers.remove(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_event_names() {
        assert_eq!(LifecycleEvent::RunStarted.name(), "RunStarted");
        assert_eq!(LifecycleEvent::EscalationRaised.name(), "EscalationRaised");
        assert_eq!(LifecycleEvent::RunFinished.name(), "RunFinished");
    }

    #[test]
    fn test_event_context_builder() {
        let ctx = EventContext::new()
            .with_run_id("run-1")
            .with_stage(Stage::Render)
            .with_attempt(2)
            .with_metadata("gate", "render_gate");

        assert_eq!(ctx.run_id.as_deref(), Some("run-1"));
        assert_eq!(ctx.stage, Some(Stage::Render));
        assert_eq!(ctx.attempt, Some(2));
        assert_eq!(ctx.metadata.get("gate"), Some(&"render_gate".to_string()));
        assert!(ctx.message.is_none());
    }

    #[test]
    fn test_event_manager_multiple_handlers() {
        let mut manager = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();

        manager.on(LifecycleEvent::StageResolved, move |event, ctx| {
            first.lock().unwrap().push((event, ctx.stage));
        });
        manager.on(LifecycleEvent::StageResolved, move |event, ctx| {
            second.lock().unwrap().push((event, ctx.stage));
        });

        let ctx = EventContext::new().with_stage(Stage::Layout);
        manager.fire(LifecycleEvent::StageResolved, &ctx);
        manager.fire(LifecycleEvent::RunStarted, &ctx);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(
            seen.iter()
                .all(|(e, s)| *e == LifecycleEvent::StageResolved && *s == Some(Stage::Layout))
        );
    }

    #[test]
    fn test_event_manager_clear() {
        let mut manager = EventManager::new();
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        manager.on(LifecycleEvent::RunFinished, move |_event, _ctx| {
            *counter_clone.lock().unwrap() += 1;
        });

        manager.clear(LifecycleEvent::RunFinished);
        manager.fire(LifecycleEvent::RunFinished, &EventContext::new());

        assert_eq!(*counter.lock().unwrap(), 0);
    }
}
