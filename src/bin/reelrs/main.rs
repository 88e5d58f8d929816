use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use reelrs::adapters::{CommandAgent, CommandCritic, LogNotifier, Notifier, WebhookNotifier};
use reelrs::events::LifecycleEvent;
use reelrs::pipeline::EventLog;
use reelrs::{
    AppConfig, ArtifactLedger, Collaborators, FileCheckpointStore, Orchestrator, RunId, RunOutcome,
    ui,
};

mod args;
use args::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    ui::init_logging();

    let args = CliArgs::parse()?;
    let config = match &args.config {
        Some(path) => AppConfig::load_at(Path::new(path))?,
        None => AppConfig::load()?,
    };
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));

    if args.command == Command::Status {
        return status(&store, args.json_output);
    }
    if matches!(args.command, Command::Run { .. } | Command::Resume) {
        config.validate().context("invalid configuration")?;
    }

    let orchestrator = build_orchestrator(&config, store.clone(), args.quiet)?;
    if !args.quiet && !args.json_output {
        ui::header(&config.paths.checkpoints, &config.agent.program);
    }

    match args.command.clone() {
        Command::Run { source } => {
            // Interrupted work always goes first.
            for outcome in orchestrator.resume_interrupted().await? {
                report(&outcome, &args);
            }
            let mut ctx = orchestrator.start_run(&source)?;
            let outcome = orchestrator.drive(&mut ctx).await?;
            report(&outcome, &args);
        }
        Command::Resume => {
            let plans = orchestrator.recover()?;
            if !args.json_output {
                plans.iter().for_each(ui::recovery_plan);
            }
            for outcome in orchestrator.resume_interrupted().await? {
                report(&outcome, &args);
            }
        }
        Command::Resolve { run_id } => {
            let state = orchestrator.resolve_escalation(&RunId::new(run_id)).await?;
            print_state(&state, &args)?;
        }
        Command::Abort { run_id, reason } => {
            let reason = reason.unwrap_or_else(|| "aborted by operator".to_string());
            let state = orchestrator.abort(&RunId::new(run_id), &reason).await?;
            print_state(&state, &args)?;
        }
        Command::Status => status(&store, args.json_output)?,
    }
    Ok(())
}

fn build_orchestrator(
    config: &AppConfig,
    store: Arc<FileCheckpointStore>,
    quiet: bool,
) -> Result<Orchestrator> {
    let notifier: Arc<dyn Notifier> = match &config.notifier.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    let log = EventLog::open(&config.event_log_dir()).with_context(|| {
        format!(
            "failed to open event log in {}",
            config.event_log_dir().display()
        )
    })?;

    let mut orchestrator = Orchestrator::new(
        store,
        ArtifactLedger::new(&config.checkpoint_dir()),
        config.catalog()?,
        Collaborators {
            agent: Arc::new(CommandAgent::from_config(&config.agent)),
            critic: Arc::new(CommandCritic::from_config(&config.critic)),
            notifier,
        },
        config.limits(),
        Some(Arc::new(log)),
    );

    if !quiet {
        orchestrator.events.on(LifecycleEvent::StageStarted, |_, ctx| {
            if let (Some(run_id), Some(stage)) = (&ctx.run_id, ctx.stage) {
                ui::info(format!(
                    "{run_id}: {stage} (attempt {})",
                    ctx.attempt.unwrap_or(1)
                ));
            }
        });
        orchestrator
            .events
            .on(LifecycleEvent::EscalationRaised, |_, ctx| {
                ui::warn(format!(
                    "{}: escalated at {}: {}",
                    ctx.run_id.as_deref().unwrap_or("?"),
                    ctx.stage.map(|s| s.as_str()).unwrap_or("?"),
                    ctx.message.as_deref().unwrap_or("")
                ));
            });
    }
    Ok(orchestrator)
}

fn status(store: &FileCheckpointStore, json_output: bool) -> Result<()> {
    let states = store.list_all()?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }
    if states.is_empty() {
        ui::info("no runs");
    }
    states.iter().for_each(ui::run_status);
    Ok(())
}

fn report(outcome: &RunOutcome, args: &CliArgs) {
    let (label, state) = match outcome {
        RunOutcome::Completed(state) => ("completed", state),
        RunOutcome::Failed(state) => ("failed", state),
        RunOutcome::Paused(state) => ("paused", state),
    };
    if args.json_output {
        println!(
            "{}",
            serde_json::json!({"outcome": label, "state": state})
        );
        return;
    }
    match outcome {
        RunOutcome::Completed(_) => ui::info(format!("{} completed", state.run_id())),
        RunOutcome::Failed(_) => ui::error(format!("{} failed", state.run_id())),
        RunOutcome::Paused(_) => ui::warn(format!(
            "{} paused at {} awaiting operator ({}); `reelrs resolve {}` to continue",
            state.run_id(),
            state.current_stage(),
            state.escalation_state(),
            state.run_id()
        )),
    }
}

fn print_state(state: &reelrs::RunState, args: &CliArgs) -> Result<()> {
    if args.json_output {
        println!("{}", serde_json::to_string_pretty(state)?);
    } else {
        ui::run_status(state);
    }
    Ok(())
}
