use colored::*;

use crate::recovery::RecoveryPlan;
use crate::state::RunState;

/// Environment variable that enables machine-readable JSON logs when set to "1" or "true".
const MACHINE_LOG_ENV: &str = "REELRS_MACHINE_LOG";

pub fn init_logging() {
    // Internal logs are opt-in via RUST_LOG. UI output remains separate.
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Warn);
    }
    let _ = builder.try_init();
}

fn machine_log_enabled() -> bool {
    matches!(
        std::env::var(MACHINE_LOG_ENV)
            .ok()
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("1") | Some("true")
    )
}

fn emit_machine_event(kind: &str, data: serde_json::Value) {
    if !machine_log_enabled() {
        return;
    }

    let event = serde_json::json!({
        "kind": kind,
        "data": data,
    });

    if let Ok(line) = serde_json::to_string(&event) {
        eprintln!("{line}");
    }
}

fn console_safe(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

pub fn info(msg: impl AsRef<str>) {
    let raw = msg.as_ref();
    println!("{}", console_safe(raw));
    emit_machine_event("info", serde_json::json!({ "message": raw }));
}

pub fn warn(msg: impl AsRef<str>) {
    let raw = msg.as_ref();
    eprintln!("{} {}", "!".yellow().bold(), console_safe(raw).yellow());
    emit_machine_event("warn", serde_json::json!({ "message": raw }));
}

pub fn error(msg: impl AsRef<str>) {
    let raw = msg.as_ref();
    eprintln!("{} {}", "✗".red().bold(), console_safe(raw).red());
    emit_machine_event("error", serde_json::json!({ "message": raw }));
}

pub fn header(checkpoint_dir: &str, agent: &str) {
    println!(
        "{} {} | {} | {}",
        ">>".bold(),
        "reelrs".bold(),
        console_safe(agent).cyan(),
        console_safe(checkpoint_dir).dimmed()
    );
    emit_machine_event(
        "header",
        serde_json::json!({
            "checkpoints": checkpoint_dir,
            "agent": agent,
        }),
    );
}

/// One line per run: id, stage, attempt, QA status and any pending escalation.
pub fn run_line(state: &RunState) -> String {
    let escalation = state.escalation_state();
    let flag = if escalation.is_pending() {
        format!(" [awaiting operator: {escalation}]")
    } else {
        String::new()
    };
    format!(
        "{}  {:<10} attempt {}  qa={}{}",
        state.run_id(),
        state.current_stage().as_str(),
        state.current_attempt(),
        state.qa_status(),
        flag
    )
}

pub fn run_status(state: &RunState) {
    let line = run_line(state);
    if state.escalation_state().is_pending() {
        println!("{} {}", "⏸".yellow().bold(), line.yellow());
    } else if state.is_terminal() {
        println!("{} {}", "■".dimmed(), line.dimmed());
    } else {
        println!("{} {}", "▶".green().bold(), line);
    }
    emit_machine_event("run_status", serde_json::json!(state));
}

pub fn recovery_plan(plan: &RecoveryPlan) {
    let marker = if plan.awaiting_resolution {
        "⏸".yellow().bold()
    } else {
        "↻".cyan().bold()
    };
    println!("{marker} {} {}", plan.run_id, console_safe(&plan.reason).dimmed());
    emit_machine_event("recovery_plan", serde_json::json!(plan));
}
