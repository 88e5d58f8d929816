use anyhow::{Result, anyhow};
use std::env;

pub const USAGE: &str = "\
usage: reelrs [-c|--config <path>] [-q|--quiet] [--json] <command>

commands:
  run <source>              start a new run (interrupted runs resume first)
  resume                    resume interrupted runs that are not awaiting an operator
  resolve <run_id>          clear a pending escalation
  abort <run_id> [reason]   stop a run for good
  status                    list runs and their stage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run { source: String },
    Resume,
    Resolve { run_id: String },
    Abort { run_id: String, reason: Option<String> },
    Status,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub config: Option<String>, // -c/--config
    pub quiet: bool,            // -q/--quiet
    pub json_output: bool,      // --json
}

impl CliArgs {
    /// Parse command-line arguments
    pub fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().collect();
        Self::parse_from(&args[1..])
    }

    /// Parse from a slice of arguments (for testing)
    pub fn parse_from(args: &[String]) -> Result<Self> {
        let mut config = None;
        let mut quiet = false;
        let mut json_output = false;
        let mut positional: Vec<String> = Vec::new();

        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];

            match arg.as_str() {
                "-c" | "--config" => {
                    i += 1;
                    if i >= args.len() {
                        return Err(anyhow!("{arg} requires a value"));
                    }
                    config = Some(args[i].clone());
                }
                "-q" | "--quiet" => {
                    quiet = true;
                }
                "--json" => {
                    json_output = true;
                }
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(anyhow!("Unknown argument: {flag}"));
                }
                value => positional.push(value.to_string()),
            }

            i += 1;
        }

        Ok(CliArgs {
            command: Self::command(&positional)?,
            config,
            quiet,
            json_output,
        })
    }

    fn command(positional: &[String]) -> Result<Command> {
        let Some((name, rest)) = positional.split_first() else {
            return Err(anyhow!("missing command\n\n{USAGE}"));
        };
        let command = match (name.as_str(), rest) {
            ("run", [source]) => Command::Run {
                source: source.clone(),
            },
            ("resume", []) => Command::Resume,
            ("status", []) => Command::Status,
            ("resolve", [run_id]) => Command::Resolve {
                run_id: run_id.clone(),
            },
            ("abort", [run_id, reason @ ..]) => Command::Abort {
                run_id: run_id.clone(),
                reason: (!reason.is_empty()).then(|| reason.join(" ")),
            },
            ("run" | "resume" | "status" | "resolve" | "abort", _) => {
                return Err(anyhow!("wrong number of arguments for `{name}`\n\n{USAGE}"));
            }
            (other, _) => return Err(anyhow!("Unknown command: {other}\n\n{USAGE}")),
        };
        Ok(command)
    }
}
