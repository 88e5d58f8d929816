use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::state::Stage;

pub const EVENT_LOG_FILE: &str = "events.log";

/// Append-only transition log, one line per event:
/// `<timestamp> | <namespace>.<event> | <stage> | <json>`.
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    pub fn open(log_dir: &Path) -> io::Result<Self> {
        create_dir_all(log_dir)?;
        let path = log_dir.join(EVENT_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        namespace: &str,
        event: &str,
        stage: Stage,
        data: &serde_json::Value,
    ) -> io::Result<()> {
        self.record_at(Utc::now(), namespace, event, stage, data)
    }

    /// Note: `flush` only pushes to OS buffers; lines are not fsynced.
    pub fn record_at(
        &self,
        ts: DateTime<Utc>,
        namespace: &str,
        event: &str,
        stage: Stage,
        data: &serde_json::Value,
    ) -> io::Result<()> {
        let line = format_line(ts, namespace, event, stage, data);
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("event log mutex poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Records an event, downgrading write failures to a warning so that
    /// observability never blocks a transition that is already persisted.
    pub fn emit(&self, namespace: &str, event: &str, stage: Stage, data: serde_json::Value) {
        if let Err(err) = self.record(namespace, event, stage, &data) {
            log::warn!(
                "failed to append {namespace}.{event} to {}: {err}",
                self.path.display()
            );
        }
    }
}

pub fn format_line(
    ts: DateTime<Utc>,
    namespace: &str,
    event: &str,
    stage: Stage,
    data: &serde_json::Value,
) -> String {
    format!(
        "{} | {namespace}.{event} | {stage} | {data}",
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}
