//! Durable run records.
//!
//! Each run is one JSON document at `<dir>/<run_id>.json`. Writes go to a
//! temp file in the same directory and are renamed into place, so a crash
//! leaves either the previous record or the new one, never a partial file.
//! Stage artifacts live beside the records in `<dir>/artifacts/<run_id>.json`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::errors::CheckpointError;
use crate::state::{RunState, Stage};
use crate::types::{ArtifactSet, RunId};

pub const ARTIFACTS_DIR: &str = "artifacts";

pub trait CheckpointStore: Send + Sync {
    /// Atomically replaces the run's record. Idempotent.
    fn save(&self, state: &RunState) -> Result<(), CheckpointError>;

    fn load(&self, run_id: &RunId) -> Result<Option<RunState>, CheckpointError>;

    /// Non-terminal runs, oldest update first. Unreadable records are
    /// logged and skipped.
    fn list_incomplete(&self) -> Result<Vec<RunState>, CheckpointError>;
}

pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, run_id: &RunId) -> Result<PathBuf, CheckpointError> {
        record_path(&self.dir, run_id)
    }

    /// Every readable record, terminal or not.
    pub fn list_all(&self) -> Result<Vec<RunState>, CheckpointError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}/*.json",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );

        let mut states = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    log::warn!("skipping unreadable checkpoint entry: {err}");
                    continue;
                }
            };
            match read_record(&path) {
                Ok(state) => states.push(state),
                Err(err) => log::warn!("skipping checkpoint: {err}"),
            }
        }
        states.sort_by(|a, b| {
            a.updated_at()
                .cmp(&b.updated_at())
                .then_with(|| a.run_id().cmp(b.run_id()))
        });
        Ok(states)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &RunState) -> Result<(), CheckpointError> {
        let path = self.record_path(state.run_id())?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json_atomic(&path, state)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunState>, CheckpointError> {
        let path = self.record_path(run_id)?;
        match read_record(&path) {
            Ok(state) => Ok(Some(state)),
            Err(CheckpointError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn list_incomplete(&self) -> Result<Vec<RunState>, CheckpointError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|state| !state.is_terminal())
            .collect())
    }
}

fn record_path(dir: &Path, run_id: &RunId) -> Result<PathBuf, CheckpointError> {
    if !run_id.is_path_safe() {
        return Err(CheckpointError::UnsafeRunId(run_id.as_str().to_string()));
    }
    Ok(dir.join(format!("{run_id}.json")))
}

fn read_record(path: &Path) -> Result<RunState, CheckpointError> {
    let state: RunState = read_json(path)?;
    state.validate().map_err(|source| CheckpointError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(state)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `value` as pretty JSON via temp file, fsync and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;

    let bytes = serde_json::to_vec_pretty(value).map_err(CheckpointError::Encode)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(&bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    // Make the rename itself durable.
    if let Ok(handle) = fs::File::open(dir) {
        if let Err(err) = handle.sync_all() {
            log::debug!("directory fsync failed for {}: {err}", dir.display());
        }
    }
    Ok(())
}

/// Artifacts produced by each completed stage of a run, fed to later stages.
pub struct ArtifactLedger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ArtifactLedger {
    pub fn new(checkpoint_dir: &Path) -> Self {
        Self {
            dir: checkpoint_dir.join(ARTIFACTS_DIR),
            write_lock: Mutex::new(()),
        }
    }

    pub fn record(
        &self,
        run_id: &RunId,
        artifacts: &BTreeMap<Stage, ArtifactSet>,
    ) -> Result<(), CheckpointError> {
        let path = record_path(&self.dir, run_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json_atomic(&path, artifacts)
    }

    /// Empty when nothing has been recorded for the run yet.
    pub fn load(&self, run_id: &RunId) -> Result<BTreeMap<Stage, ArtifactSet>, CheckpointError> {
        let path = record_path(&self.dir, run_id)?;
        match read_json(&path) {
            Ok(artifacts) => Ok(artifacts),
            Err(CheckpointError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(BTreeMap::new())
            }
            Err(err) => Err(err),
        }
    }
}
