//! Run-state persistence: save and load per-pipeline run state across processes.

use crate::error::StateError;
use crate::types::{PipelineRunState, RunStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STATE_FILE: &str = "run_state.json";

/// JSON file of `pipeline id -> PipelineRunState`, written atomically.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    state_dir: PathBuf,
}

impl RunStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn save(&self, states: &BTreeMap<String, PipelineRunState>) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| StateError::PersistenceError {
            message: format!("Failed to create state directory: {}", e),
        })?;

        let json = serde_json::to_string_pretty(states).map_err(|e| StateError::PersistenceError {
            message: format!("Failed to serialize run state: {}", e),
        })?;
        let path = self.path();
        let tmp = self.state_dir.join(format!("{STATE_FILE}.tmp"));
        std::fs::write(&tmp, json).map_err(|e| StateError::PersistenceError {
            message: format!("Failed to write run state: {}", e),
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| StateError::PersistenceError {
            message: format!("Failed to rename run state file: {}", e),
        })?;

        debug!(path = %path.display(), pipelines = states.len(), "Run state saved");
        Ok(())
    }

    /// Load persisted state. A missing file is an empty table.
    pub fn load(&self) -> Result<BTreeMap<String, PipelineRunState>, StateError> {
        let path = self.path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = std::fs::read_to_string(&path).map_err(|e| StateError::LoadFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let mut states: BTreeMap<String, PipelineRunState> =
            serde_json::from_str(&json).map_err(|e| StateError::LoadFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;

        // A run that was in flight when the process died did not finish.
        for state in states.values_mut() {
            if state.status == RunStatus::Running {
                warn!(pipeline_id = %state.pipeline_id, "Interrupted run restored as failed");
                state.status = RunStatus::Failed;
            }
        }
        info!(pipelines = states.len(), "Loaded run state from {:?}", path);
        Ok(states)
    }

    /// Like [`load`](Self::load), but starts fresh on a corrupt or unreadable file.
    pub fn load_or_default(&self) -> BTreeMap<String, PipelineRunState> {
        match self.load() {
            Ok(states) => states,
            Err(e) => {
                warn!("{}, starting fresh", e);
                BTreeMap::new()
            }
        }
    }
}

/// Read persisted state without building a manager, e.g. for `conduit status`.
pub fn read_run_state(state_dir: &Path) -> Result<BTreeMap<String, PipelineRunState>, StateError> {
    RunStateStore::new(state_dir).load()
}
