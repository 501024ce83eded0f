//! Crash-safe JSON state persistence.
//!
//! The orchestrator's entire durable memory is one JSON document. Writes go
//! through a sibling temp file that is fsync'd and atomically renamed into
//! place, so a crash mid-write never leaves a torn or truncated state file
//! on disk. Loading is deliberately forgiving: unknown keys and malformed
//! records are dropped rather than failing startup, since a corrupt-looking
//! record from a previous orchestrator version should not block recovery.

use crate::error::{Result, StateError};
use crate::OrchestratorState;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Owns the on-disk path and the in-memory snapshot of orchestrator state.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: OrchestratorState,
}

impl StateStore {
    /// Load state from `path`, creating an empty snapshot if the file does
    /// not exist yet (first boot).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => sanitize(parse_or_empty(&raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => OrchestratorState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, state })
    }

    pub fn get(&self) -> &OrchestratorState {
        &self.state
    }

    /// Apply `mutate` to the in-memory snapshot and persist the result
    /// atomically. On a write failure the in-memory snapshot is rolled back
    /// so callers never observe state that disagrees with disk.
    pub fn update<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut OrchestratorState),
    {
        let previous = self.state.clone();
        mutate(&mut self.state);
        if let Err(err) = self.persist() {
            self.state = previous;
            return Err(err);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.state).map_err(StateError::Serialize)?;
        atomic_write(&self.path, &json).map_err(|err| StateError::Persist {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    pub fn has_processed_event(&self, dedupe_key: &str) -> bool {
        self.state.event_index.contains_key(dedupe_key)
    }

    /// Record that `dedupe_key` resulted in `task_id` (or the
    /// `"failed-<wallclock>"` sentinel) and persist immediately so the
    /// sync token can safely advance past this event afterward.
    pub fn mark_event_processed(&mut self, dedupe_key: &str, task_id: &str) -> Result<()> {
        self.update(|state| {
            state
                .event_index
                .insert(dedupe_key.to_string(), task_id.to_string());
        })
    }
}

fn parse_or_empty(raw: &str) -> OrchestratorState {
    if raw.trim().is_empty() {
        return OrchestratorState::default();
    }
    match serde_json::from_str(raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(%error, "state file did not parse as JSON, starting from empty state");
            OrchestratorState::default()
        }
    }
}

/// Drop any record that fails basic consistency checks rather than letting
/// it poison every future load. Projects/tasks are validated independently,
/// so one bad record doesn't take down the whole snapshot.
fn sanitize(mut state: OrchestratorState) -> OrchestratorState {
    state.tasks.retain(|id, task| {
        let ok = !id.is_empty()
            && !task.project_key.is_empty()
            && !task.lobby_room_id.is_empty()
            && !task.lobby_event_id.is_empty()
            && !task.initial_prompt.is_empty();
        if !ok {
            tracing::warn!(task_id = %id, "dropping malformed task record from loaded state");
        }
        ok
    });
    state.projects.retain(|key, project| {
        let ok = !key.is_empty() && !project.display_name.is_empty();
        if !ok {
            tracing::warn!(project_key = %key, "dropping malformed project record from loaded state");
        }
        ok
    });
    state.event_index.retain(|key, _| key.contains(':'));
    state
}

/// Write `contents` to `path` via a sibling temp file, fsync it, rename it
/// into place, and best-effort fsync the containing directory so the
/// rename itself is durable.
fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut temp = match dir {
        Some(dir) => NamedTempFile::new_in(dir)?,
        None => NamedTempFile::new()?,
    };
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;

    if let Some(dir) = dir {
        if let Ok(dir_handle) = std::fs::File::open(dir) {
            let _ = dir_handle.sync_all();
        }
    }
    Ok(())
}
