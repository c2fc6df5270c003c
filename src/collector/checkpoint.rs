//! Durable rotation cursor for populations too large for one cycle.
//!
//! The cursor is loaded at the start of a rotating cycle and saved only after
//! the cycle completes, so a crash re-processes the same slice (at-least-once,
//! harmless because sample writes are upserts).

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CheckpointError;
use crate::store::{collections, put_record, Store};
use crate::types::{ts_secs, EntityId};

/// Position of the rotation within its population.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCursor {
    /// Index of the first entity of the next slice
    pub cursor_index: usize,
    /// Population size seen by the last slice
    pub total_population_size: usize,
    #[serde(default, with = "ts_secs::option")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Full passes over the population
    pub cycles_completed: u64,
}

impl RotationCursor {
    /// Takes the next slice of `population` and returns it with the advanced cursor.
    ///
    /// `population` must be in a stable order (sorted by id). The slice is
    /// `population[cursor .. cursor + slice_size]`, clamped at the end and never
    /// wrapped within one call. Reaching the end wraps the cursor to 0 and
    /// counts one completed cycle. A cursor left beyond a shrunken population
    /// restarts at 0 without counting a cycle.
    pub fn next_slice<'a>(
        &self,
        population: &'a [EntityId],
        slice_size: usize,
    ) -> (&'a [EntityId], RotationCursor) {
        let len = population.len();
        let mut next = RotationCursor {
            cursor_index: 0,
            total_population_size: len,
            last_run_at: self.last_run_at,
            cycles_completed: self.cycles_completed,
        };
        if len == 0 {
            return (&[], next);
        }

        let start = if self.cursor_index >= len {
            0
        } else {
            self.cursor_index
        };
        let end = (start + slice_size.max(1)).min(len);

        if end >= len {
            next.cycles_completed += 1;
        } else {
            next.cursor_index = end;
        }
        (&population[start..end], next)
    }
}

/// Durable home of a [`RotationCursor`].
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when no checkpoint was ever saved.
    fn load(&self) -> Result<Option<RotationCursor>, CheckpointError>;

    fn save(&self, cursor: &RotationCursor) -> Result<(), String>;
}

/// Loads the cursor, falling back to the zero cursor when it is missing or corrupt.
///
/// A storage read failure is returned as is: the saved cursor may be intact,
/// and resetting it would overwrite the rotation's progress on the next save.
pub fn load_or_reset(
    checkpoint: &dyn CheckpointStore,
) -> Result<RotationCursor, CheckpointError> {
    match checkpoint.load() {
        Ok(Some(cursor)) => Ok(cursor),
        Ok(None) => Ok(RotationCursor::default()),
        Err(CheckpointError::Corrupt(reason)) => {
            error!("Rotation checkpoint corrupt, restarting from 0: {}", reason);
            Ok(RotationCursor::default())
        }
        Err(e) => Err(e),
    }
}

// ================================================================================================
// FILE CHECKPOINT
// ================================================================================================

/// JSON file checkpoint, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Creates the parent directory if needed. The file itself is written on first save.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {}", e))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<RotationCursor>, CheckpointError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Unreadable(format!(
                    "Read checkpoint failed: {}",
                    e
                )))
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt(format!("Parse checkpoint failed: {}", e)))
    }

    fn save(&self, cursor: &RotationCursor) -> Result<(), String> {
        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| format!("Create temp failed: {}", e))?;

        let body = serde_json::to_vec_pretty(cursor)
            .map_err(|e| format!("Serialize checkpoint failed: {}", e))?;
        file.write_all(&body)
            .map_err(|e| format!("Write checkpoint failed: {}", e))?;
        file.sync_all().map_err(|e| format!("Sync failed: {}", e))?;
        drop(file);

        // Atomic rename
        std::fs::rename(&tmp_path, &self.path).map_err(|e| format!("Rename failed: {}", e))?;
        Ok(())
    }
}

// ================================================================================================
// STORE CHECKPOINT
// ================================================================================================

/// Checkpoint kept as a document in the `control` collection.
pub struct StoreCheckpointStore {
    store: Arc<dyn Store>,
    id: String,
}

impl StoreCheckpointStore {
    pub fn new(store: Arc<dyn Store>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }
}

impl CheckpointStore for StoreCheckpointStore {
    fn load(&self) -> Result<Option<RotationCursor>, CheckpointError> {
        let doc = self
            .store
            .get(collections::CONTROL, &self.id)
            .map_err(|e| {
                warn!("Loading checkpoint '{}' failed: {}", self.id, e);
                CheckpointError::Unreadable(e.to_string())
            })?;
        doc.map(|doc| doc.decode())
            .transpose()
            .map_err(|e| CheckpointError::Corrupt(format!("'{}': {}", self.id, e)))
    }

    fn save(&self, cursor: &RotationCursor) -> Result<(), String> {
        put_record(self.store.as_ref(), collections::CONTROL, &self.id, cursor)
            .map_err(|e| e.to_string())
    }
}
