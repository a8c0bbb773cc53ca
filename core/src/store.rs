use crate::session::Session;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const SNAPSHOT_FILE: &str = "sessions.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("transcript store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcript snapshot is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    sessions: &'a [Session],
}

#[derive(Deserialize)]
struct SnapshotRaw {
    #[serde(default)]
    sessions: Value,
}

/// Copy of the whole session collection, kept in one JSON document on disk
/// or in memory.
///
/// Writes are upserts keyed by session id; the copy with the greater
/// `(updated_at, revision)` wins.
#[derive(Clone)]
pub struct TranscriptStore {
    location: Location,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
enum Location {
    Disk(PathBuf),
    Memory(Arc<Mutex<Vec<Session>>>),
}

impl TranscriptStore {
    /// Snapshot under `root`. The directory is created on first write.
    pub fn new(root: PathBuf) -> Self {
        Self {
            location: Location::Disk(root),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory(Arc::new(Mutex::new(Vec::new()))),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        match &self.location {
            Location::Disk(root) => Some(root),
            Location::Memory(_) => None,
        }
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.root().map(|root| root.join(SNAPSHOT_FILE))
    }

    /// Where an unparsable snapshot is moved before the next write.
    pub fn quarantine_path(&self) -> Option<PathBuf> {
        self.root().map(|root| root.join(format!("{SNAPSHOT_FILE}.corrupt")))
    }

    /// Loads every session. A `sessions` field that is not a list loads as
    /// empty; individual unreadable entries are skipped.
    pub fn load_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let path = match &self.location {
            Location::Memory(sessions) => return Ok(sessions.lock().clone()),
            Location::Disk(root) => root.join(SNAPSHOT_FILE),
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let raw: SnapshotRaw = serde_json::from_str(&contents)?;
        let Value::Array(entries) = raw.sessions else {
            warn!(path = %path.display(), "session snapshot has no session list; starting empty");
            return Ok(Vec::new());
        };

        let sessions = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Session>(entry) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(%err, "skipping unreadable session entry");
                    None
                }
            })
            .collect();
        Ok(sessions)
    }

    /// Returns `false` when the stored copy was newer and was kept.
    pub fn upsert(&self, session: &Session) -> Result<bool, StoreError> {
        let written = self.upsert_many(std::slice::from_ref(session))?;
        Ok(written == 1)
    }

    /// Returns how many of `incoming` replaced or added an entry.
    pub fn upsert_many(&self, incoming: &[Session]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let mut sessions = self.load_for_update()?;
        let mut written = 0;
        for session in incoming {
            match sessions.iter_mut().find(|existing| existing.id == session.id) {
                Some(existing) if session.is_newer_than(existing) => {
                    *existing = session.clone();
                    written += 1;
                }
                Some(_) => {}
                None => {
                    sessions.push(session.clone());
                    written += 1;
                }
            }
        }
        if written > 0 {
            self.write_snapshot(sessions)?;
        }
        Ok(written)
    }

    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut sessions = self.load_for_update()?;
        let before = sessions.len();
        sessions.retain(|session| session.id != id);
        let removed = sessions.len() != before;
        if removed {
            self.write_snapshot(sessions)?;
        }
        Ok(removed)
    }

    /// Like [`load_sessions`](Self::load_sessions), but an unparsable
    /// snapshot is moved to [`quarantine_path`](Self::quarantine_path) and
    /// the write starts from an empty collection.
    fn load_for_update(&self) -> Result<Vec<Session>, StoreError> {
        match self.load_sessions() {
            Err(StoreError::Serialization(err)) => {
                if let (Some(path), Some(quarantine)) = (self.snapshot_path(), self.quarantine_path()) {
                    fs::rename(&path, &quarantine)?;
                    warn!(
                        %err,
                        moved_to = %quarantine.display(),
                        "session snapshot is corrupt; set aside and starting a new one"
                    );
                }
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn write_snapshot(&self, sessions: Vec<Session>) -> Result<(), StoreError> {
        let root = match &self.location {
            Location::Memory(stored) => {
                *stored.lock() = sessions;
                return Ok(());
            }
            Location::Disk(root) => root,
        };
        fs::create_dir_all(root)?;
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            sessions: &sessions,
        };
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        let staging = root.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&staging, serialized)?;
        fs::rename(staging, root.join(SNAPSHOT_FILE))?;
        Ok(())
    }
}
