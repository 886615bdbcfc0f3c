//! Durable storage for sessions and results, keyed by session id

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::protocol::SessionId;
use crate::session::{DebugResult, DebugSession};

/// Where the coordinator persists session snapshots and results.
///
/// A result is written once per session; a second write is an error.
pub trait SessionStore: Send + Sync {
    fn save_session(&self, session: &DebugSession) -> Result<(), StoreError>;

    fn load_session(&self, id: &SessionId) -> Result<Option<DebugSession>, StoreError>;

    fn save_result(&self, result: &DebugResult) -> Result<(), StoreError>;

    fn load_result(&self, id: &SessionId) -> Result<Option<DebugResult>, StoreError>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, DebugSession>>,
    results: RwLock<HashMap<SessionId, DebugResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl SessionStore for MemoryStore {
    fn save_session(&self, session: &DebugSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .insert(session.id().clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, id: &SessionId) -> Result<Option<DebugSession>, StoreError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    fn save_result(&self, result: &DebugResult) -> Result<(), StoreError> {
        let mut results = self.results.write();
        if results.contains_key(&result.session_id) {
            return Err(StoreError::ResultExists(result.session_id.clone()));
        }
        results.insert(result.session_id.clone(), result.clone());
        Ok(())
    }

    fn load_result(&self, id: &SessionId) -> Result<Option<DebugResult>, StoreError> {
        Ok(self.results.read().get(id).cloned())
    }
}

/// One JSON file per session snapshot and per result
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Hex keeps distinct ids on distinct files whatever characters they contain
    fn file_name(id: &SessionId, suffix: &str) -> String {
        format!("{}.{}.json", hex::encode(id.as_str()), suffix)
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(Self::file_name(id, "session"))
    }

    fn result_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(Self::file_name(id, "result"))
    }

    fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file so readers never see a torn snapshot
    fn write<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn save_session(&self, session: &DebugSession) -> Result<(), StoreError> {
        let path = self.session_path(session.id());
        debug!(session_id = %session.id(), path = %path.display(), "Persisting session");
        Self::write(&path, session)
    }

    fn load_session(&self, id: &SessionId) -> Result<Option<DebugSession>, StoreError> {
        let session: Option<DebugSession> = Self::read(&self.session_path(id))?;
        Ok(session.filter(|s| s.id() == id))
    }

    fn save_result(&self, result: &DebugResult) -> Result<(), StoreError> {
        let path = self.result_path(&result.session_id);
        if path.exists() {
            return Err(StoreError::ResultExists(result.session_id.clone()));
        }
        Self::write(&path, result)
    }

    fn load_result(&self, id: &SessionId) -> Result<Option<DebugResult>, StoreError> {
        let result: Option<DebugResult> = Self::read(&self.result_path(id))?;
        Ok(result.filter(|r| &r.session_id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Codebase, ErrorReport};

    fn finished_session() -> DebugSession {
        let error = ErrorReport::builder("KeyError", "'user'").build().unwrap();
        let mut session = DebugSession::new(SessionId::new(), error, Codebase::new("svc"));
        session.set_analysis("nothing to do").unwrap();
        session.complete().unwrap();
        session
    }

    fn exercise(store: &dyn SessionStore) {
        let session = finished_session();
        let id = session.id().clone();

        assert!(store.load_session(&id).unwrap().is_none());
        store.save_session(&session).unwrap();
        assert_eq!(store.load_session(&id).unwrap(), Some(session.clone()));

        let result = DebugResult::from_session(&session).unwrap();
        store.save_result(&result).unwrap();
        assert_eq!(store.load_result(&id).unwrap(), Some(result.clone()));
        assert!(matches!(
            store.save_result(&result),
            Err(StoreError::ResultExists(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("sessions")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_json_file_store_keeps_similar_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        let error = ErrorReport::builder("KeyError", "'user'").build().unwrap();
        let underscored =
            DebugSession::new(SessionId::from("ticket_1"), error.clone(), Codebase::new("svc"));
        store.save_session(&underscored).unwrap();

        for other in ["ticket.1", "ticket/1", "../ticket_1"] {
            let id = SessionId::from(other);
            assert!(store.session_path(&id).starts_with(dir.path()));
            assert_ne!(store.session_path(&id), store.session_path(underscored.id()));
            assert!(store.load_session(&id).unwrap().is_none());
        }

        let dotted = DebugSession::new(SessionId::from("ticket.1"), error, Codebase::new("svc"));
        store.save_session(&dotted).unwrap();
        assert_eq!(store.load_session(dotted.id()).unwrap(), Some(dotted));
        assert_eq!(
            store.load_session(underscored.id()).unwrap(),
            Some(underscored)
        );
    }

    #[test]
    fn test_json_file_store_ignores_mismatched_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let session = finished_session();
        store.save_session(&session).unwrap();

        // A snapshot copied under another id's file name is not that id's session
        let other = SessionId::from("someone-else");
        std::fs::copy(store.session_path(session.id()), store.session_path(&other)).unwrap();
        assert!(store.load_session(&other).unwrap().is_none());
    }
}
