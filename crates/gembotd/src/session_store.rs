use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use gembot_core::types::Turn;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub(crate) enum StorageError {
    #[error("history io failed: {0}")]
    Io(#[from] io::Error),
    #[error("history json failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("history record malformed: {0}")]
    Malformed(String),
}

/// Durable record of every session, keyed by contact id. Saved wholesale.
pub(crate) trait HistoryStorage: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Map<String, Value>>, StorageError>;
    fn save(&self, record: &Map<String, Value>) -> Result<(), StorageError>;
}

pub(crate) struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl HistoryStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<Map<String, Value>>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(Some(map)),
            other => Err(StorageError::Malformed(format!(
                "expected object at top level, got {}",
                json_kind(&other)
            ))),
        }
    }

    // Write to a sibling temp file then rename, so a crash mid-write keeps the old record.
    fn save(&self, record: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Per-contact conversation history held in memory and mirrored to storage.
pub(crate) struct SessionStore {
    storage: Arc<dyn HistoryStorage>,
    sessions: Mutex<HashMap<String, Vec<Turn>>>,
    // Serializes snapshot + read-merge-write so a stale snapshot never lands last.
    persist_lock: tokio::sync::Mutex<()>,
}

impl SessionStore {
    pub(crate) fn new(storage: Arc<dyn HistoryStorage>) -> Self {
        Self {
            storage,
            sessions: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get_or_load(&self, contact: &str) -> Vec<Turn> {
        self.ensure_loaded(contact);
        self.lock().get(contact).cloned().unwrap_or_default()
    }

    pub(crate) fn append(&self, contact: &str, turns: Vec<Turn>) {
        self.ensure_loaded(contact);
        self.lock()
            .entry(contact.to_string())
            .or_default()
            .extend(turns);
    }

    /// Keeps the last `2 * max_turns` turns; `max_turns == 0` disables trimming.
    pub(crate) fn trim(&self, contact: &str, max_turns: usize) {
        if max_turns == 0 {
            return;
        }
        let keep = max_turns.saturating_mul(2);
        let mut sessions = self.lock();
        if let Some(turns) = sessions.get_mut(contact) {
            if turns.len() > keep {
                let dropped = turns.len() - keep;
                turns.drain(..dropped);
                info!("session trimmed contact={} dropped={} kept={}", contact, dropped, keep);
            }
        }
    }

    /// Empties a known session. Returns false when the contact was never seen.
    pub(crate) fn clear(&self, contact: &str) -> bool {
        let in_memory = self.lock().contains_key(contact);
        let known = in_memory || self.stored_record().is_some_and(|r| r.contains_key(contact));
        if known {
            self.lock().insert(contact.to_string(), Vec::new());
            info!("session cleared contact={}", contact);
        }
        known
    }

    pub(crate) async fn persist_all(&self) -> Result<(), StorageError> {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = self.lock().clone();
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || write_snapshot(storage.as_ref(), &snapshot))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))?
    }

    pub(crate) fn known_sessions(&self) -> usize {
        self.lock().len()
    }

    fn ensure_loaded(&self, contact: &str) {
        if self.lock().contains_key(contact) {
            return;
        }
        let loaded = self.load_contact(contact);
        self.lock().entry(contact.to_string()).or_insert(loaded);
    }

    fn load_contact(&self, contact: &str) -> Vec<Turn> {
        let Some(record) = self.stored_record() else {
            return Vec::new();
        };
        let Some(raw) = record.get(contact) else {
            return Vec::new();
        };
        match serde_json::from_value::<Vec<Turn>>(raw.clone()) {
            Ok(turns) => {
                info!("session loaded contact={} turns={}", contact, turns.len());
                turns
            }
            Err(err) => {
                warn!(
                    "session record unreadable, starting empty: contact={} err={}",
                    contact, err
                );
                Vec::new()
            }
        }
    }

    fn stored_record(&self) -> Option<Map<String, Value>> {
        match self.storage.load() {
            Ok(record) => record,
            Err(err) => {
                warn!("load history record failed, treating as empty: err={}", err);
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Turn>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Contacts not touched by this process are carried over from the previous record.
fn write_snapshot(
    storage: &dyn HistoryStorage,
    snapshot: &HashMap<String, Vec<Turn>>,
) -> Result<(), StorageError> {
    let mut record = match storage.load() {
        Ok(Some(existing)) => existing,
        Ok(None) => Map::new(),
        Err(err) => {
            warn!("previous history record unreadable, overwriting: err={}", err);
            Map::new()
        }
    };
    for (contact, turns) in snapshot {
        record.insert(contact.clone(), serde_json::to_value(turns)?);
    }
    storage.save(&record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> (SessionStore, PathBuf) {
        let path = dir.path().join("history").join("sessions.json");
        let store = SessionStore::new(Arc::new(JsonFileStorage::new(path.clone())));
        (store, path)
    }

    fn exchange(i: usize) -> Vec<Turn> {
        vec![Turn::user(format!("q{i}")), Turn::model(format!("a{i}"))]
    }

    #[test]
    fn trim_keeps_most_recent_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = file_store(&dir);
        for max_turns in 1..4 {
            let contact = format!("c{max_turns}");
            for i in 0..7 {
                store.append(&contact, exchange(i));
                store.trim(&contact, max_turns);
                let turns = store.get_or_load(&contact);
                assert!(turns.len() <= 2 * max_turns);
                assert_eq!(turns.len() % 2, 0);
                assert_eq!(turns.last(), Some(&Turn::model(format!("a{i}"))));
            }
        }
    }

    #[test]
    fn zero_bound_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = file_store(&dir);
        for i in 0..30 {
            store.append("A", exchange(i));
            store.trim("A", 0);
        }
        assert_eq!(store.get_or_load("A").len(), 60);
    }

    #[tokio::test]
    async fn persisted_sessions_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        store.append("A", exchange(1));
        store.append("群聊/B", exchange(2));
        store.persist_all().await.unwrap();

        let reopened = SessionStore::new(Arc::new(JsonFileStorage::new(path)));
        assert_eq!(reopened.get_or_load("A"), exchange(1));
        assert_eq!(reopened.get_or_load("群聊/B"), exchange(2));
        assert!(reopened.get_or_load("nobody").is_empty());
    }

    #[tokio::test]
    async fn persist_keeps_contacts_not_loaded_this_run() {
        let dir = tempfile::tempdir().unwrap();
        let (first, path) = file_store(&dir);
        first.append("A", exchange(1));
        first.persist_all().await.unwrap();

        let second = SessionStore::new(Arc::new(JsonFileStorage::new(path.clone())));
        second.append("B", exchange(2));
        second.persist_all().await.unwrap();

        let third = SessionStore::new(Arc::new(JsonFileStorage::new(path)));
        assert_eq!(third.get_or_load("A"), exchange(1));
        assert_eq!(third.get_or_load("B"), exchange(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_persists_keep_every_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        let store = Arc::new(store);
        let rounds = 10;
        for round in 0..rounds {
            let mut handles = Vec::new();
            for c in 0..16 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    let contact = format!("c{c}");
                    store.append(&contact, exchange(round));
                    store.persist_all().await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        }

        let reopened = SessionStore::new(Arc::new(JsonFileStorage::new(path.clone())));
        for c in 0..16 {
            let turns = reopened.get_or_load(&format!("c{c}"));
            assert_eq!(turns.len(), 2 * rounds, "contact c{c}");
            assert_eq!(turns.last(), Some(&Turn::model(format!("a{}", rounds - 1))));
        }
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_record_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(store.get_or_load("A").is_empty());
    }

    #[test]
    fn mistyped_contact_entry_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"A": "oops", "B": [{"role": "user", "parts": [{"text": "hi"}]}]}"#,
        )
        .unwrap();
        assert!(store.get_or_load("A").is_empty());
        assert_eq!(store.get_or_load("B"), vec![Turn::user("hi")]);
    }

    #[tokio::test]
    async fn clear_reports_whether_session_existed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        assert!(!store.clear("stranger"));
        assert_eq!(store.known_sessions(), 0);

        store.append("A", exchange(1));
        store.persist_all().await.unwrap();
        assert!(store.clear("A"));
        assert!(store.get_or_load("A").is_empty());

        // Known only from the durable record.
        let reopened = SessionStore::new(Arc::new(JsonFileStorage::new(path)));
        assert!(reopened.clear("A"));
    }
}
