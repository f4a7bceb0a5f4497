use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct ImageContextEntry {
    path: PathBuf,
    timestamp: DateTime<Utc>,
}

/// Most recent image per chat, valid for a fixed TTL. Expired entries are
/// evicted when read.
pub(crate) struct ImageContextCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, ImageContextEntry>>,
}

impl ImageContextCache {
    pub(crate) fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 1000)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn update(&self, chat_id: &str, path: PathBuf, timestamp: DateTime<Utc>) {
        info!(
            "image context updated chat_id={} path={}",
            chat_id,
            path.display()
        );
        self.lock()
            .insert(chat_id.to_string(), ImageContextEntry { path, timestamp });
    }

    pub(crate) fn get(&self, chat_id: &str) -> Option<PathBuf> {
        self.get_at(chat_id, Utc::now())
    }

    pub(crate) fn get_at(&self, chat_id: &str, now: DateTime<Utc>) -> Option<PathBuf> {
        let mut entries = self.lock();
        let entry = entries.get(chat_id)?;
        if now - entry.timestamp < self.ttl {
            return Some(entry.path.clone());
        }
        debug!(
            "image context expired chat_id={} age_seconds={}",
            chat_id,
            (now - entry.timestamp).num_seconds()
        );
        entries.remove(chat_id);
        None
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    // A panic while holding the lock cannot leave an entry half-written.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ImageContextEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
