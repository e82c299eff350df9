use relay_core::{Paths, Result, ThreadKey};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of a session lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedThread {
    pub thread_key: String,
    pub session_id: Option<String>,
    /// Whether this lookup was served by migrating a legacy two-field key;
    /// callers should persist when set.
    pub migrated: bool,
}

/// Mapping `chatId:topicId:agentId -> sessionId`, persisted as `threads.json`.
///
/// Legacy two-field `chatId:topicId` keys (written before sessions were
/// scoped per agent) are migrated lazily: the first resolve against a legacy
/// key moves its session under the requesting agent's thread key.
#[derive(Clone)]
pub struct ThreadStore {
    path: PathBuf,
    map: Arc<Mutex<HashMap<String, String>>>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ThreadStore {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.threads_file();
        let map = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<HashMap<String, String>>(&content)?
        } else {
            HashMap::new()
        };
        debug!(count = map.len(), "Loaded thread store");
        Ok(Self {
            path,
            map: Arc::new(Mutex::new(map)),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn resolve(&self, key: &ThreadKey) -> ResolvedThread {
        let thread_key = key.to_string();
        let mut map = self.map.lock().expect("thread map poisoned");

        if let Some(session) = map.get(&thread_key) {
            return ResolvedThread {
                thread_key,
                session_id: Some(session.clone()),
                migrated: false,
            };
        }

        // Legacy key: chatId:topicId without the agent segment.
        let legacy_key = key.topic_key();
        if let Some(session) = map.remove(&legacy_key) {
            info!(from = %legacy_key, to = %thread_key, "Migrated legacy thread key");
            map.insert(thread_key.clone(), session.clone());
            return ResolvedThread {
                thread_key,
                session_id: Some(session),
                migrated: true,
            };
        }

        ResolvedThread {
            thread_key,
            session_id: None,
            migrated: false,
        }
    }

    pub fn set(&self, thread_key: &str, session_id: &str) {
        let mut map = self.map.lock().expect("thread map poisoned");
        map.insert(thread_key.to_string(), session_id.to_string());
    }

    pub fn clear(&self, key: &ThreadKey) -> bool {
        let mut map = self.map.lock().expect("thread map poisoned");
        map.remove(&key.to_string()).is_some()
    }

    pub fn session_for(&self, thread_key: &str) -> Option<String> {
        let map = self.map.lock().expect("thread map poisoned");
        map.get(thread_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("thread map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the mapping to disk. One writer at a time per store; errors are
    /// returned so the caller can decide (persistence callers log and drop).
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let content = {
            let map = self.map.lock().expect("thread map poisoned");
            serde_json::to_string_pretty(&*map)?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Fire-and-forget persistence; failures are logged, never surfaced.
    pub fn persist(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.clone();
            handle.spawn(async move {
                if let Err(e) = store.save().await {
                    warn!(error = %e, "Failed to persist thread store");
                }
            });
        }
    }
}
