use relay_core::{Config, Paths, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Mutable runtime settings backed by `config.json`. Slash commands change
/// the default agent and per-agent model/thinking selections at runtime;
/// persistence is asynchronous and fail-soft.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    config: Arc<Mutex<Config>>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SettingsStore {
    pub fn new(paths: &Paths, config: Config) -> Self {
        Self {
            path: paths.config_file(),
            config: Arc::new(Mutex::new(config)),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn default_agent(&self) -> String {
        self.config.lock().expect("config poisoned").agent.clone()
    }

    pub fn set_default_agent(&self, agent: &str) {
        self.config.lock().expect("config poisoned").agent = agent.to_string();
        self.persist();
    }

    pub fn model_for(&self, agent: &str) -> Option<String> {
        self.config
            .lock()
            .expect("config poisoned")
            .models
            .get(agent)
            .cloned()
    }

    pub fn set_model(&self, agent: &str, model: &str) {
        self.config
            .lock()
            .expect("config poisoned")
            .models
            .insert(agent.to_string(), model.to_string());
        self.persist();
    }

    pub fn clear_model(&self, agent: &str) {
        self.config
            .lock()
            .expect("config poisoned")
            .models
            .remove(agent);
        self.persist();
    }

    pub fn thinking_for(&self, agent: &str) -> Option<String> {
        self.config
            .lock()
            .expect("config poisoned")
            .thinking
            .get(agent)
            .cloned()
    }

    pub fn set_thinking(&self, agent: &str, level: &str) {
        self.config
            .lock()
            .expect("config poisoned")
            .thinking
            .insert(agent.to_string(), level.to_string());
        self.persist();
    }

    pub fn clear_thinking(&self, agent: &str) {
        self.config
            .lock()
            .expect("config poisoned")
            .thinking
            .remove(agent);
        self.persist();
    }

    pub fn cron_chat_id(&self) -> Option<i64> {
        self.config.lock().expect("config poisoned").cron_chat_id
    }

    pub fn snapshot(&self) -> Config {
        self.config.lock().expect("config poisoned").clone()
    }

    fn persist(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.clone();
            handle.spawn(async move {
                if let Err(e) = store.save().await {
                    warn!(error = %e, "Failed to persist config");
                }
            });
        }
    }

    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot();
        snapshot.save(&self.path)
    }
}

/// Per-topic agent overrides, persisted as `agent-overrides.json` mapping
/// `chatId:topicId -> agentId`.
#[derive(Clone)]
pub struct OverrideStore {
    path: PathBuf,
    map: Arc<Mutex<HashMap<String, String>>>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl OverrideStore {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.overrides_file();
        let map = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            map: Arc::new(Mutex::new(map)),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn get(&self, topic_key: &str) -> Option<String> {
        self.map
            .lock()
            .expect("override map poisoned")
            .get(topic_key)
            .cloned()
    }

    pub fn set(&self, topic_key: &str, agent: &str) {
        self.map
            .lock()
            .expect("override map poisoned")
            .insert(topic_key.to_string(), agent.to_string());
        self.persist();
    }

    pub fn clear(&self, topic_key: &str) -> bool {
        let removed = self
            .map
            .lock()
            .expect("override map poisoned")
            .remove(topic_key)
            .is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.clone();
            handle.spawn(async move {
                if let Err(e) = store.save().await {
                    warn!(error = %e, "Failed to persist agent overrides");
                }
            });
        }
    }

    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let content = {
            let map = self.map.lock().expect("override map poisoned");
            serde_json::to_string_pretty(&*map)?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}
