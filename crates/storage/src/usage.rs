use chrono::Local;
use relay_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Today's local date key, e.g. `2026-08-02`.
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub input: u64,
    pub output: u64,
    pub messages: u64,
}

impl Bucket {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Apply a signed delta; phase-2 corrections can subtract from the
    /// phase-1 estimate.
    pub fn apply(&mut self, input_delta: i64, output_delta: i64) {
        if input_delta >= 0 {
            self.input += input_delta as u64;
        } else {
            self.input = self.input.saturating_sub((-input_delta) as u64);
        }
        if output_delta >= 0 {
            self.output += output_delta as u64;
        } else {
            self.output = self.output.saturating_sub((-output_delta) as u64);
        }
    }
}

/// One day's token accounting. The `date` invariant holds on access: stale
/// state is discarded rather than rolled over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageState {
    pub date: String,
    #[serde(default)]
    pub chats: HashMap<String, Bucket>,
    #[serde(default)]
    pub sources: HashMap<String, Bucket>,
    #[serde(default)]
    pub agents: HashMap<String, Bucket>,
    #[serde(default)]
    pub alerts_sent: Vec<u8>,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl UsageState {
    pub fn new(date: String) -> Self {
        Self {
            date,
            chats: HashMap::new(),
            sources: HashMap::new(),
            agents: HashMap::new(),
            alerts_sent: Vec::new(),
            total_cost_usd: 0.0,
        }
    }

    /// Total tokens across all sources.
    pub fn total_tokens(&self) -> u64 {
        self.sources.values().map(Bucket::total).sum()
    }
}

/// Persistence for the current-day usage state.
#[derive(Clone)]
pub struct UsageStore {
    path: PathBuf,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl UsageStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            path: paths.usage_file(),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Load today's state; any persisted state from another day is discarded.
    pub fn load(&self) -> UsageState {
        let today = today();
        let state = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<UsageState>(&content).ok());
        match state {
            Some(state) if state.date == today => state,
            Some(stale) => {
                debug!(stale_date = %stale.date, "Discarding stale usage state");
                UsageState::new(today)
            }
            None => UsageState::new(today),
        }
    }

    pub async fn save(&self, state: &UsageState) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = UsageStore::new(&paths);
        let state = store.load();
        assert_eq!(state.date, today());
        assert!(state.chats.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_same_day() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = UsageStore::new(&paths);

        let mut state = UsageState::new(today());
        state.chats.entry("12345".to_string()).or_default().apply(100, 20);
        state.sources.entry("chat".to_string()).or_default().apply(100, 20);
        state.alerts_sent.push(25);
        store.save(&state).await.unwrap();

        let loaded = store.load();
        assert_eq!(loaded, state);
        assert_eq!(loaded.total_tokens(), 120);
    }

    #[tokio::test]
    async fn test_stale_date_discarded() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = UsageStore::new(&paths);

        let mut stale = UsageState::new("1999-12-31".to_string());
        stale.total_cost_usd = 9.99;
        store.save(&stale).await.unwrap();

        let loaded = store.load();
        assert_eq!(loaded.date, today());
        assert_eq!(loaded.total_cost_usd, 0.0);
        assert!(loaded.alerts_sent.is_empty());
    }

    #[test]
    fn test_bucket_negative_correction_saturates() {
        let mut bucket = Bucket::default();
        bucket.apply(100, 0);
        bucket.apply(-150, 30);
        assert_eq!(bucket.input, 0);
        assert_eq!(bucket.output, 30);
    }
}
