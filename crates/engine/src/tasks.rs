use chrono::{DateTime, Utc};
use relay_core::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::queue::TopicQueue;
use crate::runner::{AgentRunner, ChatRun};
use crate::traits::Egress;

const TYPING_REFRESH: Duration = Duration::from_secs(4);
const REAP_INTERVAL: Duration = Duration::from_secs(600);
const PROMPT_HEAD_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub id: String,
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub prompt_head: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Parallel dispatch path: work is accepted immediately and fanned out, with
/// tasks bearing the same thread key chained FIFO. A typing indicator is
/// refreshed until the task settles; finished entries are kept for `/status`
/// and reaped after a TTL.
pub struct BackgroundTasks {
    entries: Mutex<HashMap<String, TaskEntry>>,
    chains: TopicQueue,
    ttl: Duration,
}

impl BackgroundTasks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            chains: TopicQueue::new(),
            ttl,
        }
    }

    /// Accept a run and return its task id immediately. `on_done` receives
    /// the runner's result once the chained execution settles.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        runner: Arc<AgentRunner>,
        egress: Arc<dyn Egress>,
        run: ChatRun,
        on_done: F,
    ) -> String
    where
        F: FnOnce(Result<String>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let entry = TaskEntry {
            id: id.clone(),
            chat_id: run.chat_id,
            topic_id: run.topic_id,
            prompt_head: run.prompt.chars().take(PROMPT_HEAD_CHARS).collect(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.entries
            .lock()
            .expect("task entries poisoned")
            .insert(id.clone(), entry);

        let chain_key = runner.thread_key_for(&run).to_string();
        let tasks = self.clone();
        let task_id = id.clone();
        self.chains.enqueue(&chain_key, async move {
            let typing = {
                let egress = egress.clone();
                let chat_id = run.chat_id;
                let topic_id = run.topic_id;
                tokio::spawn(async move {
                    loop {
                        egress.typing(chat_id, topic_id).await;
                        tokio::time::sleep(TYPING_REFRESH).await;
                    }
                })
            };

            let result = runner.run_chat(&run).await;
            typing.abort();

            {
                let mut entries = tasks.entries.lock().expect("task entries poisoned");
                if let Some(entry) = entries.get_mut(&task_id) {
                    entry.finished_at = Some(Utc::now());
                    match &result {
                        Ok(_) => entry.status = TaskStatus::Completed,
                        Err(e) => {
                            entry.status = TaskStatus::Failed;
                            entry.error = Some(e.to_string());
                        }
                    }
                }
            }
            on_done(result).await;
        });

        id
    }

    pub fn get(&self, id: &str) -> Option<TaskEntry> {
        self.entries
            .lock()
            .expect("task entries poisoned")
            .get(id)
            .cloned()
    }

    /// Mark a still-running entry as cancelled in the ledger. The underlying
    /// run is not interrupted.
    pub fn cancel(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().expect("task entries poisoned");
        match entries.get_mut(id) {
            Some(entry) if entry.status == TaskStatus::Running => {
                entry.status = TaskStatus::Cancelled;
                entry.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<TaskEntry> {
        let entries = self.entries.lock().expect("task entries poisoned");
        let mut list: Vec<TaskEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    /// (running, completed, failed) counts.
    pub fn summary(&self) -> (usize, usize, usize) {
        let entries = self.entries.lock().expect("task entries poisoned");
        let mut running = 0;
        let mut completed = 0;
        let mut failed = 0;
        for entry in entries.values() {
            match entry.status {
                TaskStatus::Running => running += 1,
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed | TaskStatus::Cancelled => failed += 1,
            }
        }
        (running, completed, failed)
    }

    /// Drop settled entries older than the TTL.
    pub fn reap(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut entries = self.entries.lock().expect("task entries poisoned");
        let before = entries.len();
        entries.retain(|_, entry| match entry.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Reaped settled background tasks");
        }
        drop(entries);
        self.chains.sweep();
    }

    pub async fn reap_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.reap(),
                _ = shutdown.recv() => break,
            }
        }
    }

    pub async fn drain(&self, timeout: Duration) -> bool {
        self.chains.drain(timeout).await
    }
}
