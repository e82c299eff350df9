use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    /// Standard five-field cron expression (six- and seven-field forms with
    /// a seconds column are accepted too).
    pub cron: String,
    #[serde(default = "default_tz")]
    pub tz: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct JobStore {
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

/// Per-job run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scheduled,
    Running,
    Logging,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Scheduled => write!(f, "scheduled"),
            RunState::Running => write!(f, "running"),
            RunState::Logging => write!(f, "logging"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Next fire time for a cron expression in a named timezone, strictly after
/// `after`. Five-field expressions get a seconds column prepended; an
/// unknown timezone falls back to UTC.
pub fn next_fire(expr: &str, tz_name: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = normalize_cron(expr)?;
    let schedule = cron::Schedule::from_str(&normalized).ok()?;
    let tz: chrono_tz::Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

fn normalize_cron(expr: &str) -> Option<String> {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => Some(format!("0 {}", trimmed)),
        6 | 7 => Some(trimmed.to_string()),
        _ => None,
    }
}

/// Bounded ring of live output chunks kept per job, retrievable on demand.
#[derive(Debug)]
pub struct OutputRing {
    chunks: VecDeque<String>,
    bytes: usize,
    cap: usize,
}

impl OutputRing {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk.to_string());
        while self.bytes > self.cap && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    pub fn contents(&self) -> String {
        self.chunks
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
