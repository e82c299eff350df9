use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
}

/// Tunable limits. Every field has an environment-variable override applied
/// by [`Limits::apply_env`] at startup; misconfigured values fall back to the
/// persisted/default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default = "default_agent_max_buffer")]
    pub agent_max_buffer: usize,
    #[serde(default = "default_file_instructions_every")]
    pub file_instructions_every: u32,
    #[serde(default = "default_memory_curate_every")]
    pub memory_curate_every: u32,
    #[serde(default = "default_memory_retrieval_limit")]
    pub memory_retrieval_limit: usize,
    #[serde(default = "default_memory_capture_max_chars")]
    pub memory_capture_max_chars: usize,
    /// Rotate a thread after this many turns. 0 disables the turn limit.
    #[serde(default = "default_thread_rotation_turns")]
    pub thread_rotation_turns: u32,
    /// Rotate a thread once the accumulated prompt+response size reaches this
    /// many characters. 0 disables the context limit.
    #[serde(default = "default_thread_max_context_chars")]
    pub thread_max_context_chars: u64,
    /// Daily token budget across all chats. 0 disables budget gating.
    #[serde(default)]
    pub token_budget_daily: u64,
    #[serde(default = "default_cron_budget_gate_pct")]
    pub cron_budget_gate_pct: f64,
    #[serde(default = "default_media_ttl_hours")]
    pub media_ttl_hours: u64,
    #[serde(default = "default_media_cleanup_interval_ms")]
    pub media_cleanup_interval_ms: u64,
}

fn default_agent_timeout_ms() -> u64 {
    300_000
}

fn default_agent_max_buffer() -> usize {
    10 * 1024 * 1024
}

fn default_file_instructions_every() -> u32 {
    5
}

fn default_memory_curate_every() -> u32 {
    20
}

fn default_memory_retrieval_limit() -> usize {
    6
}

fn default_memory_capture_max_chars() -> usize {
    1500
}

fn default_thread_rotation_turns() -> u32 {
    40
}

fn default_thread_max_context_chars() -> u64 {
    120_000
}

fn default_cron_budget_gate_pct() -> f64 {
    90.0
}

fn default_media_ttl_hours() -> u64 {
    24
}

fn default_media_cleanup_interval_ms() -> u64 {
    3_600_000
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            agent_timeout_ms: default_agent_timeout_ms(),
            agent_max_buffer: default_agent_max_buffer(),
            file_instructions_every: default_file_instructions_every(),
            memory_curate_every: default_memory_curate_every(),
            memory_retrieval_limit: default_memory_retrieval_limit(),
            memory_capture_max_chars: default_memory_capture_max_chars(),
            thread_rotation_turns: default_thread_rotation_turns(),
            thread_max_context_chars: default_thread_max_context_chars(),
            token_budget_daily: 0,
            cron_budget_gate_pct: default_cron_budget_gate_pct(),
            media_ttl_hours: default_media_ttl_hours(),
            media_cleanup_interval_ms: default_media_cleanup_interval_ms(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, into: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(v) => *into = v,
            Err(_) => tracing::warn!(var = name, value = %raw, "Ignoring unparseable env override"),
        }
    }
}

impl Limits {
    pub fn apply_env(&mut self) {
        env_parse("AGENT_TIMEOUT_MS", &mut self.agent_timeout_ms);
        env_parse("AGENT_MAX_BUFFER", &mut self.agent_max_buffer);
        env_parse("FILE_INSTRUCTIONS_EVERY", &mut self.file_instructions_every);
        env_parse("MEMORY_CURATE_EVERY", &mut self.memory_curate_every);
        env_parse("MEMORY_RETRIEVAL_LIMIT", &mut self.memory_retrieval_limit);
        env_parse("MEMORY_CAPTURE_MAX_CHARS", &mut self.memory_capture_max_chars);
        env_parse("THREAD_ROTATION_TURNS", &mut self.thread_rotation_turns);
        env_parse("THREAD_MAX_CONTEXT_CHARS", &mut self.thread_max_context_chars);
        env_parse("TOKEN_BUDGET_DAILY", &mut self.token_budget_daily);
        env_parse("CRON_BUDGET_GATE_PCT", &mut self.cron_budget_gate_pct);
        env_parse("MEDIA_TTL_HOURS", &mut self.media_ttl_hours);
        env_parse("MEDIA_CLEANUP_INTERVAL_MS", &mut self.media_cleanup_interval_ms);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Global default agent id.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Per-agent model overrides: agentId -> modelId.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Per-agent thinking/reasoning level: agentId -> level.
    #[serde(default)]
    pub thinking: HashMap<String, String>,
    /// Fallback chat for cron jobs without an assigned chat.
    #[serde(default)]
    pub cron_chat_id: Option<i64>,
    /// Allowed sender ids. Empty = allow all.
    #[serde(default)]
    pub allow_from: Vec<i64>,
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Shell command used to transcribe voice notes; receives the audio path
    /// in `$RELAY_AUDIO_PATH` and prints the transcript on stdout.
    #[serde(default)]
    pub transcribe_command: Option<String>,
    /// Per-agent daily token quotas: agentId -> tokens. Missing = unlimited.
    #[serde(default)]
    pub agent_quotas: HashMap<String, u64>,
    /// Dispatch ingress through the background task manager (per-thread
    /// chaining with typing heartbeats) instead of the per-topic queue.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub limits: Limits,
}

fn default_agent() -> String {
    "claude".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: default_agent(),
            models: HashMap::new(),
            thinking: HashMap::new(),
            cron_chat_id: None,
            allow_from: Vec::new(),
            telegram: TelegramConfig::default(),
            transcribe_command: None,
            agent_quotas: HashMap::new(),
            parallel: false,
            limits: Limits::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Transport token, with the `TELEGRAM_BOT_TOKEN` env var taking priority.
    pub fn telegram_token(&self) -> Option<String> {
        std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                let t = self.telegram.token.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            })
    }
}
