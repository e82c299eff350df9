use relay_agents::{pty_wrap, AdapterRegistry, AgentAdapter, CommandSpec};
use relay_core::{topic_key, Error, Limits, Result, ThreadKey};
use relay_storage::{EventKind, ThreadStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::exec;
use crate::memory_service::MemoryService;
use crate::settings::{OverrideStore, SettingsStore};
use crate::tracker::{TokenEvent, TokenTracker};

const RETRIEVAL_MIN_CHARS: usize = 15;
const RETRIEVAL_CACHE_TTL: Duration = Duration::from_secs(60);
const RETRIEVAL_CACHE_SWEEP_AT: usize = 100;
const PROMPT_KEY_HEAD: usize = 200;
const SESSION_LIST_TIMEOUT_MS: u64 = 30_000;

const PROMPT_ENV: &str = "RELAY_PROMPT";
const SESSION_ENV: &str = "RELAY_SESSION_ID";

/// Instructions describing how replies and produced files must be formatted.
/// Emitted on new and rotated threads, then refreshed periodically.
const FILE_STYLE_INSTRUCTIONS: &str = "Reply as a chat message: short paragraphs, plain text over \
markdown tables, under 3500 characters. When you produce an image or file for the user, write its \
absolute path on its own line as [attachment:/full/path] and it will be delivered as media.";

const STALE_SESSION_PHRASES: [&str; 6] = [
    "no conversation found with session id",
    "session not found",
    "session expired",
    "no session found",
    "conversation not found",
    "invalid session id",
];

pub(crate) fn is_stale_session_text(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    STALE_SESSION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Retrieval only kicks in for prompts with enough substance to rank on.
pub(crate) fn retrieval_eligible(prompt: &str) -> bool {
    prompt.chars().filter(|c| !c.is_whitespace()).count() >= RETRIEVAL_MIN_CHARS
}

fn estimate_tokens(chars: u64) -> u64 {
    chars / 4
}

fn rotation_reason(limits: &Limits, turn: u32, ctx_present: bool, ctx: u64) -> Option<&'static str> {
    if limits.thread_rotation_turns > 0 && turn >= limits.thread_rotation_turns {
        return Some("turn limit reached");
    }
    if limits.thread_max_context_chars > 0 {
        if !ctx_present {
            // A session id survived a restart but the size estimate did not;
            // resuming blind risks overflowing the model.
            return Some("context size unknown after restart");
        }
        if ctx >= limits.thread_max_context_chars {
            return Some("context limit reached");
        }
    }
    None
}

/// One full chat invocation through the pipeline.
#[derive(Debug, Clone)]
pub struct ChatRun {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub prompt: String,
    /// Explicit agent override; falls back to the per-topic override, then
    /// the global default.
    pub agent: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub attachments: Vec<PathBuf>,
    pub kind: EventKind,
    pub source: String,
}

impl ChatRun {
    pub fn text(chat_id: i64, topic_id: Option<i64>, prompt: &str) -> Self {
        Self {
            chat_id,
            topic_id,
            prompt: prompt.to_string(),
            agent: None,
            model: None,
            cwd: None,
            attachments: Vec::new(),
            kind: EventKind::Text,
            source: "chat".to_string(),
        }
    }
}

/// Point-in-time view of one thread, for `/status`.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub agent_id: String,
    pub thread_key: String,
    pub session_id: Option<String>,
    pub turns: u32,
    pub context_chars: u64,
}

struct CacheEntry {
    fragment: String,
    at: Instant,
}

/// The invocation pipeline: prompt assembly, subprocess execution, output
/// parsing, session lifecycle, stale-session recovery, and token accounting.
pub struct AgentRunner {
    limits: Limits,
    registry: AdapterRegistry,
    threads: ThreadStore,
    settings: SettingsStore,
    overrides: OverrideStore,
    tracker: Arc<TokenTracker>,
    memory: Arc<MemoryService>,
    turns: Mutex<HashMap<String, u32>>,
    ctx_chars: Mutex<HashMap<String, u64>>,
    retrieval_cache: Mutex<HashMap<(i64, String, String), CacheEntry>>,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limits: Limits,
        registry: AdapterRegistry,
        threads: ThreadStore,
        settings: SettingsStore,
        overrides: OverrideStore,
        tracker: Arc<TokenTracker>,
        memory: Arc<MemoryService>,
    ) -> Self {
        Self {
            limits,
            registry,
            threads,
            settings,
            overrides,
            tracker,
            memory,
            turns: Mutex::new(HashMap::new()),
            ctx_chars: Mutex::new(HashMap::new()),
            retrieval_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    /// Substitute a registered adapter for an agent id the registry does not
    /// know: first the configured default, then any registered adapter. Ids
    /// can go stale in `config.json` and `agent-overrides.json`; a stale id
    /// must not take the whole dispatch down.
    fn validate_agent_id(&self, candidate: String) -> String {
        if self.registry.contains(&candidate) {
            return candidate;
        }
        let default = self.settings.default_agent();
        if self.registry.contains(&default) {
            warn!(agent = %candidate, fallback = %default, "Unknown agent id; using the default agent");
            return default;
        }
        match self.registry.ids().first() {
            Some(first) => {
                warn!(agent = %candidate, default = %default, fallback = %first, "Unknown agent and unknown default; using the first registered adapter");
                (*first).to_string()
            }
            // Empty registry: surfaced as a config error by the caller.
            None => candidate,
        }
    }

    fn effective_agent_id(&self, chat_id: i64, topic_id: Option<i64>, explicit: Option<&str>) -> String {
        let candidate = explicit
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .or_else(|| self.overrides.get(&topic_key(chat_id, topic_id)))
            .unwrap_or_else(|| self.settings.default_agent());
        self.validate_agent_id(candidate)
    }

    pub fn effective_agent(&self, run: &ChatRun) -> String {
        self.effective_agent_id(run.chat_id, run.topic_id, run.agent.as_deref())
    }

    pub fn thread_key_for(&self, run: &ChatRun) -> ThreadKey {
        ThreadKey::new(run.chat_id, run.topic_id, &self.effective_agent(run))
    }

    /// The full chat pipeline.
    pub async fn run_chat(&self, run: &ChatRun) -> Result<String> {
        let agent_id = self.effective_agent(run);
        let adapter = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| Error::Config(format!("unknown agent '{}'", agent_id)))?;
        if self.tracker.agent_quota_exceeded(&agent_id) {
            return Err(Error::Budget(format!("daily quota for agent '{}' reached", agent_id)));
        }

        let key = ThreadKey::new(run.chat_id, run.topic_id, &agent_id);
        let resolved = self.threads.resolve(&key);
        if resolved.migrated {
            self.threads.persist();
        }
        let tk = resolved.thread_key;
        let mut session_id = resolved.session_id;

        let mut turn = {
            let mut turns = self.turns.lock().expect("turns map poisoned");
            let entry = turns.entry(tk.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let (ctx_present, ctx_value) = {
            let ctx = self.ctx_chars.lock().expect("ctx map poisoned");
            match ctx.get(&tk) {
                Some(v) => (true, *v),
                None => (false, 0),
            }
        };

        let mut rotated = false;
        if session_id.is_some() {
            if let Some(reason) = rotation_reason(&self.limits, turn, ctx_present, ctx_value) {
                info!(thread = %tk, turn, context_chars = ctx_value, reason, "Rotating thread");
                self.clear_thread_state(&key, &tk, 1);
                session_id = None;
                rotated = true;
                turn = 1;
            }
        }
        let is_new = session_id.is_none() && !rotated;

        let model = run.model.clone().or_else(|| self.settings.model_for(&agent_id));
        let thinking = self.settings.thinking_for(&agent_id);

        let mut final_prompt = self.assemble_prompt(run, &tk, &key.topic_id, &agent_id, is_new, rotated, turn);
        let ctx_for_estimate = if rotated { 0 } else { ctx_value };
        let estimate =
            estimate_tokens(final_prompt.chars().count() as u64 + ctx_for_estimate) as i64;
        self.tracker.track(TokenEvent {
            chat_id: run.chat_id,
            input_tokens: estimate,
            output_tokens: 0,
            source: run.source.clone(),
            agent_id: agent_id.clone(),
            cost_usd: None,
        });

        let (command, envs) = build_command(
            adapter.as_ref(),
            &final_prompt,
            session_id.as_deref(),
            model.as_deref(),
            thinking.as_deref(),
        );
        debug!(thread = %tk, agent = %agent_id, new = is_new, rotated, "Invoking agent");
        let mut raw = self.exec_tolerant(&command, &envs, run.cwd.as_deref()).await?;
        let mut parsed = adapter.parse_output(&raw);

        // One-shot recovery when the agent rejects a session it no longer
        // knows. The retry runs as a fresh thread with a compact bootstrap.
        if !parsed.saw_json && session_id.is_some() && is_stale_session_text(&raw) {
            warn!(thread = %tk, "Stale session reported by agent; retrying on a fresh thread");
            self.clear_thread_state(&key, &tk, 1);
            session_id = None;
            final_prompt = self.assemble_prompt(run, &tk, &key.topic_id, &agent_id, false, true, 1);
            let (command, envs) =
                build_command(adapter.as_ref(), &final_prompt, None, model.as_deref(), thinking.as_deref());
            raw = self.exec_tolerant(&command, &envs, run.cwd.as_deref()).await?;
            parsed = adapter.parse_output(&raw);
        }

        // Session-id fallback through the adapter's listing capability.
        if parsed.session_id.is_none() {
            if let Some(list_cmd) = adapter.list_sessions_command() {
                match exec::run(&list_cmd, &[], None, SESSION_LIST_TIMEOUT_MS, self.limits.agent_max_buffer).await {
                    Ok(out) => parsed.session_id = adapter.parse_session_list(&out.stdout),
                    Err(e) => warn!(error = %e, "Session listing fallback failed"),
                }
            }
        }
        if let Some(new_session) = &parsed.session_id {
            if session_id.as_deref() != Some(new_session.as_str()) {
                self.threads.set(&tk, new_session);
                self.threads.persist();
            }
        }

        let text = if parsed.text.is_empty() {
            raw.trim().to_string()
        } else {
            parsed.text.clone()
        };
        if text.is_empty() {
            return Err(Error::Parse("agent produced no text".to_string()));
        }

        // Phase-2 accounting: real usage corrects the estimate; otherwise the
        // response is estimated the same way the input was.
        match parsed.usage {
            Some(usage) => self.tracker.track(TokenEvent {
                chat_id: run.chat_id,
                input_tokens: usage.input_tokens as i64 - estimate,
                output_tokens: usage.output_tokens as i64,
                source: run.source.clone(),
                agent_id: agent_id.clone(),
                cost_usd: parsed.cost_usd,
            }),
            None => self.tracker.track(TokenEvent {
                chat_id: run.chat_id,
                input_tokens: 0,
                output_tokens: estimate_tokens(text.chars().count() as u64) as i64,
                source: run.source.clone(),
                agent_id: agent_id.clone(),
                cost_usd: parsed.cost_usd,
            }),
        }

        {
            let mut ctx = self.ctx_chars.lock().expect("ctx map poisoned");
            let entry = ctx.entry(tk).or_insert(0);
            *entry += final_prompt.chars().count() as u64 + text.chars().count() as u64;
        }

        Ok(text)
    }

    /// One-shot invocation: no session continuity, no bootstrap, no memory.
    pub async fn run_once(
        &self,
        agent: Option<&str>,
        prompt: &str,
        model: Option<&str>,
        cwd: Option<&Path>,
        source: &str,
    ) -> Result<String> {
        let requested = agent
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_agent());
        let agent_id = self.validate_agent_id(requested);
        let adapter = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| Error::Config(format!("unknown agent '{}'", agent_id)))?;
        if self.tracker.agent_quota_exceeded(&agent_id) {
            return Err(Error::Budget(format!("daily quota for agent '{}' reached", agent_id)));
        }

        let model = model
            .map(str::to_string)
            .or_else(|| self.settings.model_for(&agent_id));
        let thinking = self.settings.thinking_for(&agent_id);
        let estimate = estimate_tokens(prompt.chars().count() as u64) as i64;
        self.tracker.track(TokenEvent {
            chat_id: 0,
            input_tokens: estimate,
            output_tokens: 0,
            source: source.to_string(),
            agent_id: agent_id.clone(),
            cost_usd: None,
        });

        let (command, envs) =
            build_command(adapter.as_ref(), prompt, None, model.as_deref(), thinking.as_deref());
        let raw = self.exec_tolerant(&command, &envs, cwd).await?;
        let parsed = adapter.parse_output(&raw);
        let text = if parsed.text.is_empty() {
            raw.trim().to_string()
        } else {
            parsed.text
        };
        if text.is_empty() {
            return Err(Error::Parse("agent produced no text".to_string()));
        }

        match parsed.usage {
            Some(usage) => self.tracker.track(TokenEvent {
                chat_id: 0,
                input_tokens: usage.input_tokens as i64 - estimate,
                output_tokens: usage.output_tokens as i64,
                source: source.to_string(),
                agent_id,
                cost_usd: parsed.cost_usd,
            }),
            None => self.tracker.track(TokenEvent {
                chat_id: 0,
                input_tokens: 0,
                output_tokens: estimate_tokens(text.chars().count() as u64) as i64,
                source: source.to_string(),
                agent_id,
                cost_usd: parsed.cost_usd,
            }),
        }
        Ok(text)
    }

    /// User-issued `/reset`: clear the session and counters. Does not
    /// interrupt an in-flight run.
    pub fn reset_thread(&self, chat_id: i64, topic_id: Option<i64>) -> String {
        let agent_id = self.effective_agent_id(chat_id, topic_id, None);
        let key = ThreadKey::new(chat_id, topic_id, &agent_id);
        self.clear_thread_state(&key, &key.to_string(), 0);
        agent_id
    }

    pub fn thread_snapshot(&self, chat_id: i64, topic_id: Option<i64>) -> ThreadSnapshot {
        let agent_id = self.effective_agent_id(chat_id, topic_id, None);
        let key = ThreadKey::new(chat_id, topic_id, &agent_id);
        let tk = key.to_string();
        ThreadSnapshot {
            agent_id,
            session_id: self.threads.session_for(&tk),
            turns: *self
                .turns
                .lock()
                .expect("turns map poisoned")
                .get(&tk)
                .unwrap_or(&0),
            context_chars: *self
                .ctx_chars
                .lock()
                .expect("ctx map poisoned")
                .get(&tk)
                .unwrap_or(&0),
            thread_key: tk,
        }
    }

    /// Available models for an agent, when its adapter can list them.
    pub async fn list_models(&self, agent_id: &str) -> Result<Vec<String>> {
        let agent_id = self.validate_agent_id(agent_id.to_string());
        let adapter = self
            .registry
            .get(&agent_id)
            .ok_or_else(|| Error::Config(format!("unknown agent '{}'", agent_id)))?;
        let command = adapter
            .list_models_command()
            .ok_or_else(|| Error::NotFound(format!("agent '{}' cannot list models", agent_id)))?;
        let out = exec::run(&command, &[], None, SESSION_LIST_TIMEOUT_MS, self.limits.agent_max_buffer).await?;
        Ok(adapter.parse_model_list(&out.stdout))
    }

    fn clear_thread_state(&self, key: &ThreadKey, tk: &str, turns: u32) {
        if self.threads.clear(key) {
            self.threads.persist();
        }
        self.turns
            .lock()
            .expect("turns map poisoned")
            .insert(tk.to_string(), turns);
        self.ctx_chars
            .lock()
            .expect("ctx map poisoned")
            .insert(tk.to_string(), 0);
    }

    async fn exec_tolerant(
        &self,
        command: &str,
        envs: &[(String, String)],
        cwd: Option<&Path>,
    ) -> Result<String> {
        let out = exec::run(
            command,
            envs,
            cwd,
            self.limits.agent_timeout_ms,
            self.limits.agent_max_buffer,
        )
        .await?;
        if out.exit_code != Some(0) {
            if out.stdout.trim().is_empty() {
                return Err(Error::NonZeroExit(format!(
                    "exit code {:?} with empty stdout",
                    out.exit_code
                )));
            }
            warn!(exit_code = ?out.exit_code, "Agent exited non-zero; parsing partial stdout");
        }
        Ok(out.stdout)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_prompt(
        &self,
        run: &ChatRun,
        thread_key: &str,
        topic_id: &str,
        agent_id: &str,
        is_new: bool,
        rotated: bool,
        turn: u32,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        if is_new {
            sections.push(self.memory.bootstrap_context(thread_key, false));
        } else if rotated {
            sections.push(self.memory.bootstrap_context(thread_key, true));
        }

        let every = self.limits.file_instructions_every;
        if is_new || rotated || (every > 0 && turn % every == 0) {
            sections.push(FILE_STYLE_INSTRUCTIONS.to_string());
        }

        let prompt = if run.kind == EventKind::Cron {
            format!(
                "[{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M UTC"),
                run.prompt
            )
        } else {
            run.prompt.clone()
        };
        sections.push(prompt);

        if let Some(fragment) = self.retrieval_fragment(run, topic_id, agent_id) {
            sections.push(fragment);
        }
        for path in &run.attachments {
            sections.push(format!("[attachment:{}]", path.display()));
        }

        sections.retain(|s| !s.trim().is_empty());
        sections.join("\n\n")
    }

    fn retrieval_fragment(&self, run: &ChatRun, topic_id: &str, agent_id: &str) -> Option<String> {
        if !retrieval_eligible(&run.prompt) {
            return None;
        }
        let head: String = run.prompt.chars().take(PROMPT_KEY_HEAD).collect();
        let cache_key = (run.chat_id, topic_id.to_string(), head);

        {
            let cache = self.retrieval_cache.lock().expect("retrieval cache poisoned");
            if let Some(entry) = cache.get(&cache_key) {
                if entry.at.elapsed() < RETRIEVAL_CACHE_TTL {
                    return Some(entry.fragment.clone()).filter(|f| !f.is_empty());
                }
            }
        }

        let fragment = self
            .memory
            .retrieve(&run.prompt, run.chat_id, topic_id, agent_id)
            .unwrap_or_default();

        let mut cache = self.retrieval_cache.lock().expect("retrieval cache poisoned");
        if cache.len() > RETRIEVAL_CACHE_SWEEP_AT {
            cache.retain(|_, entry| entry.at.elapsed() < RETRIEVAL_CACHE_TTL);
        }
        // An empty fragment is cached too, as a sentinel that suppresses
        // re-querying for the TTL.
        cache.insert(
            cache_key,
            CacheEntry {
                fragment: fragment.clone(),
                at: Instant::now(),
            },
        );
        Some(fragment).filter(|f| !f.is_empty())
    }
}

fn build_command(
    adapter: &dyn AgentAdapter,
    prompt: &str,
    session_id: Option<&str>,
    model: Option<&str>,
    thinking: Option<&str>,
) -> (String, Vec<(String, String)>) {
    let mut envs = vec![(PROMPT_ENV.to_string(), prompt.to_string())];
    let mut spec = CommandSpec {
        prompt: prompt.to_string(),
        prompt_expr: Some(format!("\"${}\"", PROMPT_ENV)),
        session_id: None,
        session_expr: None,
        model: model.map(str::to_string),
        thinking: thinking.map(str::to_string),
    };
    if let Some(session) = session_id {
        envs.push((SESSION_ENV.to_string(), session.to_string()));
        spec.session_id = Some(session.to_string());
        spec.session_expr = Some(format!("\"${}\"", SESSION_ENV));
    }

    let mut command = adapter.build_command(&spec);
    if adapter.needs_pty() {
        command = pty_wrap(&command);
    }
    if adapter.merge_stderr() {
        command.push_str(" 2>&1");
    }
    (command, envs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agents::{shell_quote, AgentOutput, CodexAdapter};
    use relay_core::{Config, Paths};
    use relay_storage::{MemoryStore, UsageStore};
    use tempfile::TempDir;

    fn quoted_json(value: serde_json::Value) -> String {
        shell_quote(&value.to_string())
    }

    /// Codex-protocol fake whose behavior depends on whether a session is
    /// being resumed. Every received prompt is appended to a log file.
    struct ScriptedAdapter {
        log: PathBuf,
        fresh_text: String,
        resumed_text: String,
    }

    impl AgentAdapter for ScriptedAdapter {
        fn id(&self) -> &'static str {
            "fake"
        }

        fn build_command(&self, spec: &CommandSpec) -> String {
            let started = quoted_json(
                serde_json::json!({"type": "thread.started", "thread_id": "t-1"}),
            );
            let fresh = quoted_json(serde_json::json!({
                "type": "item.completed",
                "item": {"type": "agent_message", "text": self.fresh_text}
            }));
            let resumed = quoted_json(serde_json::json!({
                "type": "item.completed",
                "item": {"type": "agent_message", "text": self.resumed_text}
            }));
            let log = shell_quote(&self.log.display().to_string());
            let session_check = if spec.session_id.is_some() {
                format!("printf '%s\\n' {}", resumed)
            } else {
                format!("printf '%s\\n' {} {}", started, fresh)
            };
            format!(
                "printf '%s\\n----\\n' \"$RELAY_PROMPT\" >> {}; {}",
                log, session_check
            )
        }

        fn parse_output(&self, raw: &str) -> AgentOutput {
            CodexAdapter.parse_output(raw)
        }
    }

    /// Fake that reports a stale session when resumed, and a new thread when
    /// started fresh.
    struct StaleOnceAdapter;

    impl AgentAdapter for StaleOnceAdapter {
        fn id(&self) -> &'static str {
            "fake"
        }

        fn build_command(&self, spec: &CommandSpec) -> String {
            if spec.session_id.is_some() {
                "printf '%s\\n' 'Error: no conversation found with session id t-1'".to_string()
            } else {
                let started = quoted_json(
                    serde_json::json!({"type": "thread.started", "thread_id": "t-2"}),
                );
                let msg = quoted_json(serde_json::json!({
                    "type": "item.completed",
                    "item": {"type": "agent_message", "text": "recovered"}
                }));
                format!("printf '%s\\n' {} {}", started, msg)
            }
        }

        fn parse_output(&self, raw: &str) -> AgentOutput {
            CodexAdapter.parse_output(raw)
        }
    }

    struct Harness {
        runner: AgentRunner,
        threads: ThreadStore,
        paths: Paths,
        _dir: TempDir,
    }

    fn harness(
        limits: Limits,
        make_adapters: impl FnOnce(&Paths) -> Vec<Arc<dyn AgentAdapter>>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();

        let mut config = Config::default();
        config.agent = "fake".to_string();
        config.limits = limits.clone();

        let mut registry = AdapterRegistry::new();
        for adapter in make_adapters(&paths) {
            registry.register(adapter);
        }

        let threads = ThreadStore::load(&paths).unwrap();
        let settings = SettingsStore::new(&paths, config);
        let overrides = OverrideStore::load(&paths).unwrap();
        let tracker = Arc::new(TokenTracker::new(
            UsageStore::new(&paths),
            0,
            HashMap::new(),
        ));
        let memory = Arc::new(MemoryService::new(
            MemoryStore::new(paths.clone()),
            paths.clone(),
            &limits,
        ));

        Harness {
            runner: AgentRunner::new(
                limits,
                registry,
                threads.clone(),
                settings,
                overrides,
                tracker,
                memory,
            ),
            threads,
            paths,
            _dir: dir,
        }
    }

    fn no_rotation_limits() -> Limits {
        Limits {
            thread_rotation_turns: 0,
            thread_max_context_chars: 0,
            ..Default::default()
        }
    }

    fn scripted(paths: &Paths) -> Vec<Arc<dyn AgentAdapter>> {
        vec![Arc::new(ScriptedAdapter {
            log: paths.base.join("prompts.log"),
            fresh_text: "Primera respuesta".to_string(),
            resumed_text: "Segunda respuesta".to_string(),
        })]
    }

    fn prompts_log(h: &Harness) -> Vec<String> {
        let raw = std::fs::read_to_string(h.paths.base.join("prompts.log")).unwrap_or_default();
        raw.split("\n----\n")
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .collect()
    }

    #[test]
    fn test_rotation_reason_turn_limit() {
        let limits = Limits {
            thread_rotation_turns: 3,
            thread_max_context_chars: 0,
            ..Default::default()
        };
        assert_eq!(rotation_reason(&limits, 2, true, 0), None);
        assert_eq!(rotation_reason(&limits, 3, true, 0), Some("turn limit reached"));
    }

    #[test]
    fn test_rotation_reason_context_limit() {
        let limits = Limits {
            thread_rotation_turns: 100,
            thread_max_context_chars: 6000,
            ..Default::default()
        };
        assert_eq!(rotation_reason(&limits, 2, true, 5999), None);
        assert_eq!(
            rotation_reason(&limits, 2, true, 6000),
            Some("context limit reached")
        );
    }

    #[test]
    fn test_rotation_reason_post_restart() {
        let limits = Limits {
            thread_rotation_turns: 0,
            thread_max_context_chars: 6000,
            ..Default::default()
        };
        assert_eq!(
            rotation_reason(&limits, 1, false, 0),
            Some("context size unknown after restart")
        );
        // With the limit disabled a missing entry is fine.
        let disabled = Limits {
            thread_rotation_turns: 0,
            thread_max_context_chars: 0,
            ..Default::default()
        };
        assert_eq!(rotation_reason(&disabled, 1, false, 0), None);
    }

    #[test]
    fn test_stale_phrase_match_is_case_insensitive() {
        assert!(is_stale_session_text("ERROR: No Conversation Found With Session Id t-1"));
        assert!(is_stale_session_text("fatal: session expired, please restart"));
        assert!(!is_stale_session_text("everything is fine"));
    }

    #[test]
    fn test_retrieval_gate_boundaries() {
        assert!(!retrieval_eligible(""));
        assert!(!retrieval_eligible("12345678901234")); // 14 chars
        assert!(retrieval_eligible("123456789012345")); // 15 chars
        // Whitespace does not count.
        assert!(!retrieval_eligible("1 2 3 4 5 6 7 8 9 0 1 2 3 4"));
        assert!(retrieval_eligible(&"x".repeat(4000)));
    }

    #[tokio::test]
    async fn test_thread_continuity() {
        // S1: first run has no session; the second resumes t-1; the store
        // persists the mapping.
        let h = harness(no_rotation_limits(), scripted);

        let run1 = h
            .runner
            .run_chat(&ChatRun::text(12345, None, "Hola equipo"))
            .await
            .unwrap();
        assert_eq!(run1, "Primera respuesta");
        assert_eq!(h.threads.session_for("12345:root:fake").as_deref(), Some("t-1"));

        let run2 = h
            .runner
            .run_chat(&ChatRun::text(12345, None, "¿Seguimos?"))
            .await
            .unwrap();
        assert_eq!(run2, "Segunda respuesta");
        assert_eq!(h.threads.session_for("12345:root:fake").as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_rotation_by_turn_limit() {
        // S2: rotationTurns=3 -> builds 1 and 3 start fresh, build 2 resumes,
        // and the rotated bootstrap is the compact variant.
        let limits = Limits {
            thread_rotation_turns: 3,
            thread_max_context_chars: 0,
            ..Default::default()
        };
        let h = harness(limits, scripted);
        // A long soul file so full vs compact bootstraps are distinguishable.
        std::fs::write(h.paths.soul_md(), "S".repeat(2000)).unwrap();

        let r1 = h.runner.run_chat(&ChatRun::text(1, None, "uno")).await.unwrap();
        let r2 = h.runner.run_chat(&ChatRun::text(1, None, "dos")).await.unwrap();
        let r3 = h.runner.run_chat(&ChatRun::text(1, None, "tres")).await.unwrap();
        assert_eq!(r1, "Primera respuesta");
        assert_eq!(r2, "Segunda respuesta");
        assert_eq!(r3, "Primera respuesta"); // fresh again after rotation

        let prompts = prompts_log(&h);
        assert_eq!(prompts.len(), 3);
        // Build 1: full bootstrap.
        assert!(prompts[0].contains(&"S".repeat(2000)));
        // Build 2: continuing thread, no bootstrap.
        assert!(!prompts[1].contains("[soul]"));
        // Build 3: compact bootstrap, soul truncated.
        assert!(prompts[2].contains("[soul]"));
        assert!(!prompts[2].contains(&"S".repeat(2000)));

        let snapshot = h.runner.thread_snapshot(1, None);
        assert_eq!(snapshot.turns, 1);
        assert_eq!(snapshot.session_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_rotation_by_context_size() {
        // S3: responses of ~5000 chars against a 6000-char ceiling rotate on
        // the third turn.
        let limits = Limits {
            thread_rotation_turns: 100,
            thread_max_context_chars: 6000,
            ..Default::default()
        };
        let h = harness(limits, |paths| {
            vec![Arc::new(ScriptedAdapter {
                log: paths.base.join("prompts.log"),
                fresh_text: "f".repeat(5000),
                resumed_text: "r".repeat(5000),
            })]
        });

        let r1 = h.runner.run_chat(&ChatRun::text(1, None, "uno")).await.unwrap();
        assert!(r1.starts_with('f'));
        let r2 = h.runner.run_chat(&ChatRun::text(1, None, "dos")).await.unwrap();
        assert!(r2.starts_with('r')); // resumed
        let r3 = h.runner.run_chat(&ChatRun::text(1, None, "tres")).await.unwrap();
        assert!(r3.starts_with('f')); // rotated, fresh again
    }

    #[tokio::test]
    async fn test_stale_session_recovery() {
        // S4: a stored session the agent no longer knows triggers exactly one
        // retry as a fresh thread; counters reset and the new id is stored.
        let h = harness(no_rotation_limits(), |_| vec![Arc::new(StaleOnceAdapter)]);
        h.threads.set("77:root:fake", "t-1");

        let out = h.runner.run_chat(&ChatRun::text(77, None, "hola")).await.unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(h.threads.session_for("77:root:fake").as_deref(), Some("t-2"));

        let snapshot = h.runner.thread_snapshot(77, None);
        assert_eq!(snapshot.turns, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_session_until_next_completion() {
        let h = harness(no_rotation_limits(), scripted);

        h.runner.run_chat(&ChatRun::text(5, None, "hola")).await.unwrap();
        assert!(h.threads.session_for("5:root:fake").is_some());

        h.runner.reset_thread(5, None);
        assert!(h.threads.session_for("5:root:fake").is_none());
        let snapshot = h.runner.thread_snapshot(5, None);
        assert_eq!(snapshot.turns, 0);
        assert_eq!(snapshot.context_chars, 0);

        // Next completion re-establishes a session.
        let out = h.runner.run_chat(&ChatRun::text(5, None, "otra vez")).await.unwrap();
        assert_eq!(out, "Primera respuesta");
        assert_eq!(h.threads.session_for("5:root:fake").as_deref(), Some("t-1"));
    }

    /// Second registered adapter for override-resolution tests.
    struct OtherAdapter;

    impl AgentAdapter for OtherAdapter {
        fn id(&self) -> &'static str {
            "other"
        }
        fn build_command(&self, spec: &CommandSpec) -> String {
            format!("printf 'other: %s' {}", spec.prompt_arg())
        }
        fn parse_output(&self, raw: &str) -> AgentOutput {
            AgentOutput {
                text: raw.trim().to_string(),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_agent_override_resolution() {
        let h = harness(no_rotation_limits(), |paths| {
            let mut adapters = scripted(paths);
            adapters.push(Arc::new(OtherAdapter));
            adapters
        });

        assert_eq!(h.runner.effective_agent(&ChatRun::text(9, None, "x")), "fake");
        h.runner.overrides().set("9:root", "other");
        assert_eq!(h.runner.effective_agent(&ChatRun::text(9, None, "x")), "other");
        // Explicit override wins over the per-topic one.
        let mut run = ChatRun::text(9, None, "x");
        run.agent = Some("fake".to_string());
        assert_eq!(h.runner.effective_agent(&run), "fake");
    }

    #[tokio::test]
    async fn test_unknown_agent_falls_back_to_default() {
        let h = harness(no_rotation_limits(), scripted);

        // Explicit unknown id: the run goes to the default agent instead of
        // erroring, and the thread is scoped under the agent that ran.
        let mut run = ChatRun::text(1, None, "hola");
        run.agent = Some("nope".to_string());
        let out = h.runner.run_chat(&run).await.unwrap();
        assert_eq!(out, "Primera respuesta");
        assert_eq!(h.threads.session_for("1:root:fake").as_deref(), Some("t-1"));

        // A stale per-topic override resolves the same way.
        h.runner.overrides().set("1:root", "ghost");
        assert_eq!(h.runner.effective_agent(&ChatRun::text(1, None, "x")), "fake");
    }

    #[tokio::test]
    async fn test_unknown_default_falls_back_to_registered_adapter() {
        // A hand-edited config.json can name a default that no adapter
        // provides; resolution lands on a registered one.
        let h = harness(no_rotation_limits(), scripted);
        h.runner.settings().set_default_agent("missing");

        assert_eq!(h.runner.effective_agent(&ChatRun::text(2, None, "x")), "fake");
        let out = h.runner.run_chat(&ChatRun::text(2, None, "hola")).await.unwrap();
        assert_eq!(out, "Primera respuesta");
        assert_eq!(h.threads.session_for("2:root:fake").as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_build_command_wraps_pty_and_stderr() {
        struct PtyAdapter;
        impl AgentAdapter for PtyAdapter {
            fn id(&self) -> &'static str {
                "pty"
            }
            fn needs_pty(&self) -> bool {
                true
            }
            fn merge_stderr(&self) -> bool {
                true
            }
            fn build_command(&self, spec: &CommandSpec) -> String {
                format!("fakecli {}", spec.prompt_arg())
            }
            fn parse_output(&self, raw: &str) -> AgentOutput {
                AgentOutput {
                    text: raw.trim().to_string(),
                    ..Default::default()
                }
            }
        }
        let (command, envs) = build_command(&PtyAdapter, "hola", None, None, None);
        assert!(command.starts_with("script -qec"));
        assert!(command.ends_with("2>&1"));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].0, "RELAY_PROMPT");
    }
}
