use chrono::{TimeZone, Utc};
use relay_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Markers delimiting the machine-maintained section of `memory.md`.
/// Manual edits outside the markers survive re-curation verbatim.
pub const AUTO_BEGIN: &str = "<!-- relay:auto -->";
pub const AUTO_END: &str = "<!-- /relay:auto -->";

const CURATE_TAIL_PER_THREAD: usize = 10;
const RETRIEVE_TAIL_PER_THREAD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    User,
    Assistant,
}

impl EventRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventRole::User => "user",
            EventRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Command,
    Audio,
    Image,
    Document,
    Cron,
}

/// One immutable conversation event. Events are append-only; curation builds
/// a separate digest and never rewrites the logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEvent {
    pub thread_key: String,
    pub chat_id: i64,
    pub topic_id: String,
    pub agent_id: String,
    pub role: EventRole,
    pub kind: EventKind,
    pub text: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CurationReport {
    pub events_processed: usize,
    pub bytes: usize,
    pub last_curated_at: String,
}

#[derive(Debug, Clone)]
pub struct RetrieveQuery {
    pub query: String,
    pub chat_id: i64,
    pub topic_id: String,
    pub agent_id: String,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ScoredEvent {
    pub event: MemoryEvent,
    pub score: f64,
}

/// Three tiers of memory data: per-thread JSONL append logs, the curated
/// digest spliced into `memory.md`, and a keyword index used to narrow
/// retrieval candidates.
#[derive(Clone)]
pub struct MemoryStore {
    paths: Paths,
}

impl MemoryStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn append_event(&self, event: &MemoryEvent) -> Result<()> {
        let path = self.paths.memory_event_file(&event.thread_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// The most recent `limit` events of one thread, oldest first.
    pub fn tail(&self, thread_key: &str, limit: usize) -> Result<Vec<MemoryEvent>> {
        let path = self.paths.memory_event_file(thread_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut events: Vec<MemoryEvent> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => debug!(error = %e, "Skipping unparseable memory event line"),
            }
        }
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }

    /// Recent thread history formatted as a compact prompt preamble.
    pub fn bootstrap(&self, thread_key: &str, limit: usize) -> Result<String> {
        let events = self.tail(thread_key, limit)?;
        let mut out = String::new();
        for event in &events {
            let ts = Utc
                .timestamp_millis_opt(event.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now);
            out.push_str(&format!(
                "[{}] {}: {}\n",
                ts.format("%m-%d %H:%M"),
                event.role.as_str(),
                event.text
            ));
        }
        Ok(out.trim_end().to_string())
    }

    /// Every known thread, discovered from the first line of each log file.
    fn scan_threads(&self) -> Vec<(String, PathBuf)> {
        let dir = self.paths.memory_threads_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut threads = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let first_line = std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| c.lines().next().map(str::to_string));
            if let Some(line) = first_line {
                if let Ok(event) = serde_json::from_str::<MemoryEvent>(&line) {
                    threads.push((event.thread_key, path));
                }
            }
        }
        threads.sort_by(|a, b| a.0.cmp(&b.0));
        threads
    }

    /// Rebuild the auto section of `memory.md` from recent events across all
    /// threads, rebuild the keyword index, and record curation state.
    pub fn curate(&self, max_bytes: usize) -> Result<CurationReport> {
        let mut recent: Vec<MemoryEvent> = Vec::new();
        let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (thread_key, _path) in self.scan_threads() {
            let events = self.tail(&thread_key, CURATE_TAIL_PER_THREAD)?;
            for event in &events {
                for token in tokenize(&event.text) {
                    index.entry(token).or_default().insert(thread_key.clone());
                }
            }
            recent.extend(events);
        }
        recent.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| a.thread_key.cmp(&b.thread_key))
        });

        let events_processed = recent.len();
        let mut digest = String::new();
        for event in &recent {
            let ts = Utc
                .timestamp_millis_opt(event.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now);
            let head: String = event.text.chars().take(200).collect();
            let line = format!(
                "- [{}] {} {} {}: {}\n",
                ts.format("%Y-%m-%d"),
                event.thread_key,
                event.role.as_str(),
                kind_label(event.kind),
                head
            );
            if digest.len() + line.len() > max_bytes {
                break;
            }
            digest.push_str(&line);
        }

        self.splice_digest(&digest)?;

        let index_out: BTreeMap<String, Vec<String>> = index
            .into_iter()
            .map(|(token, threads)| (token, threads.into_iter().collect()))
            .collect();
        std::fs::write(
            self.paths.memory_index_file(),
            serde_json::to_string(&index_out)?,
        )?;

        let report = CurationReport {
            events_processed,
            bytes: digest.len(),
            last_curated_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(
            self.paths.memory_state_file(),
            serde_json::to_string_pretty(&report)?,
        )?;

        info!(
            events = events_processed,
            bytes = report.bytes,
            "Memory curation completed"
        );
        Ok(report)
    }

    fn splice_digest(&self, digest: &str) -> Result<()> {
        let path = self.paths.memory_md();
        let existing = std::fs::read_to_string(&path).unwrap_or_default();

        let auto_block = format!("{}\n{}{}", AUTO_BEGIN, digest, AUTO_END);
        let updated = match (existing.find(AUTO_BEGIN), existing.find(AUTO_END)) {
            (Some(start), Some(end)) if end >= start => {
                let after = end + AUTO_END.len();
                format!("{}{}{}", &existing[..start], auto_block, &existing[after..])
            }
            _ => {
                let mut out = existing;
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("\n## Recent activity\n\n");
                out.push_str(&auto_block);
                out.push('\n');
                out
            }
        };
        std::fs::write(&path, updated)?;
        Ok(())
    }

    pub fn curation_state(&self) -> Option<CurationReport> {
        let content = std::fs::read_to_string(self.paths.memory_state_file()).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn load_index(&self) -> Option<BTreeMap<String, Vec<String>>> {
        let content = std::fs::read_to_string(self.paths.memory_index_file()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Ranked retrieval over the scopes same-thread, same-topic-other-agent,
    /// same-chat-other-topic, and global. Deterministic for identical inputs:
    /// score = scope weight x keyword overlap, ties broken by recency then
    /// thread key.
    pub fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<ScoredEvent>> {
        let tokens = tokenize(&query.query);
        if tokens.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut threads = self.scan_threads();
        if let Some(index) = self.load_index() {
            let mut candidates: BTreeSet<String> = BTreeSet::new();
            for token in &tokens {
                if let Some(keys) = index.get(token) {
                    candidates.extend(keys.iter().cloned());
                }
            }
            // The index only covers curated history; the caller's own thread
            // is always a candidate.
            candidates.insert(format!(
                "{}:{}:{}",
                query.chat_id, query.topic_id, query.agent_id
            ));
            threads.retain(|(key, _)| candidates.contains(key));
        }

        let mut scored: Vec<ScoredEvent> = Vec::new();
        for (thread_key, _path) in threads {
            let weight = scope_weight(&thread_key, query);
            for event in self.tail(&thread_key, RETRIEVE_TAIL_PER_THREAD)? {
                let text = event.text.to_lowercase();
                let overlap = tokens.iter().filter(|t| text.contains(t.as_str())).count();
                if overlap == 0 {
                    continue;
                }
                scored.push(ScoredEvent {
                    score: weight * overlap as f64,
                    event,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.event.timestamp_ms.cmp(&a.event.timestamp_ms))
                .then_with(|| a.event.thread_key.cmp(&b.event.thread_key))
        });
        scored.truncate(query.limit);
        Ok(scored)
    }

    /// Count of events across all thread logs; used by `/memory` reporting.
    pub fn event_count(&self) -> usize {
        self.scan_threads()
            .iter()
            .filter_map(|(_, path)| std::fs::read_to_string(path).ok())
            .map(|content| content.lines().filter(|l| !l.trim().is_empty()).count())
            .sum()
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Text => "text",
        EventKind::Command => "command",
        EventKind::Audio => "audio",
        EventKind::Image => "image",
        EventKind::Document => "document",
        EventKind::Cron => "cron",
    }
}

fn scope_weight(thread_key: &str, query: &RetrieveQuery) -> f64 {
    let own = format!("{}:{}:{}", query.chat_id, query.topic_id, query.agent_id);
    if thread_key == own {
        return 4.0;
    }
    let topic_prefix = format!("{}:{}:", query.chat_id, query.topic_id);
    if thread_key.starts_with(&topic_prefix) {
        return 3.0;
    }
    let chat_prefix = format!("{}:", query.chat_id);
    if thread_key.starts_with(&chat_prefix) {
        return 2.0;
    }
    1.0
}

fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
    {
        seen.insert(token.to_string());
    }
    seen.into_iter().collect()
}
