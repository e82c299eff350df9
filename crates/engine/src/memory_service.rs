use once_cell::sync::Lazy;
use regex::Regex;
use relay_core::{Limits, Paths, ThreadKey};
use relay_storage::{EventKind, EventRole, MemoryEvent, MemoryStore, RetrieveQuery};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Ceiling applied to soul/tools sections in compact bootstraps.
pub const COMPACT_PREAMBLE_MAX: usize = 800;

const BOOTSTRAP_TAIL_EVENTS: usize = 12;
const DIGEST_MAX_BYTES: usize = 16 * 1024;

static ATTACHMENT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[attachment:[^\]]*\]").expect("attachment regex is valid"));

/// Wraps the memory store with event capture, auto-curation cadence, and
/// bootstrap-context assembly.
pub struct MemoryService {
    store: MemoryStore,
    paths: Paths,
    capture_max_chars: usize,
    curate_every: u32,
    retrieval_limit: usize,
    captured: AtomicU32,
}

impl MemoryService {
    pub fn new(store: MemoryStore, paths: Paths, limits: &Limits) -> Self {
        Self {
            store,
            paths,
            capture_max_chars: limits.memory_capture_max_chars,
            curate_every: limits.memory_curate_every,
            retrieval_limit: limits.memory_retrieval_limit,
            captured: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Record one conversation event. Never blocks or fails the caller:
    /// I/O errors are logged and dropped.
    pub fn capture(&self, key: &ThreadKey, role: EventRole, kind: EventKind, text: &str) {
        let sanitized = ATTACHMENT_TOKEN.replace_all(text, "").trim().to_string();
        if sanitized.is_empty() {
            return;
        }
        let event = MemoryEvent {
            thread_key: key.to_string(),
            chat_id: key.chat_id,
            topic_id: key.topic_id.clone(),
            agent_id: key.agent_id.clone(),
            role,
            kind,
            text: truncate_chars(&sanitized, self.capture_max_chars),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.store.append_event(&event) {
            warn!(error = %e, thread = %event.thread_key, "Failed to capture memory event");
            return;
        }

        let count = self.captured.fetch_add(1, Ordering::SeqCst) + 1;
        if self.curate_every > 0 && count % self.curate_every == 0 {
            self.curate_async();
        }
    }

    /// Rebuild the curated digest off the hot path.
    pub fn curate_async(&self) {
        let store = self.store.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match tokio::task::spawn_blocking(move || store.curate(DIGEST_MAX_BYTES)).await {
                    Ok(Ok(report)) => {
                        debug!(events = report.events_processed, bytes = report.bytes, "Curated memory digest")
                    }
                    Ok(Err(e)) => warn!(error = %e, "Memory curation failed"),
                    Err(e) => warn!(error = %e, "Memory curation task panicked"),
                }
            });
        }
    }

    /// Bootstrap context for a thread with no active session: soul, tools,
    /// curated memory, and the recent thread tail, each in open/close
    /// markers. Compact mode truncates soul and tools only.
    pub fn bootstrap_context(&self, thread_key: &str, compact: bool) -> String {
        let mut out = String::new();

        let mut push = |name: &str, body: String, truncate: bool| {
            let body = body.trim();
            if body.is_empty() {
                return;
            }
            let body = if truncate {
                truncate_chars(body, COMPACT_PREAMBLE_MAX)
            } else {
                body.to_string()
            };
            out.push_str(&format!("[{}]\n{}\n[/{}]\n\n", name, body, name));
        };

        push("soul", read_or_empty(&self.paths.soul_md()), compact);
        push("tools", read_or_empty(&self.paths.tools_md()), compact);
        push("memory", read_or_empty(&self.paths.memory_md()), false);
        push(
            "recent",
            self.store
                .bootstrap(thread_key, BOOTSTRAP_TAIL_EVENTS)
                .unwrap_or_default(),
            false,
        );

        out.trim_end().to_string()
    }

    /// Retrieval injection for a prompt. Fail-soft: errors log and return
    /// nothing.
    pub fn retrieve(
        &self,
        query: &str,
        chat_id: i64,
        topic_id: &str,
        agent_id: &str,
    ) -> Option<String> {
        let results = match self.store.retrieve(&RetrieveQuery {
            query: query.to_string(),
            chat_id,
            topic_id: topic_id.to_string(),
            agent_id: agent_id.to_string(),
            limit: self.retrieval_limit,
        }) {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Memory retrieval failed");
                return None;
            }
        };
        if results.is_empty() {
            return None;
        }

        let mut out = String::from("[recall]\n");
        for scored in &results {
            out.push_str(&format!(
                "- ({}) {}: {}\n",
                scored.event.thread_key,
                scored.event.role.as_str(),
                scored.event.text
            ));
        }
        out.push_str("[/recall]");
        Some(out)
    }

    pub fn events_captured(&self) -> u32 {
        self.captured.load(Ordering::SeqCst)
    }
}

fn read_or_empty(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn service(limits: Limits) -> (Arc<MemoryService>, Paths, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        let store = MemoryStore::new(paths.clone());
        (
            Arc::new(MemoryService::new(store, paths.clone(), &limits)),
            paths,
            dir,
        )
    }

    #[test]
    fn test_capture_strips_attachment_tokens_and_truncates() {
        let limits = Limits {
            memory_capture_max_chars: 20,
            ..Default::default()
        };
        let (service, _paths, _dir) = service(limits);
        let key = ThreadKey::new(1, None, "claude");
        service.capture(
            &key,
            EventRole::User,
            EventKind::Text,
            "look at [attachment:/tmp/x.png] this very long message that keeps going",
        );

        let tail = service.store().tail("1:root:claude", 10).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(!tail[0].text.contains("attachment"));
        assert!(tail[0].text.ends_with('…'));
        assert!(tail[0].text.chars().count() <= 20);
    }

    #[test]
    fn test_capture_of_pure_attachment_is_skipped() {
        let (service, _paths, _dir) = service(Limits::default());
        let key = ThreadKey::new(1, None, "claude");
        service.capture(&key, EventRole::User, EventKind::Image, "[attachment:/tmp/x.png]");
        assert!(service.store().tail("1:root:claude", 10).unwrap().is_empty());
    }

    #[test]
    fn test_bootstrap_sections_and_compact_truncation() {
        let (service, paths, _dir) = service(Limits::default());
        std::fs::write(paths.soul_md(), "S".repeat(2000)).unwrap();
        std::fs::write(paths.tools_md(), "tool notes").unwrap();
        let key = ThreadKey::new(1, None, "claude");
        service.capture(&key, EventRole::User, EventKind::Text, "hola equipo");

        let full = service.bootstrap_context("1:root:claude", false);
        assert!(full.contains("[soul]"));
        assert!(full.contains(&"S".repeat(2000)));
        assert!(full.contains("[tools]\ntool notes\n[/tools]"));
        assert!(full.contains("[recent]"));
        assert!(full.contains("hola equipo"));

        let compact = service.bootstrap_context("1:root:claude", true);
        assert!(!compact.contains(&"S".repeat(2000)));
        assert!(compact.contains('…'));
        // The tail survives compaction in full.
        assert!(compact.contains("hola equipo"));
    }

    #[test]
    fn test_bootstrap_skips_missing_sections() {
        let (service, _paths, _dir) = service(Limits::default());
        let out = service.bootstrap_context("1:root:claude", false);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retrieve_formats_fragment() {
        let (service, _paths, _dir) = service(Limits::default());
        let key = ThreadKey::new(1, None, "claude");
        service.capture(&key, EventRole::User, EventKind::Text, "the staging database password rotation");
        let fragment = service.retrieve("database rotation", 1, "root", "claude").unwrap();
        assert!(fragment.starts_with("[recall]"));
        assert!(fragment.contains("database"));
        assert!(service.retrieve("zebra quantum", 1, "root", "claude").is_none());
    }
}
