use serde_json::Value;

use crate::adapter::{AgentAdapter, AgentOutput, CommandSpec, TokenUsage};
use crate::shell::shell_quote;
use crate::stream::JsonStream;

/// Adapter for the Codex CLI: line-delimited JSON event stream.
///
/// Session ids arrive in a `thread.started` event; message items arrive as
/// `item.completed` events carrying an optional `channel` discriminator, with
/// the `final` channel preferred over intermediate ones.
pub struct CodexAdapter;

impl AgentAdapter for CodexAdapter {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn merge_stderr(&self) -> bool {
        true
    }

    fn build_command(&self, spec: &CommandSpec) -> String {
        let mut cmd = String::from("codex exec --json");
        if let Some(model) = spec.model.as_deref().filter(|m| !m.is_empty()) {
            cmd.push_str(&format!(" --model {}", shell_quote(model)));
        }
        if let Some(level) = spec.thinking.as_deref().filter(|t| !t.is_empty()) {
            cmd.push_str(&format!(
                " -c model_reasoning_effort={}",
                shell_quote(level)
            ));
        }
        if let Some(session) = spec.session_arg() {
            cmd.push_str(&format!(" resume {}", session));
        }
        cmd.push(' ');
        cmd.push_str(&spec.prompt_arg());
        cmd
    }

    fn parse_output(&self, raw: &str) -> AgentOutput {
        let mut stream = JsonStream::new();
        let events = stream.push(raw);

        let mut out = AgentOutput::default();
        let mut messages: Vec<(Option<String>, String)> = Vec::new();

        for event in &events {
            out.saw_json = true;
            match event.get("type").and_then(Value::as_str) {
                Some("thread.started") => {
                    if let Some(id) = event.get("thread_id").and_then(Value::as_str) {
                        out.session_id = Some(id.to_string());
                    }
                }
                Some("item.completed") => {
                    let item = match event.get("item") {
                        Some(item) => item,
                        None => continue,
                    };
                    if item.get("type").and_then(Value::as_str) != Some("agent_message") {
                        continue;
                    }
                    let text = item
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let channel = item
                        .get("channel")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    messages.push((channel, text));
                }
                Some("turn.completed") => {
                    if let Some(usage) = event.get("usage") {
                        let input = usage
                            .get("input_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                        let output = usage
                            .get("output_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                        out.usage = Some(TokenUsage {
                            input_tokens: input,
                            output_tokens: output,
                        });
                        out.cost_usd = usage.get("total_cost_usd").and_then(Value::as_f64);
                    }
                }
                _ => {}
            }
        }

        // Prefer the last `final`-channel message; fall back to the last item
        // when no channel discriminator exists.
        let chosen = messages
            .iter()
            .rev()
            .find(|(channel, _)| channel.as_deref() == Some("final"))
            .or_else(|| messages.last());
        if let Some((_, text)) = chosen {
            out.text = text.trim().to_string();
        }

        out
    }

    fn list_sessions_command(&self) -> Option<String> {
        Some("codex sessions list --json".to_string())
    }

    /// Extract the most recently updated session id from a JSONL listing.
    fn parse_session_list(&self, raw: &str) -> Option<String> {
        let mut stream = JsonStream::new();
        let mut best: Option<(i64, String)> = None;
        for entry in stream.push(raw) {
            let id = match entry.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => continue,
            };
            let updated = entry
                .get("updated_at_ms")
                .or_else(|| entry.get("updatedAtMs"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if best.as_ref().map(|(ts, _)| updated >= *ts).unwrap_or(true) {
                best = Some((updated, id));
            }
        }
        best.map(|(_, id)| id)
    }

    fn list_models_command(&self) -> Option<String> {
        Some("codex models list --json".to_string())
    }

    fn parse_model_list(&self, raw: &str) -> Vec<String> {
        let mut stream = JsonStream::new();
        let mut models = Vec::new();
        for entry in stream.push(raw) {
            match entry {
                Value::Array(items) => {
                    for item in items {
                        if let Some(id) = item.get("id").and_then(Value::as_str) {
                            models.push(id.to_string());
                        }
                    }
                }
                Value::Object(obj) => {
                    if let Some(id) = obj.get("id").and_then(Value::as_str) {
                        models.push(id.to_string());
                    }
                }
                _ => {}
            }
        }
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_stream(session_id: &str, text: &str) -> String {
        format!(
            "{}\n{}\n{}\n",
            serde_json::json!({"type": "thread.started", "thread_id": session_id}),
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "text": text}}),
            serde_json::json!({"type": "turn.completed", "usage": {"input_tokens": 120, "output_tokens": 48}}),
        )
    }

    #[test]
    fn test_round_trip_law() {
        let adapter = CodexAdapter;
        let out = adapter.parse_output(&synthetic_stream("t-1", "Primera respuesta"));
        assert_eq!(out.session_id.as_deref(), Some("t-1"));
        assert_eq!(out.text, "Primera respuesta");
        assert!(out.saw_json);
        assert_eq!(
            out.usage,
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 48
            })
        );
    }

    #[test]
    fn test_final_channel_preferred() {
        let adapter = CodexAdapter;
        let raw = format!(
            "{}\n{}\n{}\n",
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "channel": "commentary", "text": "thinking..."}}),
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "channel": "final", "text": "the answer"}}),
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "channel": "commentary", "text": "post-hoc"}}),
        );
        let out = adapter.parse_output(&raw);
        assert_eq!(out.text, "the answer");
    }

    #[test]
    fn test_falls_back_to_last_item_without_channels() {
        let adapter = CodexAdapter;
        let raw = format!(
            "{}\n{}\n",
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "text": "first"}}),
            serde_json::json!({"type": "item.completed", "item": {"type": "agent_message", "text": "second"}}),
        );
        let out = adapter.parse_output(&raw);
        assert_eq!(out.text, "second");
    }

    #[test]
    fn test_plain_error_text_sets_no_json() {
        let adapter = CodexAdapter;
        let out = adapter.parse_output("Error: no conversation found with session id t-1\n");
        assert!(!out.saw_json);
        assert!(out.text.is_empty());
        assert!(out.session_id.is_none());
    }

    #[test]
    fn test_build_command_resume_and_flags() {
        let adapter = CodexAdapter;
        let spec = CommandSpec {
            prompt: "hi".into(),
            prompt_expr: Some("\"$RELAY_PROMPT\"".into()),
            session_id: Some("t-1".into()),
            session_expr: Some("\"$RELAY_SESSION_ID\"".into()),
            model: Some("gpt-5.3".into()),
            thinking: Some("high".into()),
        };
        let cmd = adapter.build_command(&spec);
        assert_eq!(
            cmd,
            "codex exec --json --model 'gpt-5.3' -c model_reasoning_effort='high' resume \"$RELAY_SESSION_ID\" \"$RELAY_PROMPT\""
        );
    }

    #[test]
    fn test_build_command_omits_empty_flags() {
        let adapter = CodexAdapter;
        let spec = CommandSpec {
            prompt: "hi".into(),
            model: Some(String::new()),
            ..Default::default()
        };
        let cmd = adapter.build_command(&spec);
        assert_eq!(cmd, "codex exec --json 'hi'");
    }

    #[test]
    fn test_session_list_picks_latest() {
        let adapter = CodexAdapter;
        let raw = format!(
            "{}\n{}\n",
            serde_json::json!({"id": "old", "updated_at_ms": 100}),
            serde_json::json!({"id": "new", "updated_at_ms": 200}),
        );
        assert_eq!(adapter.parse_session_list(&raw).as_deref(), Some("new"));
    }
}
