use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::adapter::{AgentAdapter, AgentOutput, CommandSpec, TokenUsage};
use crate::shell::shell_quote;

static ANSI_SEQUENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b(?:\[[0-9;?]*[ -/]*[@-~]|\][^\x07]*(?:\x07|\x1b\\)|[@-Z\\-_])")
        .expect("ANSI regex is valid")
});

static SESSION_ID_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("session id regex is valid")
});

/// Adapter for the Claude Code CLI: one JSON result envelope on stdout.
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    fn extract(envelope: &Value, out: &mut AgentOutput) {
        out.saw_json = true;
        if let Some(text) = envelope
            .get("result")
            .or_else(|| envelope.get("text"))
            .and_then(Value::as_str)
        {
            out.text = text.trim().to_string();
        }
        if let Some(id) = envelope.get("session_id").and_then(Value::as_str) {
            if SESSION_ID_SHAPE.is_match(id) {
                out.session_id = Some(id.to_string());
            }
        }
        if let Some(usage) = envelope.get("usage") {
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
        }
        out.cost_usd = envelope.get("total_cost_usd").and_then(Value::as_f64);
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn id(&self) -> &'static str {
        "claude"
    }

    fn build_command(&self, spec: &CommandSpec) -> String {
        let mut cmd = String::from("claude -p --output-format json");
        if let Some(model) = spec.model.as_deref().filter(|m| !m.is_empty()) {
            cmd.push_str(&format!(" --model {}", shell_quote(model)));
        }
        if let Some(session) = spec.session_arg() {
            cmd.push_str(&format!(" --resume {}", session));
        }
        cmd.push(' ');
        cmd.push_str(&spec.prompt_arg());
        cmd
    }

    fn parse_output(&self, raw: &str) -> AgentOutput {
        let cleaned = ANSI_SEQUENCES.replace_all(raw, "");
        let trimmed = cleaned.trim();

        let mut out = AgentOutput::default();
        if trimmed.is_empty() {
            return out;
        }

        if let Ok(envelope) = serde_json::from_str::<Value>(trimmed) {
            if envelope.is_object() {
                Self::extract(&envelope, &mut out);
                return out;
            }
        }

        // Banner noise before the envelope: scan lines from the bottom for
        // the last parseable object.
        for line in trimmed.lines().rev() {
            let line = line.trim();
            if !line.starts_with('{') {
                continue;
            }
            if let Ok(envelope) = serde_json::from_str::<Value>(line) {
                if envelope.is_object() {
                    Self::extract(&envelope, &mut out);
                    return out;
                }
            }
        }

        out.text = trimmed.to_string();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "3f1d2c4b-9a87-4e65-b321-0f9e8d7c6b5a";

    fn envelope(session: &str) -> String {
        serde_json::json!({
            "type": "result",
            "subtype": "success",
            "result": "Hello there",
            "session_id": session,
            "usage": {"input_tokens": 900, "output_tokens": 120},
            "total_cost_usd": 0.042
        })
        .to_string()
    }

    #[test]
    fn test_whole_envelope() {
        let out = ClaudeAdapter.parse_output(&envelope(SESSION));
        assert_eq!(out.text, "Hello there");
        assert_eq!(out.session_id.as_deref(), Some(SESSION));
        assert!(out.saw_json);
        assert_eq!(out.cost_usd, Some(0.042));
        assert_eq!(
            out.usage,
            Some(TokenUsage {
                input_tokens: 900,
                output_tokens: 120
            })
        );
    }

    #[test]
    fn test_bottom_scan_past_banner() {
        let raw = format!("Starting up...\nwarning: slow disk\n{}\n", envelope(SESSION));
        let out = ClaudeAdapter.parse_output(&raw);
        assert_eq!(out.text, "Hello there");
        assert_eq!(out.session_id.as_deref(), Some(SESSION));
    }

    #[test]
    fn test_non_uuid_session_rejected() {
        let out = ClaudeAdapter.parse_output(&envelope("not-a-session-id"));
        assert_eq!(out.session_id, None);
        assert_eq!(out.text, "Hello there");
    }

    #[test]
    fn test_ansi_stripped_before_parse() {
        let raw = format!("\x1b[2J\x1b[1;32m{}\x1b[0m", envelope(SESSION));
        let out = ClaudeAdapter.parse_output(&raw);
        assert!(out.saw_json);
        assert_eq!(out.text, "Hello there");
    }

    #[test]
    fn test_only_control_bytes_yields_empty() {
        let out = ClaudeAdapter.parse_output("\x1b[2J\x1b[0m\x1b[H");
        assert!(!out.saw_json);
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_plain_text_fallback() {
        let out = ClaudeAdapter.parse_output("Error: no conversation found with session id t-1");
        assert!(!out.saw_json);
        assert_eq!(out.text, "Error: no conversation found with session id t-1");
    }

    #[test]
    fn test_parse_is_deterministic() {
        let raw = format!("noise\n{}\n", envelope(SESSION));
        assert_eq!(ClaudeAdapter.parse_output(&raw), ClaudeAdapter.parse_output(&raw));
    }

    #[test]
    fn test_build_command() {
        let spec = CommandSpec {
            prompt: "hola".into(),
            prompt_expr: Some("\"$RELAY_PROMPT\"".into()),
            session_id: Some(SESSION.into()),
            session_expr: None,
            model: Some("claude-sonnet-4-5".into()),
            thinking: None,
        };
        let cmd = ClaudeAdapter.build_command(&spec);
        assert_eq!(
            cmd,
            format!(
                "claude -p --output-format json --model 'claude-sonnet-4-5' --resume '{}' \"$RELAY_PROMPT\"",
                SESSION
            )
        );
    }
}
