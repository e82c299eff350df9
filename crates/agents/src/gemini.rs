use crate::adapter::{AgentAdapter, AgentOutput, CommandSpec};
use crate::shell::shell_quote;

/// Adapter for the Gemini CLI: plain text on stdout, no session protocol.
/// The binary insists on a TTY, so the runner wraps it in a pty helper.
pub struct GeminiAdapter;

impl AgentAdapter for GeminiAdapter {
    fn id(&self) -> &'static str {
        "gemini"
    }

    fn needs_pty(&self) -> bool {
        true
    }

    fn merge_stderr(&self) -> bool {
        true
    }

    fn build_command(&self, spec: &CommandSpec) -> String {
        let mut cmd = String::from("gemini");
        if let Some(model) = spec.model.as_deref().filter(|m| !m.is_empty()) {
            cmd.push_str(&format!(" -m {}", shell_quote(model)));
        }
        cmd.push_str(" -p ");
        cmd.push_str(&spec.prompt_arg());
        cmd
    }

    fn parse_output(&self, raw: &str) -> AgentOutput {
        AgentOutput {
            text: raw.trim().to_string(),
            ..Default::default()
        }
    }
}
