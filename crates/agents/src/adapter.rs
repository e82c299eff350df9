use std::collections::HashMap;
use std::sync::Arc;

use crate::claude::ClaudeAdapter;
use crate::codex::CodexAdapter;
use crate::gemini::GeminiAdapter;

/// Inputs for building one agent invocation.
///
/// Values are normally passed through environment variables: the runner sets
/// `RELAY_PROMPT` / `RELAY_SESSION_ID` and supplies the matching shell
/// expansions as `prompt_expr` / `session_expr`. When no expression is given
/// the raw value is embedded with POSIX single-quote escaping instead.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub prompt: String,
    pub prompt_expr: Option<String>,
    pub session_id: Option<String>,
    pub session_expr: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
}

impl CommandSpec {
    /// The prompt as a shell word: the supplied expansion expression, or the
    /// escaped literal value.
    pub fn prompt_arg(&self) -> String {
        match &self.prompt_expr {
            Some(expr) => expr.clone(),
            None => crate::shell::shell_quote(&self.prompt),
        }
    }

    pub fn session_arg(&self) -> Option<String> {
        let session = self.session_id.as_deref()?;
        Some(match &self.session_expr {
            Some(expr) => expr.clone(),
            None => crate::shell::shell_quote(session),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of parsing one agent invocation's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub text: String,
    pub session_id: Option<String>,
    /// Whether any JSON envelope was recognized. Used by the stale-session
    /// detector: structured output means the agent answered, however badly.
    pub saw_json: bool,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
}

/// Per-agent strategy: how to build the command line and how to read the
/// output back. Capability queries (`list_sessions_command`,
/// `list_models_command`) default to unsupported.
pub trait AgentAdapter: Send + Sync {
    fn id(&self) -> &'static str;

    /// stdin/stdout must be attached to a pseudo-terminal.
    fn needs_pty(&self) -> bool {
        false
    }

    /// Fold stderr into stdout before parsing.
    fn merge_stderr(&self) -> bool {
        false
    }

    fn build_command(&self, spec: &CommandSpec) -> String;

    fn parse_output(&self, raw: &str) -> AgentOutput;

    fn list_sessions_command(&self) -> Option<String> {
        None
    }

    fn parse_session_list(&self, _raw: &str) -> Option<String> {
        None
    }

    fn list_models_command(&self) -> Option<String> {
        None
    }

    fn parse_model_list(&self, _raw: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn AgentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with the built-in adapters.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeAdapter));
        registry.register(Arc::new(CodexAdapter));
        registry.register(Arc::new(GeminiAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.adapters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = AdapterRegistry::builtin();
        assert_eq!(registry.ids(), vec!["claude", "codex", "gemini"]);
        assert!(registry.get("claude").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_spec_prompt_arg_prefers_expression() {
        let spec = CommandSpec {
            prompt: "hello".into(),
            prompt_expr: Some("\"$RELAY_PROMPT\"".into()),
            ..Default::default()
        };
        assert_eq!(spec.prompt_arg(), "\"$RELAY_PROMPT\"");

        let spec = CommandSpec {
            prompt: "it's me".into(),
            ..Default::default()
        };
        assert_eq!(spec.prompt_arg(), "'it'\\''s me'");
    }
}
