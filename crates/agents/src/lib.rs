pub mod adapter;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod shell;
pub mod stream;

pub use adapter::{AdapterRegistry, AgentAdapter, AgentOutput, CommandSpec, TokenUsage};
pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;
pub use shell::{pty_wrap, shell_quote};
pub use stream::JsonStream;
