use async_trait::async_trait;
use relay_core::{OutboundMessage, Result};
use std::path::Path;

/// Outbound side of the messaging transport.
#[async_trait]
pub trait Egress: Send + Sync {
    async fn send(&self, msg: OutboundMessage) -> Result<()>;

    /// Idempotent typing-indicator refresh. Best effort; failures are the
    /// implementation's problem.
    async fn typing(&self, chat_id: i64, topic_id: Option<i64>);
}

/// Speech-to-text collaborator for voice notes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, path: &Path) -> Result<String>;
}

/// Narrow handle the dispatcher uses to serve `/cron` commands without
/// depending on the scheduler crate.
#[async_trait]
pub trait CronControl: Send + Sync {
    async fn handle(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        args: &[String],
    ) -> Result<String>;
}
