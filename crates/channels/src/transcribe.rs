use async_trait::async_trait;
use relay_core::{Error, Result};
use relay_engine::{exec, Transcriber};
use std::path::Path;

const TRANSCRIBE_TIMEOUT_MS: u64 = 120_000;
const TRANSCRIBE_MAX_BUFFER: usize = 1 << 20;

/// Speech-to-text through a user-configured shell command. The command
/// receives the audio path in `$RELAY_AUDIO_PATH` and prints the transcript
/// on stdout.
pub struct CommandTranscriber {
    command: String,
}

impl CommandTranscriber {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        let envs = vec![(
            "RELAY_AUDIO_PATH".to_string(),
            path.display().to_string(),
        )];
        let out = exec::run(
            &self.command,
            &envs,
            None,
            TRANSCRIBE_TIMEOUT_MS,
            TRANSCRIBE_MAX_BUFFER,
        )
        .await?;
        if out.exit_code != Some(0) {
            return Err(Error::Transport(format!(
                "transcriber exited with {:?}",
                out.exit_code
            )));
        }
        Ok(out.stdout.trim().to_string())
    }
}
