use std::path::PathBuf;

/// Filesystem layout under the relay config root.
///
/// The root defaults to the XDG config dir (`~/.config/relay`) and can be
/// overridden with the `RELAY_HOME` environment variable.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = std::env::var("RELAY_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::config_dir().map(|d| d.join("relay")))
            .unwrap_or_else(|| PathBuf::from(".relay"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn threads_file(&self) -> PathBuf {
        self.base.join("threads.json")
    }

    pub fn overrides_file(&self) -> PathBuf {
        self.base.join("agent-overrides.json")
    }

    pub fn usage_file(&self) -> PathBuf {
        self.base.join("usage.json")
    }

    pub fn cron_file(&self) -> PathBuf {
        self.base.join("cron.json")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.base.join("media")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.base.join("memory")
    }

    pub fn memory_threads_dir(&self) -> PathBuf {
        self.memory_dir().join("threads")
    }

    pub fn memory_event_file(&self, thread_key: &str) -> PathBuf {
        let safe_key = thread_key.replace([':', '/', '\\'], "_");
        self.memory_threads_dir().join(format!("{}.jsonl", safe_key))
    }

    pub fn memory_state_file(&self) -> PathBuf {
        self.memory_dir().join("state.json")
    }

    pub fn memory_index_file(&self) -> PathBuf {
        self.memory_dir().join("index.json")
    }

    pub fn memory_md(&self) -> PathBuf {
        self.base.join("memory.md")
    }

    pub fn soul_md(&self) -> PathBuf {
        self.base.join("soul.md")
    }

    pub fn tools_md(&self) -> PathBuf {
        self.base.join("tools.md")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.media_dir())?;
        std::fs::create_dir_all(self.memory_dir())?;
        std::fs::create_dir_all(self.memory_threads_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_file_sanitizes_key() {
        let paths = Paths::with_base(PathBuf::from("/tmp/relay-test"));
        let file = paths.memory_event_file("12345:root:claude");
        assert!(file.ends_with("memory/threads/12345_root_claude.jsonl"));
    }
}
