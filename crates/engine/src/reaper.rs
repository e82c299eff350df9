use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// TTL sweep over the downloaded-media directory.
pub struct MediaReaper {
    dir: PathBuf,
    ttl: Duration,
    interval: Duration,
}

impl MediaReaper {
    pub fn new(dir: PathBuf, ttl_hours: u64, cleanup_interval_ms: u64) -> Self {
        Self {
            dir,
            ttl: Duration::from_secs(ttl_hours * 3600),
            interval: Duration::from_millis(cleanup_interval_ms.max(1000)),
        }
    }

    pub async fn run_loop(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = sweep_once(&self.dir, self.ttl);
                    if removed > 0 {
                        debug!(removed, dir = %self.dir.display(), "Reaped expired media files");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

/// Delete regular files older than `ttl`; returns how many were removed.
pub fn sweep_once(dir: &Path, ttl: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age >= ttl)
            .unwrap_or(false);
        if expired {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove expired media"),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), b"x").unwrap();
        std::fs::write(dir.path().join("b.ogg"), b"x").unwrap();

        // Nothing is older than an hour.
        assert_eq!(sweep_once(dir.path(), Duration::from_secs(3600)), 0);
        // A zero TTL expires everything.
        assert_eq!(sweep_once(dir.path(), Duration::ZERO), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sweep_missing_dir_is_noop() {
        assert_eq!(sweep_once(Path::new("/nonexistent/relay-media"), Duration::ZERO), 0);
    }
}
