use relay_storage::{today, Bucket, UsageState, UsageStore};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Alert thresholds as percentages of the daily budget. Each fires at most
/// once per day.
pub const ALERT_THRESHOLDS: [u8; 5] = [25, 50, 75, 85, 95];

/// One accounting event. Two-phase runs emit an estimated input first and a
/// signed correction plus real output at completion; the message counter only
/// moves when `input_tokens > 0`, so the pair counts as a single message.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub chat_id: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub source: String,
    pub agent_id: String,
    pub cost_usd: Option<f64>,
}

pub type AlertSink = Box<dyn Fn(u8, f64) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct TrackerStats {
    pub date: String,
    pub input: u64,
    pub output: u64,
    pub messages: u64,
    pub total_cost_usd: f64,
    pub budget_daily: u64,
    pub budget_pct: f64,
    /// Per-agent token totals, highest first.
    pub agents: Vec<(String, u64)>,
}

/// Daily token accounting with coarse budget gating.
pub struct TokenTracker {
    store: UsageStore,
    state: Mutex<UsageState>,
    budget_daily: u64,
    quotas: HashMap<String, u64>,
    alert: Mutex<Option<AlertSink>>,
}

impl TokenTracker {
    pub fn new(store: UsageStore, budget_daily: u64, quotas: HashMap<String, u64>) -> Self {
        let state = store.load();
        Self {
            store,
            state: Mutex::new(state),
            budget_daily,
            quotas,
            alert: Mutex::new(None),
        }
    }

    pub fn on_alert(&self, sink: AlertSink) {
        *self.alert.lock().expect("alert sink poisoned") = Some(sink);
    }

    fn rollover(state: &mut UsageState) {
        let today = today();
        if state.date != today {
            debug!(from = %state.date, to = %today, "Rolling over usage state");
            *state = UsageState::new(today);
        }
    }

    pub fn track(&self, event: TokenEvent) {
        let mut fired: Vec<(u8, f64)> = Vec::new();
        let snapshot = {
            let mut state = self.state.lock().expect("usage state poisoned");
            Self::rollover(&mut state);

            let chat = state
                .chats
                .entry(event.chat_id.to_string())
                .or_insert_with(Bucket::default);
            chat.apply(event.input_tokens, event.output_tokens);
            if event.input_tokens > 0 {
                chat.messages += 1;
            }

            state
                .sources
                .entry(event.source.clone())
                .or_insert_with(Bucket::default)
                .apply(event.input_tokens, event.output_tokens);
            state
                .agents
                .entry(event.agent_id.clone())
                .or_insert_with(Bucket::default)
                .apply(event.input_tokens, event.output_tokens);
            if let Some(cost) = event.cost_usd {
                state.total_cost_usd += cost;
            }

            if self.budget_daily > 0 {
                let pct = state.total_tokens() as f64 / self.budget_daily as f64 * 100.0;
                for threshold in ALERT_THRESHOLDS {
                    if pct >= threshold as f64 && !state.alerts_sent.contains(&threshold) {
                        state.alerts_sent.push(threshold);
                        fired.push((threshold, pct));
                    }
                }
            }

            state.clone()
        };

        if !fired.is_empty() {
            let alert = self.alert.lock().expect("alert sink poisoned");
            if let Some(sink) = alert.as_ref() {
                for (threshold, pct) in &fired {
                    sink(*threshold, *pct);
                }
            }
        }

        // Persistence is asynchronous and fail-soft; in-memory state stays
        // authoritative until the next successful write.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move {
                if let Err(e) = store.save(&snapshot).await {
                    warn!(error = %e, "Failed to persist usage state");
                }
            });
        }
    }

    pub fn budget_pct(&self) -> f64 {
        if self.budget_daily == 0 {
            return 0.0;
        }
        let mut state = self.state.lock().expect("usage state poisoned");
        Self::rollover(&mut state);
        state.total_tokens() as f64 / self.budget_daily as f64 * 100.0
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.budget_daily > 0 && self.budget_pct() >= 100.0
    }

    pub fn agent_quota_exceeded(&self, agent_id: &str) -> bool {
        let quota = match self.quotas.get(agent_id) {
            Some(q) if *q > 0 => *q,
            _ => return false,
        };
        let mut state = self.state.lock().expect("usage state poisoned");
        Self::rollover(&mut state);
        state
            .agents
            .get(agent_id)
            .map(|b| b.total() >= quota)
            .unwrap_or(false)
    }

    pub fn stats(&self, chat_id: Option<i64>) -> TrackerStats {
        let mut state = self.state.lock().expect("usage state poisoned");
        Self::rollover(&mut state);

        let (input, output, messages) = match chat_id {
            Some(id) => {
                let bucket = state.chats.get(&id.to_string()).cloned().unwrap_or_default();
                (bucket.input, bucket.output, bucket.messages)
            }
            None => state.chats.values().fold((0, 0, 0), |acc, b| {
                (acc.0 + b.input, acc.1 + b.output, acc.2 + b.messages)
            }),
        };

        let mut agents: Vec<(String, u64)> = state
            .agents
            .iter()
            .map(|(id, b)| (id.clone(), b.total()))
            .collect();
        agents.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let budget_pct = if self.budget_daily == 0 {
            0.0
        } else {
            state.total_tokens() as f64 / self.budget_daily as f64 * 100.0
        };

        TrackerStats {
            date: state.date.clone(),
            input,
            output,
            messages,
            total_cost_usd: state.total_cost_usd,
            budget_daily: self.budget_daily,
            budget_pct,
            agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Paths;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tracker(budget: u64) -> (TokenTracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = UsageStore::new(&paths);
        (TokenTracker::new(store, budget, HashMap::new()), dir)
    }

    fn event(chat_id: i64, input: i64, output: i64) -> TokenEvent {
        TokenEvent {
            chat_id,
            input_tokens: input,
            output_tokens: output,
            source: "chat".to_string(),
            agent_id: "claude".to_string(),
            cost_usd: None,
        }
    }

    #[test]
    fn test_budget_alert_thresholds_fire_once_in_order() {
        let (tracker, _dir) = tracker(1000);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        tracker.on_alert(Box::new(move |threshold, _pct| {
            sink.lock().unwrap().push(threshold);
        }));

        // Cumulative totals: 300, 550, 800, 900, 1000.
        for step in [300, 250, 250, 100, 100] {
            tracker.track(event(12345, step, 0));
        }

        assert_eq!(*fired.lock().unwrap(), vec![25, 50, 75, 85, 95]);

        // A further crossing fires nothing new.
        tracker.track(event(12345, 500, 0));
        assert_eq!(fired.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_two_phase_accounting_counts_one_message() {
        let (tracker, _dir) = tracker(0);
        tracker.track(event(7, 120, 0));
        tracker.track(event(7, 0, 60));
        let stats = tracker.stats(Some(7));
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.input, 120);
        assert_eq!(stats.output, 60);
    }

    #[test]
    fn test_negative_correction_applies() {
        let (tracker, _dir) = tracker(0);
        tracker.track(event(7, 1000, 0));
        tracker.track(event(7, -400, 80));
        let stats = tracker.stats(Some(7));
        assert_eq!(stats.input, 600);
        assert_eq!(stats.output, 80);
    }

    #[test]
    fn test_budget_exhaustion() {
        let (tracker, _dir) = tracker(100);
        assert!(!tracker.is_budget_exhausted());
        tracker.track(event(1, 60, 40));
        assert!(tracker.is_budget_exhausted());
        assert!((tracker.budget_pct() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_budget_means_never_exhausted() {
        let (tracker, _dir) = tracker(0);
        tracker.track(event(1, 1_000_000, 0));
        assert!(!tracker.is_budget_exhausted());
        assert_eq!(tracker.budget_pct(), 0.0);
    }

    #[test]
    fn test_agent_quota() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = UsageStore::new(&paths);
        let mut quotas = HashMap::new();
        quotas.insert("claude".to_string(), 100u64);
        let tracker = TokenTracker::new(store, 0, quotas);

        assert!(!tracker.agent_quota_exceeded("claude"));
        tracker.track(event(1, 100, 0));
        assert!(tracker.agent_quota_exceeded("claude"));
        assert!(!tracker.agent_quota_exceeded("codex"));
    }

    #[test]
    fn test_stats_aggregates_all_chats() {
        let (tracker, _dir) = tracker(0);
        tracker.track(event(1, 10, 5));
        tracker.track(event(2, 20, 5));
        let stats = tracker.stats(None);
        assert_eq!(stats.input, 30);
        assert_eq!(stats.output, 10);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.agents, vec![("claude".to_string(), 40)]);
    }

    #[test]
    fn test_cost_accumulates() {
        let (tracker, _dir) = tracker(0);
        let mut ev = event(1, 10, 5);
        ev.cost_usd = Some(0.01);
        tracker.track(ev.clone());
        tracker.track(ev);
        let stats = tracker.stats(None);
        assert!((stats.total_cost_usd - 0.02).abs() < 1e-9);
    }
}
