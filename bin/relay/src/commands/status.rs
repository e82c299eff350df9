use relay_core::{Config, Paths};
use relay_storage::{MemoryStore, ThreadStore, UsageStore};

/// Print a summary of configuration and persisted state.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!("relay status");
    println!("  config root: {}", paths.base.display());
    println!("  default agent: {}", config.agent);
    println!(
        "  telegram token: {}",
        if config.telegram_token().is_some() {
            "configured"
        } else {
            "NOT SET"
        }
    );
    println!(
        "  allow list: {}",
        if config.allow_from.is_empty() {
            "open (everyone)".to_string()
        } else {
            format!("{} user(s)", config.allow_from.len())
        }
    );
    println!("  dispatch mode: {}", if config.parallel { "parallel" } else { "queued" });

    if let Ok(threads) = ThreadStore::load(&paths) {
        println!("  active sessions: {}", threads.len());
    }

    let usage = UsageStore::new(&paths).load();
    println!(
        "  usage {}: {} tokens, ${:.4}",
        usage.date,
        usage.total_tokens(),
        usage.total_cost_usd
    );
    if config.limits.token_budget_daily > 0 {
        println!(
            "  daily budget: {} tokens, gate for cron at {:.0}%",
            config.limits.token_budget_daily, config.limits.cron_budget_gate_pct
        );
    }

    let memory = MemoryStore::new(paths.clone());
    println!("  memory events: {}", memory.event_count());
    if let Some(state) = memory.curation_state() {
        println!(
            "  last curation: {} ({} bytes)",
            state.last_curated_at, state.bytes
        );
    }

    Ok(())
}
