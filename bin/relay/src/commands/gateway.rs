use anyhow::Context;
use relay_agents::AdapterRegistry;
use relay_channels::{CommandTranscriber, TelegramChannel, TelegramEgress};
use relay_core::{Config, OutboundMessage, Paths};
use relay_engine::{
    AgentRunner, BackgroundTasks, Dispatcher, Egress, MediaReaper, MemoryService, OverrideStore,
    SettingsStore, TokenTracker, TopicQueue, Transcriber,
};
use relay_scheduler::CronService;
use relay_storage::{MemoryStore, ThreadStore, UsageStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const INBOUND_BUFFER: usize = 256;
const TASK_TTL: Duration = Duration::from_secs(3600);
const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire everything together and run until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let mut config = Config::load_or_default(&paths)?;
    config.limits.apply_env();
    let token = config
        .telegram_token()
        .context("Telegram bot token not configured; set TELEGRAM_BOT_TOKEN or telegram.token in config.json")?;

    let limits = config.limits.clone();
    let registry = AdapterRegistry::builtin();
    if !registry.contains(&config.agent) {
        warn!(
            agent = %config.agent,
            available = %registry.ids().join(", "),
            "Configured default agent is not a registered adapter; runs will fall back to a registered one"
        );
    }
    let threads = ThreadStore::load(&paths)?;
    let settings = SettingsStore::new(&paths, config.clone());
    let overrides = OverrideStore::load(&paths)?;
    let tracker = Arc::new(TokenTracker::new(
        UsageStore::new(&paths),
        limits.token_budget_daily,
        config.agent_quotas.clone(),
    ));
    let memory = Arc::new(MemoryService::new(
        MemoryStore::new(paths.clone()),
        paths.clone(),
        &limits,
    ));
    let runner = Arc::new(AgentRunner::new(
        limits.clone(),
        registry,
        threads,
        settings,
        overrides,
        tracker.clone(),
        memory.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (shutdown_tx, _) = broadcast::channel(8);

    let channel = Arc::new(TelegramChannel::new(
        token.clone(),
        paths.media_dir(),
        inbound_tx,
    ));
    let egress: Arc<dyn Egress> = Arc::new(TelegramEgress::new(token));

    // Budget alerts go to the cron chat, falling back to the first
    // allow-listed user.
    if let Some(alert_chat) = config.cron_chat_id.or_else(|| config.allow_from.first().copied()) {
        let alert_egress = egress.clone();
        tracker.on_alert(Box::new(move |threshold, pct| {
            let egress = alert_egress.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let text = format!(
                        "Daily token budget at {:.0}% (crossed the {}% threshold).",
                        pct, threshold
                    );
                    if let Err(e) = egress
                        .send(OutboundMessage::text(alert_chat, None, &text))
                        .await
                    {
                        warn!(error = %e, "Failed to deliver budget alert");
                    }
                });
            }
        }));
    }

    let transcriber: Option<Arc<dyn Transcriber>> = config
        .transcribe_command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .map(|c| Arc::new(CommandTranscriber::new(c)) as Arc<dyn Transcriber>);

    let tasks = Arc::new(BackgroundTasks::new(TASK_TTL));
    let queue = Arc::new(TopicQueue::new());
    let dispatcher = Arc::new(Dispatcher::new(
        runner.clone(),
        memory.clone(),
        tracker.clone(),
        tasks.clone(),
        queue.clone(),
        egress.clone(),
        transcriber,
        config.allow_from.clone(),
        paths.media_dir(),
        config.parallel,
    ));

    let cron = Arc::new(CronService::new(
        paths.clone(),
        runner,
        egress,
        tracker,
        memory,
        limits.cron_budget_gate_pct,
        config.cron_chat_id,
    ));
    match cron.load().await {
        Ok(count) => info!(count, "Cron jobs loaded"),
        Err(e) => warn!(error = %e, "Failed to load cron jobs"),
    }
    dispatcher.set_cron(cron.clone());

    let reaper = MediaReaper::new(
        paths.media_dir(),
        limits.media_ttl_hours,
        limits.media_cleanup_interval_ms,
    );

    tokio::spawn(channel.run_loop(shutdown_tx.subscribe()));
    tokio::spawn(dispatcher.run_loop(inbound_rx, shutdown_tx.subscribe()));
    tokio::spawn(cron.run_loop(shutdown_tx.subscribe()));
    tokio::spawn(tasks.clone().reap_loop(shutdown_tx.subscribe()));
    tokio::spawn(reaper.run_loop(shutdown_tx.subscribe()));

    info!("relay gateway running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    // Stop ingress and the scheduler, then race the drain against a timeout.
    info!("Shutting down: draining pending work");
    let _ = shutdown_tx.send(());
    let drained =
        queue.drain(QUEUE_DRAIN_TIMEOUT).await && tasks.drain(TASK_DRAIN_TIMEOUT).await;
    if drained {
        info!("Drained cleanly");
    } else {
        warn!("Drain timed out; forcing exit");
    }
    Ok(())
}
