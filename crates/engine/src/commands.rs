use relay_core::{topic_key, InboundEvent};
use std::sync::Arc;

use crate::dispatch::Dispatcher;

const HELP: &str = "Commands:\n\
/agent [name|default] - show or set the agent for this topic\n\
/model [id|reset] - show or set the model for the current agent\n\
/thinking [level|off] - reasoning effort for the current agent\n\
/reset - start a fresh conversation with the current agent\n\
/memory - memory and curation status\n\
/usage - today's token usage\n\
/status - thread, queue, and task status\n\
/cron <list|show|assign|unassign|run|logs|reload|chatid> - scheduled jobs";

/// Handle one slash command and produce the reply text.
pub(crate) async fn handle(dispatcher: &Arc<Dispatcher>, event: &InboundEvent, text: &str) -> String {
    let mut parts = text.trim().split_whitespace();
    let head = parts.next().unwrap_or("");
    let cmd = head
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();
    let args: Vec<String> = parts.map(str::to_string).collect();

    match cmd.as_str() {
        "start" => format!(
            "relay is up. Messages in this chat go to the '{}' agent.\n\n{}",
            dispatcher.runner.settings().default_agent(),
            HELP
        ),
        "help" => HELP.to_string(),
        "agent" => agent_cmd(dispatcher, event, &args),
        "model" => model_cmd(dispatcher, event, &args).await,
        "thinking" => thinking_cmd(dispatcher, event, &args),
        "reset" => {
            let agent = dispatcher.runner.reset_thread(event.chat_id, event.topic_id);
            format!("Session reset; the next message starts a fresh '{}' conversation.", agent)
        }
        "memory" => memory_cmd(dispatcher),
        "usage" => usage_cmd(dispatcher, event),
        "status" => status_cmd(dispatcher, event),
        "cron" => match dispatcher.cron.get() {
            Some(cron) => match cron.handle(event.chat_id, event.topic_id, &args).await {
                Ok(reply) => reply,
                Err(e) => format!("Cron command failed: {}", e),
            },
            None => "The cron scheduler is not running.".to_string(),
        },
        other => format!("Unknown command '/{}'. {}", other, HELP),
    }
}

fn agent_cmd(dispatcher: &Arc<Dispatcher>, event: &InboundEvent, args: &[String]) -> String {
    let runner = &dispatcher.runner;
    let key = topic_key(event.chat_id, event.topic_id);
    match args.first().map(String::as_str) {
        None => {
            let current = runner
                .overrides()
                .get(&key)
                .unwrap_or_else(|| runner.settings().default_agent());
            format!(
                "Current agent: {} (default: {}). Available: {}",
                current,
                runner.settings().default_agent(),
                runner.registry().ids().join(", ")
            )
        }
        Some("default") => {
            runner.overrides().clear(&key);
            format!(
                "Topic override cleared; using the default agent '{}'.",
                runner.settings().default_agent()
            )
        }
        Some(name) => {
            if runner.registry().contains(name) {
                runner.overrides().set(&key, name);
                format!("This topic now talks to '{}'.", name)
            } else {
                format!(
                    "Unknown agent '{}'. Available: {}",
                    name,
                    runner.registry().ids().join(", ")
                )
            }
        }
    }
}

async fn model_cmd(dispatcher: &Arc<Dispatcher>, event: &InboundEvent, args: &[String]) -> String {
    let runner = &dispatcher.runner;
    let agent = runner
        .thread_snapshot(event.chat_id, event.topic_id)
        .agent_id;
    match args.first().map(String::as_str) {
        None => {
            let configured = runner
                .settings()
                .model_for(&agent)
                .unwrap_or_else(|| "(agent default)".to_string());
            let mut reply = format!("Model for '{}': {}", agent, configured);
            match runner.list_models(&agent).await {
                Ok(models) if !models.is_empty() => {
                    reply.push_str(&format!("\nAvailable: {}", models.join(", ")));
                }
                _ => {}
            }
            reply
        }
        Some("reset") => {
            runner.settings().clear_model(&agent);
            format!("Model for '{}' reset to the agent default.", agent)
        }
        Some(model) => {
            runner.settings().set_model(&agent, model);
            format!("Model for '{}' set to '{}'.", agent, model)
        }
    }
}

fn thinking_cmd(dispatcher: &Arc<Dispatcher>, event: &InboundEvent, args: &[String]) -> String {
    let runner = &dispatcher.runner;
    let agent = runner
        .thread_snapshot(event.chat_id, event.topic_id)
        .agent_id;
    match args.first().map(String::as_str) {
        None => format!(
            "Thinking level for '{}': {}",
            agent,
            runner
                .settings()
                .thinking_for(&agent)
                .unwrap_or_else(|| "(off)".to_string())
        ),
        Some("off") | Some("reset") => {
            runner.settings().clear_thinking(&agent);
            format!("Thinking level for '{}' cleared.", agent)
        }
        Some(level) => {
            runner.settings().set_thinking(&agent, level);
            format!("Thinking level for '{}' set to '{}'.", agent, level)
        }
    }
}

fn memory_cmd(dispatcher: &Arc<Dispatcher>) -> String {
    let store = dispatcher.memory.store();
    let mut reply = format!(
        "Memory: {} events on disk, {} captured this run.",
        store.event_count(),
        dispatcher.memory.events_captured()
    );
    match store.curation_state() {
        Some(state) => reply.push_str(&format!(
            "\nLast curation: {} ({} events, {} bytes).",
            state.last_curated_at, state.events_processed, state.bytes
        )),
        None => reply.push_str("\nNo curation has run yet."),
    }
    reply
}

fn usage_cmd(dispatcher: &Arc<Dispatcher>, event: &InboundEvent) -> String {
    let stats = dispatcher.tracker.stats(Some(event.chat_id));
    let mut reply = format!(
        "Usage {} - this chat: {} in / {} out tokens over {} messages.",
        stats.date, stats.input, stats.output, stats.messages
    );
    if stats.budget_daily > 0 {
        reply.push_str(&format!(
            "\nDaily budget: {:.1}% of {} tokens used.",
            stats.budget_pct, stats.budget_daily
        ));
    }
    if stats.total_cost_usd > 0.0 {
        reply.push_str(&format!("\nReported cost: ${:.4}.", stats.total_cost_usd));
    }
    if !stats.agents.is_empty() {
        let line = stats
            .agents
            .iter()
            .map(|(agent, tokens)| format!("{} {}", agent, tokens))
            .collect::<Vec<_>>()
            .join(", ");
        reply.push_str(&format!("\nBy agent: {}.", line));
    }
    reply
}

fn status_cmd(dispatcher: &Arc<Dispatcher>, event: &InboundEvent) -> String {
    let snapshot = dispatcher
        .runner
        .thread_snapshot(event.chat_id, event.topic_id);
    let (running, completed, failed) = dispatcher.tasks.summary();
    let session = snapshot
        .session_id
        .as_deref()
        .unwrap_or("(none)")
        .to_string();
    format!(
        "Agent: {}\nSession: {}\nTurns: {}, context ~ {} chars\nQueue: {} pending\nTasks: {} running, {} completed, {} failed",
        snapshot.agent_id,
        session,
        snapshot.turns,
        snapshot.context_chars,
        dispatcher.queue.pending(),
        running,
        completed,
        failed
    )
}
