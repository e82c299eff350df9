use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use relay_core::{
    topic_key, InboundEvent, InboundKind, MediaKind, OutboundMessage, OutboundPayload,
};
use relay_storage::{EventKind, EventRole};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::memory_service::MemoryService;
use crate::queue::TopicQueue;
use crate::runner::{AgentRunner, ChatRun};
use crate::tasks::BackgroundTasks;
use crate::tracker::TokenTracker;
use crate::traits::{CronControl, Egress, Transcriber};

static ATTACHMENT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[attachment:([^\]]+)\]").expect("attachment regex is valid"));

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Ingress loop: allow-list filter, slash commands, and the per-topic queue
/// feeding the runner. Everything user-visible flows back out through the
/// egress handle.
pub struct Dispatcher {
    pub(crate) runner: Arc<AgentRunner>,
    pub(crate) memory: Arc<MemoryService>,
    pub(crate) tracker: Arc<TokenTracker>,
    pub(crate) tasks: Arc<BackgroundTasks>,
    pub(crate) queue: Arc<TopicQueue>,
    pub(crate) egress: Arc<dyn Egress>,
    pub(crate) transcriber: Option<Arc<dyn Transcriber>>,
    pub(crate) cron: OnceCell<Arc<dyn CronControl>>,
    pub(crate) allow_from: Vec<i64>,
    pub(crate) media_dir: PathBuf,
    /// When set, chat runs go through the background task manager instead of
    /// the per-topic queue: same-thread chaining, typing heartbeats, `/status`
    /// visibility.
    pub(crate) parallel: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<AgentRunner>,
        memory: Arc<MemoryService>,
        tracker: Arc<TokenTracker>,
        tasks: Arc<BackgroundTasks>,
        queue: Arc<TopicQueue>,
        egress: Arc<dyn Egress>,
        transcriber: Option<Arc<dyn Transcriber>>,
        allow_from: Vec<i64>,
        media_dir: PathBuf,
        parallel: bool,
    ) -> Self {
        Self {
            runner,
            memory,
            tracker,
            tasks,
            queue,
            egress,
            transcriber,
            cron: OnceCell::new(),
            allow_from,
            media_dir,
            parallel,
        }
    }

    /// Wire the cron scheduler's command surface. Called once at startup.
    pub fn set_cron(&self, cron: Arc<dyn CronControl>) {
        let _ = self.cron.set(cron);
    }

    pub async fn run_loop(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                maybe = inbound_rx.recv() => match maybe {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("Dispatcher stopped accepting ingress");
    }

    pub async fn handle(self: &Arc<Self>, event: InboundEvent) {
        if !self.allowed(event.user_id) {
            warn!(user_id = event.user_id, chat_id = event.chat_id, "Dropping message from unlisted sender");
            return;
        }

        match event.kind.clone() {
            InboundKind::Text { text } => {
                let trimmed = text.trim();
                if trimmed.starts_with('/') {
                    let key = self.runner.thread_key_for(&ChatRun::text(
                        event.chat_id,
                        event.topic_id,
                        trimmed,
                    ));
                    self.memory
                        .capture(&key, EventRole::User, EventKind::Command, trimmed);
                    let reply = commands::handle(self, &event, trimmed).await;
                    self.reply_text(event.chat_id, event.topic_id, &reply).await;
                } else {
                    self.enqueue_chat(
                        event.chat_id,
                        event.topic_id,
                        text,
                        EventKind::Text,
                        Vec::new(),
                    );
                }
            }
            InboundKind::Media { kind, path, caption } => {
                self.handle_media(&event, kind, path, caption).await;
            }
        }
    }

    async fn handle_media(
        self: &Arc<Self>,
        event: &InboundEvent,
        kind: MediaKind,
        path: PathBuf,
        caption: Option<String>,
    ) {
        if !self.path_sanctioned(&path) {
            warn!(path = %path.display(), "Rejecting attachment outside the media directory");
            self.reply_text(
                event.chat_id,
                event.topic_id,
                "Attachment rejected: file is outside the managed media directory.",
            )
            .await;
            return;
        }

        match kind {
            MediaKind::Voice | MediaKind::Audio => {
                let transcriber = match &self.transcriber {
                    Some(t) => t.clone(),
                    None => {
                        self.reply_text(
                            event.chat_id,
                            event.topic_id,
                            "Voice transcription is not configured.",
                        )
                        .await;
                        return;
                    }
                };
                match transcriber.transcribe(&path).await {
                    Ok(transcript) if !transcript.trim().is_empty() => {
                        let prompt = match caption {
                            Some(c) if !c.trim().is_empty() => format!("{}\n\n{}", c, transcript),
                            _ => transcript,
                        };
                        self.enqueue_chat(
                            event.chat_id,
                            event.topic_id,
                            prompt,
                            EventKind::Audio,
                            Vec::new(),
                        );
                    }
                    Ok(_) => {
                        self.reply_text(
                            event.chat_id,
                            event.topic_id,
                            "The voice note came back empty from transcription.",
                        )
                        .await;
                    }
                    Err(e) => {
                        error!(error = %e, "Transcription failed");
                        self.reply_text(
                            event.chat_id,
                            event.topic_id,
                            "Could not transcribe the voice note.",
                        )
                        .await;
                    }
                }
            }
            MediaKind::Image => {
                let prompt =
                    caption.unwrap_or_else(|| "Describe the attached image.".to_string());
                self.enqueue_chat(
                    event.chat_id,
                    event.topic_id,
                    prompt,
                    EventKind::Image,
                    vec![path],
                );
            }
            MediaKind::Document => {
                let prompt =
                    caption.unwrap_or_else(|| "Summarize the attached document.".to_string());
                self.enqueue_chat(
                    event.chat_id,
                    event.topic_id,
                    prompt,
                    EventKind::Document,
                    vec![path],
                );
            }
        }
    }

    /// Queue a chat run on its topic key. Capture happens inside the queued
    /// job, so memory events land in conversational order.
    pub(crate) fn enqueue_chat(
        self: &Arc<Self>,
        chat_id: i64,
        topic_id: Option<i64>,
        prompt: String,
        kind: EventKind,
        attachments: Vec<PathBuf>,
    ) {
        if self.tracker.is_budget_exhausted() {
            let this = self.clone();
            tokio::spawn(async move {
                this.reply_text(
                    chat_id,
                    topic_id,
                    "The daily token budget is exhausted; service resumes tomorrow.",
                )
                .await;
            });
            return;
        }

        let mut run = ChatRun::text(chat_id, topic_id, &prompt);
        run.kind = kind;
        run.attachments = attachments;

        if self.parallel {
            let thread_key = self.runner.thread_key_for(&run);
            self.memory
                .capture(&thread_key, EventRole::User, kind, &prompt);
            let this = self.clone();
            self.tasks.spawn(
                self.runner.clone(),
                self.egress.clone(),
                run,
                move |result| async move {
                    match result {
                        Ok(text) => {
                            this.memory.capture(
                                &thread_key,
                                EventRole::Assistant,
                                EventKind::Text,
                                &text,
                            );
                            this.deliver(chat_id, topic_id, &text).await;
                        }
                        Err(e) => {
                            error!(chat_id, topic = ?topic_id, error = %e, "Background chat run failed");
                            this.reply_text(chat_id, topic_id, &format!("Agent failed: {}", e))
                                .await;
                        }
                    }
                },
            );
            return;
        }

        let key = topic_key(chat_id, topic_id);
        let this = self.clone();
        self.queue.enqueue(&key, async move {
            this.egress.typing(chat_id, topic_id).await;

            let thread_key = this.runner.thread_key_for(&run);
            this.memory
                .capture(&thread_key, EventRole::User, kind, &prompt);

            match this.runner.run_chat(&run).await {
                Ok(text) => {
                    this.memory
                        .capture(&thread_key, EventRole::Assistant, EventKind::Text, &text);
                    this.deliver(chat_id, topic_id, &text).await;
                }
                Err(e) => {
                    error!(chat_id, topic = ?topic_id, error = %e, "Chat run failed");
                    this.reply_text(chat_id, topic_id, &format!("Agent failed: {}", e))
                        .await;
                }
            }
        });
    }

    /// Send a response, peeling `[attachment:...]` tokens off into separate
    /// media messages.
    async fn deliver(&self, chat_id: i64, topic_id: Option<i64>, text: &str) {
        let (body, files) = split_reply(text);
        if !body.is_empty() {
            self.reply_text(chat_id, topic_id, &body).await;
        }
        for file in files {
            if !file.is_file() {
                debug!(path = %file.display(), "Skipping missing attachment from agent reply");
                continue;
            }
            let payload = if is_image(&file) {
                OutboundPayload::Image(file)
            } else {
                OutboundPayload::Document(file)
            };
            let msg = OutboundMessage {
                chat_id,
                topic_id,
                payload,
            };
            if let Err(e) = self.egress.send(msg).await {
                warn!(error = %e, "Failed to deliver attachment");
            }
        }
    }

    pub(crate) async fn reply_text(&self, chat_id: i64, topic_id: Option<i64>, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if let Err(e) = self
            .egress
            .send(OutboundMessage::text(chat_id, topic_id, text))
            .await
        {
            error!(error = %e, chat_id, "Failed to send reply");
        }
    }

    fn allowed(&self, user_id: i64) -> bool {
        self.allow_from.is_empty() || self.allow_from.contains(&user_id)
    }

    fn path_sanctioned(&self, path: &Path) -> bool {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.media_dir.canonicalize() {
            Ok(dir) => canonical.starts_with(dir),
            Err(_) => false,
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Split an agent reply into its text body and any `[attachment:...]` paths.
fn split_reply(text: &str) -> (String, Vec<PathBuf>) {
    let mut files = Vec::new();
    for capture in ATTACHMENT_TOKEN.captures_iter(text) {
        if let Some(path) = capture.get(1) {
            files.push(PathBuf::from(path.as_str().trim()));
        }
    }
    let body = ATTACHMENT_TOKEN.replace_all(text, "").trim().to_string();
    (body, files)
}
