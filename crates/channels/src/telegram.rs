use relay_core::{Error, InboundEvent, InboundKind, MediaKind, OutboundMessage, OutboundPayload, Result};
use relay_engine::Egress;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::format;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u32 = 30;

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<User>,
    chat: Chat,
    message_thread_id: Option<i64>,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<PhotoSize>>,
    voice: Option<Voice>,
    audio: Option<Audio>,
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    width: i32,
    height: i32,
}

#[derive(Debug, Deserialize)]
struct Voice {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct Audio {
    file_id: String,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Document {
    file_id: String,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    file_path: Option<String>,
}

/// Long-polling ingress side of the Telegram Bot API.
pub struct TelegramChannel {
    token: String,
    client: Client,
    inbound_tx: mpsc::Sender<InboundEvent>,
    media_dir: PathBuf,
}

impl TelegramChannel {
    pub fn new(token: String, media_dir: PathBuf, inbound_tx: mpsc::Sender<InboundEvent>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS as u64 + 30))
            .build()
            .unwrap_or_default();
        let _ = std::fs::create_dir_all(&media_dir);
        Self {
            token,
            client,
            inbound_tx,
            media_dir,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut params = vec![("timeout", LONG_POLL_SECS.to_string())];
        if let Some(off) = offset {
            params.push(("offset", off.to_string()));
        }

        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("getUpdates failed: {}", e)))?;

        let parsed: TelegramResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("getUpdates parse failed: {}", e)))?;

        if !parsed.ok {
            return Err(Error::Transport(
                parsed.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(parsed.result.unwrap_or_default())
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!("Telegram channel started");
        let mut offset: Option<i64> = None;

        loop {
            tokio::select! {
                result = self.get_updates(offset) => match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = Some(update.update_id + 1);
                            if let Some(message) = update.message {
                                self.handle_message(message).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Polling error; backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Telegram channel shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        let user_id = match &message.from {
            Some(user) => user.id,
            None => return,
        };
        let chat_id = message.chat.id;
        let topic_id = message.message_thread_id;

        let kind = if let Some(text) = &message.text {
            Some(InboundKind::Text { text: text.clone() })
        } else if let Some(photos) = &message.photo {
            // Largest rendition wins; a message carrying both a photo and a
            // document resolves as a photo.
            let best = photos.iter().max_by_key(|p| p.width * p.height);
            match best {
                Some(photo) => self
                    .download(&photo.file_id, Some("jpg"))
                    .await
                    .map(|path| InboundKind::Media {
                        kind: MediaKind::Image,
                        path,
                        caption: message.caption.clone(),
                    }),
                None => None,
            }
        } else if let Some(voice) = &message.voice {
            self.download(&voice.file_id, Some("ogg"))
                .await
                .map(|path| InboundKind::Media {
                    kind: MediaKind::Voice,
                    path,
                    caption: message.caption.clone(),
                })
        } else if let Some(audio) = &message.audio {
            self.download(&audio.file_id, extension_of(audio.file_name.as_deref()))
                .await
                .map(|path| InboundKind::Media {
                    kind: MediaKind::Audio,
                    path,
                    caption: message.caption.clone(),
                })
        } else if let Some(document) = &message.document {
            self.download(&document.file_id, extension_of(document.file_name.as_deref()))
                .await
                .map(|path| InboundKind::Media {
                    kind: MediaKind::Document,
                    path,
                    caption: message.caption.clone(),
                })
        } else {
            None
        };

        let Some(kind) = kind else {
            debug!(chat_id, "Ignoring unsupported or undownloadable message");
            return;
        };

        let event = InboundEvent {
            chat_id,
            topic_id,
            user_id,
            kind,
            timestamp_ms: chrono_now_ms(),
        };
        if self.inbound_tx.send(event).await.is_err() {
            warn!("Inbound channel closed; dropping message");
        }
    }

    /// Resolve and download a file into the media directory.
    async fn download(&self, file_id: &str, extension: Option<&str>) -> Option<PathBuf> {
        let response = self
            .client
            .get(self.api_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await
            .ok()?;
        let parsed: TelegramResponse<FileResponse> = response.json().await.ok()?;
        let remote_path = parsed.result?.file_path?;

        let url = format!("{}/file/bot{}/{}", TELEGRAM_API_BASE, self.token, remote_path);
        let bytes = self.client.get(&url).send().await.ok()?.bytes().await.ok()?;

        let ext = extension
            .map(str::to_string)
            .or_else(|| {
                Path::new(&remote_path)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "bin".to_string());
        let local = self
            .media_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), ext));
        match tokio::fs::write(&local, &bytes).await {
            Ok(()) => Some(local),
            Err(e) => {
                error!(error = %e, "Failed to store downloaded media");
                None
            }
        }
    }
}

fn extension_of(file_name: Option<&str>) -> Option<&str> {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|e| e.to_str())
}

fn chrono_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Outbound side of the Telegram Bot API.
pub struct TelegramEgress {
    token: String,
    client: Client,
}

impl TelegramEgress {
    pub fn new(token: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { token, client }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    async fn call(&self, method: &str, params: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} failed: {}", method, e)))?;
        let parsed: TelegramResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("{} parse failed: {}", method, e)))?;
        if !parsed.ok {
            return Err(Error::Transport(format!(
                "{}: {}",
                method,
                parsed.description.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(())
    }

    async fn send_file(
        &self,
        method: &str,
        field: &str,
        chat_id: i64,
        topic_id: Option<i64>,
        path: &Path,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Transport(format!("cannot read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);
        if let Some(topic) = topic_id {
            form = form.text("message_thread_id", topic.to_string());
        }

        let response = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} failed: {}", method, e)))?;
        let parsed: TelegramResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("{} parse failed: {}", method, e)))?;
        if !parsed.ok {
            return Err(Error::Transport(format!(
                "{}: {}",
                method,
                parsed.description.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Egress for TelegramEgress {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        match &msg.payload {
            OutboundPayload::Text(text) => {
                let html = format::to_html(text);
                for chunk in format::chunks(&html, format::MESSAGE_LIMIT) {
                    let mut params = serde_json::json!({
                        "chat_id": msg.chat_id,
                        "text": chunk,
                        "parse_mode": "HTML",
                        "disable_web_page_preview": true,
                    });
                    if let Some(topic) = msg.topic_id {
                        params["message_thread_id"] = serde_json::json!(topic);
                    }
                    // HTML can be cut mid-tag by chunking; retry as plain text.
                    if self.call("sendMessage", &params).await.is_err() {
                        if let Some(obj) = params.as_object_mut() {
                            obj.remove("parse_mode");
                        }
                        self.call("sendMessage", &params).await?;
                    }
                }
                Ok(())
            }
            OutboundPayload::Image(path) => {
                self.send_file("sendPhoto", "photo", msg.chat_id, msg.topic_id, path)
                    .await
            }
            OutboundPayload::Document(path) => {
                self.send_file("sendDocument", "document", msg.chat_id, msg.topic_id, path)
                    .await
            }
        }
    }

    async fn typing(&self, chat_id: i64, topic_id: Option<i64>) {
        let mut params = serde_json::json!({
            "chat_id": chat_id,
            "action": "typing",
        });
        if let Some(topic) = topic_id {
            params["message_thread_id"] = serde_json::json!(topic);
        }
        if let Err(e) = self.call("sendChatAction", &params).await {
            debug!(error = %e, "Typing indicator failed");
        }
    }
}
