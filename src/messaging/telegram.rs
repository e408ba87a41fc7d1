//! Telegram messaging adapter over the Bot API.
//!
//! Inbound messages come from long polling `getUpdates`. Replies are sent as
//! MarkdownV2, so callers must escape text with `output::markdown::escape`.

use crate::error::MessagingError;
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{AttachmentRef, InboundMessage, MessageKind, ReplyTarget};

use serde::Deserialize;
use serde::de::DeserializeOwned;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram's per-message character limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Server-side long poll timeout for `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 50;

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct TelegramAdapter {
    http: reqwest::Client,
    token: String,
    api_base: String,
    /// Shutdown signal for the polling loop.
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
    #[serde(default)]
    document: Option<FileInfo>,
    #[serde(default)]
    audio: Option<FileInfo>,
    #[serde(default)]
    voice: Option<FileInfo>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_id: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct File {
    #[serde(default)]
    file_path: Option<String>,
}

impl TelegramAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, API_BASE)
    }

    /// Point the adapter at a different Bot API server (self-hosted or test).
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> crate::Result<T> {
        call_api(&self.http, &self.api_base, &self.token, method, body).await
    }
}

async fn call_api<T: DeserializeOwned>(
    http: &reqwest::Client,
    api_base: &str,
    token: &str,
    method: &'static str,
    body: serde_json::Value,
) -> crate::Result<T> {
    let url = format!("{api_base}/bot{token}/{method}");
    let response = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|source| MessagingError::Http { method, source })?;

    // Error responses still carry a JSON body with a description.
    let parsed: ApiResponse<T> = response
        .json()
        .await
        .map_err(|source| MessagingError::Http { method, source })?;

    match parsed {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { description, .. } => Err(MessagingError::Api {
            method,
            description: description.unwrap_or_else(|| "no description".into()),
        }
        .into()),
    }
}

impl Messaging for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let http = self.http.clone();
        let api_base = self.api_base.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"],
                });
                let poll = call_api::<Vec<Update>>(&http, &api_base, &token, "getUpdates", body);

                let updates = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("telegram polling loop shutting down");
                        break;
                    }
                    result = poll => result,
                };

                let updates = match updates {
                    Ok(updates) => updates,
                    Err(error) => {
                        tracing::warn!(%error, "telegram getUpdates failed, retrying");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.message else {
                        continue;
                    };
                    if inbound_tx.send(to_inbound(message)).await.is_err() {
                        tracing::warn!("telegram inbound receiver dropped, stopping poll");
                        return;
                    }
                }
            }
        });

        tracing::info!("telegram polling started");
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(inbound_rx)))
    }

    async fn send_typing(&self, chat_id: i64) -> crate::Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn send_reply(&self, target: ReplyTarget, text: &str) -> crate::Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": target.chat_id,
                    "text": text,
                    "parse_mode": "MarkdownV2",
                    "reply_parameters": {
                        "message_id": target.message_id,
                        "allow_sending_without_reply": true,
                    },
                }),
            )
            .await?;
        Ok(())
    }

    async fn download(&self, attachment: &AttachmentRef) -> crate::Result<Vec<u8>> {
        let file: File = self
            .call(
                "getFile",
                serde_json::json!({ "file_id": attachment.file_id }),
            )
            .await?;
        let file_path = file.file_path.ok_or_else(|| {
            MessagingError::Download(format!("no file_path for {}", attachment.file_id))
        })?;

        let url = format!("{}/file/bot{}/{}", self.api_base, self.token, file_path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| MessagingError::Http {
                method: "file",
                source,
            })?;
        if !response.status().is_success() {
            return Err(MessagingError::Download(format!("HTTP {}", response.status())).into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| MessagingError::Http {
                method: "file",
                source,
            })?;
        Ok(bytes.to_vec())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }
        tracing::info!("telegram adapter shut down");
        Ok(())
    }
}

/// Reduce a Bot API message to the fields ingress uses.
fn to_inbound(message: TelegramMessage) -> InboundMessage {
    let kind = message_kind(&message);
    let reply_to_text = message
        .reply_to_message
        .and_then(|reply| reply.text.or(reply.caption));

    InboundMessage {
        chat_id: Some(message.chat.id),
        message_id: Some(message.message_id),
        sender_id: message.from.map(|user| user.id),
        text: message.text.or(message.caption),
        kind,
        reply_to_text,
    }
}

fn message_kind(message: &TelegramMessage) -> MessageKind {
    let file = |info: &FileInfo, fallback: &str| AttachmentRef {
        file_id: info.file_id.clone(),
        mime_type: info.mime_type.clone().unwrap_or_else(|| fallback.to_string()),
    };

    // Photos arrive as several sizes of the same image; take the largest.
    if let Some(largest) = message
        .photo
        .iter()
        .max_by_key(|size| u64::from(size.width) * u64::from(size.height))
    {
        return MessageKind::Photo(AttachmentRef {
            file_id: largest.file_id.clone(),
            mime_type: "image/jpeg".into(),
        });
    }
    if let Some(document) = &message.document {
        return MessageKind::Document(file(document, "application/octet-stream"));
    }
    if let Some(audio) = &message.audio {
        return MessageKind::Audio(file(audio, "audio/mpeg"));
    }
    if let Some(voice) = &message.voice {
        return MessageKind::Voice(file(voice, "audio/ogg"));
    }
    if message.text.is_some() {
        return MessageKind::Text;
    }
    MessageKind::Other
}
