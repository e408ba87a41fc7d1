//! Ingress: admit an inbound message, persist it into the message store,
//! submit a dispatch job to the queue and link the job back to the message.
//!
//! The steps run strictly in order and `meta.json` is written last. Egress
//! treats a message directory without `meta.json` as not yet committed.

use crate::config::Config;
use crate::error::Error;
use crate::messaging::{InboundStream, Messaging};
use crate::queue::JobQueue;
use crate::store::{MessageDir, MessageKey, MessageMeta, MessageStore};
use crate::{CHANNEL, InboundMessage, ReplyTarget};

use futures::StreamExt as _;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Why a message was turned away before anything touched the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SenderNotAllowed,
    MissingIdentifiers,
    Empty,
}

/// Result of submitting one message.
#[derive(Debug)]
pub enum IngressOutcome {
    /// Persisted, queued, linked and committed.
    Enqueued { job_id: String, directory: PathBuf },
    /// Failed the admission filter. Nothing was written.
    Rejected(Rejection),
    /// Only attachments, none of which could be downloaded. The message
    /// directory was removed again.
    RolledBack,
    /// Something failed after admission. Whatever was already written stays
    /// on disk for inspection.
    Failed(Error),
}

/// A message that passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub key: MessageKey,
    pub target: ReplyTarget,
    pub sender_id: i64,
}

pub struct Enqueuer<M, Q> {
    messaging: Arc<M>,
    queue: Q,
    store: MessageStore,
    config: Config,
    self_exe: PathBuf,
}

impl<M: Messaging, Q: JobQueue> Enqueuer<M, Q> {
    /// `self_exe` is the binary the queue runs to dispatch a job.
    pub fn new(
        messaging: Arc<M>,
        queue: Q,
        store: MessageStore,
        config: &Config,
        self_exe: PathBuf,
    ) -> Self {
        Self {
            messaging,
            queue,
            store,
            config: config.clone(),
            self_exe,
        }
    }

    /// Admission filter. Pure: no I/O.
    pub fn admit(&self, message: &InboundMessage) -> Result<Admitted, Rejection> {
        let sender_id = message
            .sender_id
            .filter(|sender| self.config.is_allowed(*sender))
            .ok_or(Rejection::SenderNotAllowed)?;

        let (Some(chat_id), Some(message_id)) = (message.chat_id, message.message_id) else {
            return Err(Rejection::MissingIdentifiers);
        };

        if message.trimmed_text().is_none() && message.kind.attachment().is_none() {
            return Err(Rejection::Empty);
        }

        Ok(Admitted {
            key: MessageKey::for_message(chat_id, message_id),
            target: ReplyTarget {
                chat_id,
                message_id,
            },
            sender_id,
        })
    }

    /// Run the whole ingress pipeline for one message. Never fails: every
    /// problem is logged and reported through the outcome.
    pub async fn submit(&self, message: &InboundMessage) -> IngressOutcome {
        let admitted = match self.admit(message) {
            Ok(admitted) => admitted,
            Err(rejection) => {
                tracing::info!(
                    ?rejection,
                    sender_id = ?message.sender_id,
                    chat_id = ?message.chat_id,
                    "message rejected"
                );
                return IngressOutcome::Rejected(rejection);
            }
        };

        match self.persist_and_enqueue(message, &admitted).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, key = %admitted.key, "failed to enqueue message");
                IngressOutcome::Failed(error)
            }
        }
    }

    async fn persist_and_enqueue(
        &self,
        message: &InboundMessage,
        admitted: &Admitted,
    ) -> crate::Result<IngressOutcome> {
        let dir = self.store.create(&admitted.key).await?;

        self.send_typing(admitted.target.chat_id).await;
        let staged = self.stage_attachments(&dir, message).await;
        let text = message.trimmed_text();

        if staged.is_empty() && text.is_none() {
            tracing::warn!(key = %admitted.key, "no attachment could be downloaded, rolling back");
            if let Err(error) = dir.remove().await {
                tracing::warn!(%error, key = %admitted.key, "failed to remove message directory");
            }
            return Ok(IngressOutcome::RolledBack);
        }

        self.send_typing(admitted.target.chat_id).await;
        let prompt = assemble_prompt(message.reply_to_text.as_deref(), &staged, text);
        dir.write_prompt(&prompt).await?;

        let argv = dispatch_argv(&self.self_exe, &admitted.key);
        let job_id = self.queue.submit(&argv).await?;

        let link = self.store.job_link(&job_id)?;
        link.create(dir.path()).await?;

        dir.write_meta(&MessageMeta {
            channel: CHANNEL.to_string(),
            chat_id: admitted.target.chat_id,
            message_id: admitted.target.message_id,
            user_id: Some(admitted.sender_id),
        })
        .await?;

        tracing::info!(
            key = %admitted.key,
            job_id = %job_id,
            attachments = staged.len(),
            "message enqueued"
        );

        Ok(IngressOutcome::Enqueued {
            job_id,
            directory: dir.path().to_path_buf(),
        })
    }

    /// Download every attachment, skipping the ones that fail.
    async fn stage_attachments(&self, dir: &MessageDir, message: &InboundMessage) -> Vec<PathBuf> {
        let mut staged = Vec::new();

        for (position, attachment) in message.attachments().iter().enumerate() {
            let index = position + 1;
            let data = match self.messaging.download(attachment).await {
                Ok(data) => data,
                Err(error) => {
                    tracing::warn!(%error, file_id = %attachment.file_id, "failed to download attachment");
                    continue;
                }
            };

            match dir.write_attachment(index, &attachment.mime_type, &data).await {
                Ok(path) => {
                    tracing::debug!(path = %path.display(), size = data.len(), "attachment staged");
                    staged.push(path);
                }
                Err(error) => {
                    tracing::warn!(%error, file_id = %attachment.file_id, "failed to store attachment");
                }
            }
        }

        staged
    }

    async fn send_typing(&self, chat_id: i64) {
        if let Err(error) = self.messaging.send_typing(chat_id).await {
            tracing::debug!(%error, chat_id, "failed to send typing indicator");
        }
    }

    /// Feed messages from `stream` through `submit`, one at a time, until the
    /// stream ends or shutdown is signalled.
    pub async fn listen(&self, mut stream: InboundStream, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(channel = self.messaging.name(), "ingress listening");

        loop {
            let message = tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                message = stream.next() => message,
            };
            let Some(message) = message else {
                tracing::warn!("inbound stream ended");
                break;
            };
            self.submit(&message).await;
        }

        tracing::info!("ingress stopped");
    }
}

/// Command line the queue runs for a message.
pub fn dispatch_argv(self_exe: &Path, key: &MessageKey) -> Vec<String> {
    vec![
        self_exe.to_string_lossy().into_owned(),
        "dispatch".into(),
        "--id".into(),
        key.to_string(),
    ]
}

/// Prompt text: quoted reply, attachment manifest, then the user's text.
pub fn assemble_prompt(quote: Option<&str>, attachments: &[PathBuf], text: Option<&str>) -> String {
    let mut sections = Vec::new();

    if let Some(quote) = quote.map(str::trim).filter(|quote| !quote.is_empty()) {
        let quoted: Vec<String> = quote.lines().map(|line| format!("> {line}")).collect();
        sections.push(quoted.join("\n"));
    }

    if !attachments.is_empty() {
        let manifest: Vec<String> = attachments
            .iter()
            .enumerate()
            .map(|(position, path)| format!("Attachment {}: {}", position + 1, path.display()))
            .collect();
        sections.push(manifest.join("\n"));
    }

    if let Some(text) = text {
        sections.push(text.to_string());
    }

    sections.join("\n\n").trim().to_string()
}
