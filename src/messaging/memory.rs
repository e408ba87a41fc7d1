//! In-memory messaging adapter.
//!
//! Inbound messages are injected with `inject_message`, outbound traffic is
//! recorded instead of sent. Used for local dry runs and by the test suite.

use crate::messaging::traits::{InboundStream, Messaging};
use crate::{AttachmentRef, InboundMessage, ReplyTarget};

use crate::error::MessagingError;

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Something the adapter was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Typing { chat_id: i64 },
    Reply { target: ReplyTarget, text: String },
}

pub struct MemoryAdapter {
    max_message_length: usize,
    sent: Mutex<Vec<Sent>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_replies: Mutex<bool>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl MemoryAdapter {
    pub fn new(max_message_length: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        Self {
            max_message_length,
            sent: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            fail_replies: Mutex::new(false),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Make `file_id` downloadable. Unknown ids fail to download.
    pub fn add_file(&self, file_id: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.lock_files().insert(file_id.into(), data.into());
    }

    /// Make every following `send_reply` fail.
    pub fn fail_replies(&self, fail: bool) {
        *self.fail_replies.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = fail;
    }

    pub async fn inject_message(&self, message: InboundMessage) -> crate::Result<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|error| anyhow::anyhow!("inbound stream closed: {error}"))?;
        Ok(())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.lock_sent().clone()
    }

    /// Only the replies, in send order.
    pub fn replies(&self) -> Vec<(ReplyTarget, String)> {
        self.lock_sent()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Reply { target, text } => Some((*target, text.clone())),
                Sent::Typing { .. } => None,
            })
            .collect()
    }

    fn lock_sent(&self) -> std::sync::MutexGuard<'_, Vec<Sent>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Messaging for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let receiver = self
            .inbound_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("memory adapter already started"))?;
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(receiver)))
    }

    async fn send_typing(&self, chat_id: i64) -> crate::Result<()> {
        self.lock_sent().push(Sent::Typing { chat_id });
        Ok(())
    }

    async fn send_reply(&self, target: ReplyTarget, text: &str) -> crate::Result<()> {
        let fail = *self
            .fail_replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fail {
            return Err(MessagingError::Api {
                method: "sendMessage",
                description: "simulated failure".into(),
            }
            .into());
        }

        self.lock_sent().push(Sent::Reply {
            target,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn download(&self, attachment: &AttachmentRef) -> crate::Result<Vec<u8>> {
        self.lock_files()
            .get(&attachment.file_id)
            .cloned()
            .ok_or_else(|| {
                MessagingError::Download(format!("unknown file id {}", attachment.file_id)).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt as _;

    #[tokio::test]
    async fn records_outbound_and_streams_injected_messages() {
        let adapter = MemoryAdapter::default();
        let mut stream = adapter.start().await.expect("start should succeed");

        adapter
            .inject_message(InboundMessage {
                chat_id: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        let received = stream.next().await.expect("message should arrive");
        assert_eq!(received.chat_id, Some(5));

        let target = ReplyTarget {
            chat_id: 5,
            message_id: 9,
        };
        adapter.send_typing(5).await.unwrap();
        adapter.send_reply(target, "hi").await.unwrap();
        assert_eq!(
            adapter.sent(),
            vec![
                Sent::Typing { chat_id: 5 },
                Sent::Reply {
                    target,
                    text: "hi".into()
                }
            ]
        );

        assert!(adapter.start().await.is_err(), "second start should fail");
    }

    #[tokio::test]
    async fn downloads_only_known_files() {
        let adapter = MemoryAdapter::default();
        adapter.add_file("known", b"bytes".to_vec());

        let known = AttachmentRef {
            file_id: "known".into(),
            mime_type: "image/jpeg".into(),
        };
        let unknown = AttachmentRef {
            file_id: "unknown".into(),
            mime_type: "image/jpeg".into(),
        };

        assert_eq!(adapter.download(&known).await.unwrap(), b"bytes");
        assert!(adapter.download(&unknown).await.is_err());
    }
}
