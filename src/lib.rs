//! Courier: correlates chat messages with queued agent jobs using only the
//! filesystem.
//!
//! Ingress persists each admitted message into a directory, submits a job to
//! an external queue and links the queue's job id back to the directory.
//! Egress watches the queue's terminal directories, resolves finished jobs
//! through that link and delivers the captured output as replies.

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod messaging;
pub mod output;
pub mod queue;
pub mod store;

pub use error::{Error, Result};

/// Channel literal used in message keys and `meta.json`.
pub const CHANNEL: &str = "telegram";

/// An inbound chat message, reduced to what ingress needs.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub sender_id: Option<i64>,
    /// Message text, or the caption of a media message.
    pub text: Option<String>,
    pub kind: MessageKind,
    /// Text of the message this one replies to, if any.
    pub reply_to_text: Option<String>,
}

impl InboundMessage {
    /// Text with surrounding whitespace removed, `None` when blank.
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn attachments(&self) -> Vec<AttachmentRef> {
        self.kind.attachment().into_iter().collect()
    }
}

/// Kind of an inbound message, resolved once when the update is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageKind {
    #[default]
    Text,
    Photo(AttachmentRef),
    Document(AttachmentRef),
    Audio(AttachmentRef),
    Voice(AttachmentRef),
    /// Stickers, locations, polls and anything else without a usable payload.
    Other,
}

impl MessageKind {
    pub fn attachment(&self) -> Option<AttachmentRef> {
        match self {
            MessageKind::Photo(attachment)
            | MessageKind::Document(attachment)
            | MessageKind::Audio(attachment)
            | MessageKind::Voice(attachment) => Some(attachment.clone()),
            MessageKind::Text | MessageKind::Other => None,
        }
    }
}

/// Reference to a downloadable file on the channel side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub file_id: String,
    pub mime_type: String,
}

/// Where a reply goes: the conversation and the message being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub chat_id: i64,
    pub message_id: i64,
}
