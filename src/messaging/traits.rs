//! Messaging trait shared by channel adapters.

use crate::{AttachmentRef, InboundMessage, ReplyTarget};

use futures::Stream;

use std::future::Future;
use std::pin::Pin;

/// Stream of inbound messages produced by an adapter.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// A chat channel: receives messages, sends replies and downloads files.
pub trait Messaging: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Longest text a single outbound message may carry.
    fn max_message_length(&self) -> usize;

    /// Start receiving messages.
    fn start(&self) -> impl Future<Output = crate::Result<InboundStream>> + Send;

    /// Show a transient "working" indicator in the conversation.
    fn send_typing(&self, chat_id: i64) -> impl Future<Output = crate::Result<()>> + Send;

    /// Send `text` (already escaped for the channel) as a reply.
    fn send_reply(
        &self,
        target: ReplyTarget,
        text: &str,
    ) -> impl Future<Output = crate::Result<()>> + Send;

    /// Fetch the bytes behind an attachment reference.
    fn download(
        &self,
        attachment: &AttachmentRef,
    ) -> impl Future<Output = crate::Result<Vec<u8>>> + Send;

    fn shutdown(&self) -> impl Future<Output = crate::Result<()>> + Send {
        async { Ok(()) }
    }
}
