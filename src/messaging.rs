//! Messaging adapters (Telegram, in-memory).

pub mod memory;
pub mod telegram;
pub mod traits;

pub use memory::MemoryAdapter;
pub use telegram::TelegramAdapter;
pub use traits::{InboundStream, Messaging};
