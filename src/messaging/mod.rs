use async_trait::async_trait;

use crate::error::Error;

pub mod event;
pub mod hub;
pub mod telegram;

pub use event::{AlertResult, ClientMessage, ServerMessage};
pub use hub::AlertHub;
pub use telegram::TelegramService;

/// Secondary alert sink, invoked best-effort after the primary WebSocket
/// push. Implementations must never block the primary path.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver a compact text summary to an external target.
    async fn deliver(&self, target: &str, summary: &str) -> Result<(), Error>;
}
