// Best-effort operator notifications
pub mod telegram;

pub use telegram::TelegramNotifier;

use async_trait::async_trait;

/// Fire-and-forget message delivery. Failures are logged by the caller, never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}
