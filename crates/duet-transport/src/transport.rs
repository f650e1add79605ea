//! Transport abstractions
//!
//! A transport moves `Message`s to the peer player and hands incoming ones to
//! a registered `MessageHandler` on its own background task.

use async_trait::async_trait;
use duet_core::{Message, Result};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default bound on how long `stop()` waits for a background task
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiver of incoming messages
///
/// Invoked once per delivered message, always on the transport's delivery
/// task and never on the task that called `send`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called when a message is received
    async fn on_message(&self, message: Message);
}

/// Delivery mechanism connecting two players
///
/// Lifecycle is `created -> running -> stopped`. Handlers should be registered
/// before `start()`; replacing one while messages are flowing is allowed, but
/// a message already being dispatched still goes to the previous handler.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Register the handler invoked for every received message
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>);

    /// Send a message to the peer
    async fn send(&self, message: Message) -> Result<()>;

    /// Bring the transport up and spawn its delivery task
    ///
    /// Returns once the transport is ready to send.
    async fn start(&self) -> Result<()>;

    /// Stop the delivery task and release channel resources
    ///
    /// Waits a bounded time for the background task; safe to call repeatedly.
    async fn stop(&self);
}

/// Shared slot holding the registered handler
///
/// Written by the registering task and read by the delivery task.
#[derive(Clone, Default)]
pub struct HandlerSlot(Arc<RwLock<Option<Arc<dyn MessageHandler>>>>);

impl HandlerSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered handler
    pub fn set(&self, handler: Arc<dyn MessageHandler>) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(handler);
    }

    fn get(&self) -> Option<Arc<dyn MessageHandler>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand a message to the registered handler
    ///
    /// Returns false when no handler is registered and the message was dropped.
    pub async fn dispatch(&self, message: Message) -> bool {
        // Clone out of the lock so the handler never runs while it is held
        match self.get() {
            Some(handler) => {
                handler.on_message(message).await;
                true
            }
            None => {
                debug!("No handler registered, dropping {}", message);
                false
            }
        }
    }
}

/// Wait for a background task to finish, giving up after `timeout`
///
/// A task that is still running after the timeout is left detached.
pub(crate) async fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, task: &str) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!("{} task exited", task),
        Ok(Err(e)) if e.is_cancelled() => debug!("{} task cancelled", task),
        Ok(Err(e)) => error!("{} task panicked: {}", task, e),
        Err(_) => warn!("{} task did not exit within {:?}", task, timeout),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::recorder;
    use super::*;

    #[tokio::test]
    async fn test_dispatch_without_handler_drops() {
        let slot = HandlerSlot::new();
        assert!(!slot.dispatch(Message::new("lost", 1)).await);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_latest_handler() {
        let slot = HandlerSlot::new();
        let (first, mut first_rx) = recorder();
        let (second, mut second_rx) = recorder();

        slot.set(first);
        assert!(slot.dispatch(Message::new("a", 1)).await);
        slot.set(second);
        assert!(slot.dispatch(Message::new("b", 2)).await);

        assert_eq!(first_rx.recv().await.unwrap().content(), "a");
        assert_eq!(second_rx.recv().await.unwrap().content(), "b");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_with_timeout_gives_up_on_stuck_task() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let started = std::time::Instant::now();
        join_with_timeout(handle, Duration::from_millis(50), "stuck").await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
