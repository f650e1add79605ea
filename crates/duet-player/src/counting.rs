//! Bounded exchange supervisor
//!
//! A `CountingPlayer` counts what it sends and receives. The initiator stops
//! answering once both counts reach the limit; a responder never does and
//! relies on being stopped from outside.

use crate::player::{PlayerCore, PlayerState};
use async_trait::async_trait;
use duet_core::{Message, Result};
use duet_transport::{MessageHandler, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info};

/// Messages each way before the initiator stops
pub const DEFAULT_MAX_MESSAGES: i32 = 10;

/// Default interval for `wait_for_stop_condition`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Termination predicate
///
/// True only for the initiator, once it has both sent and received at least
/// `max_messages`.
pub fn stop_condition(is_initiator: bool, sent: i32, received: i32, max_messages: i32) -> bool {
    is_initiator && sent >= max_messages && received >= max_messages
}

/// Counts reported at the end of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub initiator: bool,
    pub sent: i32,
    pub received: i32,
    pub max_messages: i32,
    pub stop_condition_met: bool,
    pub state: PlayerState,
}

struct CountingInner {
    core: PlayerCore,
    is_initiator: bool,
    max_messages: i32,
    received: AtomicI32,
}

impl CountingInner {
    /// The outgoing counter doubles as the sent count
    fn sent_count(&self) -> i32 {
        self.core.counter()
    }

    fn received_count(&self) -> i32 {
        self.received.load(Ordering::SeqCst)
    }

    fn should_stop(&self) -> bool {
        stop_condition(
            self.is_initiator,
            self.sent_count(),
            self.received_count(),
            self.max_messages,
        )
    }
}

/// Player that stops answering after a bounded exchange
pub struct CountingPlayer {
    inner: Arc<CountingInner>,
}

impl CountingPlayer {
    /// Create a player with the default limit of 10 messages each way
    pub fn new(name: impl Into<String>, transport: impl Transport, is_initiator: bool) -> Self {
        Self::with_max_messages(name, transport, is_initiator, DEFAULT_MAX_MESSAGES)
    }

    /// Create a player with a custom limit
    pub fn with_max_messages(
        name: impl Into<String>,
        transport: impl Transport,
        is_initiator: bool,
        max_messages: i32,
    ) -> Self {
        let inner = Arc::new(CountingInner {
            core: PlayerCore::new(name.into(), Box::new(transport)),
            is_initiator,
            max_messages,
            received: AtomicI32::new(0),
        });
        inner.core.register(Arc::new(CountingResponder {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Player name
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Whether this player started the exchange and owns the stop decision
    pub fn is_initiator(&self) -> bool {
        self.inner.is_initiator
    }

    /// Messages each way before the initiator stops
    pub fn max_messages(&self) -> i32 {
        self.inner.max_messages
    }

    /// Messages sent, equal to the last outgoing counter
    pub fn sent_count(&self) -> i32 {
        self.inner.sent_count()
    }

    /// Messages received
    pub fn received_count(&self) -> i32 {
        self.inner.received_count()
    }

    /// Whether the session is over for this player; never true for a responder
    pub fn should_stop(&self) -> bool {
        self.inner.should_stop()
    }

    /// Lifecycle state
    pub fn state(&self) -> PlayerState {
        self.inner.core.state()
    }

    /// Snapshot of the counts for reporting
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            name: self.name().to_string(),
            initiator: self.is_initiator(),
            sent: self.sent_count(),
            received: self.received_count(),
            max_messages: self.max_messages(),
            stop_condition_met: self.should_stop(),
            state: self.state(),
        }
    }

    /// Send a message with the next counter value
    pub async fn send_message(&self, content: impl Into<String>) -> Result<()> {
        self.inner.core.send_message(content.into()).await.map(|_| ())
    }

    /// Poll the stop condition every `poll_interval` until it holds
    ///
    /// Never returns for a responder; wrap it in a timeout or a select if the
    /// caller needs another way out.
    pub async fn wait_for_stop_condition(&self, poll_interval: Duration) {
        while !self.should_stop() {
            tokio::time::sleep(poll_interval).await;
        }
        info!(
            "[{}] Stop condition reached: sent {}, received {}",
            self.name(),
            self.sent_count(),
            self.received_count()
        );
    }

    /// Start the owned transport
    pub async fn start(&self) -> Result<()> {
        self.inner.core.start().await
    }

    /// Stop the owned transport
    pub async fn stop(&self) {
        self.inner.core.stop().await
    }
}

struct CountingResponder {
    inner: Weak<CountingInner>,
}

#[async_trait]
impl MessageHandler for CountingResponder {
    async fn on_message(&self, message: Message) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.received.fetch_add(1, Ordering::SeqCst);
        let name = inner.core.name();
        info!("[{}] Received: {}", name, message);

        if inner.should_stop() {
            info!("[{}] Stop condition met, not responding", name);
            return;
        }

        let response = format!("{}{}", message.content(), inner.sent_count());
        if let Err(e) = inner.core.send_message(response).await {
            error!("[{}] Failed to respond: {}", name, e);
        }
    }
}
