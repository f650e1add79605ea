//! Player owning a transport

use async_trait::async_trait;
use duet_core::{DuetError, Message, Result};
use duet_transport::{MessageHandler, Transport};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{error, info};

/// Lifecycle of a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Constructed, transport not started
    Idle,
    /// Transport started, exchanging messages
    Active,
    /// Transport stopped
    Stopped,
}

/// State shared by every player flavor
///
/// Owns the transport exclusively. Incoming messages reach the player
/// through a handler holding a `Weak` back-reference, so the transport never
/// keeps its owner alive.
pub(crate) struct PlayerCore {
    name: String,
    transport: Box<dyn Transport>,
    /// Last counter assigned; 0 before the first send
    counter: AtomicI32,
    /// Serializes counter assignment with the send itself
    send_lock: tokio::sync::Mutex<()>,
    state: Mutex<PlayerState>,
}

impl PlayerCore {
    pub(crate) fn new(name: String, transport: Box<dyn Transport>) -> Self {
        Self {
            name,
            transport,
            counter: AtomicI32::new(0),
            send_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(PlayerState::Idle),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn counter(&self) -> i32 {
        self.counter.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> PlayerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, handler: Arc<dyn MessageHandler>) {
        self.transport.set_message_handler(handler);
    }

    /// Number, log and send one message; returns the counter it carried
    pub(crate) async fn send_message(&self, content: String) -> Result<i32> {
        let _guard = self.send_lock.lock().await;
        // Only written under send_lock, so load-then-store cannot race
        let counter = self.counter.load(Ordering::SeqCst).checked_add(1).ok_or_else(|| {
            DuetError::SendError(format!("[{}] Message counter exhausted", self.name))
        })?;
        self.counter.store(counter, Ordering::SeqCst);
        let message = Message::new(content, counter);
        info!("[{}] Sending: {}", self.name, message);
        self.transport.send(message).await?;
        Ok(counter)
    }

    pub(crate) async fn start(&self) -> Result<()> {
        if self.state() != PlayerState::Idle {
            return Ok(());
        }
        self.transport.start().await?;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PlayerState::Active;
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        if self.state() == PlayerState::Stopped {
            return;
        }
        self.transport.stop().await;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PlayerState::Stopped;
        info!("[{}] Stopped", self.name);
    }
}

/// Player that answers every message it receives
///
/// The answer is the received content followed by this player's outgoing
/// counter at the time of receipt, so two players exchange messages
/// indefinitely once one of them sends first.
pub struct Player {
    core: Arc<PlayerCore>,
}

impl Player {
    /// Create a player and register it as the transport's handler
    pub fn new(name: impl Into<String>, transport: impl Transport) -> Self {
        let core = Arc::new(PlayerCore::new(name.into(), Box::new(transport)));
        core.register(Arc::new(Responder {
            core: Arc::downgrade(&core),
        }));
        Self { core }
    }

    /// Player name
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Number of messages sent so far, which is also the last counter used
    pub fn counter(&self) -> i32 {
        self.core.counter()
    }

    /// Lifecycle state
    pub fn state(&self) -> PlayerState {
        self.core.state()
    }

    /// Send a message with the next counter value
    pub async fn send_message(&self, content: impl Into<String>) -> Result<()> {
        self.core.send_message(content.into()).await.map(|_| ())
    }

    /// Start the owned transport
    pub async fn start(&self) -> Result<()> {
        self.core.start().await
    }

    /// Stop the owned transport
    pub async fn stop(&self) {
        self.core.stop().await
    }
}

struct Responder {
    core: Weak<PlayerCore>,
}

#[async_trait]
impl MessageHandler for Responder {
    async fn on_message(&self, message: Message) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        info!("[{}] Received: {}", core.name(), message);

        let response = format!("{}{}", message.content(), core.counter());
        if let Err(e) = core.send_message(response).await {
            error!("[{}] Failed to respond: {}", core.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_transport::InProcessTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, message: Message) {
            let _ = self.0.send(message);
        }
    }

    /// Player on one end, a recording endpoint on the other
    async fn player_with_peer() -> (Player, InProcessTransport, mpsc::UnboundedReceiver<Message>) {
        let (ours, theirs) = InProcessTransport::pair();
        let player = Player::new("P", ours);
        let (tx, rx) = mpsc::unbounded_channel();
        theirs.set_message_handler(Arc::new(Recorder(tx)));
        theirs.start().await.unwrap();
        (player, theirs, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_counters_are_sequential() {
        let (player, peer, mut rx) = player_with_peer().await;

        for i in 0..5 {
            player.send_message(format!("m{}", i)).await.unwrap();
        }
        assert_eq!(player.counter(), 5);

        let counters: Vec<i32> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(next(&mut rx).await.counter());
            }
            out
        };
        assert_eq!(counters, vec![1, 2, 3, 4, 5]);

        player.stop().await;
        peer.stop().await;
    }

    #[tokio::test]
    async fn test_response_appends_own_counter() {
        let (player, peer, mut rx) = player_with_peer().await;
        player.start().await.unwrap();

        peer.send(Message::new("Hello", 1)).await.unwrap();
        let first = next(&mut rx).await;
        assert_eq!((first.content(), first.counter()), ("Hello0", 1));

        peer.send(Message::new("Hello01", 2)).await.unwrap();
        let second = next(&mut rx).await;
        assert_eq!((second.content(), second.counter()), ("Hello011", 2));

        assert_eq!(player.counter(), 2);
        player.stop().await;
        peer.stop().await;
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let (player, peer, _rx) = player_with_peer().await;
        assert_eq!(player.name(), "P");
        assert_eq!(player.state(), PlayerState::Idle);

        player.start().await.unwrap();
        assert_eq!(player.state(), PlayerState::Active);

        player.stop().await;
        player.stop().await;
        assert_eq!(player.state(), PlayerState::Stopped);

        peer.stop().await;
    }

    #[tokio::test]
    async fn test_two_players_ping_pong() {
        let (a, b) = InProcessTransport::pair();
        let alice = Player::new("Alice", a);
        let bob = Player::new("Bob", b);
        alice.start().await.unwrap();
        bob.start().await.unwrap();

        alice.send_message("Hello").await.unwrap();

        // Unbounded exchange: both counters keep climbing
        timeout(Duration::from_secs(5), async {
            while alice.counter() < 20 || bob.counter() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_counter_never_wraps() {
        let (player, peer, mut rx) = player_with_peer().await;
        player.core.counter.store(i32::MAX - 1, Ordering::SeqCst);

        player.send_message("last").await.unwrap();
        assert_eq!(next(&mut rx).await.counter(), i32::MAX);

        let err = player.send_message("one too many").await.unwrap_err();
        assert!(matches!(err, DuetError::SendError(_)));
        assert_eq!(player.counter(), i32::MAX);
        assert!(rx.try_recv().is_err());

        player.stop().await;
        peer.stop().await;
    }
}
