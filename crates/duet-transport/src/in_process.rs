//! In-process transport backed by unbounded FIFO queues
//!
//! Endpoints come in linked pairs. Sending on one endpoint enqueues into the
//! peer's inbound queue, and the peer's delivery task hands each message to
//! the peer's handler in the order it was sent.

use crate::transport::{DEFAULT_JOIN_TIMEOUT, HandlerSlot, MessageHandler, Transport, join_with_timeout};
use async_trait::async_trait;
use duet_core::{DuetError, Message, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One end of an in-process message channel
pub struct InProcessTransport {
    /// Sender into the peer's inbound queue
    peer_tx: mpsc::UnboundedSender<Message>,
    /// Our inbound queue, moved into the delivery task on start
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Registered receive callback
    handler: HandlerSlot,
    /// Whether the delivery task should keep going
    running: Arc<AtomicBool>,
    /// Set once stop() has run
    stopped: AtomicBool,
    /// Background delivery task handle
    delivery_handle: Mutex<Option<JoinHandle<()>>>,
    /// Bound on waiting for the delivery task in stop()
    join_timeout: Duration,
}

impl InProcessTransport {
    /// Create two linked endpoints with the default join timeout
    pub fn pair() -> (Self, Self) {
        Self::pair_with_timeout(DEFAULT_JOIN_TIMEOUT)
    }

    /// Create two linked endpoints with a custom join timeout
    pub fn pair_with_timeout(join_timeout: Duration) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self::endpoint(b_tx, a_rx, join_timeout),
            Self::endpoint(a_tx, b_rx, join_timeout),
        )
    }

    fn endpoint(
        peer_tx: mpsc::UnboundedSender<Message>,
        inbound_rx: mpsc::UnboundedReceiver<Message>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            peer_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            handler: HandlerSlot::new(),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            delivery_handle: Mutex::new(None),
            join_timeout,
        }
    }

    /// Whether the delivery task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handler.set(handler);
    }

    async fn send(&self, message: Message) -> Result<()> {
        // Unbounded: only fails once the peer's delivery side is gone
        self.peer_tx
            .send(message)
            .map_err(|e| DuetError::SendError(format!("Peer queue closed, dropped {}", e.0)))
    }

    async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DuetError::NotConnected);
        }

        let rx = self
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!("In-process transport already started");
            return Ok(());
        };

        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(delivery_task(
            rx,
            self.handler.clone(),
            self.running.clone(),
        ));
        *self
            .delivery_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("In-process transport started");
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        // Never started: drop the queue so the peer sees a closed channel
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .delivery_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Interrupts a pending recv; undelivered messages are dropped
            handle.abort();
            join_with_timeout(handle, self.join_timeout, "In-process delivery").await;
            info!("In-process transport stopped");
        }
    }
}

/// Delivery loop: dequeue one message, dispatch it, repeat
async fn delivery_task(
    mut rx: mpsc::UnboundedReceiver<Message>,
    handler: HandlerSlot,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match rx.recv().await {
            Some(message) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                handler.dispatch(message).await;
            }
            None => {
                debug!("Inbound queue closed, delivery task exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::recorder;
    use std::time::Instant;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_delivery_is_fifo() {
        let (a, b) = InProcessTransport::pair();
        let (handler, mut rx) = recorder();
        b.set_message_handler(handler);
        a.start().await.unwrap();
        b.start().await.unwrap();

        for i in 1..=50 {
            a.send(Message::new(format!("m{}", i), i)).await.unwrap();
        }

        for i in 1..=50 {
            let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(msg.counter(), i);
            assert_eq!(msg.content(), format!("m{}", i));
        }

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_queues() {
        let (a, b) = InProcessTransport::pair();
        let (handler, mut rx) = recorder();
        b.set_message_handler(handler);

        a.send(Message::new("early", 1)).await.unwrap();
        a.send(Message::new("queued", 2)).await.unwrap();
        assert!(rx.try_recv().is_err());

        b.start().await.unwrap();
        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.counter(), 1);
        assert_eq!(second.counter(), 2);

        b.stop().await;
    }

    #[tokio::test]
    async fn test_delivery_is_per_endpoint() {
        let (a, b) = InProcessTransport::pair();
        let (a_handler, mut a_rx) = recorder();
        let (b_handler, mut b_rx) = recorder();
        a.set_message_handler(a_handler);
        b.set_message_handler(b_handler);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send(Message::new("to b", 1)).await.unwrap();
        b.send(Message::new("to a", 1)).await.unwrap();

        let at_b = timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap().unwrap();
        let at_a = timeout(Duration::from_secs(2), a_rx.recv()).await.unwrap().unwrap();
        assert_eq!(at_b.content(), "to b");
        assert_eq!(at_a.content(), "to a");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_stopped() {
        let (a, b) = InProcessTransport::pair();
        a.start().await.unwrap();
        b.start().await.unwrap();

        b.stop().await;
        let err = a.send(Message::new("late", 1)).await.unwrap_err();
        assert!(matches!(err, DuetError::SendError(_)));

        a.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_bounded_and_idempotent() {
        let (a, _b) = InProcessTransport::pair_with_timeout(Duration::from_millis(200));
        a.start().await.unwrap();
        assert!(a.is_running());

        let started = Instant::now();
        a.stop().await;
        a.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!a.is_running());

        assert!(matches!(a.start().await, Err(DuetError::NotConnected)));
    }

    /// Records the first message it sees, then never finishes dispatching it
    struct Stuck(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Stuck {
        async fn on_message(&self, message: Message) {
            let _ = self.0.send(message);
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_stop_mid_dispatch_drops_queued_messages() {
        let (a, b) = InProcessTransport::pair_with_timeout(Duration::from_millis(500));
        let (tx, mut seen) = mpsc::unbounded_channel();
        b.set_message_handler(Arc::new(Stuck(tx)));
        b.start().await.unwrap();

        for i in 1..=3 {
            a.send(Message::new(format!("m{}", i), i)).await.unwrap();
        }
        let first = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(first.counter(), 1);

        let started = Instant::now();
        b.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!b.is_running());

        // m2 and m3 were queued behind the stuck dispatch and never delivered
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.try_recv().is_err());
        assert!(matches!(
            a.send(Message::new("m4", 4)).await,
            Err(DuetError::SendError(_))
        ));
    }
}
