//! TCP transport
//!
//! One side listens and accepts exactly one connection, the other dials with
//! a fixed retry policy. After the stream header exchange a background reader
//! task decodes frames and dispatches them; sends are written and flushed on
//! the caller's task.

use crate::protocol;
use crate::transport::{DEFAULT_JOIN_TIMEOUT, HandlerSlot, MessageHandler, Transport, join_with_timeout};
use async_trait::async_trait;
use duet_core::{DuetError, Message, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Which end of the connection this transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRole {
    /// Binds the port and accepts one incoming connection
    Listener,
    /// Dials the remote host:port
    Connector,
}

/// Configuration for a TCP transport
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host to dial, or interface to bind (default: 127.0.0.1)
    pub host: String,
    /// Port to dial or bind (default: 9999)
    pub port: u16,
    /// Number of dial attempts before giving up (default: 10)
    pub connect_attempts: u32,
    /// Pause before every dial attempt, including the first (default: 500ms)
    pub retry_delay: Duration,
    /// Bound on waiting for the reader task in stop() (default: 1s)
    pub join_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9999,
            connect_attempts: 10,
            retry_delay: Duration::from_millis(500),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl TcpConfig {
    /// Config for the given host and port, defaults elsewhere
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Message transport over a single TCP connection
pub struct TcpTransport {
    role: TcpRole,
    config: TcpConfig,
    /// Registered receive callback
    handler: HandlerSlot,
    /// Whether the reader task should keep going
    running: Arc<AtomicBool>,
    /// False until connected, and again once the reader loop has ended
    connected: Arc<AtomicBool>,
    /// Flipped to true by stop(); wakes anything parked in accept, dial,
    /// header exchange or a blocked write
    shutdown: watch::Sender<bool>,
    /// Listening socket (listener role only)
    listener: Mutex<Option<TcpListener>>,
    /// Writer half of the connection
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Background reader task handle
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create a transport in the given role (not connected yet)
    pub fn new(role: TcpRole, config: TcpConfig) -> Self {
        Self {
            role,
            config,
            handler: HandlerSlot::new(),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
            listener: Mutex::new(None),
            writer: Mutex::new(None),
            reader_handle: std::sync::Mutex::new(None),
        }
    }

    /// Create a transport that binds and accepts one connection
    pub fn listener(config: TcpConfig) -> Self {
        Self::new(TcpRole::Listener, config)
    }

    /// Create a transport that dials the configured address
    pub fn connector(config: TcpConfig) -> Self {
        Self::new(TcpRole::Connector, config)
    }

    /// Whether the connection can still deliver messages
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the listening socket ahead of start()
    ///
    /// Returns the bound address, which is how callers learn the port when
    /// the config asks for port 0. Idempotent.
    pub async fn bind(&self) -> Result<SocketAddr> {
        if self.role != TcpRole::Listener {
            return Err(DuetError::BindError(
                "Connector transports do not bind".into(),
            ));
        }

        let mut guard = self.listener.lock().await;
        if let Some(listener) = guard.as_ref() {
            return listener
                .local_addr()
                .map_err(|e| DuetError::BindError(format!("Failed to read local address: {}", e)));
        }

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DuetError::BindError(format!("Failed to bind {}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| DuetError::BindError(format!("Failed to read local address: {}", e)))?;

        info!("Listening on {}", local);
        *guard = Some(listener);
        Ok(local)
    }

    /// Accept the single peer connection
    async fn accept(&self) -> Result<TcpStream> {
        self.bind().await?;

        // Taken out so stop() is not blocked behind a pending accept
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| DuetError::BindError("Listening socket closed".into()))?;

        let accepted = tokio::select! {
            res = listener.accept() => res
                .map_err(|e| DuetError::BindError(format!("Accept failed: {}", e))),
            _ = shutdown_signal(self.shutdown.subscribe()) => Err(DuetError::BindError(
                "Stopped while waiting for a connection".into(),
            )),
        };

        // Kept open until stop(), unless stop() already ran
        if self.running.load(Ordering::SeqCst) {
            *self.listener.lock().await = Some(listener);
        }

        let (stream, peer) = accepted?;
        info!("Peer connected from {}", peer);
        Ok(stream)
    }

    /// Dial the peer, pausing before every attempt
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let addr = self.config.addr();
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            tokio::select! {
                _ = sleep(self.config.retry_delay) => {}
                _ = shutdown_signal(self.shutdown.subscribe()) => {
                    return Err(DuetError::ConnectError(format!(
                        "Stopped while connecting to {}",
                        addr
                    )));
                }
            }

            let dialed = tokio::select! {
                res = TcpStream::connect(&addr) => res,
                _ = shutdown_signal(self.shutdown.subscribe()) => {
                    return Err(DuetError::ConnectError(format!(
                        "Stopped while connecting to {}",
                        addr
                    )));
                }
            };

            match dialed {
                Ok(stream) => {
                    info!("Connected to {} (attempt {}/{})", addr, attempt, attempts);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect attempt {}/{} to {} failed: {}", attempt, attempts, addr, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(DuetError::ConnectError(format!(
            "Failed to connect to {} after {} attempts: {}",
            addr, attempts, last_error
        )))
    }

    /// Exchange stream headers, store the writer and spawn the reader task
    async fn init_streams(&self, stream: TcpStream) -> Result<()> {
        // Disable Nagle's algorithm for low latency
        stream
            .set_nodelay(true)
            .map_err(|e| DuetError::ConnectError(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let (mut read_half, mut write_half) = stream.into_split();
        tokio::select! {
            res = async {
                protocol::write_header(&mut write_half).await?;
                protocol::read_header(&mut read_half).await
            } => res?,
            _ = shutdown_signal(self.shutdown.subscribe()) => return Err(stopped_during_setup()),
        }

        {
            // stop() flips `running` before it takes the writer, so checking
            // under the lock leaves no window for an orphaned connection
            let mut guard = self.writer.lock().await;
            if !self.running.load(Ordering::SeqCst) {
                drop(guard);
                if let Err(e) = write_half.shutdown().await {
                    debug!("Error closing abandoned connection: {}", e);
                }
                return Err(stopped_during_setup());
            }
            *guard = Some(write_half);
            self.connected.store(true, Ordering::SeqCst);
        }

        let handle = tokio::spawn(reader_task(
            read_half,
            self.handler.clone(),
            self.running.clone(),
            self.connected.clone(),
        ));
        *self
            .reader_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        // stop() ran after the writer was stored; it has closed the writer
        // and the reader exits on its first running check
        if !self.running.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(stopped_during_setup());
        }
        Ok(())
    }
}

fn stopped_during_setup() -> DuetError {
    DuetError::ConnectError("Stopped during connection setup".into())
}

/// Resolves once stop() has been called
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    loop {
        let stopped = *rx.borrow_and_update();
        if stopped || rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handler.set(handler);
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(DuetError::NotConnected);
        }

        // A write parked on backpressure gives up the writer when stop() runs
        let result = tokio::select! {
            res = async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(DuetError::NotConnected)?;
                protocol::write_message(writer, &message).await
            } => res,
            _ = shutdown_signal(self.shutdown.subscribe()) => Err(DuetError::SendError(
                "Transport stopped during send".into(),
            )),
        };
        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("TCP transport already started");
            return Ok(());
        }

        let stream = match self.role {
            TcpRole::Listener => self.accept().await,
            TcpRole::Connector => self.connect_with_retry().await,
        };

        let result = match stream {
            Ok(stream) => self.init_streams(stream).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!("TCP transport failed to start: {}", e);
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        // Input first: aborting drops the read half and unblocks a pending read
        let handle = self
            .reader_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = &handle {
            handle.abort();
        }

        match timeout(self.config.join_timeout, self.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    if let Err(e) = writer.shutdown().await {
                        warn!("Error closing connection: {}", e);
                    }
                }
            }
            Err(_) => warn!(
                "Writer still busy after {:?}, leaving it to the cancelled send",
                self.config.join_timeout
            ),
        }

        if self.listener.lock().await.take().is_some() {
            debug!("Closed listening socket");
        }

        if let Some(handle) = handle {
            join_with_timeout(handle, self.config.join_timeout, "TCP reader").await;
            info!("TCP transport stopped");
        }
    }
}

/// Reader loop: decode one frame, dispatch it, repeat
///
/// Any read or decode failure ends the loop; there is no reconnect.
async fn reader_task(
    mut reader: OwnedReadHalf,
    handler: HandlerSlot,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match protocol::read_message(&mut reader).await {
            Ok(message) => {
                debug!("[TCP→] {}", message);
                handler.dispatch(message).await;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("Error reading message: {}", e);
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
