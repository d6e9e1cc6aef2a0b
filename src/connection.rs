//! Connection manager for the external service side of the bridge.
//!
//! Holds one outbound TCP connection to the forwarder, multiplexes concurrent
//! requests over it by correlation id, and reports liveness purely from the
//! transport: a zero-length read or a socket error means the host is gone.
//!
//! Each connection gets its own pending-request table. When the connection
//! drops, every entry in that table fails with [`BridgeError::ConnectionLost`]
//! and the table is discarded, so a response from an old connection can never
//! resolve a request made on a new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::transport::{write_frame, ConnectionState, FrameBuffer, Message, Request};

/// Timing and buffer settings for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Wait between failed reconnection attempts.
    pub reconnect_interval: Duration,

    /// Upper bound on the TCP connect handshake.
    pub connect_timeout: Duration,

    /// Default per-request deadline.
    pub request_timeout: Duration,

    /// Longest a single read waits before the receive loop re-checks for
    /// cancellation. Also the supervisor's idle wake-up interval.
    pub poll_interval: Duration,

    /// Bytes requested per socket read.
    pub recv_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Create from the loaded configuration values.
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            ..Self::default()
        }
    }
}

/// A request waiting for its response.
struct PendingEntry {
    tx: oneshot::Sender<Result<Message>>,
    deadline: Instant,
}

/// State scoped to one TCP connection.
struct Link {
    /// Write half; locking it is the send serialization point.
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    /// Cancelled once the link is torn down.
    closed: CancellationToken,
}

impl Link {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Register a pending entry, unless the link is already torn down.
    async fn register(&self, id: &str, deadline: Instant) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut pending = self.pending.lock().await;
        if self.closed.is_cancelled() {
            return Err(BridgeError::ConnectionLost);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), PendingEntry { tx, deadline });
        Ok(rx)
    }

    /// Hand a response to its waiter. Returns `false` if nobody is waiting.
    async fn resolve(&self, message: Message) -> bool {
        let entry = self.pending.lock().await.remove(message.id());
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(message));
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it. Returns whether it was present.
    async fn forget(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Mark the link closed and fail everything still pending.
    async fn fail_all(&self) -> usize {
        self.closed.cancel();
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        let count = pending.len();
        for (id, entry) in pending.drain() {
            trace!(id = %id, overdue = entry.deadline <= now, "Failing pending request");
            let _ = entry.tx.send(Err(BridgeError::ConnectionLost));
        }
        count
    }
}

/// The live connection and its receive task.
struct Active {
    link: Arc<Link>,
    receiver: JoinHandle<()>,
}

/// Client side of the bridge.
///
/// Shared as `Arc<HostConnection>`: the receive loop and the reconnection
/// supervisor both hold a handle.
pub struct HostConnection {
    addr: String,
    config: ConnectionConfig,
    active: Mutex<Option<Active>>,
    /// Serializes connection attempts.
    connect_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    disconnected: Notify,
    request_counter: AtomicU64,
    /// Execution requests currently awaiting a response.
    executions: AtomicUsize,
}

impl HostConnection {
    /// Create a manager for the forwarder at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            addr: addr.into(),
            config,
            active: Mutex::new(None),
            connect_lock: Mutex::new(()),
            state,
            disconnected: Notify::new(),
            request_counter: AtomicU64::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves after the next transport-detected disconnect.
    ///
    /// A disconnect that happened while nobody was waiting is remembered, so
    /// the next call returns immediately.
    pub async fn disconnected(&self) {
        self.disconnected.notified().await;
    }

    /// Connect with the configured handshake timeout.
    pub async fn connect(self: &Arc<Self>) -> bool {
        self.connect_with_timeout(self.config.connect_timeout).await
    }

    /// Open the connection and start the receive loop.
    ///
    /// Returns `false` on refusal or timeout; never fails otherwise. Calling
    /// it while connected is a no-op that returns `true`.
    pub async fn connect_with_timeout(self: &Arc<Self>, timeout: Duration) -> bool {
        let _connecting = self.connect_lock.lock().await;
        if self.active.lock().await.is_some() {
            return true;
        }

        self.set_state(ConnectionState::Connecting);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Connection to host failed");
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
            Err(_) => {
                debug!(addr = %self.addr, timeout = ?timeout, "Connection to host timed out");
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let link = Arc::new(Link::new(writer));

        // Hold the slot while spawning so an immediate EOF cannot be
        // processed before the link is installed
        let mut active = self.active.lock().await;
        let receiver = tokio::spawn(Arc::clone(self).receive_loop(Arc::clone(&link), reader));
        *active = Some(Active { link, receiver });
        self.set_state(ConnectionState::Connected);
        drop(active);

        info!(addr = %self.addr, "Connected to host");
        true
    }

    /// Close the connection and fail every pending request. Idempotent.
    pub async fn disconnect(&self) {
        let active = self.active.lock().await.take();
        if let Some(Active { link, receiver }) = active {
            let failed = link.fail_all().await;
            if let Ok(mut writer) = link.writer.try_lock() {
                let _ = writer.shutdown().await;
            }
            if let Err(e) = receiver.await {
                warn!(error = %e, "Receive loop ended abnormally");
            }
            info!(failed_requests = failed, "Disconnected from host");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` defaults to the configured request timeout. Fails with
    /// `NotConnected` immediately when there is no connection,
    /// `RequestTimeout` when the deadline passes with the channel intact, and
    /// `ConnectionLost` when the connection drops first.
    pub async fn send_request(&self, request: Request, timeout: Option<Duration>) -> Result<Message> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let link = self.current_link().await.ok_or(BridgeError::NotConnected)?;
        let execution = request.is_execution();
        let deadline = Instant::now() + timeout;

        let (id, rx) = {
            let Ok(mut writer) = tokio::time::timeout_at(deadline, link.writer.lock()).await else {
                // Queued behind a stalled write; nothing was sent
                let id = self.next_request_id();
                debug!(id = %id, timeout = ?timeout, "Request timed out waiting to send");
                return Err(BridgeError::RequestTimeout { id, timeout });
            };
            let id = self.next_request_id();
            let rx = link.register(&id, deadline).await?;
            if execution {
                self.begin_execution();
            }

            let message = request.into_message(id.clone());
            let written = tokio::time::timeout_at(deadline, write_frame(&mut *writer, &message)).await;

            let failure = match written {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some((e.to_string(), BridgeError::ConnectionLost)),
                // A partial frame may be on the wire; the stream is unusable
                Err(_) => Some((
                    "write timed out".to_string(),
                    BridgeError::RequestTimeout {
                        id: id.clone(),
                        timeout,
                    },
                )),
            };
            if let Some((reason, error)) = failure {
                link.forget(&id).await;
                if execution {
                    self.end_execution();
                }
                // Close while still holding the writer so no frame follows a partial one
                self.close_link(&link, &reason).await;
                drop(writer);
                return Err(error);
            }
            drop(writer);

            trace!(id = %id, kind = message.kind(), "Request sent");
            (id, rx)
        };

        let outcome = Self::await_response(&link, &id, rx, deadline, timeout).await;
        if execution {
            self.end_execution();
        }
        outcome
    }

    /// Check liveness. `true` iff a `pong` came back in time.
    pub async fn ping(&self, timeout: Duration) -> bool {
        matches!(
            self.send_request(Request::Ping, Some(timeout)).await,
            Ok(Message::Pong { .. })
        )
    }

    pub async fn execute_code(&self, code: impl Into<String>, timeout: Option<Duration>) -> Result<Message> {
        self.send_request(Request::Execute { code: code.into() }, timeout)
            .await
    }

    pub async fn execute_file(&self, file: impl Into<String>, timeout: Option<Duration>) -> Result<Message> {
        self.send_request(Request::ExecuteFile { file: file.into() }, timeout)
            .await
    }

    pub async fn get_state(&self, timeout: Option<Duration>) -> Result<Message> {
        self.send_request(Request::GetState, timeout).await
    }

    /// Number of requests awaiting a response on the current connection.
    pub async fn pending_requests(&self) -> usize {
        match self.current_link().await {
            Some(link) => link.pending.lock().await.len(),
            None => 0,
        }
    }

    async fn current_link(&self) -> Option<Arc<Link>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.link))
    }

    async fn await_response(
        link: &Link,
        id: &str,
        mut rx: oneshot::Receiver<Result<Message>>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                if link.forget(id).await {
                    debug!(id = %id, timeout = ?timeout, "Request timed out");
                    Err(BridgeError::RequestTimeout {
                        id: id.to_string(),
                        timeout,
                    })
                } else {
                    // Resolved as the deadline fired; a dropped connection wins
                    rx.try_recv().unwrap_or(Err(BridgeError::ConnectionLost))
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, link: Arc<Link>, mut reader: OwnedReadHalf) {
        let mut frames = FrameBuffer::new();
        let mut chunk = vec![0u8; self.config.recv_buffer_size.max(1)];

        let reason = loop {
            let read = tokio::select! {
                () = link.closed.cancelled() => return,
                read = tokio::time::timeout(self.config.poll_interval, reader.read(&mut chunk)) => read,
            };
            match read {
                Err(_) => continue,
                Ok(Ok(0)) => break "connection closed by host".to_string(),
                Ok(Ok(n)) => {
                    frames.extend(&chunk[..n]);
                    Self::dispatch(&link, &mut frames).await;
                }
                Ok(Err(e)) => break e.to_string(),
            }
        };

        self.close_link(&link, &reason).await;
    }

    async fn dispatch(link: &Link, frames: &mut FrameBuffer) {
        while let Some(frame) = frames.next_frame() {
            match frame {
                Ok(message) => {
                    let id = message.id().to_string();
                    if !link.resolve(message).await {
                        trace!(id = %id, "No pending request for response");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed frame from host"),
            }
        }
    }

    /// Tear down `link` after a transport failure.
    async fn close_link(&self, link: &Arc<Link>, reason: &str) {
        let current = {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(&a.link, link)) {
                active.take()
            } else {
                None
            }
        };

        let failed = link.fail_all().await;
        if current.is_some() {
            warn!(reason = %reason, failed_requests = failed, "Connection to host lost");
            self.set_state(ConnectionState::Disconnected);
            self.disconnected.notify_one();
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        format!("req_{n}_{millis}")
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    fn begin_execution(&self) {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|current| {
            if *current != ConnectionState::Connected {
                return false;
            }
            *current = ConnectionState::Executing;
            true
        });
    }

    fn end_execution(&self) {
        if self.executions.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.state.send_if_modified(|current| {
            if *current != ConnectionState::Executing {
                return false;
            }
            *current = ConnectionState::Connected;
            true
        });
    }
}
