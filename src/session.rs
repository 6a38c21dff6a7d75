//! Port sessions: command/response correlation on a half-duplex bus.
//!
//! A `PortSession` owns one open transport. Every write goes through
//! [`PortSession::send`], which holds the session's write lock until the
//! request is fully answered or has timed out. An independent read loop
//! drains the transport and hands each chunk it reads to whoever is waiting.
//!
//! Because the lock admits a single outstanding request, the next chunk read
//! after a write is that write's response. The bus carries no sequence
//! numbers, so this single pending slot is the entire correlation scheme.
//!
//! Transport calls are blocking, so they run on tokio's blocking pool via
//! `spawn_blocking`. A stalled line holds up its own session only.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, HubEvent};
use crate::frame;
use crate::port::{PortError, SerialPortAdapter};
use crate::registry::PortId;

/// Default write-and-wait timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the read loop sleeps when the transport has nothing buffered.
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Inbound frames kept for slow raw-frame observers.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 64;

/// Upper bound on a single read from the transport.
const MAX_READ_CHUNK: usize = 4096;

/// Session-level failures.
///
/// A response timeout is deliberately absent: it is reported as
/// [`Reply::TimedOut`].
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The transport rejected the write or accepted only part of it.
    #[error("Write failed: {0}")]
    Write(String),

    /// The session was closed, possibly while the caller was waiting.
    #[error("Port session is closed")]
    Closed,

    /// The read loop hit a transport fault; the session must be reopened.
    #[error("Port session faulted: {0}")]
    Faulted(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Successful outcome of [`PortSession::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Fire-and-forget write completed.
    Sent,
    /// Bytes read after the write.
    Response(Vec<u8>),
    /// Nothing arrived within the response timeout.
    TimedOut,
}

impl Reply {
    pub fn into_response(self) -> Option<Vec<u8>> {
        match self {
            Reply::Response(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Tuning knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub response_timeout: Duration,
    pub read_poll_interval: Duration,
    pub frame_queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
        }
    }
}

/// Completion cell: `Some(bytes)` on a response, `None` when closing.
type PendingCell = oneshot::Sender<Option<Vec<u8>>>;

/// The live wrapper around one open transport.
pub struct PortSession {
    id: PortId,
    path: String,
    transport: Mutex<Box<dyn SerialPortAdapter>>,
    /// Serialises whole request/response exchanges.
    write_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCell>>,
    options: SessionOptions,
    shutdown: CancellationToken,
    fault: Mutex<Option<String>>,
    frames: broadcast::Sender<Vec<u8>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

impl PortSession {
    /// Wrap an open transport. The read loop is not running until [`start`].
    ///
    /// [`start`]: PortSession::start
    pub fn new(
        id: PortId,
        path: impl Into<String>,
        transport: Box<dyn SerialPortAdapter>,
        options: SessionOptions,
        events: EventBus,
    ) -> Arc<Self> {
        let (frames, _) = broadcast::channel(options.frame_queue_capacity.max(1));
        Arc::new(Self {
            id,
            path: path.into(),
            transport: Mutex::new(transport),
            write_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            options,
            shutdown: CancellationToken::new(),
            fault: Mutex::new(None),
            frames,
            reader: Mutex::new(None),
            events,
        })
    }

    /// Spawn the read loop. Calling this twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut reader = self.reader.lock();
        if reader.is_none() {
            let session = Arc::clone(self);
            *reader = Some(tokio::spawn(async move { session.read_loop().await }));
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn response_timeout(&self) -> Duration {
        self.options.response_timeout
    }

    /// Whether the transport still reports itself open and the session is live.
    ///
    /// Never waits on the transport: while a blocking call holds it the
    /// session counts as open, and the read loop reports a dead line as a fault.
    pub fn is_open(&self) -> bool {
        if self.shutdown.is_cancelled() || self.fault.lock().is_some() {
            return false;
        }
        self.transport
            .try_lock()
            .map_or(true, |transport| transport.is_open())
    }

    /// Observe every chunk the read loop receives, solicited or not.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frames.subscribe()
    }

    /// Write `data` and, if `expect_response`, wait for the reply.
    ///
    /// The write lock is held across the wait so no other caller's write can
    /// land between this request and its response. If the returned future is
    /// dropped mid-wait, the lock and the pending slot are both released.
    ///
    /// # Errors
    ///
    /// - `SessionError::Closed` if the session is closed before or during the call
    /// - `SessionError::Faulted` if the read loop has died
    /// - `SessionError::Write` on a failed or short write
    pub async fn send(
        self: &Arc<Self>,
        data: &[u8],
        expect_response: bool,
    ) -> Result<Reply, SessionError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_usable()?;

        let slot = PendingSlot(self.as_ref());
        let (cell, receiver) = if expect_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = Arc::clone(self);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || session.write_exchange(&data, cell))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))??;

        let Some(receiver) = receiver else {
            return Ok(Reply::Sent);
        };

        let reply = tokio::select! {
            result = receiver => match result {
                Ok(Some(bytes)) => Reply::Response(bytes),
                Ok(None) | Err(_) => return Err(self.closed_reason()),
            },
            _ = self.shutdown.cancelled() => return Err(self.closed_reason()),
            _ = tokio::time::sleep(self.options.response_timeout) => {
                warn!(port_id = %self.id, path = %self.path, "response timed out");
                Reply::TimedOut
            }
        };
        drop(slot);
        Ok(reply)
    }

    /// Stop the read loop, release any waiter and close the transport.
    ///
    /// Waits for an in-flight `send` to let go of the write lock first, so the
    /// transport is never closed underneath a write.
    pub async fn close(self: &Arc<Self>) {
        self.shutdown.cancel();
        self.release_pending();

        let _guard = self.write_lock.lock().await;
        let session = Arc::clone(self);
        let closed = tokio::task::spawn_blocking(move || session.transport.lock().close()).await;
        if let Err(e) = closed {
            error!(port_id = %self.id, "closing transport failed: {}", e);
        }

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(port_id = %self.id, "read loop ended abnormally: {}", e);
                }
            }
        }
        info!(port_id = %self.id, path = %self.path, "port session closed");
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        if let Some(reason) = self.fault.lock().clone() {
            return Err(SessionError::Faulted(reason));
        }
        Ok(())
    }

    fn closed_reason(&self) -> SessionError {
        match self.fault.lock().clone() {
            Some(reason) => SessionError::Faulted(reason),
            None => SessionError::Closed,
        }
    }

    /// Clear, install and write under one transport lock. The read loop
    /// resolves cells under the same lock, so nothing read before this point
    /// can answer the request. Runs on the blocking pool.
    fn write_exchange(&self, data: &[u8], cell: Option<PendingCell>) -> Result<(), SessionError> {
        let mut transport = self.transport.lock();
        if let Err(e) = transport.clear_input() {
            debug!(port_id = %self.id, "could not clear input before write: {}", e);
        }
        if let Some(cell) = cell {
            self.install_pending(cell)?;
        }
        self.write_frame(&mut **transport, data)
    }

    fn install_pending(&self, cell: PendingCell) -> Result<(), SessionError> {
        let mut pending = self.pending.lock();
        // Re-checked under the slot lock: `close` cancels first and then
        // drains the slot under this same lock.
        self.ensure_usable()?;
        *pending = Some(cell);
        Ok(())
    }

    fn write_frame(
        &self,
        transport: &mut dyn SerialPortAdapter,
        data: &[u8],
    ) -> Result<(), SessionError> {
        match transport.write_bytes(data) {
            Ok(n) if n == data.len() => {
                debug!(port_id = %self.id, frame = %frame::to_hex(data), "frame written");
                Ok(())
            }
            Ok(n) => Err(SessionError::Write(format!(
                "short write: {} of {} bytes",
                n,
                data.len()
            ))),
            Err(e) => Err(SessionError::Write(e.to_string())),
        }
    }

    fn release_pending(&self) {
        if let Some(cell) = self.pending.lock().take() {
            let _ = cell.send(None);
        }
    }

    /// Read whatever is buffered and hand it to the waiter, if any.
    ///
    /// The waiter is resolved while the transport lock is still held; see
    /// `send` for why.
    fn read_available(&self) -> Result<Option<Vec<u8>>, PortError> {
        let mut transport = self.transport.lock();
        if !transport.is_open() {
            return Err(PortError::NotOpen);
        }
        let available = transport.bytes_to_read()?;
        if available == 0 {
            return Ok(None);
        }
        let mut buffer = vec![0u8; available.min(MAX_READ_CHUNK)];
        let n = transport.read_bytes(&mut buffer)?;
        if n == 0 {
            return Ok(None);
        }
        buffer.truncate(n);

        if let Some(cell) = self.pending.lock().take() {
            // The waiter may have timed out between take and send.
            let _ = cell.send(Some(buffer.clone()));
        }
        Ok(Some(buffer))
    }

    async fn read_loop(self: Arc<Self>) {
        debug!(port_id = %self.id, path = %self.path, "read loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let session = Arc::clone(&self);
            let read = tokio::task::spawn_blocking(move || session.read_available())
                .await
                .unwrap_or_else(|e| Err(PortError::Io(std::io::Error::other(e))));
            match read {
                Ok(Some(bytes)) => {
                    debug!(port_id = %self.id, frame = %frame::to_hex(&bytes), "bytes received");
                    // No observers is fine.
                    let _ = self.frames.send(bytes);
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.read_poll_interval) => {}
                    }
                }
                Err(PortError::NotOpen) if self.shutdown.is_cancelled() => break,
                Err(e) => {
                    let message = format!("error reading serial data: {e}");
                    error!(port_id = %self.id, path = %self.path, "{}", message);
                    *self.fault.lock() = Some(message.clone());
                    self.release_pending();
                    self.events.publish(HubEvent::transport_error(self.id, message));
                    break;
                }
            }
        }
        debug!(port_id = %self.id, "read loop stopped");
    }
}

impl std::fmt::Debug for PortSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSession")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("response_timeout", &self.options.response_timeout)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// Clears the pending slot when a `send` finishes, however it finishes.
struct PendingSlot<'a>(&'a PortSession);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.pending.lock().take();
    }
}
