//! Transfer session manager.
//!
//! A [`TransferSession`] owns the single active channel to a peer and the
//! registry of every transfer on it. Channel events are applied strictly in
//! delivery order by [`TransferSession::run`]; outbound transfers run on their
//! own tasks and share the registry.
//!
//! ## Connection states
//!
//! ```text
//! idle -> connecting -> connected -> disconnected
//!                              \--> failed
//! ```
//!
//! When the channel closes or fails, every transfer still in flight moves to
//! `error` with "connection lost" and its buffers are released. Completed
//! results stay available until dismissed or the session is closed.
//!
//! ## Example
//!
//! ```rust,ignore
//! let session = TransferSession::new(SessionOptions::default());
//! session.open(channel).await;
//! tokio::spawn({
//!     let session = session.clone();
//!     async move { session.run(events).await }
//! });
//!
//! let mut updates = session.subscribe();
//! let handle = session.send(&OutgoingFile::from_path(path)?).await?;
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::channel::{Channel, ChannelEvent, EventReceiver};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{OutgoingFile, ReceivedFile};
use crate::protocol::{self, TransferId};
use crate::transfer::{
    receiver, SendHandle, SharedRegistry, TransferRegistry, TransferSender, TransferUpdate,
    TransferView, UpdateFn,
};

/// Reason recorded on transfers interrupted by a lost channel.
pub const CONNECTION_LOST: &str = "connection lost";

/// State of the session's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No channel yet
    Idle,
    /// Channel handed over, waiting for it to open
    Connecting,
    /// Frames can flow
    Connected,
    /// Channel closed
    Disconnected,
    /// Channel failed
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause between consecutive chunks of one transfer
    pub chunk_delay: Duration,
    /// Capacity of the update broadcast
    pub event_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::ZERO,
            event_buffer: 256,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_delay: config.transfer.chunk_delay,
            event_buffer: config.transfer.event_buffer.max(1),
        }
    }
}

type Listeners = Arc<RwLock<Vec<UpdateFn>>>;

struct Inner {
    registry: SharedRegistry,
    sender: TransferSender,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    status: watch::Sender<ConnectionStatus>,
    last_error: Mutex<Option<String>>,
    listeners: Listeners,
    updates: broadcast::Sender<TransferUpdate>,
}

/// Manager for all transfers over one peer channel.
#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl TransferSession {
    /// Create an idle session.
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        let registry = TransferRegistry::shared();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (updates, _) = broadcast::channel(options.event_buffer.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Idle);

        let notify: UpdateFn = {
            let listeners = Arc::clone(&listeners);
            let updates = updates.clone();
            Arc::new(move |update: &TransferUpdate| {
                dispatch(&listeners, &updates, update);
            })
        };

        let sender =
            TransferSender::new(Arc::clone(&registry), notify).with_chunk_delay(options.chunk_delay);

        Self {
            inner: Arc::new(Inner {
                registry,
                sender,
                channel: Mutex::new(None),
                status,
                last_error: Mutex::new(None),
                listeners,
                updates,
            }),
        }
    }

    /// Hand over a channel. The session is `connecting` until it reports
    /// [`ChannelEvent::Open`].
    ///
    /// A previously held channel is closed.
    pub async fn open(&self, channel: Arc<dyn Channel>) {
        tracing::debug!("Opening session to {}", channel.peer_label());

        let previous = self.inner.channel.lock().await.replace(channel);
        if let Some(previous) = previous {
            previous.close();
        }

        *self.inner.last_error.lock().await = None;
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Apply one channel event.
    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                if self.inner.channel.lock().await.is_some() {
                    tracing::info!("Connection established");
                    self.set_status(ConnectionStatus::Connected);
                }
            }
            ChannelEvent::Data(bytes) => self.handle_frame(&bytes).await,
            ChannelEvent::Error(reason) => {
                tracing::error!("Channel error: {}", reason);
                *self.inner.last_error.lock().await = Some(reason);
                self.set_status(ConnectionStatus::Failed);
                self.connection_lost().await;
            }
            ChannelEvent::Close => {
                if self.connection_status() != ConnectionStatus::Failed {
                    tracing::info!("Connection closed");
                    self.set_status(ConnectionStatus::Disconnected);
                }
                self.connection_lost().await;
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match protocol::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                return;
            }
        };

        let result = {
            let mut registry = self.inner.registry.lock().await;
            receiver::on_frame(&mut registry, frame)
        };

        match result {
            Ok(Some(update)) => self.notify(&update),
            Ok(None) => {}
            Err(e) if e.is_recoverable() => tracing::warn!("Dropping frame: {}", e),
            Err(e) => tracing::error!("Failed to apply frame: {}", e),
        }
    }

    /// Process channel events until the channel closes.
    pub async fn run(&self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, ChannelEvent::Close);
            self.handle_event(event).await;
            if closed {
                break;
            }
        }

        if self.inner.channel.lock().await.is_some() {
            self.handle_event(ChannelEvent::Close).await;
        }

        tracing::debug!("Session event loop finished");
    }

    async fn connection_lost(&self) {
        if let Some(channel) = self.inner.channel.lock().await.take() {
            channel.close();
        }

        let updates: Vec<TransferUpdate> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .fail_in_flight(CONNECTION_LOST)
                .iter()
                .filter_map(|id| registry.get(id).map(crate::transfer::TransferRecord::update))
                .collect()
        };

        if !updates.is_empty() {
            tracing::warn!("{} transfer(s) interrupted by lost connection", updates.len());
        }
        for update in &updates {
            self.notify(update);
        }
    }

    /// Send a file to the peer.
    ///
    /// # Errors
    ///
    /// - [`Error::NoActiveConnection`] if there is no open channel
    /// - [`Error::NotConnected`] if the channel has not opened yet
    /// - file errors if the source cannot be read
    pub async fn send(&self, file: &OutgoingFile) -> Result<SendHandle> {
        let channel = self
            .inner
            .channel
            .lock()
            .await
            .clone()
            .ok_or(Error::NoActiveConnection)?;

        if self.connection_status() != ConnectionStatus::Connected {
            return Err(Error::NotConnected);
        }

        self.inner.sender.send(file, Some(channel)).await
    }

    /// Stop a transfer and forget it.
    ///
    /// Returns whether the transfer existed. Other transfers are unaffected.
    pub async fn cancel(&self, id: &TransferId) -> bool {
        let removed = self.inner.registry.lock().await.remove(id).is_some();
        if removed {
            tracing::info!("Cancelled transfer {}", id);
        }
        removed
    }

    /// Forget a finished transfer, releasing its result.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownTransfer`] if the id is unknown
    /// - [`Error::InvalidInput`] if the transfer is still active
    pub async fn dismiss(&self, id: &TransferId) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        let status = registry
            .get(id)
            .map(|r| r.status)
            .ok_or(Error::UnknownTransfer(*id))?;

        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "transfer {id} is still {status}"
            )));
        }

        registry.remove(id);
        Ok(())
    }

    /// Register a callback for every transfer update.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&TransferUpdate) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Subscribe to transfer updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransferUpdate> {
        self.inner.updates.subscribe()
    }

    /// Snapshots of every transfer, oldest first.
    pub async fn files(&self) -> Vec<TransferView> {
        self.inner.registry.lock().await.views()
    }

    /// Snapshot of one transfer.
    pub async fn get(&self, id: &TransferId) -> Option<TransferView> {
        self.inner
            .registry
            .lock()
            .await
            .get(id)
            .map(crate::transfer::TransferRecord::view)
    }

    /// Reassembled content of a completed inbound transfer.
    pub async fn received_file(&self, id: &TransferId) -> Option<ReceivedFile> {
        self.inner
            .registry
            .lock()
            .await
            .get(id)
            .and_then(|r| r.received_file().cloned())
    }

    /// Remote peers reachable through the session.
    pub async fn peers(&self) -> Vec<String> {
        if self.connection_status() != ConnectionStatus::Connected {
            return Vec::new();
        }

        self.inner
            .channel
            .lock()
            .await
            .iter()
            .map(|c| c.peer_label())
            .collect()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Most recent channel error.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().await.clone()
    }

    /// Tear down the channel and drop every transfer, including results.
    pub async fn close(&self) {
        tracing::debug!("Closing session");
        self.connection_lost().await;
        self.inner.registry.lock().await.clear();

        if self.connection_status() != ConnectionStatus::Failed {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::debug!("Connection status {} -> {}", current, status);
                *current = status;
                true
            }
        });
    }

    fn notify(&self, update: &TransferUpdate) {
        dispatch(&self.inner.listeners, &self.inner.updates, update);
    }
}

fn dispatch(
    listeners: &Listeners,
    updates: &broadcast::Sender<TransferUpdate>,
    update: &TransferUpdate,
) {
    let listeners = listeners.read().unwrap_or_else(PoisonError::into_inner);
    for listener in listeners.iter() {
        listener(update);
    }
    let _ = updates.send(update.clone());
}
