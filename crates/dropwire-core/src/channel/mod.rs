//! Channel abstraction.
//!
//! A channel is an ordered, reliable, message-oriented pipe between exactly
//! two peers. Each call to [`Channel::send`] delivers one whole frame to the
//! peer, which observes it as a single [`ChannelEvent::Data`] event. How the
//! channel was established (signaling, sockets, an in-process pair) is not
//! this crate's concern.
//!
//! [`memory_pair`] returns two connected in-memory endpoints for tests and
//! local loopback use. The TCP adapter lives in [`crate::net`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Events a channel delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is ready to carry frames
    Open,
    /// One complete frame from the peer
    Data(Vec<u8>),
    /// The channel failed
    Error(String),
    /// The channel closed
    Close,
}

/// Receiving side of a channel's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Sending side of a channel's event stream.
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// An open message channel to one peer.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Deliver one frame to the peer.
    ///
    /// Waits while the transport's outgoing buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the channel is closed or the
    /// transport rejected the frame.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Whether frames can currently be sent.
    fn is_open(&self) -> bool;

    /// Human readable description of the remote end.
    fn peer_label(&self) -> String;

    /// Close the channel. Both ends observe [`ChannelEvent::Close`].
    fn close(&self);
}

/// One end of an in-memory channel pair.
#[derive(Debug)]
pub struct MemoryChannel {
    label: String,
    open: Arc<AtomicBool>,
    local: EventSender,
    remote: EventSender,
}

impl MemoryChannel {
    /// Simulate a transport failure: both ends observe an error followed by
    /// close.
    pub fn fail(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            for tx in [&self.local, &self.remote] {
                let _ = tx.send(ChannelEvent::Error(reason.to_string()));
                let _ = tx.send(ChannelEvent::Close);
            }
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::ChannelError("channel is closed".to_string()));
        }

        self.remote
            .send(ChannelEvent::Data(frame))
            .map_err(|_| Error::ChannelError("peer dropped".to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.remote.is_closed()
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.local.send(ChannelEvent::Close);
            let _ = self.remote.send(ChannelEvent::Close);
        }
    }
}

/// One endpoint returned by [`memory_pair`].
pub type MemoryEndpoint = (Arc<MemoryChannel>, EventReceiver);

/// Create two connected in-memory channel endpoints.
///
/// Both event streams start with [`ChannelEvent::Open`].
#[must_use]
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let left = MemoryChannel {
        label: "memory:right".to_string(),
        open: Arc::clone(&open),
        local: left_tx.clone(),
        remote: right_tx.clone(),
    };
    let right = MemoryChannel {
        label: "memory:left".to_string(),
        open,
        local: right_tx.clone(),
        remote: left_tx.clone(),
    };

    let _ = left_tx.send(ChannelEvent::Open);
    let _ = right_tx.send(ChannelEvent::Open);

    ((Arc::new(left), left_rx), (Arc::new(right), right_rx))
}
