//! TCP adapter for the channel abstraction.
//!
//! A TCP stream is a byte pipe, so frames are delimited by their DWRP header
//! ([`crate::protocol::read_frame`]). One task drains outgoing frames into the
//! socket and another turns incoming frames into [`ChannelEvent::Data`].
//!
//! `dropwire host` listens and accepts one peer; `dropwire join` dials it.
//! Addresses are plain `IP` or `IP:PORT`, which suits direct links and
//! overlay networks such as Tailscale or WireGuard.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::channel::{Channel, ChannelEvent, EventReceiver, EventSender};
use crate::error::{Error, Result};
use crate::protocol;

/// Frames waiting for the socket writer before [`Channel::send`] blocks.
pub const OUTBOUND_QUEUE: usize = 32;

/// A channel carried over one TCP connection.
#[derive(Debug)]
pub struct TcpChannel {
    peer: SocketAddr,
    open: Arc<AtomicBool>,
    outbound: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
    events: EventSender,
}

impl TcpChannel {
    /// Dial a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: SocketAddr, keepalive: bool) -> Result<(Arc<Self>, EventReceiver)> {
        tracing::info!("Connecting to {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ChannelError(format!("failed to connect to {addr}: {e}")))?;

        Self::from_stream(stream, keepalive)
    }

    /// Accept a single peer from a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept(
        listener: &TcpListener,
        keepalive: bool,
    ) -> Result<(Arc<Self>, EventReceiver)> {
        let (stream, addr) = listener.accept().await?;
        tracing::info!("Accepted connection from {}", addr);

        Self::from_stream(stream, keepalive)
    }

    /// Wrap an established stream.
    ///
    /// The returned event stream starts with [`ChannelEvent::Open`]. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be configured.
    pub fn from_stream(stream: TcpStream, keepalive: bool) -> Result<(Arc<Self>, EventReceiver)> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        if keepalive {
            configure_tcp_keepalive(&stream)?;
        }

        let (read_half, write_half) = stream.into_split();
        Ok(Self::spawn(read_half, write_half, peer))
    }

    fn spawn<R, W>(reader: R, writer: W, peer: SocketAddr) -> (Arc<Self>, EventReceiver)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let open = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&shutdown),
            Arc::clone(&open),
            events_tx.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&shutdown),
            Arc::clone(&open),
            events_tx.clone(),
        ));

        let _ = events_tx.send(ChannelEvent::Open);

        let channel = Self {
            peer,
            open,
            outbound: outbound_tx,
            shutdown,
            events: events_tx,
        };

        (Arc::new(channel), events_rx)
    }

    /// Remote socket address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::ChannelError("connection is closed".to_string()));
        }

        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::ChannelError("connection writer stopped".to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn peer_label(&self) -> String {
        self.peer.to_string()
    }

    fn close(&self) {
        self.shutdown.notify_one();
        finish(&self.open, &self.events, None);
    }
}

/// Emit the terminal events once, whichever side notices first.
fn finish(open: &AtomicBool, events: &EventSender, error: Option<String>) {
    if open.swap(false, Ordering::SeqCst) {
        if let Some(reason) = error {
            let _ = events.send(ChannelEvent::Error(reason));
        }
        let _ = events.send(ChannelEvent::Close);
    }
}

/// Drain queued frames into the socket. On shutdown, frames already queued
/// are still written before the write side is closed.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<Notify>,
    open: Arc<AtomicBool>,
    events: EventSender,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            () = shutdown.notified() => {
                outbound.close();
                outbound.recv().await
            }
        };

        let Some(frame) = frame else {
            break;
        };

        if let Err(e) = protocol::write_frame(&mut writer, &frame).await {
            tracing::error!("Write to peer failed: {}", e);
            finish(&open, &events, Some(e.to_string()));
            return;
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!("Connection writer stopped");
}

async fn read_loop<R>(
    mut reader: R,
    shutdown: Arc<Notify>,
    open: Arc<AtomicBool>,
    events: EventSender,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(frame) => {
                if events.send(ChannelEvent::Data(frame)).is_err() {
                    break;
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Peer closed the connection");
                finish(&open, &events, None);
                break;
            }
            Err(e) => {
                if open.load(Ordering::SeqCst) {
                    tracing::error!("Read from peer failed: {}", e);
                }
                finish(&open, &events, Some(e.to_string()));
                break;
            }
        }
    }

    shutdown.notify_one();
}

/// Configure TCP keep-alive on a stream so dead peers are noticed.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses the default port
/// - `IP:PORT` (e.g., `192.168.1.100:52540`)
/// - `[IPv6]` (e.g., `[::1]`) - uses the default port
/// - `[IPv6]:PORT` (e.g., `[::1]:52540`)
///
/// # Examples
///
/// ```
/// use dropwire_core::net::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100", 52620).unwrap();
/// assert_eq!(addr.port(), 52620);
///
/// let addr = parse_host_address("192.168.1.100:52540", 52620).unwrap();
/// assert_eq!(addr.port(), 52540);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:{default_port})"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if host.starts_with('[') && host.ends_with(']') {
        let ip: IpAddr = host[1..host.len() - 1].parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}
