//! DWRP (Dropwire Protocol) wire protocol implementation.
//!
//! Two frame kinds travel over the channel: a metadata frame announcing a
//! transfer, followed by chunk frames carrying its bytes. Frames for
//! different transfers may interleave; receivers demultiplex by transfer id.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      DWRP Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x44 0x57 0x52 0x50` ("DWRP")
//! - Version: `0x01 0x00` (1.0)
//! - Type: `0x01` metadata (JSON payload), `0x02` chunk (binary payload)
//! - Length: Payload length in bytes (big-endian)
//!
//! ## Chunk Payload
//!
//! ```text
//! fileId (16 bytes) | index (4 bytes BE) | total (4 bytes BE) | raw chunk bytes
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Protocol magic bytes: "DWRP"
pub const MAGIC: [u8; 4] = [0x44, 0x57, 0x52, 0x50];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Fixed part of a chunk payload: file id, index and total
pub const CHUNK_HEADER_SIZE: usize = 24;

/// Maximum payload size (64 KiB); a full chunk frame needs well under this
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Unique identifier of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from its 16 wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 bytes written on the wire.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TransferId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid transfer id '{s}': {e}")))
    }
}

/// Message types in the DWRP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Transfer announcement
    Metadata = 0x01,
    /// One slice of file bytes
    Chunk = 0x02,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Metadata),
            0x02 => Some(Self::Chunk),
            _ => None,
        }
    }

    /// Tag name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Chunk => "chunk",
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Message type
    pub message_type: MessageType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.message_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::MalformedFrame("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::MalformedFrame(format!(
                "unsupported protocol version {}.{}",
                version.0, version.1
            )));
        }

        let message_type = MessageType::from_byte(buf[6])
            .ok_or_else(|| Error::MalformedFrame(format!("unknown message type: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedFrame(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            message_type,
            payload_length,
        })
    }
}

/// Identity and description of one file transfer.
///
/// Serialized as the JSON payload of a metadata frame:
/// `{ "id", "name", "size", "type", "lastModified" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Transfer id, stable for the transfer's lifetime
    pub id: TransferId,
    /// Original file name
    pub name: String,
    /// Total byte length
    pub size: u64,
    /// Content type
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Source-side modification time (milliseconds on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
}

impl TransferMetadata {
    /// Describe a new transfer with a fresh id.
    ///
    /// An empty or missing MIME type falls back to `application/octet-stream`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        size: u64,
        mime_type: Option<&str>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let mime_type = match mime_type {
            Some(m) if !m.trim().is_empty() => m.to_string(),
            _ => crate::DEFAULT_MIME_TYPE.to_string(),
        };

        Self {
            id: TransferId::new(),
            name: name.into(),
            size,
            mime_type,
            last_modified,
        }
    }

    /// Number of chunks this transfer is split into.
    #[must_use]
    pub fn total_chunks(&self) -> u64 {
        crate::file::chunk_count(self.size, crate::CHUNK_SIZE)
    }
}

/// One ordered slice of a transfer's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Owning transfer
    pub transfer_id: TransferId,
    /// Zero-based position among `total` chunks
    pub index: u32,
    /// Chunk count for the transfer
    pub total: u32,
    /// Raw bytes
    pub payload: Vec<u8>,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Transfer announcement
    Metadata(TransferMetadata),
    /// File bytes
    Chunk(Chunk),
}

impl Frame {
    /// Transfer the frame belongs to.
    #[must_use]
    pub const fn transfer_id(&self) -> TransferId {
        match self {
            Self::Metadata(metadata) => metadata.id,
            Self::Chunk(chunk) => chunk.transfer_id,
        }
    }

    /// Message type of this frame.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Metadata(_) => MessageType::Metadata,
            Self::Chunk(_) => MessageType::Chunk,
        }
    }

    /// Encode the frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Metadata(metadata) => encode_metadata(metadata),
            Self::Chunk(chunk) => Ok(encode_chunk(chunk)),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn frame(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        message_type,
        payload_length: payload.len() as u32,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a metadata frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_metadata(metadata: &TransferMetadata) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(metadata).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(frame(MessageType::Metadata, &payload))
}

/// Encode a chunk frame.
///
/// Format: file_id (16 bytes) | index (4 bytes) | total (4 bytes) | data
#[must_use]
pub fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk.payload.len());
    payload.extend_from_slice(chunk.transfer_id.as_bytes());
    payload.extend_from_slice(&chunk.index.to_be_bytes());
    payload.extend_from_slice(&chunk.total.to_be_bytes());
    payload.extend_from_slice(&chunk.payload);
    frame(MessageType::Chunk, &payload)
}

/// Decode one complete frame.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the tag is unknown, the frame is
/// truncated, or required fields are missing or ill-typed.
pub fn decode(data: &[u8]) -> Result<Frame> {
    if data.len() < HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }

    let mut header_buf = [0u8; HEADER_SIZE];
    header_buf.copy_from_slice(&data[..HEADER_SIZE]);
    let header = FrameHeader::decode(&header_buf)?;

    let payload = &data[HEADER_SIZE..];
    if payload.len() != header.payload_length as usize {
        return Err(Error::MalformedFrame(format!(
            "declared payload length {} but got {} bytes",
            header.payload_length,
            payload.len()
        )));
    }

    match header.message_type {
        MessageType::Metadata => decode_metadata(payload).map(Frame::Metadata),
        MessageType::Chunk => decode_chunk(payload).map(Frame::Chunk),
    }
}

fn decode_metadata(payload: &[u8]) -> Result<TransferMetadata> {
    let mut metadata: TransferMetadata = serde_json::from_slice(payload)
        .map_err(|e| Error::MalformedFrame(format!("invalid metadata: {e}")))?;

    if metadata.mime_type.trim().is_empty() {
        metadata.mime_type = crate::DEFAULT_MIME_TYPE.to_string();
    }

    Ok(metadata)
}

fn decode_chunk(payload: &[u8]) -> Result<Chunk> {
    if payload.len() < CHUNK_HEADER_SIZE {
        return Err(Error::MalformedFrame(
            "chunk payload too short".to_string(),
        ));
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&payload[0..16]);
    let index = u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]);
    let total = u32::from_be_bytes([payload[20], payload[21], payload[22], payload[23]]);
    let data = &payload[CHUNK_HEADER_SIZE..];

    if total == 0 {
        return Err(Error::MalformedFrame("chunk total is zero".to_string()));
    }
    if index >= total {
        return Err(Error::MalformedFrame(format!(
            "chunk index {index} out of range for total {total}"
        )));
    }
    if data.len() > crate::CHUNK_SIZE {
        return Err(Error::MalformedFrame(format!(
            "chunk of {} bytes exceeds maximum of {}",
            data.len(),
            crate::CHUNK_SIZE
        )));
    }

    Ok(Chunk {
        transfer_id: TransferId::from_bytes(id),
        index,
        total,
        payload: data.to_vec(),
    })
}

/// Read one complete frame from a byte stream.
///
/// Returns the raw frame bytes (header included), ready for [`decode`].
///
/// # Errors
///
/// Returns an error if reading fails or the header is invalid. An invalid
/// header leaves the stream unsynchronized, so callers should treat it as
/// fatal to the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut buf = vec![0u8; HEADER_SIZE + header.payload_length as usize];
    buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    if header.payload_length > 0 {
        reader.read_exact(&mut buf[HEADER_SIZE..]).await?;
    }

    Ok(buf)
}

/// Write one encoded frame to a byte stream.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;

    Ok(())
}
