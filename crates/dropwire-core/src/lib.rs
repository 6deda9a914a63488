//! # Dropwire Core Library
//!
//! `dropwire-core` moves files directly between two peers over an already
//! established, message-oriented data channel. No file bytes pass through a
//! server.
//!
//! ## Features
//!
//! - **Chunked transfers**: Files are cut into fixed 16 KiB chunks
//! - **Out-of-order reassembly**: Chunks land in a per-transfer arena by index
//! - **Concurrent transfers**: Many transfers share one channel, demultiplexed by id
//! - **Transport agnostic**: Anything implementing [`channel::Channel`] can carry frames
//!
//! ## Modules
//!
//! - [`channel`] - Channel abstraction and an in-memory channel pair
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`mod@file`] - Chunk arithmetic, file reading and materialization
//! - [`net`] - TCP adapter for the channel abstraction
//! - [`protocol`] - DWRP wire protocol (metadata and chunk frames)
//! - [`session`] - Transfer session manager
//! - [`transfer`] - Transfer registry, sender and receiver pipelines
//!
//! ## Example
//!
//! ```rust,ignore
//! use dropwire_core::channel::memory_pair;
//! use dropwire_core::file::OutgoingFile;
//! use dropwire_core::session::TransferSession;
//!
//! let ((left, left_events), (right, right_events)) = memory_pair();
//! let sender = TransferSession::default();
//! sender.open(left).await;
//! tokio::spawn({
//!     let sender = sender.clone();
//!     async move { sender.run(left_events).await }
//! });
//!
//! let handle = sender.send(&OutgoingFile::from_bytes("hello.txt", b"hi".to_vec())).await?;
//! handle.finished().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod channel;
pub mod config;
pub mod error;
pub mod file;
pub mod net;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use error::{Error, Result};
pub use protocol::{Chunk, Frame, TransferId, TransferMetadata};
pub use session::{ConnectionStatus, SessionOptions, TransferSession};
pub use transfer::{TransferDirection, TransferStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for DWRP
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Chunk size for file transfers (16 KiB, fixed and never negotiated)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// MIME type used when a file does not declare one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Default TCP port for the network adapter
pub const DEFAULT_PORT: u16 = 52620;
