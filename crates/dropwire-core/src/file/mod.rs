//! File operations for Dropwire.
//!
//! This module handles:
//! - Chunk arithmetic (chunk counts and lengths)
//! - Describing and reading outgoing files chunk by chunk
//! - Materializing reassembled inbound files
//! - File name sanitization
//!
//! ## Chunking
//!
//! A file of `S` bytes is cut into `ceil(S / C)` chunks of `C` bytes; the
//! last chunk holds the remaining `S - C * (total - 1)` bytes. Every chunk is
//! filled completely before the next begins, whatever the underlying reader
//! returns per call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::Digest;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::protocol::TransferMetadata;

/// Number of chunks needed for `size` bytes.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Length of chunk `index` for a file of `size` bytes.
///
/// Returns 0 for indices past the end.
#[must_use]
pub fn chunk_len(size: u64, index: u64, chunk_size: usize) -> usize {
    let start = index.saturating_mul(chunk_size as u64);
    let remaining = size.saturating_sub(start);
    #[allow(clippy::cast_possible_truncation)]
    {
        remaining.min(chunk_size as u64) as usize
    }
}

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on the local filesystem
    Path(PathBuf),
    /// Bytes already held in memory
    Memory(Arc<[u8]>),
}

/// A local file about to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// File name announced to the peer
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// Modification time
    pub last_modified: DateTime<Utc>,
    /// Byte source
    pub source: FileSource,
}

impl OutgoingFile {
    /// Describe a file on disk.
    ///
    /// The MIME type is guessed from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or is not a regular file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;

        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Self {
            name,
            size: metadata.len(),
            mime_type: mime_guess::from_path(path).first().map(|m| m.to_string()),
            last_modified: truncate_to_millis(last_modified),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Describe in-memory content as a file.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let data: Arc<[u8]> = data.into();
        let mime_type = mime_guess::from_path(&name).first().map(|m| m.to_string());

        Self {
            name,
            size: data.len() as u64,
            mime_type,
            last_modified: truncate_to_millis(Utc::now()),
            source: FileSource::Memory(data),
        }
    }

    /// Override the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Override the modification time.
    #[must_use]
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = truncate_to_millis(last_modified);
        self
    }

    /// Build the metadata announcing this file, with a fresh transfer id.
    #[must_use]
    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata::new(
            self.name.clone(),
            self.size,
            self.mime_type.as_deref(),
            self.last_modified,
        )
    }

    /// Open a chunk reader over the file's bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn chunker(&self, chunk_size: usize) -> Result<FileChunker> {
        let reader: Box<dyn AsyncRead + Send + Unpin> = match &self.source {
            FileSource::Path(path) => Box::new(tokio::fs::File::open(path).await.map_err(
                |e| match e.kind() {
                    std::io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
                    _ => Error::Io(e),
                },
            )?),
            FileSource::Memory(data) => Box::new(std::io::Cursor::new(Arc::clone(data))),
        };

        Ok(FileChunker::new(reader, chunk_size))
    }
}

fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

/// Sequential chunk reader.
pub struct FileChunker {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Chunk size in bytes
    pub chunk_size: usize,
    next_index: u64,
}

impl std::fmt::Debug for FileChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunker")
            .field("chunk_size", &self.chunk_size)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl FileChunker {
    /// Create a chunker over any async reader.
    #[must_use]
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size,
            next_index: 0,
        }
    }

    /// Read the next chunk.
    ///
    /// Returns `None` at end of input. Every chunk except the last is exactly
    /// `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            let n = self.reader.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some((index, buffer)))
    }
}

/// Content of a completed inbound transfer.
///
/// Cloning is cheap; the bytes are shared. Memory is released once the
/// registry entry and every clone are dropped.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    metadata: TransferMetadata,
    content: Arc<[u8]>,
}

impl ReceivedFile {
    /// Wrap reassembled content.
    #[must_use]
    pub fn new(metadata: TransferMetadata, content: Vec<u8>) -> Self {
        Self {
            metadata,
            content: content.into(),
        }
    }

    /// Metadata announced by the sender.
    #[must_use]
    pub const fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    /// Reassembled bytes.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Length of the reassembled bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// SHA-256 of the content, hex encoded.
    #[must_use]
    pub fn sha256_hex(&self) -> String {
        use std::fmt::Write;

        let digest = sha2::Sha256::digest(&self.content);
        digest.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    /// Write the file into `dir` under its sanitized name.
    ///
    /// An existing file is never overwritten unless `overwrite` is set; a
    /// numbered name like `report (1).pdf` is chosen instead. The sender's
    /// modification time is restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unusable or writing fails.
    pub async fn save_to(&self, dir: &Path, overwrite: bool) -> Result<PathBuf> {
        let name = sanitize_file_name(&self.metadata.name)
            .ok_or_else(|| Error::InvalidPath(self.metadata.name.clone()))?;

        tokio::fs::create_dir_all(dir).await?;

        let path = if overwrite {
            sanitize_path(dir, Path::new(&name))
                .ok_or_else(|| Error::InvalidPath(name.clone()))?
        } else {
            unique_path(dir, &name)
        };

        tokio::fs::write(&path, &self.content).await?;

        let file = std::fs::File::options().write(true).open(&path)?;
        if let Err(e) = file.set_modified(self.metadata.last_modified.into()) {
            tracing::debug!("Could not restore mtime on {}: {}", path.display(), e);
        }

        Ok(path)
    }
}

/// Reduce a peer-supplied file name to a single safe path component.
///
/// Returns `None` if nothing usable remains.
#[must_use]
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        None
    } else {
        Some(cleaned)
    }
}

/// Sanitize a path to prevent directory traversal attacks.
///
/// # Arguments
///
/// * `base` - Base directory
/// * `relative` - Relative path from base
///
/// # Returns
///
/// The sanitized absolute path, or None if the path is invalid.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        if !matches!(component, std::path::Component::Normal(_)) {
            return None;
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// First path in `dir` for `name` that does not exist yet.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());

    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
