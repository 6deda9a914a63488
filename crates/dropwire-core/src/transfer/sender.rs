//! Sender pipeline.
//!
//! Sending a file registers an outbound record, emits one metadata frame and
//! then every chunk in increasing index order on a spawned task. Progress
//! after chunk `i` of `n` is `(i + 1) * 100 / n`. A failed channel write
//! fails the transfer; nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use super::{percent, SharedRegistry, TransferResult, TransferStatus, TransferUpdate, UpdateFn};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::file::{FileChunker, OutgoingFile};
use crate::protocol::{self, Chunk, TransferId, TransferMetadata};

/// Handle to an outbound transfer in progress.
#[derive(Debug)]
pub struct SendHandle {
    id: TransferId,
    progress: watch::Receiver<u8>,
    done: oneshot::Receiver<Result<()>>,
}

impl SendHandle {
    /// Transfer id.
    #[must_use]
    pub const fn id(&self) -> TransferId {
        self.id
    }

    /// Progress stream, in percent.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    /// Wait until every chunk has been handed to the channel.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the transfer.
    pub async fn finished(self) -> Result<()> {
        self.done
            .await
            .map_err(|_| Error::Internal("sender task dropped".to_string()))?
    }
}

/// Emits outbound transfers onto a channel.
#[derive(Clone)]
pub struct TransferSender {
    registry: SharedRegistry,
    notify: UpdateFn,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl std::fmt::Debug for TransferSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSender")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_delay", &self.chunk_delay)
            .finish_non_exhaustive()
    }
}

impl TransferSender {
    /// Create a sender over a shared registry.
    ///
    /// `notify` is called after every status or progress change.
    #[must_use]
    pub fn new(registry: SharedRegistry, notify: UpdateFn) -> Self {
        Self {
            registry,
            notify,
            chunk_size: crate::CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Pause between consecutive chunks.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Start sending a file.
    ///
    /// Returns once the transfer is registered; chunks are emitted in the
    /// background.
    ///
    /// # Errors
    ///
    /// - [`Error::NoActiveConnection`] if `channel` is absent or closed;
    ///   nothing is registered
    /// - file errors if the source cannot be opened
    pub async fn send(
        &self,
        file: &OutgoingFile,
        channel: Option<Arc<dyn Channel>>,
    ) -> Result<SendHandle> {
        let channel = match channel {
            Some(channel) if channel.is_open() => channel,
            _ => return Err(Error::NoActiveConnection),
        };

        let metadata = file.metadata();
        let total = u32::try_from(metadata.total_chunks()).map_err(|_| {
            Error::InvalidInput(format!("'{}' is too large to send", metadata.name))
        })?;
        let chunker = file.chunker(self.chunk_size).await?;

        let id = metadata.id;
        let update = self.registry.lock().await.begin_outbound(metadata.clone()).update();
        (self.notify)(&update);

        tracing::info!(
            "Sending {} ({} bytes, {} chunks) as {}",
            metadata.name,
            metadata.size,
            total,
            id
        );

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let (done_tx, done_rx) = oneshot::channel();

        let job = SendJob {
            sender: self.clone(),
            channel,
            metadata,
            total,
            progress_tx,
        };

        tokio::spawn(async move {
            let result = job.run(chunker).await;
            let _ = done_tx.send(result);
        });

        Ok(SendHandle {
            id,
            progress: progress_rx,
            done: done_rx,
        })
    }
}

struct SendJob {
    sender: TransferSender,
    channel: Arc<dyn Channel>,
    metadata: TransferMetadata,
    total: u32,
    progress_tx: watch::Sender<u8>,
}

impl SendJob {
    async fn run(self, chunker: FileChunker) -> Result<()> {
        let id = self.metadata.id;

        match self.emit(chunker).await {
            Ok(()) => {
                let update = self
                    .sender
                    .registry
                    .lock()
                    .await
                    .complete(&id, TransferResult::Sent)
                    .map(|r| r.update());
                if let Some(update) = update {
                    (self.sender.notify)(&update);
                }
                let _ = self.progress_tx.send(100);
                tracing::info!("Sent {} ({})", self.metadata.name, id);
                Ok(())
            }
            Err(Error::TransferCancelled) => {
                tracing::info!("Transfer {} cancelled", id);
                Err(Error::TransferCancelled)
            }
            Err(e) => {
                tracing::error!("Transfer {} failed: {}", id, e);
                let update = self
                    .sender
                    .registry
                    .lock()
                    .await
                    .fail(&id, &e.to_string())
                    .map(|r| r.update());
                if let Some(update) = update {
                    (self.sender.notify)(&update);
                }
                Err(e)
            }
        }
    }

    async fn emit(&self, mut chunker: FileChunker) -> Result<()> {
        let id = self.metadata.id;

        self.channel
            .send(protocol::encode_metadata(&self.metadata)?)
            .await?;

        let mut sent = 0u32;
        while let Some((index, payload)) = chunker.next_chunk().await? {
            self.ensure_active(id).await?;

            let index = u32::try_from(index)
                .ok()
                .filter(|i| *i < self.total)
                .ok_or_else(|| {
                    Error::InvalidInput(format!("'{}' grew while sending", self.metadata.name))
                })?;

            let chunk = Chunk {
                transfer_id: id,
                index,
                total: self.total,
                payload,
            };
            self.channel.send(protocol::encode_chunk(&chunk)).await?;
            sent += 1;

            let progress = percent(u64::from(index) + 1, u64::from(self.total));
            self.report(id, progress).await;
            tracing::debug!("Sent chunk {}/{} of {}", index + 1, self.total, id);

            if self.sender.chunk_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.sender.chunk_delay).await;
            }
        }

        if sent != self.total {
            return Err(Error::InvalidInput(format!(
                "'{}' shrank while sending",
                self.metadata.name
            )));
        }

        Ok(())
    }

    /// Stop if the transfer was cancelled or the connection dropped.
    async fn ensure_active(&self, id: TransferId) -> Result<()> {
        let registry = self.sender.registry.lock().await;
        match registry.get(&id).map(|r| r.status) {
            Some(TransferStatus::Sending) => Ok(()),
            Some(TransferStatus::Error) => Err(Error::ConnectionLost),
            _ => Err(Error::TransferCancelled),
        }
    }

    async fn report(&self, id: TransferId, progress: u8) {
        let update: Option<TransferUpdate> = self
            .sender
            .registry
            .lock()
            .await
            .set_progress(&id, progress)
            .map(|r| r.update());

        let _ = self.progress_tx.send(progress);
        if let Some(update) = update {
            (self.sender.notify)(&update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, ChannelEvent};
    use crate::protocol::Frame;
    use crate::transfer::TransferRegistry;
    use std::sync::Mutex as StdMutex;

    fn recording_sender(registry: &SharedRegistry) -> (TransferSender, Arc<StdMutex<Vec<TransferUpdate>>>) {
        let updates = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let notify: UpdateFn = Arc::new(move |u: &TransferUpdate| {
            sink.lock().expect("lock").push(u.clone());
        });
        (TransferSender::new(Arc::clone(registry), notify), updates)
    }

    fn drain_frames(rx: &mut crate::channel::EventReceiver) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChannelEvent::Data(bytes) = event {
                frames.push(protocol::decode(&bytes).expect("decode"));
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_send_emits_metadata_then_ordered_chunks() {
        let registry = TransferRegistry::shared();
        let (sender, updates) = recording_sender(&registry);
        let ((left, _left_rx), (_right, mut right_rx)) = memory_pair();

        let content = vec![3u8; 40_000];
        let file = OutgoingFile::from_bytes("forty.bin", content.clone());
        let handle = sender
            .send(&file, Some(left as Arc<dyn Channel>))
            .await
            .expect("send");
        let id = handle.id();
        let progress = handle.progress();
        handle.finished().await.expect("finished");

        assert_eq!(*progress.borrow(), 100);

        let frames = drain_frames(&mut right_rx);
        assert_eq!(frames.len(), 4);
        let Frame::Metadata(metadata) = &frames[0] else {
            panic!("first frame must be metadata");
        };
        assert_eq!(metadata.id, id);
        assert_eq!(metadata.size, 40_000);

        let chunks: Vec<&Chunk> = frames[1..]
            .iter()
            .map(|f| match f {
                Frame::Chunk(c) => c,
                Frame::Metadata(_) => panic!("unexpected metadata"),
            })
            .collect();
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.total == 3));
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(),
            vec![16_384, 16_384, 7_232]
        );

        let record_status = registry.lock().await.get(&id).expect("record").status;
        assert_eq!(record_status, TransferStatus::Complete);

        let seen: Vec<u8> = updates.lock().expect("lock").iter().map(|u| u.progress).collect();
        assert_eq!(seen, vec![0, 33, 66, 100, 100]);
    }

    #[tokio::test]
    async fn test_send_without_channel_registers_nothing() {
        let registry = TransferRegistry::shared();
        let (sender, _updates) = recording_sender(&registry);
        let file = OutgoingFile::from_bytes("a.txt", b"abc".to_vec());

        let result = sender.send(&file, None).await;
        assert!(matches!(result, Err(Error::NoActiveConnection)));

        let ((left, _l), (right, _r)) = memory_pair();
        right.close();
        let result = sender.send(&file, Some(left as Arc<dyn Channel>)).await;
        assert!(matches!(result, Err(Error::NoActiveConnection)));

        assert!(registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_file_completes_immediately() {
        let registry = TransferRegistry::shared();
        let (sender, _updates) = recording_sender(&registry);
        let ((left, _left_rx), (_right, mut right_rx)) = memory_pair();

        let file = OutgoingFile::from_bytes("empty.txt", Vec::new());
        let handle = sender
            .send(&file, Some(left as Arc<dyn Channel>))
            .await
            .expect("send");
        let id = handle.id();
        handle.finished().await.expect("finished");

        let frames = drain_frames(&mut right_rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Metadata(_)));

        let guard = registry.lock().await;
        let record = guard.get(&id).expect("record");
        assert_eq!(record.status, TransferStatus::Complete);
        assert_eq!(record.progress, 100);
    }

    #[tokio::test]
    async fn test_channel_failure_marks_error() {
        let registry = TransferRegistry::shared();
        let (sender, _updates) = recording_sender(&registry);
        let sender = sender.with_chunk_delay(Duration::from_millis(20));
        let ((left, _left_rx), (right, _right_rx)) = memory_pair();

        let file = OutgoingFile::from_bytes("big.bin", vec![0u8; 10 * crate::CHUNK_SIZE]);
        let handle = sender
            .send(&file, Some(Arc::clone(&left) as Arc<dyn Channel>))
            .await
            .expect("send");
        let id = handle.id();

        tokio::time::sleep(Duration::from_millis(30)).await;
        right.close();

        let result = handle.finished().await;
        assert!(matches!(result, Err(Error::ChannelError(_))));

        let guard = registry.lock().await;
        let record = guard.get(&id).expect("record");
        assert_eq!(record.status, TransferStatus::Error);
        assert!(record.error.is_some());
        assert!(record.progress < 100);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        let registry = TransferRegistry::shared();
        let (sender, _updates) = recording_sender(&registry);
        let sender = sender.with_chunk_delay(Duration::from_millis(20));
        let ((left, _left_rx), (_right, mut right_rx)) = memory_pair();

        let file = OutgoingFile::from_bytes("big.bin", vec![0u8; 10 * crate::CHUNK_SIZE]);
        let handle = sender
            .send(&file, Some(left as Arc<dyn Channel>))
            .await
            .expect("send");
        let id = handle.id();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.lock().await.remove(&id);

        let result = handle.finished().await;
        assert!(matches!(result, Err(Error::TransferCancelled)));

        let chunk_frames = drain_frames(&mut right_rx)
            .into_iter()
            .filter(|f| matches!(f, Frame::Chunk(_)))
            .count();
        assert!(chunk_frames < 10);
        assert!(registry.lock().await.get(&id).is_none());
    }
}
