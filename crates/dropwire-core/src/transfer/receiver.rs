//! Receiver pipeline.
//!
//! Routes decoded inbound frames into the registry. A metadata frame for an
//! unseen id opens an inbound transfer; chunk frames fill its arena. When the
//! last slot is filled the slots are joined in index order, checked against
//! the announced size and stored as a [`ReceivedFile`]. An empty file has no
//! chunks and completes on its metadata.

use super::{TransferRegistry, TransferResult, TransferUpdate};
use crate::error::{Error, Result};
use crate::file::ReceivedFile;
use crate::protocol::Frame;

/// Apply one inbound frame.
///
/// Returns an update when the frame changed a transfer's status or progress.
///
/// # Errors
///
/// Returns [`Error::UnknownTransfer`] or [`Error::MalformedFrame`] for chunks
/// that cannot be accepted. The registry is left unchanged and the caller
/// should drop the frame.
pub fn on_frame(registry: &mut TransferRegistry, frame: Frame) -> Result<Option<TransferUpdate>> {
    match frame {
        Frame::Metadata(metadata) => {
            if registry.contains(&metadata.id) {
                tracing::debug!("Ignoring repeated metadata for {}", metadata.id);
                return Ok(None);
            }

            tracing::info!(
                "Receiving {} ({} bytes, {}) as {}",
                metadata.name,
                metadata.size,
                metadata.mime_type,
                metadata.id
            );
            if metadata.size == 0 {
                let id = metadata.id;
                registry.begin_inbound(metadata.clone());
                tracing::info!("Received {} (0 bytes)", metadata.name);
                return Ok(registry
                    .complete(&id, TransferResult::Received(ReceivedFile::new(metadata, Vec::new())))
                    .map(super::TransferRecord::update));
            }

            Ok(Some(registry.begin_inbound(metadata).update()))
        }
        Frame::Chunk(chunk) => {
            let id = chunk.transfer_id;
            let before = registry
                .get(&id)
                .map(|r| r.progress)
                .ok_or(Error::UnknownTransfer(id))?;

            let progress = registry.record_chunk(id, chunk.index, chunk.total, chunk.payload)?;
            tracing::debug!(
                "Chunk {}/{} of {} ({}%)",
                chunk.index + 1,
                chunk.total,
                id,
                progress.progress
            );

            if progress.is_complete {
                return Ok(finish(registry, &id));
            }

            if progress.progress == before {
                return Ok(None);
            }

            Ok(registry.get(&id).map(super::TransferRecord::update))
        }
    }
}

fn finish(registry: &mut TransferRegistry, id: &crate::protocol::TransferId) -> Option<TransferUpdate> {
    let chunks = registry.take_chunks(id)?;
    let metadata = registry.get(id)?.metadata.clone();

    let content = chunks.concat();
    let actual = content.len() as u64;
    if actual != metadata.size {
        tracing::warn!(
            "{} for {}",
            Error::SizeMismatch {
                expected: metadata.size,
                actual,
            },
            metadata.name
        );
    }

    tracing::info!("Received {} ({} bytes)", metadata.name, actual);

    let file = ReceivedFile::new(metadata, content);
    registry
        .complete(id, TransferResult::Received(file))
        .map(super::TransferRecord::update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Chunk, TransferId, TransferMetadata};
    use crate::transfer::TransferStatus;
    use chrono::Utc;

    fn announce(registry: &mut TransferRegistry, size: u64) -> TransferMetadata {
        let metadata = TransferMetadata::new("photo.jpg", size, Some("image/jpeg"), Utc::now());
        on_frame(registry, Frame::Metadata(metadata.clone())).expect("metadata");
        metadata
    }

    fn chunk(id: TransferId, index: u32, total: u32, payload: Vec<u8>) -> Frame {
        Frame::Chunk(Chunk {
            transfer_id: id,
            index,
            total,
            payload,
        })
    }

    fn split(content: &[u8]) -> Vec<Vec<u8>> {
        content
            .chunks(crate::CHUNK_SIZE)
            .map(<[u8]>::to_vec)
            .collect()
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut registry = TransferRegistry::new();
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let metadata = announce(&mut registry, content.len() as u64);

        let parts = split(&content);
        let mut progress = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            let update = on_frame(
                &mut registry,
                chunk(metadata.id, index as u32, 3, part.clone()),
            )
            .expect("chunk")
            .expect("update");
            progress.push(update.progress);
        }
        assert_eq!(progress, vec![33, 66, 100]);

        let record = registry.get(&metadata.id).expect("record");
        assert_eq!(record.status, TransferStatus::Complete);
        assert!(!record.has_buffer());

        let file = record.received_file().expect("file");
        assert_eq!(file.len(), 40_000);
        assert_eq!(file.content(), content.as_slice());
        assert_eq!(file.metadata().mime_type, "image/jpeg");
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let mut registry = TransferRegistry::new();
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8).collect();
        let metadata = announce(&mut registry, content.len() as u64);

        let parts = split(&content);
        let total = parts.len() as u32;
        for (index, part) in parts.into_iter().enumerate().rev() {
            on_frame(&mut registry, chunk(metadata.id, index as u32, total, part)).expect("chunk");
        }

        let record = registry.get(&metadata.id).expect("record");
        assert_eq!(record.progress, 100);
        assert_eq!(record.received_file().expect("file").content(), content.as_slice());
    }

    #[test]
    fn test_empty_file_completes_on_metadata() {
        let mut registry = TransferRegistry::new();
        let metadata = TransferMetadata::new("empty.txt", 0, Some("text/plain"), Utc::now());

        let update = on_frame(&mut registry, Frame::Metadata(metadata.clone()))
            .expect("metadata")
            .expect("update");
        assert_eq!(update.status, TransferStatus::Complete);
        assert_eq!(update.progress, 100);

        let record = registry.get(&metadata.id).expect("record");
        assert!(!record.has_buffer());
        let file = record.received_file().expect("file");
        assert!(file.is_empty());
        assert_eq!(file.metadata().name, "empty.txt");

        let repeated = on_frame(&mut registry, Frame::Metadata(metadata)).expect("metadata");
        assert!(repeated.is_none());
    }

    #[test]
    fn test_repeated_metadata_is_ignored() {
        let mut registry = TransferRegistry::new();
        let metadata = announce(&mut registry, 10);
        on_frame(&mut registry, chunk(metadata.id, 0, 1, vec![0; 5])).expect("chunk");

        let update = on_frame(&mut registry, Frame::Metadata(metadata.clone())).expect("metadata");
        assert!(update.is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&metadata.id).expect("record").progress, 100);
    }

    #[test]
    fn test_duplicate_chunk_has_no_update() {
        let mut registry = TransferRegistry::new();
        let metadata = announce(&mut registry, 20_000);

        let first = on_frame(&mut registry, chunk(metadata.id, 0, 2, vec![1; 16_384])).expect("chunk");
        assert_eq!(first.expect("update").progress, 50);

        let dup = on_frame(&mut registry, chunk(metadata.id, 0, 2, vec![1; 16_384])).expect("dup");
        assert!(dup.is_none());
    }

    #[test]
    fn test_unknown_chunk_is_rejected() {
        let mut registry = TransferRegistry::new();
        let result = on_frame(&mut registry, chunk(TransferId::new(), 0, 1, vec![1]));

        assert!(matches!(result, Err(Error::UnknownTransfer(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_size_mismatch_still_completes() {
        let mut registry = TransferRegistry::new();
        let metadata = announce(&mut registry, 100);

        let update = on_frame(&mut registry, chunk(metadata.id, 0, 1, vec![5; 60]))
            .expect("chunk")
            .expect("update");
        assert_eq!(update.status, TransferStatus::Complete);

        let record = registry.get(&metadata.id).expect("record");
        assert_eq!(record.received_file().expect("file").len(), 60);
    }
}
