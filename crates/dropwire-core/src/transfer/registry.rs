//! Transfer registry.
//!
//! The registry maps transfer ids to their [`TransferRecord`]s and owns the
//! chunk arena of every inbound transfer. An arena has exactly `total` slots,
//! allocated on the first chunk once its `total` matches the chunk count of the
//! announced size, plus a count of filled
//! slots. A slot written twice is only counted once, and the call that fills
//! the last slot is the only one that reports completion.
//!
//! The registry itself is not synchronized; sessions share it as a
//! [`SharedRegistry`] and perform each operation under the lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{percent, TransferDirection, TransferRecord, TransferResult, TransferStatus, TransferView};
use crate::error::{Error, Result};
use crate::protocol::{TransferId, TransferMetadata};

/// Registry shared between a session, its sender tasks and its event loop.
pub type SharedRegistry = Arc<Mutex<TransferRegistry>>;

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Progress after storing the chunk
    pub progress: u8,
    /// True only for the call that filled the last slot
    pub is_complete: bool,
}

/// Fixed-size slot buffer for one inbound transfer.
#[derive(Debug)]
pub(crate) struct ChunkArena {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    completed: bool,
}

impl ChunkArena {
    fn new(total: usize) -> Self {
        Self {
            slots: vec![None; total],
            filled: 0,
            completed: false,
        }
    }

    fn total(&self) -> usize {
        self.slots.len()
    }

    /// Slots in index order. Only meaningful once every slot is filled.
    fn into_chunks(self) -> Vec<Vec<u8>> {
        self.slots.into_iter().flatten().collect()
    }
}

/// Map of all known transfers.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    records: HashMap<TransferId, TransferRecord>,
    next_seq: u64,
}

impl TransferRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry ready to be shared.
    #[must_use]
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a transfer this side is sending.
    pub fn begin_outbound(&mut self, metadata: TransferMetadata) -> &TransferRecord {
        self.insert(metadata, TransferDirection::Outbound)
    }

    /// Register a transfer announced by the peer.
    ///
    /// No arena is allocated until the first chunk arrives.
    pub fn begin_inbound(&mut self, metadata: TransferMetadata) -> &TransferRecord {
        self.insert(metadata, TransferDirection::Inbound)
    }

    fn insert(&mut self, metadata: TransferMetadata, direction: TransferDirection) -> &TransferRecord {
        let id = metadata.id;
        let seq = self.next_seq;
        self.next_seq += 1;

        tracing::debug!(
            "Registering {:?} transfer {} ({}, {} bytes)",
            direction,
            id,
            metadata.name,
            metadata.size
        );

        self.records
            .entry(id)
            .insert_entry(TransferRecord::new(metadata, direction, seq))
            .into_mut()
    }

    /// Store one inbound chunk.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownTransfer`] if the id was never announced
    /// - [`Error::MalformedFrame`] if `index >= total`, `total` disagrees
    ///   with the announced size, or the id belongs to an outbound transfer
    pub fn record_chunk(
        &mut self,
        id: TransferId,
        index: u32,
        total: u32,
        payload: Vec<u8>,
    ) -> Result<ChunkProgress> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(Error::UnknownTransfer(id))?;

        if record.direction != TransferDirection::Inbound {
            return Err(Error::MalformedFrame(format!(
                "chunk for outbound transfer {id}"
            )));
        }

        if total == 0 || index >= total {
            return Err(Error::MalformedFrame(format!(
                "chunk index {index} out of range for total {total}"
            )));
        }

        if record.status != TransferStatus::Receiving {
            return Ok(ChunkProgress {
                progress: record.progress,
                is_complete: false,
            });
        }

        let expected = record.metadata.total_chunks();
        if u64::from(total) != expected {
            return Err(Error::MalformedFrame(format!(
                "chunk total {total} disagrees with {expected} announced for transfer {id}"
            )));
        }

        let arena = record
            .chunks
            .get_or_insert_with(|| ChunkArena::new(total as usize));

        let slot = &mut arena.slots[index as usize];
        if slot.is_none() {
            arena.filled += 1;
        }
        *slot = Some(payload);

        let progress = percent(arena.filled as u64, arena.total() as u64);
        let is_complete = arena.filled == arena.total() && !arena.completed;
        if is_complete {
            arena.completed = true;
        }

        record.progress = record.progress.max(progress);

        Ok(ChunkProgress {
            progress: record.progress,
            is_complete,
        })
    }

    /// Look up a transfer.
    #[must_use]
    pub fn get(&self, id: &TransferId) -> Option<&TransferRecord> {
        self.records.get(id)
    }

    /// Whether the id is known.
    #[must_use]
    pub fn contains(&self, id: &TransferId) -> bool {
        self.records.contains_key(id)
    }

    /// Drop a transfer and everything it holds.
    pub fn remove(&mut self, id: &TransferId) -> Option<TransferRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            tracing::debug!("Removed transfer {}", id);
        }
        removed
    }

    /// Raise a transfer's progress. Lower values are ignored.
    pub fn set_progress(&mut self, id: &TransferId, progress: u8) -> Option<&TransferRecord> {
        let record = self.records.get_mut(id)?;
        if !record.status.is_terminal() {
            record.progress = record.progress.max(progress.min(100));
        }
        Some(record)
    }

    /// Mark a transfer complete and store its result.
    ///
    /// Any chunk arena is released.
    pub fn complete(&mut self, id: &TransferId, result: TransferResult) -> Option<&TransferRecord> {
        let record = self.records.get_mut(id)?;
        if record.status.is_terminal() {
            return Some(record);
        }

        record.status = TransferStatus::Complete;
        record.progress = 100;
        record.result = Some(result);
        record.chunks = None;
        Some(record)
    }

    /// Mark a non-terminal transfer failed, releasing its arena.
    ///
    /// Returns the record if it changed.
    pub fn fail(&mut self, id: &TransferId, reason: &str) -> Option<&TransferRecord> {
        let record = self.records.get_mut(id)?;
        if record.status.is_terminal() {
            return None;
        }

        record.status = TransferStatus::Error;
        record.error = Some(reason.to_string());
        record.chunks = None;
        Some(record)
    }

    /// Fail every transfer still in flight.
    ///
    /// Completed results are kept. Returns the ids that changed.
    pub fn fail_in_flight(&mut self, reason: &str) -> Vec<TransferId> {
        let mut failed: Vec<(u64, TransferId)> = self
            .records
            .values_mut()
            .filter(|r| !r.status.is_terminal())
            .map(|record| {
                record.status = TransferStatus::Error;
                record.error = Some(reason.to_string());
                record.chunks = None;
                (record.seq, record.id())
            })
            .collect();

        failed.sort_unstable();
        failed.into_iter().map(|(_, id)| id).collect()
    }

    /// Move a fully received arena out of the registry.
    ///
    /// Returns the chunks in index order, or `None` if the transfer has no
    /// arena or it is not yet full.
    pub fn take_chunks(&mut self, id: &TransferId) -> Option<Vec<Vec<u8>>> {
        let record = self.records.get_mut(id)?;
        let full = record
            .chunks
            .as_ref()
            .is_some_and(|a| a.filled == a.total());

        if full {
            record.chunks.take().map(ChunkArena::into_chunks)
        } else {
            None
        }
    }

    /// Snapshots of every transfer, oldest first.
    #[must_use]
    pub fn views(&self) -> Vec<TransferView> {
        let mut records: Vec<&TransferRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(TransferRecord::view).collect()
    }

    /// Drop every transfer.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn inbound(registry: &mut TransferRegistry, size: u64) -> TransferId {
        let metadata = TransferMetadata::new("data.bin", size, None, Utc::now());
        registry.begin_inbound(metadata).id()
    }

    #[test]
    fn test_begin_sets_direction_and_status() {
        let mut registry = TransferRegistry::new();
        let metadata = TransferMetadata::new("out.txt", 10, Some("text/plain"), Utc::now());
        let record = registry.begin_outbound(metadata);
        assert_eq!(record.direction, TransferDirection::Outbound);
        assert_eq!(record.status, TransferStatus::Sending);
        assert_eq!(record.progress, 0);

        let id = inbound(&mut registry, 10);
        let record = registry.get(&id).expect("record");
        assert_eq!(record.status, TransferStatus::Receiving);
        assert!(!record.has_buffer());
    }

    #[test]
    fn test_registry_never_reports_pending() {
        let mut registry = TransferRegistry::new();
        let no_pending = |registry: &TransferRegistry| {
            registry
                .views()
                .iter()
                .all(|view| view.status != TransferStatus::Pending)
        };

        registry.begin_outbound(TransferMetadata::new("out.bin", 20_000, None, Utc::now()));
        let id = inbound(&mut registry, 20_000);
        assert!(no_pending(&registry));

        registry.record_chunk(id, 0, 2, vec![0; 16_384]).expect("chunk");
        assert!(no_pending(&registry));

        assert_eq!(registry.fail_in_flight("Connection lost").len(), 2);
        assert!(no_pending(&registry));
    }

    #[test]
    fn test_forty_thousand_byte_progress() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 40_000);

        let p0 = registry.record_chunk(id, 0, 3, vec![0; 16_384]).expect("chunk 0");
        assert_eq!(p0, ChunkProgress { progress: 33, is_complete: false });

        let p1 = registry.record_chunk(id, 1, 3, vec![1; 16_384]).expect("chunk 1");
        assert_eq!(p1, ChunkProgress { progress: 66, is_complete: false });

        let p2 = registry.record_chunk(id, 2, 3, vec![2; 7_232]).expect("chunk 2");
        assert_eq!(p2, ChunkProgress { progress: 100, is_complete: true });

        let chunks = registry.take_chunks(&id).expect("full arena");
        let lengths: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![16_384, 16_384, 7_232]);
        assert!(!registry.get(&id).expect("record").has_buffer());
    }

    #[test]
    fn test_reverse_order_completes_once() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 40_000);

        let mut completions = 0;
        let mut last = 0;
        for index in (0..3).rev() {
            let p = registry.record_chunk(id, index, 3, vec![index as u8]).expect("chunk");
            assert!(p.progress >= last);
            last = p.progress;
            if p.is_complete {
                completions += 1;
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(last, 100);
        assert_eq!(registry.take_chunks(&id), Some(vec![vec![0], vec![1], vec![2]]));
    }

    #[test]
    fn test_duplicate_chunk_counts_once() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 20_000);

        let first = registry.record_chunk(id, 0, 2, vec![9]).expect("chunk");
        let dup = registry.record_chunk(id, 0, 2, vec![9]).expect("duplicate");
        assert_eq!(first, dup);
        assert_eq!(dup.progress, 50);

        let done = registry.record_chunk(id, 1, 2, vec![8]).expect("last");
        assert!(done.is_complete);

        let late = registry.record_chunk(id, 1, 2, vec![8]).expect("late duplicate");
        assert_eq!(late, ChunkProgress { progress: 100, is_complete: false });
    }

    #[test]
    fn test_duplicate_after_completion() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 1);

        assert!(registry.record_chunk(id, 0, 1, vec![1]).expect("chunk").is_complete);
        let chunks = registry.take_chunks(&id).expect("arena");
        registry.complete(
            &id,
            TransferResult::Received(crate::file::ReceivedFile::new(
                registry.get(&id).expect("record").metadata.clone(),
                chunks.concat(),
            )),
        );

        let late = registry.record_chunk(id, 0, 1, vec![1]).expect("late");
        assert_eq!(late, ChunkProgress { progress: 100, is_complete: false });
        assert!(!registry.get(&id).expect("record").has_buffer());
    }

    #[test]
    fn test_unknown_transfer_leaves_registry_unchanged() {
        let mut registry = TransferRegistry::new();
        let known = inbound(&mut registry, 10);
        let stranger = TransferId::new();

        let result = registry.record_chunk(stranger, 0, 1, vec![0]);
        assert!(matches!(result, Err(Error::UnknownTransfer(id)) if id == stranger));
        assert_eq!(registry.len(), 1);
        assert!(!registry.get(&known).expect("record").has_buffer());
    }

    #[test]
    fn test_out_of_range_and_total_mismatch() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 40_000);

        assert!(matches!(
            registry.record_chunk(id, 3, 3, vec![0]),
            Err(Error::MalformedFrame(_))
        ));

        registry.record_chunk(id, 0, 3, vec![0]).expect("chunk");
        assert!(matches!(
            registry.record_chunk(id, 1, 4, vec![0]),
            Err(Error::MalformedFrame(_))
        ));
        assert_eq!(registry.get(&id).expect("record").progress, 33);
    }

    #[test]
    fn test_oversized_total_is_rejected_without_allocating() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 10);

        let result = registry.record_chunk(id, 0, u32::MAX, vec![1; 10]);
        assert!(matches!(result, Err(Error::MalformedFrame(_))));

        let record = registry.get(&id).expect("record");
        assert!(!record.has_buffer());
        assert_eq!(record.progress, 0);
        assert_eq!(record.status, TransferStatus::Receiving);

        let ok = registry.record_chunk(id, 0, 1, vec![1; 10]).expect("valid chunk");
        assert!(ok.is_complete);
    }

    #[test]
    fn test_chunk_for_outbound_is_rejected() {
        let mut registry = TransferRegistry::new();
        let metadata = TransferMetadata::new("mine.bin", 1, None, Utc::now());
        let id = registry.begin_outbound(metadata).id();

        assert!(matches!(
            registry.record_chunk(id, 0, 1, vec![0]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_set_progress_is_monotonic() {
        let mut registry = TransferRegistry::new();
        let metadata = TransferMetadata::new("out.bin", 100, None, Utc::now());
        let id = registry.begin_outbound(metadata).id();

        registry.set_progress(&id, 40);
        registry.set_progress(&id, 20);
        assert_eq!(registry.get(&id).expect("record").progress, 40);

        registry.set_progress(&id, 250);
        assert_eq!(registry.get(&id).expect("record").progress, 100);
    }

    #[test]
    fn test_fail_in_flight_keeps_completed() {
        let mut registry = TransferRegistry::new();

        let done = inbound(&mut registry, 1);
        registry.record_chunk(done, 0, 1, vec![1]).expect("chunk");
        let chunks = registry.take_chunks(&done).expect("arena");
        let metadata = registry.get(&done).expect("record").metadata.clone();
        registry.complete(
            &done,
            TransferResult::Received(crate::file::ReceivedFile::new(metadata, chunks.concat())),
        );

        let partial = inbound(&mut registry, 40_000);
        registry.record_chunk(partial, 0, 3, vec![0; 16_384]).expect("chunk");

        let failed = registry.fail_in_flight("connection lost");
        assert_eq!(failed, vec![partial]);

        let record = registry.get(&partial).expect("record");
        assert_eq!(record.status, TransferStatus::Error);
        assert_eq!(record.error.as_deref(), Some("connection lost"));
        assert!(!record.has_buffer());

        registry.remove(&partial);
        let kept = registry.get(&done).expect("completed record");
        assert_eq!(kept.status, TransferStatus::Complete);
        assert_eq!(kept.received_file().expect("content").content(), &[1]);
    }

    #[test]
    fn test_fail_ignores_terminal() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 1);
        assert!(registry.fail(&id, "boom").is_some());
        assert!(registry.fail(&id, "again").is_none());
        assert_eq!(
            registry.get(&id).expect("record").error.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_take_chunks_requires_full_arena() {
        let mut registry = TransferRegistry::new();
        let id = inbound(&mut registry, 40_000);
        assert!(registry.take_chunks(&id).is_none());

        registry.record_chunk(id, 0, 3, vec![0]).expect("chunk");
        assert!(registry.take_chunks(&id).is_none());
        assert!(registry.get(&id).expect("record").has_buffer());
    }

    #[test]
    fn test_views_in_registration_order() {
        let mut registry = TransferRegistry::new();
        let ids: Vec<TransferId> = (0..5).map(|_| inbound(&mut registry, 1)).collect();

        let viewed: Vec<TransferId> = registry.views().into_iter().map(|v| v.id).collect();
        assert_eq!(viewed, ids);

        registry.clear();
        assert!(registry.is_empty());
    }
}
