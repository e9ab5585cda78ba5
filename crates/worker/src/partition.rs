//! Per-partition checkpoint and deduplication state.
//!
//! The table is a fixed arena indexed by partition id. Every slot is made of
//! independent atomics, so operations on different partitions never contend and
//! no global lock exists. Only the execution thread advances checkpoints; control
//! requests (filters, resets) may arrive from the ingress task at any time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use protocol::NUM_PARTITIONS;

#[derive(Default)]
struct PartitionState {
    last_processed_seq: AtomicU64,
    last_processed_valid: AtomicBool,
    dedup_filter_seq: AtomicU64,
    dedup_filter_valid: AtomicBool,
    timer_filtered: AtomicBool,
    processed_ops: AtomicU64,
}

/// Result of [`PartitionTable::update_checkpoint_seq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointUpdate {
    Advanced,
    Unchanged,
    /// Lower than the current checkpoint; ignored.
    Regressed { current: u64 },
    OutOfRange,
}

pub struct PartitionTable {
    partitions: Box<[PartitionState]>,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new(NUM_PARTITIONS)
    }
}

impl PartitionTable {
    pub fn new(num_partitions: usize) -> Self {
        let partitions = (0..num_partitions)
            .map(|_| PartitionState::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { partitions }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    fn slot(&self, partition: usize) -> Option<&PartitionState> {
        let slot = self.partitions.get(partition);
        if slot.is_none() {
            tracing::warn!("partition {} outside table of {}", partition, self.len());
        }
        slot
    }

    /// Treat every future event for `partition` with sequence <= `seq` as a duplicate.
    pub fn set_filter(&self, partition: usize, seq: u64) {
        if let Some(slot) = self.slot(partition) {
            slot.dedup_filter_seq.store(seq, Ordering::Release);
            slot.dedup_filter_valid.store(true, Ordering::Release);
            tracing::debug!("partition {} dedup filter set at seq {}", partition, seq);
        }
    }

    pub fn filter_seq(&self, partition: usize) -> Option<u64> {
        let slot = self.partitions.get(partition)?;
        if slot.dedup_filter_valid.load(Ordering::Acquire) {
            Some(slot.dedup_filter_seq.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Whether an event must be dropped before reaching the handler.
    pub fn is_filtered(&self, partition: usize, seq: u64) -> bool {
        matches!(self.filter_seq(partition), Some(filter) if seq <= filter)
    }

    pub fn checkpoint_seq(&self, partition: usize) -> Option<u64> {
        let slot = self.partitions.get(partition)?;
        if slot.last_processed_valid.load(Ordering::Acquire) {
            Some(slot.last_processed_seq.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Advance the checkpoint. A lower sequence is a logged no-op.
    pub fn update_checkpoint_seq(&self, partition: usize, seq: u64) -> CheckpointUpdate {
        let Some(slot) = self.slot(partition) else {
            return CheckpointUpdate::OutOfRange;
        };

        if !slot.last_processed_valid.load(Ordering::Acquire) {
            slot.last_processed_seq.store(seq, Ordering::Release);
            slot.last_processed_valid.store(true, Ordering::Release);
            return CheckpointUpdate::Advanced;
        }

        let mut current = slot.last_processed_seq.load(Ordering::Acquire);
        loop {
            if seq < current {
                tracing::warn!(
                    "partition {} checkpoint regression ignored: {} < {}",
                    partition,
                    seq,
                    current
                );
                return CheckpointUpdate::Regressed { current };
            }
            if seq == current {
                return CheckpointUpdate::Unchanged;
            }
            match slot.last_processed_seq.compare_exchange_weak(
                current,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return CheckpointUpdate::Advanced,
                Err(actual) => current = actual,
            }
        }
    }

    /// Forget the checkpoint and dedup filter, e.g. after the partition moved.
    pub fn reset_checkpoint(&self, partition: usize) {
        if let Some(slot) = self.slot(partition) {
            slot.last_processed_valid.store(false, Ordering::Release);
            slot.dedup_filter_valid.store(false, Ordering::Release);
            tracing::debug!("partition {} checkpoint reset", partition);
        }
    }

    /// Stop executing timers for `partition`.
    pub fn set_timer_filter(&self, partition: usize) {
        if let Some(slot) = self.slot(partition) {
            slot.timer_filtered.store(true, Ordering::Release);
        }
    }

    pub fn clear_timer_filter(&self, partition: usize) {
        if let Some(slot) = self.slot(partition) {
            slot.timer_filtered.store(false, Ordering::Release);
        }
    }

    pub fn timer_enabled(&self, partition: usize) -> bool {
        self.partitions
            .get(partition)
            .map(|slot| !slot.timer_filtered.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn record_processed(&self, partition: usize) {
        if let Some(slot) = self.partitions.get(partition) {
            slot.processed_ops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn processed_ops(&self, partition: usize) -> u64 {
        self.partitions
            .get(partition)
            .map(|slot| slot.processed_ops.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Every partition with a valid checkpoint, as `(partition, seq)`.
    pub fn snapshot(&self) -> Vec<(u16, u64)> {
        (0..self.partitions.len())
            .filter_map(|p| self.checkpoint_seq(p).map(|seq| (p as u16, seq)))
            .collect()
    }
}
