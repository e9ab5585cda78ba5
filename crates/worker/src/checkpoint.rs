//! Periodic, best-effort persistence of partition checkpoints.
//!
//! The in-memory [`PartitionTable`] stays authoritative. A failed persist is
//! counted and retried on the next tick; it never fails the worker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics::WorkerMetrics;
use crate::partition::PartitionTable;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub app_name: String,
    #[serde(rename = "vb")]
    pub partition: u16,
    #[serde(rename = "last_processed_seq_no")]
    pub seq: u64,
    /// RFC3339
    pub updated_at: String,
}

pub fn checkpoint_key(app_name: &str, partition: u16) -> String {
    format!("{}_vb_{}", app_name, partition)
}

/// External metadata store for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn persist(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;
    fn load(&self, app_name: &str, partition: u16) -> Result<Option<CheckpointRecord>, CheckpointError>;
}

/// One JSON file per partition under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, app_name: &str, partition: u16) -> PathBuf {
        self.dir
            .join(format!("{}.json", checkpoint_key(app_name, partition)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn persist(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(&record.app_name, record.partition);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, app_name: &str, partition: u16) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path(app_name, partition);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct Checkpointer {
    app_name: String,
    table: Arc<PartitionTable>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<WorkerMetrics>,
    persisted: HashMap<u16, u64>,
}

impl Checkpointer {
    pub fn new(
        app_name: impl Into<String>,
        table: Arc<PartitionTable>,
        store: Arc<dyn CheckpointStore>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            table,
            store,
            metrics,
            persisted: HashMap::new(),
        }
    }

    /// Seed the table from the store. Events at or below a restored checkpoint
    /// are treated as duplicates. Returns how many partitions were restored.
    pub fn restore(&mut self) -> usize {
        let mut restored = 0;
        for partition in 0..self.table.len() as u16 {
            match self.store.load(&self.app_name, partition) {
                Ok(Some(record)) => {
                    self.table.update_checkpoint_seq(partition as usize, record.seq);
                    self.table.set_filter(partition as usize, record.seq);
                    self.persisted.insert(partition, record.seq);
                    restored += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("failed to restore checkpoint for partition {}: {}", partition, err);
                }
            }
        }
        if restored > 0 {
            tracing::info!("{}: restored {} partition checkpoints", self.app_name, restored);
        }
        restored
    }

    /// Write every checkpoint that moved since its last successful persist.
    /// Returns how many were written.
    pub fn persist_changed(&mut self) -> usize {
        let mut written = 0;
        let updated_at = chrono::Utc::now().to_rfc3339();
        for (partition, seq) in self.table.snapshot() {
            if self.persisted.get(&partition) == Some(&seq) {
                continue;
            }
            let record = CheckpointRecord {
                app_name: self.app_name.clone(),
                partition,
                seq,
                updated_at: updated_at.clone(),
            };
            match self.store.persist(&record) {
                Ok(()) => {
                    self.persisted.insert(partition, seq);
                    written += 1;
                }
                Err(err) => {
                    WorkerMetrics::incr(&self.metrics.checkpoint_failure_count);
                    tracing::warn!(
                        "failed to persist checkpoint {}: {}",
                        checkpoint_key(&self.app_name, partition),
                        err
                    );
                }
            }
        }
        if written > 0 {
            tracing::debug!("{}: persisted {} checkpoints", self.app_name, written);
        }
        written
    }

    /// Persist on every tick until shutdown, then once more.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.persist_changed();
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        self.persist_changed();
        tracing::debug!("{}: checkpointer stopped", self.app_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    struct BrokenStore;

    impl CheckpointStore for BrokenStore {
        fn persist(&self, _: &CheckpointRecord) -> Result<(), CheckpointError> {
            Err(std::io::Error::other("metadata store unreachable").into())
        }

        fn load(&self, _: &str, _: u16) -> Result<Option<CheckpointRecord>, CheckpointError> {
            Ok(None)
        }
    }

    #[test]
    fn persists_only_changed_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let table = Arc::new(PartitionTable::default());
        let metrics = Arc::new(WorkerMetrics::default());
        let mut checkpointer =
            Checkpointer::new("credit_score", Arc::clone(&table), store.clone(), metrics);

        table.update_checkpoint_seq(7, 100);
        table.update_checkpoint_seq(9, 5);
        assert_eq!(checkpointer.persist_changed(), 2);
        assert_eq!(checkpointer.persist_changed(), 0);

        table.update_checkpoint_seq(7, 101);
        assert_eq!(checkpointer.persist_changed(), 1);

        let record = store.load("credit_score", 7).expect("load").expect("present");
        assert_eq!(record.seq, 101);
        assert!(dir.path().join("credit_score_vb_7.json").exists());
        assert!(store.load("credit_score", 8).expect("load").is_none());
    }

    #[test]
    fn restore_seeds_checkpoint_and_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        store
            .persist(&CheckpointRecord {
                app_name: "app".into(),
                partition: 3,
                seq: 42,
                updated_at: chrono::Utc::now().to_rfc3339(),
            })
            .expect("persist");

        let table = Arc::new(PartitionTable::default());
        let mut checkpointer = Checkpointer::new(
            "app",
            Arc::clone(&table),
            store,
            Arc::new(WorkerMetrics::default()),
        );
        assert_eq!(checkpointer.restore(), 1);
        assert_eq!(table.checkpoint_seq(3), Some(42));
        assert!(table.is_filtered(3, 42));
        assert_eq!(checkpointer.persist_changed(), 0);
    }

    #[test]
    fn failures_are_counted_and_retried() {
        let table = Arc::new(PartitionTable::default());
        let metrics = Arc::new(WorkerMetrics::default());
        let mut checkpointer = Checkpointer::new(
            "app",
            Arc::clone(&table),
            Arc::new(BrokenStore),
            Arc::clone(&metrics),
        );
        table.update_checkpoint_seq(1, 1);
        assert_eq!(checkpointer.persist_changed(), 0);
        assert_eq!(checkpointer.persist_changed(), 0);
        assert_eq!(metrics.checkpoint_failure_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn run_flushes_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let table = Arc::new(PartitionTable::default());
        let checkpointer = Checkpointer::new(
            "app",
            Arc::clone(&table),
            store.clone(),
            Arc::new(WorkerMetrics::default()),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(checkpointer.run(Duration::from_secs(3600), stop_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        table.update_checkpoint_seq(2, 77);
        stop_tx.send(true).expect("signal");
        task.await.expect("join");

        let record = store.load("app", 2).expect("load").expect("present");
        assert_eq!(record.seq, 77);
    }
}
