//! Append-only prediction log and the background writer feeding it.
//!
//! Requests hand entries to a bounded queue and move on. A single consumer
//! task persists them on the blocking pool under a timeout; every dropped,
//! timed-out or failed write bumps `iris_log_write_failures_total` once.
//! While a timed-out append is still stuck in the store, later entries are
//! dropped rather than stacking more blocked threads behind it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LogStoreError;
use crate::metrics::ServingMetrics;
use crate::router::Arm;

/// One served prediction. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLog {
    pub request_id: Uuid,
    pub model_name: String,
    pub model_version: u32,
    pub arm: Arm,
    pub features: Vec<f64>,
    pub prediction: i64,
    pub probability: f64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

pub trait LogStore: Send + Sync + 'static {
    /// Persists `entry` as one atomic unit.
    fn append(&self, entry: &PredictionLog) -> Result<(), LogStoreError>;

    /// Up to `limit` most recent entries, newest first.
    fn query(&self, limit: usize) -> Result<Vec<PredictionLog>, LogStoreError>;
}

/// sled-backed log. Entries are keyed by a monotonically increasing id so key
/// order is insertion order; a second tree maps `request_id` to that id.
pub struct SledLogStore {
    db: sled::Db,
    entries: sled::Tree,
    by_request: sled::Tree,
}

impl SledLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogStoreError> { Self::from_db(sled::open(path.as_ref())?) }

    pub fn temporary() -> Result<Self, LogStoreError> { Self::from_db(sled::Config::new().temporary(true).open()?) }

    fn from_db(db: sled::Db) -> Result<Self, LogStoreError> {
        let entries = db.open_tree("predictions")?;
        let by_request = db.open_tree("predictions_by_request")?;
        Ok(Self { db, entries, by_request })
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

impl LogStore for SledLogStore {
    fn append(&self, entry: &PredictionLog) -> Result<(), LogStoreError> {
        let id = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(entry)?;
        let request_key = entry.request_id.as_bytes().to_vec();
        let res = (&self.entries, &self.by_request).transaction(|(entries, by_request)| {
            if by_request.get(&request_key)?.is_some() {
                return Err(ConflictableTransactionError::Abort(entry.request_id));
            }
            by_request.insert(request_key.as_slice(), &id[..])?;
            entries.insert(&id[..], value.as_slice())?;
            Ok(())
        });
        match res {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(dup)) => Err(LogStoreError::Duplicate(dup.to_string())),
            Err(TransactionError::Storage(e)) => Err(LogStoreError::Storage(e)),
        }
    }

    fn query(&self, limit: usize) -> Result<Vec<PredictionLog>, LogStoreError> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for kv in self.entries.iter().rev().take(limit) {
            let (_, v) = kv?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

/// Cloneable handle to the background log writer.
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<PredictionLog>,
    metrics: Arc<ServingMetrics>,
}

impl LogWriter {
    /// Spawns the consumer task on the current runtime.
    pub fn spawn(
        store: Arc<dyn LogStore>,
        capacity: usize,
        write_timeout: Duration,
        metrics: Arc<ServingMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(rx, store, write_timeout, metrics.clone()));
        (Self { tx, metrics }, handle)
    }

    /// Queues `entry` without waiting. A full or closed queue drops the entry.
    pub fn submit(&self, entry: PredictionLog) {
        if let Err(e) = self.tx.try_send(entry) {
            self.metrics.log_write_failures.inc();
            let (reason, request_id) = match &e {
                mpsc::error::TrySendError::Full(entry) => ("queue_full", entry.request_id),
                mpsc::error::TrySendError::Closed(entry) => ("writer_closed", entry.request_id),
            };
            warn!(%request_id, reason, "prediction log dropped");
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<PredictionLog>,
    store: Arc<dyn LogStore>,
    write_timeout: Duration,
    metrics: Arc<ServingMetrics>,
) {
    let mut stalled: Option<JoinHandle<Result<(), LogStoreError>>> = None;
    while let Some(entry) = rx.recv().await {
        let request_id = entry.request_id;
        if stalled.as_ref().is_some_and(|w| !w.is_finished()) {
            metrics.log_write_failures.inc();
            warn!(%request_id, "prediction log dropped; store still busy with a timed-out write");
            continue;
        }
        stalled = None;
        let store = store.clone();
        let mut write = tokio::task::spawn_blocking(move || store.append(&entry));
        match tokio::time::timeout(write_timeout, &mut write).await {
            Ok(Ok(Ok(()))) => {
                metrics.log_writes.inc();
                debug!(%request_id, "prediction logged");
            }
            Ok(Ok(Err(e))) => {
                metrics.log_write_failures.inc();
                warn!(%request_id, error = %e, "prediction log write failed");
            }
            Ok(Err(e)) => {
                metrics.log_write_failures.inc();
                warn!(%request_id, error = %e, "prediction log writer task failed");
            }
            Err(_) => {
                metrics.log_write_failures.inc();
                warn!(%request_id, timeout_ms = write_timeout.as_millis() as u64, "prediction log write timed out");
                // blocking tasks cannot be cancelled; remember it instead
                stalled = Some(write);
            }
        }
    }
    debug!("prediction log writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(version: u32) -> PredictionLog {
        PredictionLog {
            request_id: Uuid::new_v4(),
            model_name: "iris".into(),
            model_version: version,
            arm: Arm::Stable,
            features: vec![5.1, 3.5, 1.4, 0.2],
            prediction: 0,
            probability: 0.97,
            latency_ms: 0.02,
            timestamp: Utc::now(),
        }
    }

    struct SlowStore(Duration);

    impl LogStore for SlowStore {
        fn append(&self, _: &PredictionLog) -> Result<(), LogStoreError> {
            std::thread::sleep(self.0);
            Ok(())
        }
        fn query(&self, _: usize) -> Result<Vec<PredictionLog>, LogStoreError> { Ok(Vec::new()) }
    }

    /// Blocks on its first append only.
    struct StallOnce {
        stall: Duration,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl LogStore for StallOnce {
        fn append(&self, _: &PredictionLog) -> Result<(), LogStoreError> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                std::thread::sleep(self.stall);
            }
            Ok(())
        }
        fn query(&self, _: usize) -> Result<Vec<PredictionLog>, LogStoreError> { Ok(Vec::new()) }
    }

    #[test]
    fn query_returns_newest_first() {
        let store = SledLogStore::temporary().unwrap();
        for v in 1..=5 { store.append(&entry(v)).unwrap(); }
        let got: Vec<u32> = store.query(3).unwrap().iter().map(|e| e.model_version).collect();
        assert_eq!(got, vec![5, 4, 3]);
        assert_eq!(store.query(100).unwrap().len(), 5);
    }

    #[test]
    fn duplicate_request_ids_are_rejected() {
        let store = SledLogStore::temporary().unwrap();
        let e = entry(1);
        store.append(&e).unwrap();
        assert!(matches!(store.append(&e), Err(LogStoreError::Duplicate(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_appends_stay_whole() {
        let store = Arc::new(SledLogStore::temporary().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || for _ in 0..50 { store.append(&entry(t)).unwrap(); })
            })
            .collect();
        for h in handles { h.join().unwrap(); }
        let all = store.query(1000).unwrap();
        assert_eq!(all.len(), 400);
        assert!(all.iter().all(|e| e.features == vec![5.1, 3.5, 1.4, 0.2]));
    }

    #[tokio::test]
    async fn writer_persists_submitted_entries() {
        let store = Arc::new(SledLogStore::temporary().unwrap());
        let metrics = Arc::new(ServingMetrics::new().unwrap());
        let (writer, handle) = LogWriter::spawn(store.clone(), 16, Duration::from_secs(5), metrics.clone());
        let e = entry(3);
        writer.submit(e.clone());
        drop(writer);
        handle.await.unwrap();
        assert_eq!(store.query(1).unwrap(), vec![e]);
        assert_eq!(metrics.log_writes.get(), 1);
        assert_eq!(metrics.log_write_failures.get(), 0);
    }

    #[tokio::test]
    async fn slow_writes_time_out_and_count_once() {
        let metrics = Arc::new(ServingMetrics::new().unwrap());
        let store: Arc<dyn LogStore> = Arc::new(SlowStore(Duration::from_millis(200)));
        let (writer, handle) = LogWriter::spawn(store, 16, Duration::from_millis(20), metrics.clone());
        writer.submit(entry(1));
        drop(writer);
        handle.await.unwrap();
        assert_eq!(metrics.log_write_failures.get(), 1);
        assert_eq!(metrics.log_writes.get(), 0);
    }

    #[tokio::test]
    async fn stuck_write_holds_one_thread_until_it_returns() {
        use std::sync::atomic::Ordering;
        let metrics = Arc::new(ServingMetrics::new().unwrap());
        let store = Arc::new(StallOnce { stall: Duration::from_millis(300), calls: Default::default() });
        let (writer, handle) = LogWriter::spawn(store.clone(), 16, Duration::from_millis(20), metrics.clone());

        for v in 0..3 { writer.submit(entry(v)); }
        for _ in 0..100 {
            if metrics.log_write_failures.get() == 3 { break; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(metrics.log_write_failures.get(), 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        // once the stuck append returns, writes go through again
        tokio::time::sleep(Duration::from_millis(400)).await;
        writer.submit(entry(9));
        drop(writer);
        handle.await.unwrap();
        assert_eq!(metrics.log_writes.get(), 1);
        assert_eq!(metrics.log_write_failures.get(), 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let metrics = Arc::new(ServingMetrics::new().unwrap());
        let store: Arc<dyn LogStore> = Arc::new(SlowStore(Duration::from_millis(300)));
        let (writer, _handle) = LogWriter::spawn(store, 1, Duration::from_secs(5), metrics.clone());
        // the consumer holds at most one entry in flight and one queued
        for v in 0..10 { writer.submit(entry(v)); }
        assert!(metrics.log_write_failures.get() >= 8);
    }
}
