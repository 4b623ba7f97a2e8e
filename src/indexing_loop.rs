//! The long-running worker that runs the pipeline inside one write
//! transaction per batch, commits atomically, recreates the searcher,
//! updates stats, accounts errors, then suspends on a wake-event (spec
//! §4.4).

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

use crate::{
    document_store::DocumentStoreContextPool,
    error::{
        IndexEngineError,
        Result,
    },
    etag::CollectionName,
    metrics,
    notifications::IndexChangeKind,
    persistence::IndexPersistence,
    pipeline::{
        IndexContext,
        WorkerPipeline,
    },
    storage::{
        stats::{
            BatchStats,
            RecordedError,
        },
        IndexStorage,
    },
};

/// Outcome of reporting a write error to the host, per §4.7: whether this
/// observation tripped the index into the `Error` priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorOutcome {
    Counted,
    TrippedToError,
    NotCounted,
}

/// The seam between the loop and the owning [`crate::index::Index`]:
/// everything the loop needs to read/mutate that the façade also
/// exposes to callers (priority, notifications, in-memory flags).
#[async_trait]
pub trait LoopHost: Send + Sync {
    fn index_name(&self) -> &str;
    fn storage(&self) -> &IndexStorage;
    fn persistence(&self) -> &IndexPersistence;
    fn collections(&self) -> &BTreeSet<CollectionName>;
    fn doc_ctx_pool(&self) -> &dyn DocumentStoreContextPool;
    fn wake_notify(&self) -> Arc<Notify>;
    fn batch_completed_notify(&self) -> Arc<Notify>;
    fn set_indexing_in_progress(&self, value: bool);
    /// Classifies and accounts a write failure (§4.7); transient causes
    /// are not counted at all.
    fn on_write_error(&self, error: &IndexEngineError) -> WriteErrorOutcome;
    fn reset_write_errors(&self);
    fn publish(&self, kind: IndexChangeKind);
}

pub struct IndexingLoop {
    pipeline: WorkerPipeline,
    batch_size: usize,
}

impl IndexingLoop {
    pub fn new(pipeline: WorkerPipeline, batch_size: usize) -> Self {
        Self { pipeline, batch_size }
    }

    /// Runs batches until `cancel` is requested. Never returns `Err` for
    /// batch-internal failures (spec §4.4/§7): it logs and continues.
    /// Only cancellation ends the loop, cleanly. Consecutive batch failures
    /// are throttled with jittered backoff so a persistently broken index
    /// doesn't spin the host hot.
    pub async fn run(&self, host: Arc<dyn LoopHost>, cancel: CancellationToken) {
        info!(index = host.index_name(), "starting indexing loop");
        let mut consecutive_failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            host.set_indexing_in_progress(true);
            let wake = host.wake_notify();
            let notified = wake.notified();

            let failed = match self.run_one_batch(host.as_ref(), &cancel).await {
                Ok(BatchOutcome::MoreAvailable) => {
                    consecutive_failures = 0;
                    host.set_indexing_in_progress(false);
                    // Another batch is immediately due; skip the wait.
                    continue;
                },
                Ok(BatchOutcome::Idle) => {
                    consecutive_failures = 0;
                    false
                },
                Err(IndexEngineError::Cancelled) => {
                    host.set_indexing_in_progress(false);
                    break;
                },
                Err(IndexEngineError::OutOfMemory) => {
                    error!(index = host.index_name(), "out of memory indexing a batch, discarding");
                    true
                },
                Err(err @ IndexEngineError::IndexWriteError { .. }) => {
                    self.record_write_error(host.as_ref(), err).await;
                    true
                },
                Err(other) => {
                    warn!(index = host.index_name(), error = %other, "batch failed, discarding");
                    true
                },
            };
            host.set_indexing_in_progress(false);

            if cancel.is_cancelled() {
                break;
            }

            if failed {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = backoff_with_jitter(consecutive_failures);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = notified => {},
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            tokio::select! {
                _ = notified => {},
                _ = cancel.cancelled() => break,
            }
        }
        info!(index = host.index_name(), "indexing loop stopped");
    }

    async fn record_write_error(&self, host: &dyn LoopHost, err: IndexEngineError) {
        let message = err.to_string();
        let outcome = host.on_write_error(&err);
        error!(index = host.index_name(), error = %message, ?outcome, "index write error");
        if let Ok(txn) = host.storage().begin_write() {
            let _ = host.storage().record_error(
                &txn,
                RecordedError {
                    timestamp_millis: now_millis(),
                    action: "MapDocuments".to_string(),
                    message,
                },
            );
            let _ = host.storage().record_write_error_stat(&txn);
            let _ = txn.commit();
        }
    }

    async fn run_one_batch(&self, host: &dyn LoopHost, cancel: &CancellationToken) -> Result<BatchOutcome> {
        if cancel.is_cancelled() {
            return Err(IndexEngineError::Cancelled);
        }

        let batch_start = SystemTime::now();
        let doc_ctx = host.doc_ctx_pool().acquire().await?;
        let txn = host.storage().begin_write()?;
        let mut writer = host.persistence().open_writer();
        let mut stats = BatchStats::default();
        let mut more_available = false;

        let index_ctx = IndexContext {
            storage: host.storage(),
            txn: &txn,
            collections: host.collections(),
            batch_size: self.batch_size,
        };

        for worker in self.pipeline.workers() {
            if cancel.is_cancelled() {
                return Err(IndexEngineError::Cancelled);
            }
            let result = worker
                .execute(doc_ctx.as_ref(), &index_ctx, &mut writer, &mut stats, cancel)
                .await?;
            more_available |= result;
        }

        let opened = writer.finish()?;
        txn.commit().map_err(|e| IndexEngineError::Other(e.into()))?;
        if opened {
            host.persistence().recreate_searcher()?;
        }

        host.batch_completed_notify().notify_waiters();
        host.publish(IndexChangeKind::BatchCompleted);

        let duration = batch_start.elapsed().unwrap_or(Duration::ZERO);
        metrics::log_batch_committed(duration);
        match host.storage().begin_write() {
            Ok(stats_txn) => {
                if let Err(e) = host.storage().update_stats(&stats_txn, batch_start, duration, &stats) {
                    error!(index = host.index_name(), error = %e, "failed to record batch stats");
                } else if let Err(e) = stats_txn.commit() {
                    error!(index = host.index_name(), error = %e, "failed to commit batch stats");
                }
            },
            Err(e) => error!(index = host.index_name(), error = %e, "failed to open stats transaction"),
        }

        host.reset_write_errors();

        Ok(if more_available {
            BatchOutcome::MoreAvailable
        } else {
            BatchOutcome::Idle
        })
    }
}

enum BatchOutcome {
    MoreAvailable,
    Idle,
}

const MIN_BACKOFF_MILLIS: u64 = 100;
const MAX_BACKOFF_MILLIS: u64 = 30_000;

/// Exponential backoff capped at 30s, full-jitter to avoid every failing
/// index in the host process waking up in lockstep.
fn backoff_with_jitter(consecutive_failures: u32) -> Duration {
    let exp = MIN_BACKOFF_MILLIS.saturating_mul(1u64 << consecutive_failures.min(8));
    let ceiling = exp.min(MAX_BACKOFF_MILLIS);
    let jittered = rand::rng().random_range(MIN_BACKOFF_MILLIS..=ceiling.max(MIN_BACKOFF_MILLIS));
    Duration::from_millis(jittered)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
