//! Lifecycle (initialize → start → stop → dispose), priority/lock
//! transitions, subscription to change notifications, and delegation to
//! the rest of the engine (spec §4.7).

use std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::SystemTime,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    definition::{
        IndexDefinition,
        LockMode,
        Priority,
        PriorityState,
    },
    document_store::DocumentStoreContextPool,
    error::{
        IndexEngineError,
        Result,
    },
    etag::CollectionName,
    indexing_loop::{
        IndexingLoop,
        LoopHost,
        WriteErrorOutcome,
    },
    metrics,
    notifications::{
        DocumentChangeNotification,
        IndexChangeBus,
        IndexChangeKind,
        IndexChangeNotification,
    },
    persistence::IndexPersistence,
    pipeline::{
        mapping::IndexMapping,
        WorkerPipeline,
    },
    query::{
        self,
        QueryRequest,
        QueryResult,
        ResultRetriever,
    },
    storage::{
        stats::IndexStats,
        IndexStorage,
    },
};

/// Non-transient write-error count that trips the index to `Error`
/// priority (spec §3, §4.7, P7).
pub const WRITE_ERROR_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

struct State {
    lifecycle: Lifecycle,
    priority: Priority,
    lock_mode: LockMode,
    loop_cancel: Option<CancellationToken>,
    loop_task: Option<tokio::task::JoinHandle<()>>,
}

/// A single named full-text index over a fixed set of collections. Owns
/// its own storage environment and full-text persistence binding; many
/// instances run concurrently inside the host process, each serialized by
/// its own [`IndexingLoop`].
pub struct Index {
    definition: IndexDefinition,
    storage: IndexStorage,
    persistence: IndexPersistence,
    doc_ctx_pool: Arc<dyn DocumentStoreContextPool>,
    mapping: Arc<dyn IndexMapping>,
    change_bus: IndexChangeBus,
    wake: Arc<Notify>,
    batch_completed: Arc<Notify>,
    indexing_in_progress: AtomicBool,
    write_errors: AtomicU32,
    last_querying_time_millis: AtomicU64,
    state: Mutex<State>,
}

impl Index {
    pub fn new(
        definition: IndexDefinition,
        storage: IndexStorage,
        persistence: IndexPersistence,
        doc_ctx_pool: Arc<dyn DocumentStoreContextPool>,
        mapping: Arc<dyn IndexMapping>,
        change_bus: IndexChangeBus,
    ) -> Self {
        Self {
            definition,
            storage,
            persistence,
            doc_ctx_pool,
            mapping,
            change_bus,
            wake: Arc::new(Notify::new()),
            batch_completed: Arc::new(Notify::new()),
            indexing_in_progress: AtomicBool::new(false),
            write_errors: AtomicU32::new(0),
            last_querying_time_millis: AtomicU64::new(0),
            state: Mutex::new(State {
                lifecycle: Lifecycle::Uninitialized,
                priority: Priority::normal(),
                lock_mode: LockMode::Unlock,
                loop_cancel: None,
                loop_task: None,
            }),
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Loads persisted priority/lock mode into memory, recording the
    /// index type on first initialization so a host can later decide
    /// which variant to instantiate at open time via
    /// [`IndexStorage::read_index_type`]. Must be called exactly once
    /// before `start`.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Uninitialized {
            return Err(IndexEngineError::InvalidState("index already initialized"));
        }
        let txn = self.storage.begin_write()?;
        self.storage.write_index_type(&txn, self.definition.index_type)?;
        state.priority = self.storage.read_priority(&txn)?;
        state.lock_mode = self.storage.read_lock(&txn)?;
        txn.commit().map_err(|e| IndexEngineError::Other(e.into()))?;
        state.lifecycle = Lifecycle::Initialized;
        Ok(())
    }

    /// Spawns the indexing loop on the given runtime handle.
    pub fn start(self: &Arc<Self>, runtime: &tokio::runtime::Handle) -> Result<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Uninitialized => {
                return Err(IndexEngineError::InvalidState("index not initialized"));
            },
            Lifecycle::Running => {
                return Err(IndexEngineError::InvalidState("index already running"));
            },
            Lifecycle::Disposed => return Err(IndexEngineError::Disposed),
            Lifecycle::Initialized | Lifecycle::Stopped => {},
        }

        let cancel = CancellationToken::new();
        let pipeline = WorkerPipeline::auto_map(self.mapping.clone());
        let worker = IndexingLoop::new(pipeline, crate::pipeline::DEFAULT_BATCH_SIZE);
        let host: Arc<dyn LoopHost> = self.clone();
        let loop_cancel = cancel.clone();
        let task = runtime.spawn(async move { worker.run(host, loop_cancel).await });

        state.loop_cancel = Some(cancel);
        state.loop_task = Some(task);
        state.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Requests cancellation and joins the indexing loop.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, task) = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Disposed {
                return Err(IndexEngineError::Disposed);
            }
            if state.lifecycle != Lifecycle::Running {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Stopped;
            (state.loop_cancel.take(), state.loop_task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Stops (best-effort) and releases owned resources. Disposal is
    /// best-effort per spec §7: errors are aggregated, not allowed to
    /// prevent releasing the rest.
    pub async fn dispose(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.stop().await {
            errors.push(e);
        }
        {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Disposed;
        }
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.state.lock().lifecycle == Lifecycle::Disposed {
            return Err(IndexEngineError::Disposed);
        }
        Ok(())
    }

    /// No-op if `p` is already current. Otherwise persists it and raises
    /// at most one notification, chosen by the rules in spec §4.7 (P5).
    pub fn set_priority(&self, new_priority: Priority) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut state = self.state.lock();
        if state.priority == new_priority {
            return Ok(());
        }
        let previous = state.priority;
        let txn = self.storage.begin_write()?;
        self.storage.write_priority(&txn, new_priority)?;
        txn.commit().map_err(|e| IndexEngineError::Other(e.into()))?;
        state.priority = new_priority;

        let notification = match new_priority.state {
            PriorityState::Disabled => Some(IndexChangeKind::IndexDemotedToDisabled),
            PriorityState::Error => Some(IndexChangeKind::IndexMarkedAsErrored),
            PriorityState::Idle => Some(IndexChangeKind::IndexDemotedToIdle),
            PriorityState::Normal if previous.state == PriorityState::Idle => {
                Some(IndexChangeKind::IndexPromotedFromIdle)
            },
            PriorityState::Normal => None,
        };
        drop(state);
        if let Some(kind) = notification {
            self.publish(kind);
        }
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    /// No-op if `mode` is already current.
    pub fn set_lock(&self, mode: LockMode) -> Result<()> {
        self.ensure_not_disposed()?;
        let mut state = self.state.lock();
        if state.lock_mode == mode {
            return Ok(());
        }
        let txn = self.storage.begin_write()?;
        self.storage.write_lock(&txn, mode)?;
        txn.commit().map_err(|e| IndexEngineError::Other(e.into()))?;
        state.lock_mode = mode;
        Ok(())
    }

    pub fn lock_mode(&self) -> LockMode {
        self.state.lock().lock_mode
    }

    /// Self-stop on externally observed error (spec §4.7): if this
    /// notification is about this very index going into `Error`, stop the
    /// loop so it isn't racing the caller that just marked it errored.
    pub async fn handle_index_change(&self, notification: &IndexChangeNotification) -> Result<()> {
        if notification.index_name == self.definition.name
            && notification.kind == IndexChangeKind::IndexMarkedAsErrored
        {
            self.stop().await?;
        }
        Ok(())
    }

    /// Wakes the indexing loop if the change is on one of our collections.
    /// No etag filtering: waking is cheap, and the loop re-checks
    /// staleness on every batch anyway.
    pub fn handle_document_change(&self, notification: &DocumentChangeNotification) {
        if self.definition.collections.contains(&notification.collection) {
            self.wake.notify_one();
        }
    }

    pub fn is_indexing_in_progress(&self) -> bool {
        self.indexing_in_progress.load(Ordering::Relaxed)
    }

    pub fn last_querying_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
            + std::time::Duration::from_millis(self.last_querying_time_millis.load(Ordering::Relaxed))
    }

    pub fn get_stats(&self) -> Result<IndexStats> {
        let txn = self.storage.begin_read()?;
        self.storage.read_stats(&txn)
    }

    pub fn get_errors(&self) -> Result<Vec<crate::storage::stats::RecordedError>> {
        let txn = self.storage.begin_read()?;
        self.storage.read_errors(&txn)
    }

    pub fn get_index_definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn get_last_mapped_etag_for(&self, collection: &CollectionName) -> Result<crate::etag::Etag> {
        let txn = self.storage.begin_read()?;
        self.storage.read_last_mapped_etag(&txn, collection)
    }

    pub fn get_last_processed_document_tombstones_per_collection(
        &self,
    ) -> Result<std::collections::BTreeMap<CollectionName, crate::etag::Etag>> {
        let txn = self.storage.begin_read()?;
        let mut out = std::collections::BTreeMap::new();
        for collection in &self.definition.collections {
            out.insert(
                collection.clone(),
                self.storage.read_last_processed_tombstone_etag(&txn, collection)?,
            );
        }
        Ok(out)
    }

    pub async fn is_stale(&self) -> Result<bool> {
        let doc_ctx = self.doc_ctx_pool.acquire().await?;
        let txn = self.storage.begin_read()?;
        crate::staleness::is_stale(doc_ctx.as_ref(), &self.storage, &txn, &self.definition.collections, None)
            .await
    }

    pub async fn is_stale_as_of(&self, cutoff: crate::etag::Etag) -> Result<bool> {
        let doc_ctx = self.doc_ctx_pool.acquire().await?;
        let txn = self.storage.begin_read()?;
        crate::staleness::is_stale(
            doc_ctx.as_ref(),
            &self.storage,
            &txn,
            &self.definition.collections,
            Some(cutoff),
        )
        .await
    }

    /// Validates the index is live, opportunistically promotes an `Idle`
    /// index back to `Normal`, updates `last_querying_time`, and runs the
    /// §4.6 algorithm.
    pub async fn query<T>(
        &self,
        request: QueryRequest,
        retriever: &dyn ResultRetriever<T>,
    ) -> Result<QueryResult<T>> {
        self.ensure_not_disposed()?;

        let priority = self.priority();
        if priority.state == PriorityState::Idle && !priority.forced {
            self.set_priority(Priority {
                state: PriorityState::Normal,
                forced: priority.forced,
            })?;
        }

        let now_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_querying_time_millis.fetch_max(now_millis, Ordering::Relaxed);

        let pool = self.doc_ctx_pool.clone();
        let acquire = move || {
            let pool = pool.clone();
            Box::pin(async move { pool.acquire().await.map_err(IndexEngineError::Other) })
                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Box<dyn crate::document_store::DocumentStoreContext>>> + Send>>
        };

        let persistence = &self.persistence;
        let result = query::run_query(
            &self.definition.name,
            self.definition.stable_hash(),
            &self.definition.collections,
            &acquire,
            &self.storage,
            || persistence.open_reader().searcher,
            self.batch_completed.clone(),
            request,
            retriever,
        )
        .await?;

        metrics::log_query(result.is_stale);
        Ok(result)
    }
}

#[async_trait]
impl LoopHost for Index {
    fn index_name(&self) -> &str {
        &self.definition.name
    }

    fn storage(&self) -> &IndexStorage {
        &self.storage
    }

    fn persistence(&self) -> &IndexPersistence {
        &self.persistence
    }

    fn collections(&self) -> &std::collections::BTreeSet<CollectionName> {
        &self.definition.collections
    }

    fn doc_ctx_pool(&self) -> &dyn DocumentStoreContextPool {
        self.doc_ctx_pool.as_ref()
    }

    fn wake_notify(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    fn batch_completed_notify(&self) -> Arc<Notify> {
        self.batch_completed.clone()
    }

    fn set_indexing_in_progress(&self, value: bool) {
        self.indexing_in_progress.store(value, Ordering::Relaxed);
    }

    fn on_write_error(&self, error: &IndexEngineError) -> WriteErrorOutcome {
        let transient = matches!(
            error,
            IndexEngineError::IndexWriteError {
                kind: crate::error::WriteErrorKind::Transient,
                ..
            }
        );
        metrics::log_write_error(!transient);
        if transient {
            return WriteErrorOutcome::NotCounted;
        }
        let count = self.write_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= WRITE_ERROR_LIMIT {
            let mut state = self.state.lock();
            if state.priority.state != PriorityState::Error {
                state.priority.state = PriorityState::Error;
                let priority = state.priority;
                drop(state);
                if let Ok(txn) = self.storage.begin_write() {
                    let _ = self.storage.write_priority(&txn, priority);
                    let _ = txn.commit();
                }
                self.publish(IndexChangeKind::IndexMarkedAsErrored);
            }
            WriteErrorOutcome::TrippedToError
        } else {
            WriteErrorOutcome::Counted
        }
    }

    fn reset_write_errors(&self) {
        self.write_errors.store(0, Ordering::SeqCst);
    }

    fn publish(&self, kind: IndexChangeKind) {
        metrics::log_priority_transition(match kind {
            IndexChangeKind::BatchCompleted => "batch_completed",
            IndexChangeKind::IndexDemotedToIdle => "demoted_to_idle",
            IndexChangeKind::IndexDemotedToDisabled => "demoted_to_disabled",
            IndexChangeKind::IndexPromotedFromIdle => "promoted_from_idle",
            IndexChangeKind::IndexMarkedAsErrored => "marked_as_errored",
        });
        self.change_bus.publish(IndexChangeNotification {
            index_name: self.definition.name.clone(),
            kind,
        });
        info!(index = %self.definition.name, "published index-change notification");
    }
}

impl Index {
    /// Convenience used by hosts that don't otherwise need the `publish`
    /// entry point as a trait method.
    pub fn publish_notification(&self, kind: IndexChangeKind) {
        LoopHost::publish(self, kind);
    }
}
