//! Ordered set of work units run once per batch (spec §4.3). Each worker
//! reports whether it stopped early because of a batch budget rather than
//! because its source was exhausted; the indexing loop ORs these flags to
//! decide whether to wake itself immediately.

pub mod cleanup_deleted_documents;
pub mod map_documents;
pub mod mapping;

use std::collections::BTreeSet;

use async_trait::async_trait;
use redb::WriteTransaction;
use tokio_util::sync::CancellationToken;

use crate::{
    document_store::DocumentStoreContext,
    error::Result,
    etag::CollectionName,
    persistence::IndexWriterHandle,
    storage::{
        stats::BatchStats,
        IndexStorage,
    },
};

/// A workable default batch budget: stop after this many documents or
/// tombstones, whichever worker hits it first, and report
/// `more_available = true`.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Everything a worker needs to read/write the index's own persisted
/// progress within the batch's write transaction.
pub struct IndexContext<'a> {
    pub storage: &'a IndexStorage,
    pub txn: &'a WriteTransaction,
    pub collections: &'a BTreeSet<CollectionName>,
    pub batch_size: usize,
}

/// One unit of work in the pipeline. Implementations must update their
/// own progress etag in-place (via `IndexContext::storage`) as they
/// advance, so that a crash before commit simply discards progress (I1
/// still holds because commit is atomic, per I2).
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs this worker's share of the batch. Returns `true` if it
    /// stopped because of the batch budget (more work is available and
    /// the indexing loop should wake itself immediately), `false` if the
    /// source was exhausted.
    async fn execute(
        &self,
        doc_ctx: &dyn DocumentStoreContext,
        index_ctx: &IndexContext<'_>,
        writer: &mut IndexWriterHandle<'_>,
        stats: &mut BatchStats,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

/// The fixed-order set of workers run every batch. Canonical ordering for
/// a map-only index is cleanup-then-map (spec §4.3): tombstones are
/// retracted before new documents are mapped so a document that was
/// updated and then deleted within the same batch window doesn't
/// momentarily reappear.
pub struct WorkerPipeline {
    workers: Vec<Box<dyn Worker>>,
}

impl WorkerPipeline {
    pub fn new(workers: Vec<Box<dyn Worker>>) -> Self {
        Self { workers }
    }

    /// The canonical map-only ordering: `CleanupDeletedDocuments` then
    /// `MapDocuments`.
    pub fn auto_map(mapping: std::sync::Arc<dyn mapping::IndexMapping>) -> Self {
        Self::new(vec![
            Box::new(cleanup_deleted_documents::CleanupDeletedDocuments::new(mapping.clone())),
            Box::new(map_documents::MapDocuments::new(mapping)),
        ])
    }

    pub fn workers(&self) -> &[Box<dyn Worker>] {
        &self.workers
    }
}
