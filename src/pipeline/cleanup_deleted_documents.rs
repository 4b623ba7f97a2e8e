//! Consumes tombstones per collection, oldest-first, retracting their
//! entries from the full-text index (spec §4.3, worker #1 in the
//! canonical ordering).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    document_store::DocumentStoreContext,
    error::Result,
    persistence::IndexWriterHandle,
    pipeline::{
        mapping::IndexMapping,
        IndexContext,
        Worker,
    },
    storage::stats::BatchStats,
};

pub struct CleanupDeletedDocuments {
    mapping: Arc<dyn IndexMapping>,
}

impl CleanupDeletedDocuments {
    pub fn new(mapping: Arc<dyn IndexMapping>) -> Self {
        Self { mapping }
    }
}

#[async_trait]
impl Worker for CleanupDeletedDocuments {
    fn name(&self) -> &'static str {
        "CleanupDeletedDocuments"
    }

    async fn execute(
        &self,
        doc_ctx: &dyn DocumentStoreContext,
        index_ctx: &IndexContext<'_>,
        writer: &mut IndexWriterHandle<'_>,
        stats: &mut BatchStats,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut more_available = false;
        let mut processed = 0usize;

        'collections: for collection in index_ctx.collections {
            if cancel.is_cancelled() {
                break;
            }
            let mut after =
                index_ctx.storage.read_last_processed_tombstone_etag(index_ctx.txn, collection)?;
            loop {
                if cancel.is_cancelled() {
                    break 'collections;
                }
                let remaining = index_ctx.batch_size.saturating_sub(processed);
                if remaining == 0 {
                    more_available = true;
                    break 'collections;
                }
                let tombstones = doc_ctx
                    .tombstones_after(collection, after, remaining)
                    .await?;
                if tombstones.is_empty() {
                    break;
                }
                let hit_budget = tombstones.len() == remaining;
                for tombstone in &tombstones {
                    writer.handle_delete(self.mapping.key_term(&tombstone.key))?;
                    after = tombstone.etag;
                    processed += 1;
                    stats.tombstone_count += 1;
                }
                index_ctx
                    .storage
                    .write_last_processed_tombstone_etag(index_ctx.txn, collection, after)?;
                if hit_budget {
                    more_available = true;
                    break 'collections;
                }
            }
        }
        if cancel.is_cancelled() {
            warn!("CleanupDeletedDocuments cancelled mid-batch");
        }
        Ok(more_available)
    }
}
