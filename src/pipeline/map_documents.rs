//! Consumes documents per collection, oldest-first, mapping each into the
//! full-text index (spec §4.3, worker #2 in the canonical ordering).
//!
//! Per-document analyzer failures are caught here and recorded in
//! `stats.analyzer_errors`; they never abort the batch. Full-text write
//! failures are not caught here — they propagate up to the indexing loop,
//! which owns the write-error accounting (spec §4.4, §4.7).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    document_store::DocumentStoreContext,
    error::{
        IndexEngineError,
        Result,
    },
    persistence::IndexWriterHandle,
    pipeline::{
        mapping::IndexMapping,
        IndexContext,
        Worker,
    },
    storage::stats::BatchStats,
};

pub struct MapDocuments {
    mapping: Arc<dyn IndexMapping>,
}

impl MapDocuments {
    pub fn new(mapping: Arc<dyn IndexMapping>) -> Self {
        Self { mapping }
    }
}

#[async_trait]
impl Worker for MapDocuments {
    fn name(&self) -> &'static str {
        "MapDocuments"
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
            let mut after = index_ctx.storage.read_last_mapped_etag(index_ctx.txn, collection)?;
            loop {
                if cancel.is_cancelled() {
                    break 'collections;
                }
                let remaining = index_ctx.batch_size.saturating_sub(processed);
                if remaining == 0 {
                    more_available = true;
                    break 'collections;
                }
                let documents = doc_ctx.documents_after(collection, after, remaining).await?;
                if documents.is_empty() {
                    break;
                }
                let hit_budget = documents.len() == remaining;
                for document in &documents {
                    writer.handle_delete(self.mapping.key_term(&document.key))?;
                    match self.mapping.map(document) {
                        Ok(entries) => {
                            for entry in entries {
                                writer.handle_map(entry)?;
                            }
                        },
                        Err(IndexEngineError::IndexAnalyzerError(cause)) => {
                            warn!(collection = %collection, etag = %document.etag, %cause, "analyzer error mapping document");
                            stats.analyzer_errors += 1;
                        },
                        Err(other) => return Err(other),
                    }
                    after = document.etag;
                    processed += 1;
                    stats.map_count += 1;
                }
                index_ctx.storage.write_last_mapped_etag(index_ctx.txn, collection, after)?;
                if hit_budget {
                    more_available = true;
                    break 'collections;
                }
            }
        }
        Ok(more_available)
    }
}
