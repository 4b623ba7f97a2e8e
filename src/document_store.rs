//! Contracts consumed from the document store (spec §6). The store itself
//! is out of scope for this crate; it is injected as a trait object so the
//! indexing loop, staleness oracle, and query path can be exercised
//! against a fake in tests.

use async_trait::async_trait;

use crate::etag::{
    CollectionName,
    Etag,
};

/// A document as handed to the mapping worker. The payload is opaque here:
/// the index variant's mapping function (outside this crate's scope)
/// interprets it.
#[derive(Debug, Clone)]
pub struct Document {
    pub collection: CollectionName,
    pub etag: Etag,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A tombstone marking a deleted document. Itself etag-assigned.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub collection: CollectionName,
    /// Etag of the tombstone itself.
    pub etag: Etag,
    /// Etag of the document that was deleted, used by
    /// [`DocumentStoreContext::tombstones_with_doc_etag_at_most`].
    pub deleted_doc_etag: Etag,
    pub key: Vec<u8>,
}

/// A scoped read view into the document store, torn down on `reset`/drop.
/// Implementations wrap a transaction from the store's own storage engine;
/// this crate never begins document-store transactions itself.
#[async_trait]
pub trait DocumentStoreContext: Send + Sync {
    async fn last_document_etag(&self, collection: &CollectionName) -> anyhow::Result<Etag>;

    async fn last_tombstone_etag(&self, collection: &CollectionName) -> anyhow::Result<Etag>;

    /// Count of tombstones in `collection` whose `deleted_doc_etag` is
    /// `<= cutoff` and that have not yet been processed by this index.
    /// Implementations are expected to push the "not yet processed" half
    /// of the filter down using the caller's `last_processed_tombstone_etag`.
    async fn count_tombstones_with_doc_etag_at_most(
        &self,
        collection: &CollectionName,
        cutoff: Etag,
        last_processed_tombstone_etag: Etag,
    ) -> anyhow::Result<u64>;

    /// Documents in `collection` with etag `> after`, oldest first, used
    /// by the mapping worker. Bounded by the worker's own batch budget.
    async fn documents_after(
        &self,
        collection: &CollectionName,
        after: Etag,
        limit: usize,
    ) -> anyhow::Result<Vec<Document>>;

    /// Tombstones in `collection` with etag `> after`, oldest first, used
    /// by the cleanup worker.
    async fn tombstones_after(
        &self,
        collection: &CollectionName,
        after: Etag,
        limit: usize,
    ) -> anyhow::Result<Vec<Tombstone>>;
}

/// Scoped acquisition of `(operation_context, transaction)` pairs, with
/// guaranteed release on every exit path (spec §9). Implementations hand
/// out a fresh [`DocumentStoreContext`] per `acquire` call; nested
/// acquisitions release in reverse order because the guard is just an
/// owned value dropped by the borrow checker's usual rules.
#[async_trait]
pub trait DocumentStoreContextPool: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Box<dyn DocumentStoreContext>>;
}
