//! Compares persisted per-collection etags against live document-store
//! etags to decide staleness, with or without a caller cutoff (spec §4.5).

use std::collections::BTreeSet;

use futures::future::try_join_all;

use crate::{
    document_store::DocumentStoreContext,
    error::Result,
    etag::{
        CollectionName,
        Etag,
    },
    storage::{
        IndexStorage,
        ReadTxn,
    },
};

/// Returns `true` if any mapped collection still has unprocessed
/// documents or tombstones relative to `cutoff` (or, with no cutoff,
/// relative to the document store's current etags). Collections are
/// checked concurrently since each is an independent round trip to the
/// document store.
pub async fn is_stale<'a>(
    doc_ctx: &dyn DocumentStoreContext,
    storage: &IndexStorage,
    index_txn: impl Into<ReadTxn<'a>>,
    collections: &BTreeSet<CollectionName>,
    cutoff: Option<Etag>,
) -> Result<bool> {
    let index_txn = index_txn.into();
    let checks = collections
        .iter()
        .map(|collection| is_collection_stale(doc_ctx, storage, &index_txn, collection, cutoff));
    let results = try_join_all(checks).await?;
    Ok(results.into_iter().any(|stale| stale))
}

async fn is_collection_stale(
    doc_ctx: &dyn DocumentStoreContext,
    storage: &IndexStorage,
    index_txn: &ReadTxn<'_>,
    collection: &CollectionName,
    cutoff: Option<Etag>,
) -> Result<bool> {
    let last_doc_etag = doc_ctx.last_document_etag(collection).await?;
    let last_mapped_etag = match index_txn {
        ReadTxn::Read(r) => storage.read_last_mapped_etag(*r, collection)?,
        ReadTxn::Write(w) => storage.read_last_mapped_etag(*w, collection)?,
    };

    match cutoff {
        None => {
            if last_doc_etag > last_mapped_etag {
                return Ok(true);
            }
            let last_tombstone_etag = doc_ctx.last_tombstone_etag(collection).await?;
            let last_processed_tombstone_etag = match index_txn {
                ReadTxn::Read(r) => storage.read_last_processed_tombstone_etag(*r, collection)?,
                ReadTxn::Write(w) => storage.read_last_processed_tombstone_etag(*w, collection)?,
            };
            Ok(last_tombstone_etag > last_processed_tombstone_etag)
        },
        Some(cutoff) => {
            if std::cmp::min(cutoff, last_doc_etag) > last_mapped_etag {
                return Ok(true);
            }
            let last_processed_tombstone_etag = match index_txn {
                ReadTxn::Read(r) => storage.read_last_processed_tombstone_etag(*r, collection)?,
                ReadTxn::Write(w) => storage.read_last_processed_tombstone_etag(*w, collection)?,
            };
            let unprocessed = doc_ctx
                .count_tombstones_with_doc_etag_at_most(collection, cutoff, last_processed_tombstone_etag)
                .await?;
            Ok(unprocessed > 0)
        },
    }
}
