//! Validates a query, waits for non-stale results within a timeout,
//! computes the cache validator, and reads matching entries (spec §4.6).

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use tantivy::{
    collector::{
        Count,
        TopDocs,
    },
    query::Query,
    DocAddress,
    Searcher,
};
use tokio::sync::Notify;
use xxhash_rust::xxh64::xxh64;

use crate::{
    document_store::DocumentStoreContext,
    error::{
        IndexEngineError,
        Result,
    },
    etag::{
        CollectionName,
        Etag,
    },
    staleness,
    storage::IndexStorage,
};

/// A caller-supplied query. `limit` bounds how many hits are materialized;
/// `cutoff_etag`/`wait_for_non_stale_as_of_now`/`timeout` drive the
/// staleness/wait decision in §4.6.
pub struct QueryRequest {
    pub query: Box<dyn Query>,
    pub limit: usize,
    pub cutoff_etag: Option<Etag>,
    pub wait_for_non_stale_as_of_now: bool,
    pub timeout: Option<Duration>,
}

pub struct QueryResult<T> {
    pub index_name: String,
    pub index_timestamp: SystemTime,
    pub last_query_time: SystemTime,
    pub is_stale: bool,
    /// Cache validator (spec §6): identical inputs produce an identical
    /// value; it changes with overwhelming probability if any input
    /// changes (P4).
    pub etag: u64,
    pub results: Vec<T>,
    pub total_results: usize,
}

/// Materializes one scored hit into a caller-defined result type. Kept
/// generic so this crate never has to know the shape of a search result
/// document.
pub trait ResultRetriever<T>: Send + Sync {
    fn retrieve(&self, searcher: &Searcher, doc_address: DocAddress, score: f32) -> Result<T>;
}

/// Tracks the first-wait start time so repeated staleness re-checks
/// inside one `query()` call share a single timeout deadline (spec §4.6
/// step 4).
struct WaitState {
    started_at: Instant,
    timeout: Option<Duration>,
}

impl WaitState {
    fn elapsed_past_timeout(&self) -> bool {
        match self.timeout {
            Some(timeout) => self.started_at.elapsed() >= timeout,
            None => false,
        }
    }
}

/// Accept current results if they're not stale, or if the caller set no
/// timeout (happy to read stale), or if we've already waited out the
/// timeout.
fn will_be_acceptable(is_stale: bool, timeout: Option<Duration>, wait_state: Option<&WaitState>) -> bool {
    if !is_stale {
        return true;
    }
    if timeout.is_none() {
        return true;
    }
    wait_state.map(|w| w.elapsed_past_timeout()).unwrap_or(false)
}

/// Cache validator: xxhash64 over `[definition_hash, is_stale?0:1,
/// per-collection last_doc_etag, per-collection last_mapped_etag]` in
/// definition order (spec §6). Map-reduce reduce-etags and index-touch
/// bumps are deliberately not modeled here (spec §9 open question); this
/// crate's policy is that the vector above is the complete, stable input.
pub fn compute_cache_validator(
    definition_hash: u64,
    is_stale: bool,
    per_collection: &[(Etag, Etag)],
) -> u64 {
    let mut bytes = Vec::with_capacity(16 + per_collection.len() * 16);
    bytes.extend_from_slice(&definition_hash.to_le_bytes());
    bytes.extend_from_slice(&(if is_stale { 0u64 } else { 1u64 }).to_le_bytes());
    for (last_doc_etag, last_mapped_etag) in per_collection {
        bytes.extend_from_slice(&last_doc_etag.0.to_le_bytes());
        bytes.extend_from_slice(&last_mapped_etag.0.to_le_bytes());
    }
    xxh64(&bytes, 0)
}

/// Runs the §4.6 algorithm. `open_index_read` must open a *fresh* index
/// read transaction each call (step 2 requires re-opening on every loop
/// iteration); `reader_for` builds the tantivy reader snapshot bound to
/// that same transaction's commit state.
pub async fn run_query<T>(
    index_name: &str,
    definition_hash: u64,
    collections: &BTreeSet<CollectionName>,
    doc_ctx_pool: &dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Box<dyn DocumentStoreContext>>> + Send>>,
    storage: &IndexStorage,
    searcher: impl Fn() -> Searcher,
    batch_completed: Arc<Notify>,
    mut request: QueryRequest,
    retriever: &dyn ResultRetriever<T>,
) -> Result<QueryResult<T>> {
    let mut wait_state: Option<WaitState> = None;

    if request.wait_for_non_stale_as_of_now && request.cutoff_etag.is_none() {
        let doc_ctx = doc_ctx_pool().await?;
        let mut max_etag = Etag::NONE;
        for collection in collections {
            let etag = doc_ctx.last_document_etag(collection).await?;
            max_etag = max_etag.max(etag);
        }
        request.cutoff_etag = Some(max_etag);
    }

    loop {
        // Step 2: open the index transaction, *then* the document
        // transaction, so the document view is never staler than what
        // the index has already committed (spec §4.6, §5).
        let index_txn = storage.begin_read()?;
        let doc_ctx = doc_ctx_pool().await?;

        let is_stale = staleness::is_stale(
            doc_ctx.as_ref(),
            storage,
            &index_txn,
            collections,
            request.cutoff_etag,
        )
        .await?;

        if !will_be_acceptable(is_stale, request.timeout, wait_state.as_ref()) {
            drop(index_txn);
            drop(doc_ctx);
            let state = wait_state.get_or_insert_with(|| WaitState {
                started_at: Instant::now(),
                timeout: request.timeout,
            });
            let remaining = match state.timeout {
                Some(timeout) => timeout.saturating_sub(state.started_at.elapsed()),
                None => Duration::from_secs(0),
            };
            let notified = batch_completed.notified();
            let _ = tokio::time::timeout(remaining, notified).await;
            continue;
        }

        let mut per_collection = Vec::with_capacity(collections.len());
        for collection in collections {
            let last_doc_etag = doc_ctx.last_document_etag(collection).await?;
            let last_mapped_etag = storage.read_last_mapped_etag(&index_txn, collection)?;
            per_collection.push((last_doc_etag, last_mapped_etag));
        }
        let etag = compute_cache_validator(definition_hash, is_stale, &per_collection);

        // The document context is only needed to decide staleness and
        // build the cache validator; results live entirely in the
        // full-text index from here on.
        drop(doc_ctx);

        let searcher = searcher();
        let (top_docs, total_results) = searcher
            .search(&*request.query, &(TopDocs::with_limit(request.limit), Count))
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            results.push(retriever.retrieve(&searcher, doc_address, score)?);
        }

        return Ok(QueryResult {
            index_name: index_name.to_string(),
            index_timestamp: SystemTime::now(),
            last_query_time: SystemTime::now(),
            is_stale,
            etag,
            results,
            total_results,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptable_when_not_stale() {
        assert!(will_be_acceptable(false, Some(Duration::from_secs(1)), None));
    }

    #[test]
    fn acceptable_when_no_timeout_even_if_stale() {
        assert!(will_be_acceptable(true, None, None));
    }

    #[test]
    fn not_acceptable_while_stale_and_within_timeout() {
        let state = WaitState {
            started_at: Instant::now(),
            timeout: Some(Duration::from_secs(60)),
        };
        assert!(!will_be_acceptable(true, Some(Duration::from_secs(60)), Some(&state)));
    }

    #[test]
    fn cache_validator_is_deterministic_and_sensitive_to_inputs() {
        let a = compute_cache_validator(1, false, &[(Etag(5), Etag(5))]);
        let b = compute_cache_validator(1, false, &[(Etag(5), Etag(5))]);
        let c = compute_cache_validator(1, true, &[(Etag(5), Etag(5))]);
        let d = compute_cache_validator(2, false, &[(Etag(5), Etag(5))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
