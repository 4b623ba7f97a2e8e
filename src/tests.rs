//! End-to-end scenarios over a fake document store (spec §8 S1-S6).

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use maplit::btreeset;
use parking_lot::Mutex;
use tantivy::{
    doc,
    query::TermQuery,
    schema::{
        Field,
        IndexRecordOption,
        Schema,
        Value,
        STORED,
        STRING,
        TEXT,
    },
    Term,
};

use crate::{
    definition::{
        IndexDefinition,
        IndexId,
        IndexType,
        LockMode,
        Priority,
        PriorityState,
    },
    document_store::{
        Document,
        DocumentStoreContext,
        DocumentStoreContextPool,
        Tombstone,
    },
    error::{
        IndexEngineError,
        Result,
    },
    etag::{
        CollectionName,
        Etag,
    },
    index::Index,
    notifications::IndexChangeBus,
    persistence::IndexPersistence,
    pipeline::mapping::IndexMapping,
    query::{
        QueryRequest,
        ResultRetriever,
    },
    storage::IndexStorage,
};

#[derive(Default)]
struct FakeCollectionState {
    documents: Vec<Document>,
    tombstones: Vec<Tombstone>,
}

#[derive(Default)]
struct FakeStoreInner {
    collections: BTreeMap<CollectionName, FakeCollectionState>,
    next_etag: u64,
}

/// An in-memory stand-in for the document store. Every mutation bumps a
/// single shared etag counter, matching the real store's monotonic
/// cross-collection sequence.
#[derive(Clone, Default)]
struct FakeStore {
    inner: Arc<Mutex<FakeStoreInner>>,
}

impl FakeStore {
    fn next_etag(&self) -> Etag {
        let mut inner = self.inner.lock();
        inner.next_etag += 1;
        Etag(inner.next_etag)
    }

    fn put_document(&self, collection: &CollectionName, key: Vec<u8>, payload: Vec<u8>) -> Etag {
        let etag = self.next_etag();
        let mut inner = self.inner.lock();
        inner
            .collections
            .entry(collection.clone())
            .or_default()
            .documents
            .push(Document {
                collection: collection.clone(),
                etag,
                key,
                payload,
            });
        etag
    }

    fn delete_document(&self, collection: &CollectionName, key: Vec<u8>, deleted_doc_etag: Etag) -> Etag {
        let etag = self.next_etag();
        let mut inner = self.inner.lock();
        inner
            .collections
            .entry(collection.clone())
            .or_default()
            .tombstones
            .push(Tombstone {
                collection: collection.clone(),
                etag,
                deleted_doc_etag,
                key,
            });
        etag
    }
}

#[async_trait]
impl DocumentStoreContext for FakeStore {
    async fn last_document_etag(&self, collection: &CollectionName) -> anyhow::Result<Etag> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.documents.last())
            .map(|d| d.etag)
            .unwrap_or(Etag::NONE))
    }

    async fn last_tombstone_etag(&self, collection: &CollectionName) -> anyhow::Result<Etag> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.tombstones.last())
            .map(|t| t.etag)
            .unwrap_or(Etag::NONE))
    }

    async fn count_tombstones_with_doc_etag_at_most(
        &self,
        collection: &CollectionName,
        cutoff: Etag,
        last_processed_tombstone_etag: Etag,
    ) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .map(|c| {
                c.tombstones
                    .iter()
                    .filter(|t| t.deleted_doc_etag <= cutoff && t.etag > last_processed_tombstone_etag)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn documents_after(
        &self,
        collection: &CollectionName,
        after: Etag,
        limit: usize,
    ) -> anyhow::Result<Vec<Document>> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| d.etag > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tombstones_after(
        &self,
        collection: &CollectionName,
        after: Etag,
        limit: usize,
    ) -> anyhow::Result<Vec<Tombstone>> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .map(|c| {
                c.tombstones
                    .iter()
                    .filter(|t| t.etag > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentStoreContextPool for FakeStore {
    async fn acquire(&self) -> anyhow::Result<Box<dyn DocumentStoreContext>> {
        Ok(Box::new(self.clone()))
    }
}

struct AutoMapMapper {
    key_field: Field,
    body_field: Field,
}

impl AutoMapMapper {
    fn schema() -> (Schema, Field, Field) {
        let mut builder = Schema::builder();
        let key_field = builder.add_text_field("key", STRING | STORED);
        let body_field = builder.add_text_field("body", TEXT | STORED);
        (builder.build(), key_field, body_field)
    }
}

impl IndexMapping for AutoMapMapper {
    fn map(&self, document: &Document) -> Result<Vec<tantivy::TantivyDocument>> {
        let body = String::from_utf8(document.payload.clone())
            .map_err(|e| IndexEngineError::IndexAnalyzerError(e.into()))?;
        let key = String::from_utf8_lossy(&document.key).into_owned();
        Ok(vec![tantivy::doc!(
            self.key_field => key,
            self.body_field => body,
        )])
    }

    fn key_term(&self, key: &[u8]) -> Term {
        Term::from_field_text(self.key_field, &String::from_utf8_lossy(key))
    }
}

struct IdRetriever {
    key_field: Field,
}

impl ResultRetriever<String> for IdRetriever {
    fn retrieve(&self, searcher: &tantivy::Searcher, doc_address: tantivy::DocAddress, _score: f32) -> Result<String> {
        let doc: tantivy::TantivyDocument =
            searcher.doc(doc_address).map_err(|e| IndexEngineError::Other(e.into()))?;
        let value = doc
            .get_first(self.key_field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(value)
    }
}

fn users() -> CollectionName {
    CollectionName::new("Users")
}

fn build_index(store: FakeStore) -> (Arc<Index>, Field, Field) {
    let (schema, key_field, body_field) = AutoMapMapper::schema();
    let definition = IndexDefinition::new(
        IndexId(1),
        "Users_ByBody",
        IndexType::AutoMap,
        btreeset! { users() },
        LockMode::Unlock,
        vec![],
    )
    .unwrap();
    let storage = IndexStorage::open_in_memory().unwrap();
    let persistence = IndexPersistence::open_in_memory(schema).unwrap();
    let (change_bus, _rx) = IndexChangeBus::new(16);
    let mapping = Arc::new(AutoMapMapper { key_field, body_field });
    let index = Arc::new(Index::new(
        definition,
        storage,
        persistence,
        Arc::new(store),
        mapping,
        change_bus,
    ));
    (index, key_field, body_field)
}

#[tokio::test]
async fn s1_indexes_a_hundred_documents_and_becomes_non_stale() {
    let store = FakeStore::default();
    let (index, _key, _body) = build_index(store.clone());
    for i in 1..=100 {
        store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
    }

    index.initialize().unwrap();
    let runtime = tokio::runtime::Handle::current();
    index.start(&runtime).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !index.is_stale().await.unwrap() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "did not catch up in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(index.get_last_mapped_etag_for(&users()).unwrap(), Etag(100));
    index.dispose().await.unwrap();
}

#[tokio::test]
async fn s2_tombstone_removes_a_document_from_results() {
    let store = FakeStore::default();
    let (index, key_field, _body) = build_index(store.clone());
    let mut etags = Vec::new();
    for i in 1..=100 {
        etags.push(store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec()));
    }

    index.initialize().unwrap();
    let runtime = tokio::runtime::Handle::current();
    index.start(&runtime).unwrap();

    wait_until_non_stale(&index).await;

    let deleted_etag = etags[49]; // user/50
    store.delete_document(&users(), b"user/50".to_vec(), deleted_etag);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let per_collection = index.get_last_processed_document_tombstones_per_collection().unwrap();
        if per_collection.get(&users()).copied().unwrap_or(Etag::NONE) == Etag(101) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tombstone not processed in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let retriever = IdRetriever { key_field };
    let query = QueryRequest {
        query: Box::new(TermQuery::new(
            Term::from_field_text(key_field, "user/50"),
            IndexRecordOption::Basic,
        )),
        limit: 10,
        cutoff_etag: None,
        wait_for_non_stale_as_of_now: false,
        timeout: None,
    };
    let result = index.query(query, &retriever).await.unwrap();
    assert_eq!(result.results.len(), 0);
    index.dispose().await.unwrap();
}

#[tokio::test]
async fn s4_ten_persistent_write_errors_trip_priority_to_error_and_self_stops() {
    let store = FakeStore::default();
    let (index, _key, _body) = build_index(store);

    index.initialize().unwrap();
    for _ in 0..crate::index::WRITE_ERROR_LIMIT {
        let outcome = <Index as crate::indexing_loop::LoopHost>::on_write_error(
            &index,
            &IndexEngineError::write_error(anyhow::anyhow!("full-text backend rejected write")),
        );
        let _ = outcome;
    }

    assert_eq!(index.priority().state, PriorityState::Error);
    // A subsequent successful batch does not silently clear Error (P7):
    // only an explicit set_priority(Normal) does.
    <Index as crate::indexing_loop::LoopHost>::reset_write_errors(&index);
    assert_eq!(index.priority().state, PriorityState::Error);

    index
        .set_priority(Priority {
            state: PriorityState::Normal,
            forced: false,
        })
        .unwrap();
    assert_eq!(index.priority().state, PriorityState::Normal);
}

#[tokio::test]
async fn s3_wait_for_non_stale_as_of_now_blocks_until_caught_up_or_times_out() {
    let store = FakeStore::default();
    let (index, key_field, _body) = build_index(store.clone());
    for i in 1..=50 {
        store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
    }
    index.initialize().unwrap();
    let retriever = IdRetriever { key_field };

    // Nothing is consuming the backlog yet, so a short timeout has to give
    // up and return the stale snapshot rather than hang forever.
    let query = QueryRequest {
        query: Box::new(TermQuery::new(
            Term::from_field_text(key_field, "user/1"),
            IndexRecordOption::Basic,
        )),
        limit: 10,
        cutoff_etag: None,
        wait_for_non_stale_as_of_now: true,
        timeout: Some(Duration::from_millis(50)),
    };
    let result = index.query(query, &retriever).await.unwrap();
    assert!(result.is_stale);

    let runtime = tokio::runtime::Handle::current();
    index.start(&runtime).unwrap();

    let query = QueryRequest {
        query: Box::new(TermQuery::new(
            Term::from_field_text(key_field, "user/1"),
            IndexRecordOption::Basic,
        )),
        limit: 10,
        cutoff_etag: None,
        wait_for_non_stale_as_of_now: true,
        timeout: Some(Duration::from_secs(10)),
    };
    let result = index.query(query, &retriever).await.unwrap();
    assert!(!result.is_stale);
    assert_eq!(result.results.len(), 1);
    index.dispose().await.unwrap();
}

#[tokio::test]
async fn s5_repeated_query_against_a_quiescent_index_returns_an_identical_etag() {
    let store = FakeStore::default();
    let (index, key_field, _body) = build_index(store.clone());
    for i in 1..=20 {
        store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
    }
    index.initialize().unwrap();
    let runtime = tokio::runtime::Handle::current();
    index.start(&runtime).unwrap();
    wait_until_non_stale(&index).await;

    let retriever = IdRetriever { key_field };
    let make_query = || QueryRequest {
        query: Box::new(TermQuery::new(
            Term::from_field_text(key_field, "user/1"),
            IndexRecordOption::Basic,
        )),
        limit: 10,
        cutoff_etag: None,
        wait_for_non_stale_as_of_now: false,
        timeout: None,
    };
    let first = index.query(make_query(), &retriever).await.unwrap();
    let second = index.query(make_query(), &retriever).await.unwrap();
    assert_eq!(first.etag, second.etag);
    assert!(!first.is_stale);
    assert!(!second.is_stale);
    index.dispose().await.unwrap();
}

#[tokio::test]
async fn s6_memory_only_reopen_resets_last_mapped_etag_to_zero() {
    let store = FakeStore::default();
    for i in 1..=30 {
        store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
    }

    let (index1, _key1, _body1) = build_index(store.clone());
    index1.initialize().unwrap();
    let runtime = tokio::runtime::Handle::current();
    index1.start(&runtime).unwrap();
    wait_until_non_stale(&index1).await;
    assert_eq!(index1.get_last_mapped_etag_for(&users()).unwrap(), Etag(30));
    index1.dispose().await.unwrap();

    // A brand new in-memory environment has no persisted state to recover.
    let (index2, _key2, _body2) = build_index(store.clone());
    index2.initialize().unwrap();
    assert_eq!(index2.get_last_mapped_etag_for(&users()).unwrap(), Etag::NONE);

    index2.start(&runtime).unwrap();
    wait_until_non_stale(&index2).await;
    assert_eq!(index2.get_last_mapped_etag_for(&users()).unwrap(), Etag(30));
    index2.dispose().await.unwrap();
}

#[test]
fn p5_set_priority_is_idempotent() {
    let store = FakeStore::default();
    let (index, _key, _body) = build_index(store);
    index.initialize().unwrap();

    let disabled = Priority {
        state: PriorityState::Disabled,
        forced: false,
    };
    index.set_priority(disabled).unwrap();
    index.set_priority(disabled).unwrap();
    assert_eq!(index.priority(), disabled);
}

async fn wait_until_non_stale(index: &Index) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !index.is_stale().await.unwrap() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "did not catch up in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[allow(dead_code)]
fn unused_collections_helper() -> BTreeSet<CollectionName> {
    btreeset! { users() }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

mod property_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn p1_last_mapped_etag_is_monotonic_and_bounded_by_doc_count(doc_count in 1usize..40) {
            block_on(async {
                let store = FakeStore::default();
                let (index, _key, _body) = build_index(store.clone());
                for i in 1..=doc_count {
                    store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
                }
                index.initialize().unwrap();
                let before = index.get_last_mapped_etag_for(&users()).unwrap();
                assert_eq!(before, Etag::NONE);

                let runtime = tokio::runtime::Handle::current();
                index.start(&runtime).unwrap();
                wait_until_non_stale(&index).await;

                let after = index.get_last_mapped_etag_for(&users()).unwrap();
                assert!(after >= before);
                assert_eq!(after, Etag(doc_count as u64));
                index.dispose().await.unwrap();
            });
        }

        #[test]
        fn p2_is_stale_settles_false_after_a_quiescent_batch(doc_count in 1usize..40) {
            block_on(async {
                let store = FakeStore::default();
                let (index, _key, _body) = build_index(store.clone());
                for i in 1..=doc_count {
                    store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
                }
                index.initialize().unwrap();
                let runtime = tokio::runtime::Handle::current();
                index.start(&runtime).unwrap();
                wait_until_non_stale(&index).await;

                assert!(!index.is_stale().await.unwrap());
                // No further writes: staleness stays settled on a second check.
                assert!(!index.is_stale().await.unwrap());
                index.dispose().await.unwrap();
            });
        }

        #[test]
        fn p3_is_stale_as_of_settles_false_once_cutoff_is_mapped(doc_count in 1usize..40, cutoff_fraction in 0usize..=100) {
            block_on(async {
                let store = FakeStore::default();
                let (index, _key, _body) = build_index(store.clone());
                let mut last_etag = Etag::NONE;
                for i in 1..=doc_count {
                    last_etag = store.put_document(&users(), format!("user/{i}").into_bytes(), b"hello world".to_vec());
                }
                let cutoff = Etag(((last_etag.0 * cutoff_fraction as u64) / 100).max(1));

                index.initialize().unwrap();
                let runtime = tokio::runtime::Handle::current();
                index.start(&runtime).unwrap();

                let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
                loop {
                    if !index.is_stale_as_of(cutoff).await.unwrap() {
                        break;
                    }
                    assert!(tokio::time::Instant::now() < deadline, "did not catch up in time");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }

                let mapped = index.get_last_mapped_etag_for(&users()).unwrap();
                assert!(mapped >= std::cmp::min(cutoff, last_etag));
                index.dispose().await.unwrap();
            });
        }

        #[test]
        fn p6_dispose_always_reaches_disposed_regardless_of_prior_lifecycle(
            start_first in any::<bool>(),
        ) {
            block_on(async {
                let store = FakeStore::default();
                let (index, _key, _body) = build_index(store);
                index.initialize().unwrap();
                if start_first {
                    let runtime = tokio::runtime::Handle::current();
                    index.start(&runtime).unwrap();
                }

                index.dispose().await.unwrap();
                assert!(matches!(index.dispose().await, Err(IndexEngineError::Disposed)));
                assert!(matches!(
                    index.set_priority(Priority {
                        state: PriorityState::Normal,
                        forced: false,
                    }),
                    Err(IndexEngineError::Disposed)
                ));
            });
        }
    }
}
