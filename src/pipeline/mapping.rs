//! The mapping function itself is out of scope (spec §1 Non-goals): it is
//! supplied by the index variant. This is the seam the `MapDocuments`
//! worker calls through.

use tantivy::{
    TantivyDocument,
    Term,
};

use crate::{
    document_store::Document,
    error::Result,
};

/// Transforms one document into zero or more searchable entries, and
/// builds the delete term used to retract a document's entries when it is
/// overwritten or tombstoned. Implementations are index-type-specific
/// (e.g. an auto-derived field-by-field map); this crate only calls
/// through the trait.
pub trait IndexMapping: Send + Sync {
    /// A per-document analyzer failure should be returned as an error so
    /// the caller can record it in `stats.analyzer_errors` and move on
    /// (spec §4.4); it must never panic or abort the batch.
    fn map(&self, document: &Document) -> Result<Vec<TantivyDocument>>;

    /// The term that uniquely identifies all entries derived from the
    /// document (or tombstone) with this store key, used to delete them.
    fn key_term(&self, key: &[u8]) -> Term;
}
