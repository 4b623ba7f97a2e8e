//! Per-index background indexing engine.
//!
//! Each [`Index`](index::Index) owns its own transactional storage
//! environment ([`storage`]) and a full-text persistence binding
//! ([`persistence`]). A single background [`IndexingLoop`](indexing_loop::IndexingLoop)
//! drains documents and tombstones from the document store through an
//! ordered [`WorkerPipeline`](pipeline::WorkerPipeline), commits the batch
//! atomically, and wakes any queries blocked on staleness.
//!
//! The document store, the storage engine's transaction machinery, the
//! full-text library's query execution, and the notification bus are all
//! external collaborators: this crate only defines the contracts it needs
//! from them (see [`document_store`] and [`notifications`]) and the engine
//! built on top.

pub mod definition;
pub mod document_store;
pub mod error;
pub mod etag;
pub mod index;
pub mod indexing_loop;
pub mod metrics;
pub mod notifications;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod staleness;
pub mod storage;

pub use definition::{IndexDefinition, IndexType};
pub use error::{IndexEngineError, Result};
pub use etag::{CollectionName, Etag};
pub use index::Index;
pub use query::{QueryRequest, QueryResult};

#[cfg(test)]
mod tests;
