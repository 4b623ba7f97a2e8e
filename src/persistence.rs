//! Full-text writer/reader lifecycle bound to a storage transaction
//! (spec §4.2). The writer is created lazily on first use and is always
//! disposed before the enclosing storage transaction commits; the
//! searcher is only recreated after that commit succeeds (I3).

use parking_lot::RwLock;
use tantivy::{
    directory::{
        MmapDirectory,
        RamDirectory,
    },
    schema::Schema,
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    Searcher,
    Term,
};

use crate::error::{
    IndexEngineError,
    Result,
};

/// Default heap budget for a lazily-opened tantivy writer. Conservative:
/// many indexes may be writing concurrently in the host process.
const WRITER_HEAP_BYTES: usize = 32 * 1024 * 1024;

pub struct IndexPersistence {
    index: Index,
    reader: RwLock<IndexReader>,
}

impl IndexPersistence {
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        let index = Index::create(RamDirectory::default(), schema, Default::default())
            .map_err(|e| IndexEngineError::Other(e.into()))?;
        Self::from_index(index)
    }

    pub fn open_on_disk(schema: Schema, path: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| IndexEngineError::Other(e.into()))?;
        let directory = MmapDirectory::open(path).map_err(|e| IndexEngineError::Other(e.into()))?;
        let index = Index::open_or_create(directory, schema).map_err(|e| IndexEngineError::Other(e.into()))?;
        Self::from_index(index)
    }

    fn from_index(index: Index) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e: tantivy::TantivyError| IndexEngineError::Other(e.into()))?;
        Ok(Self {
            index,
            reader: RwLock::new(reader),
        })
    }

    pub fn schema(&self) -> Schema {
        self.index.schema()
    }

    /// Opens a write handle. Per spec, the *tantivy* writer itself is
    /// created lazily on first `handle_map`/`handle_delete`; callers only
    /// pay for it if the batch actually does something.
    pub fn open_writer(&self) -> IndexWriterHandle<'_> {
        IndexWriterHandle {
            persistence: self,
            writer: None,
        }
    }

    pub fn open_reader(&self) -> IndexReaderHandle {
        IndexReaderHandle {
            searcher: self.reader.read().searcher(),
        }
    }

    /// Called by the indexing loop exactly once after a successful
    /// transaction commit in which any write occurred (I3).
    pub fn recreate_searcher(&self) -> Result<()> {
        self.reader
            .read()
            .reload()
            .map_err(|e| IndexEngineError::Other(e.into()))
    }

    pub fn entries_count(&self) -> Result<u64> {
        Ok(self.reader.read().searcher().num_docs())
    }
}

/// A lazily-opened tantivy writer for one batch. Disposed (committed) by
/// [`IndexWriterHandle::finish`] before the enclosing storage transaction
/// commits; `recreate_searcher` is the caller's job afterward.
pub struct IndexWriterHandle<'a> {
    persistence: &'a IndexPersistence,
    writer: Option<IndexWriter>,
}

impl<'a> IndexWriterHandle<'a> {
    fn writer(&mut self) -> Result<&mut IndexWriter> {
        if self.writer.is_none() {
            let writer = self
                .persistence
                .index
                .writer(WRITER_HEAP_BYTES)
                .map_err(|e| IndexEngineError::write_error(e.into()))?;
            self.writer = Some(writer);
        }
        Ok(self.writer.as_mut().expect("just inserted"))
    }

    pub fn handle_map(&mut self, document: tantivy::TantivyDocument) -> Result<()> {
        self.writer()?
            .add_document(document)
            .map_err(|e| IndexEngineError::write_error(e.into()))?;
        Ok(())
    }

    pub fn handle_delete(&mut self, key_term: Term) -> Result<()> {
        self.writer()?.delete_term(key_term);
        Ok(())
    }

    /// True once a tantivy writer has actually been opened; if no
    /// document or tombstone touched the writer, the batch never opened
    /// one and `recreate_searcher` must not be called.
    pub fn was_opened(&self) -> bool {
        self.writer.is_some()
    }

    /// Commits the tantivy writer, returning whether one was opened at
    /// all. Must be called before the enclosing storage transaction
    /// commits.
    pub fn finish(mut self) -> Result<bool> {
        match self.writer.take() {
            Some(mut writer) => {
                writer
                    .commit()
                    .map_err(|e| IndexEngineError::write_error(e.into()))?;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

pub struct IndexReaderHandle {
    pub searcher: Searcher,
}

#[cfg(test)]
mod tests {
    use tantivy::{
        doc,
        schema::{
            Schema,
            STORED,
            STRING,
            TEXT,
        },
    };

    use super::*;

    fn test_schema() -> (Schema, tantivy::schema::Field, tantivy::schema::Field) {
        let mut builder = Schema::builder();
        let key = builder.add_text_field("key", STRING | STORED);
        let body = builder.add_text_field("body", TEXT | STORED);
        (builder.build(), key, body)
    }

    #[test]
    fn writer_is_not_opened_until_first_use() {
        let (schema, _key, _body) = test_schema();
        let persistence = IndexPersistence::open_in_memory(schema).unwrap();
        let writer = persistence.open_writer();
        assert!(!writer.was_opened());
        assert!(!writer.finish().unwrap());
    }

    #[test]
    fn commit_then_recreate_searcher_makes_docs_visible() {
        let (schema, key, body) = test_schema();
        let persistence = IndexPersistence::open_in_memory(schema).unwrap();

        assert_eq!(persistence.entries_count().unwrap(), 0);

        let mut writer = persistence.open_writer();
        writer.handle_map(doc!(key => "1", body => "hello world")).unwrap();
        assert!(writer.was_opened());
        let opened = writer.finish().unwrap();
        assert!(opened);

        // Before recreate_searcher, the old searcher still sees nothing (I3).
        assert_eq!(persistence.entries_count().unwrap(), 0);

        persistence.recreate_searcher().unwrap();
        assert_eq!(persistence.entries_count().unwrap(), 1);
    }

    #[test]
    fn on_disk_index_survives_reopen() {
        let (schema, key, body) = test_schema();
        let dir = tempfile::tempdir().unwrap();

        {
            let persistence = IndexPersistence::open_on_disk(schema.clone(), dir.path()).unwrap();
            let mut writer = persistence.open_writer();
            writer.handle_map(doc!(key => "1", body => "hello world")).unwrap();
            writer.finish().unwrap();
        }

        let reopened = IndexPersistence::open_on_disk(schema, dir.path()).unwrap();
        assert_eq!(reopened.entries_count().unwrap(), 1);
    }
}
