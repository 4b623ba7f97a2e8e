//! Error kinds for the indexing engine (spec §7).
//!
//! Lifecycle errors surface synchronously to the caller. Batch-internal
//! errors are caught inside [`crate::indexing_loop`], recorded, and never
//! escape the loop. Query-path errors from the reader propagate to the
//! query caller.

use std::fmt;

pub type Result<T> = std::result::Result<T, IndexEngineError>;

/// Whether an [`IndexEngineError::IndexWriteError`] counts against the
/// index's write-error budget (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Inner cause was a system I/O exception; not counted.
    Transient,
    /// Anything else; counted toward the error-priority trip.
    Persistent,
}

#[derive(thiserror::Error, Debug)]
pub enum IndexEngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid index state: {0}")]
    InvalidState(&'static str),

    #[error("no index implementation registered for type tag {0:?}")]
    NotImplementedIndexType(String),

    #[error("index write error ({kind:?}): {source}")]
    IndexWriteError {
        kind: WriteErrorKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("analyzer error for document: {0}")]
    IndexAnalyzerError(anyhow::Error),

    #[error("out of memory while indexing a batch")]
    OutOfMemory,

    #[error("operation cancelled")]
    Cancelled,

    #[error("index has been disposed")]
    Disposed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IndexEngineError {
    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Classifies a full-text writer failure per §4.7: a transient system
    /// I/O error does not count toward the write-error budget.
    pub fn write_error(source: anyhow::Error) -> Self {
        let kind = if source
            .chain()
            .any(|cause| cause.downcast_ref::<std::io::Error>().is_some())
        {
            WriteErrorKind::Transient
        } else {
            WriteErrorKind::Persistent
        };
        Self::IndexWriteError { kind, source }
    }
}
