use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for indexing operations.
///
/// Mutating engine calls return `Result<_, IndexError>` and never panic past
/// the engine boundary. `FlagUpdate` is the one variant that is normally
/// logged and swallowed inside the engine: a stale index-state row is
/// repaired by the next rebuild pass, so it must not abort the operation
/// that produced it.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A content loader could not turn a file into text.
    #[error("cannot load file: {path}")]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Content split into more chunks than a deletion sweep can reverse;
    /// the write is refused up front rather than stranding the overflow.
    #[error("failed to split content: {0}")]
    Chunk(String),

    /// The vector store rejected an add, delete, or persist.
    /// "id not found" during a deletion sweep is *not* this error — the
    /// gateway reports absence as `Ok(false)` and the sweep treats it as
    /// its loop terminator.
    #[error("vector index write failed")]
    IndexWrite(#[source] anyhow::Error),

    /// The relational index-state write failed.
    #[error("index state update failed")]
    FlagUpdate(#[source] anyhow::Error),

    /// The relational store failed to read entities.
    #[error("relational store error")]
    Store(#[source] anyhow::Error),
}

impl IndexError {
    pub(crate) fn load(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::Load {
            path: path.into(),
            source,
        }
    }
}
