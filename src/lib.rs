//! notedex keeps a relational store of notes and their file attachments
//! synchronized with a vector similarity index, and resolves similarity
//! hits back to source notes for retrieval-augmented consumers.
//!
//! The moving parts, leaf first:
//! - [`chunker`] splits content: markdown-aware for note bodies, fixed
//!   token windows for attachment-extracted text.
//! - [`identity`] maps (parent key, ordinal) to stable chunk ids.
//! - [`gateway`] abstracts the vector store; [`gateway::FlatVectorIndex`]
//!   is the bundled exact-scan implementation with on-disk persistence.
//! - [`store`] is the relational side: entity content plus the per-entity
//!   index state that makes rebuilds resumable.
//! - [`engine`] orchestrates upsert, deletion sweeps, and the lazy
//!   full-rebuild progress stream.
//! - [`retrieval`] turns similarity hits into rank-ordered source notes.
//!
//! Write serialization across threads is the caller's job, per parent key
//! ([`lock::KeyedLocks`]); the engine itself stays synchronous.

pub mod chunker;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod loader;
pub mod lock;
pub mod retrieval;
pub mod store;

pub use chunker::{MarkdownSplitter, TokenSplitter};
pub use embedder::{Embedder, FastembedEmbedder, DIMENSIONS};
pub use engine::{content_hash, IndexSyncEngine, ProgressEvent, ProgressStatus, UpsertMode};
pub use error::IndexError;
pub use gateway::{FlatVectorIndex, NewRecord, SearchHit, VectorIndexGateway};
pub use identity::{chunk_id, chunk_ids, ChunkMeta, ParentKey};
pub use loader::{ContentLoader, ExtensionLoader};
pub use retrieval::{RetrievalCoordinator, RetrievedNote, DEFAULT_TOP_K};
pub use store::{AttachmentRecord, IndexState, NoteRecord, RelationalStore, SqliteStore};
