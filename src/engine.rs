//! The document indexing synchronization engine.
//!
//! Decides what must be (re)embedded, splits content into chunks, assigns
//! stable chunk ids, performs idempotent batched writes into the vector
//! index, reverses them on deletion, and reports progress while rebuilding
//! the whole index.
//!
//! The engine is synchronous and lock-free internally; callers that share
//! one engine across threads serialize mutating operations per parent key
//! (see [`crate::lock::KeyedLocks`]).

use std::collections::VecDeque;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::chunker::{MarkdownSplitter, TokenSplitter};
use crate::error::IndexError;
use crate::gateway::{NewRecord, VectorIndexGateway};
use crate::identity::{chunk_id, chunk_ids, ChunkMeta, ParentKey};
use crate::loader::ContentLoader;
use crate::retrieval::{RetrievalCoordinator, RetrievedNote};
use crate::store::{NoteRecord, RelationalStore};

/// Records written to the gateway per add call. Bounds peak request size
/// and lets a mid-rebuild failure be attributed to a specific batch.
const ADD_BATCH: usize = 5;

/// Notes loaded from the relational store per rebuild step.
const REBUILD_BATCH: usize = 5;

/// Ceiling for the probe phase of a deletion sweep.
const MAX_SWEEP_ORDINALS: usize = 10_000;

/// Characters of entity content carried in progress events.
const PREVIEW_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Fresh content: no prior chunks to remove.
    Insert,
    /// Re-embed: sweep the parent's old chunks first so a shrink in chunk
    /// count leaves no orphans.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Success,
    Skip,
    Error,
}

/// One rebuild step. Emitted once per entity; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    /// First characters of the entity's content, for display.
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub current: usize,
    pub total: usize,
}

/// SHA-256 hex of `text`. The engine's content-identity function: a note is
/// considered indexed when its stored hash equals this value for its
/// current content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Orchestrates chunking, identity assignment, and vector writes against
/// the relational store, the vector gateway, and the content loader.
pub struct IndexSyncEngine<S, G, L> {
    store: S,
    gateway: G,
    loader: L,
    note_splitter: MarkdownSplitter,
    attachment_splitter: TokenSplitter,
}

impl<S, G, L> IndexSyncEngine<S, G, L>
where
    S: RelationalStore,
    G: VectorIndexGateway,
    L: ContentLoader,
{
    pub fn new(store: S, gateway: G, loader: L) -> Self {
        Self {
            store,
            gateway,
            loader,
            note_splitter: MarkdownSplitter::default(),
            attachment_splitter: TokenSplitter::default(),
        }
    }

    pub fn with_splitters(
        mut self,
        note_splitter: MarkdownSplitter,
        attachment_splitter: TokenSplitter,
    ) -> Self {
        self.note_splitter = note_splitter;
        self.attachment_splitter = attachment_splitter;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    /// (Re)index a note's primary content.
    ///
    /// Update mode sweeps the note's old chunks first. Content is split
    /// structurally, ids are assigned from the note id, and records go to
    /// the gateway in batches of [`ADD_BATCH`] with one persist after all
    /// batches succeed. The index state (content hash + chunk count) is
    /// written only after the vector writes are confirmed; a failed state
    /// write is logged and swallowed — the next rebuild repairs it.
    pub fn upsert(
        &mut self,
        note_id: i64,
        content: &str,
        mode: UpsertMode,
    ) -> Result<(), IndexError> {
        let key = ParentKey::Note(note_id);
        if mode == UpsertMode::Update {
            let known = self
                .store
                .find_note(note_id)
                .map_err(IndexError::Store)?
                .map(|n| n.state.chunk_count)
                .unwrap_or(0);
            self.sweep(&key, known)?;
        }

        let chunks = self.note_splitter.split_text(content);
        self.write_chunks(&key, note_id, &chunks)?;

        let hash = content_hash(content);
        if let Err(e) = self
            .store
            .set_note_index_state(note_id, Some(&hash), chunks.len() as u32)
            .map_err(IndexError::FlagUpdate)
        {
            tracing::warn!(note_id, error = ?e, "swallowed index state write failure");
        }
        Ok(())
    }

    /// (Re)index one attachment's extracted text under the attachment-path
    /// key. The owning note's id travels in the chunk metadata so retrieval
    /// can resolve attachment hits back to the note.
    pub fn upsert_attachment(&mut self, note_id: i64, path: &str) -> Result<(), IndexError> {
        let text = self
            .loader
            .load_text(Path::new(path))
            .map_err(|e| IndexError::load(path, e))?;

        let known = self
            .store
            .find_attachments(note_id)
            .map_err(IndexError::Store)?
            .into_iter()
            .find(|a| a.path == path)
            .map(|a| a.chunk_count)
            .unwrap_or(0);

        let key = ParentKey::Attachment(path.to_string());
        self.sweep(&key, known)?;

        let chunks = self.attachment_splitter.split_text(&text);
        self.write_chunks(&key, note_id, &chunks)?;

        if let Err(e) = self
            .store
            .set_attachment_chunk_count(path, chunks.len() as u32)
            .map_err(IndexError::FlagUpdate)
        {
            tracing::warn!(path, error = ?e, "swallowed attachment count write failure");
        }
        Ok(())
    }

    /// Scrub every vector belonging to a note: its own chunks plus the
    /// chunks of each attachment. Deleting a parent with nothing indexed is
    /// a no-op. The index state (hash, chunk counts, attachments flag) is
    /// reset best-effort; the relational rows themselves are the caller's
    /// to remove.
    pub fn delete_entity(&mut self, note_id: i64) -> Result<(), IndexError> {
        let note = self.store.find_note(note_id).map_err(IndexError::Store)?;
        let known = note.as_ref().map(|n| n.state.chunk_count).unwrap_or(0);
        self.sweep(&ParentKey::Note(note_id), known)?;

        let attachments = self
            .store
            .find_attachments(note_id)
            .map_err(IndexError::Store)?;
        for attachment in &attachments {
            let key = ParentKey::Attachment(attachment.path.clone());
            self.sweep(&key, attachment.chunk_count)?;
        }

        // Reset the whole index state, attachments included, so a rebuild
        // after a delete-without-row-removal re-indexes from scratch.
        if note.is_some() {
            if let Err(e) = self
                .store
                .set_note_index_state(note_id, None, 0)
                .and_then(|()| self.store.set_attachments_indexed(note_id, false))
                .map_err(IndexError::FlagUpdate)
            {
                tracing::warn!(note_id, error = ?e, "swallowed index state reset failure");
            }
        }
        for attachment in &attachments {
            if let Err(e) = self
                .store
                .set_attachment_chunk_count(&attachment.path, 0)
                .map_err(IndexError::FlagUpdate)
            {
                tracing::warn!(path = %attachment.path, error = ?e, "swallowed attachment count reset failure");
            }
        }
        Ok(())
    }

    /// Rebuild the whole index as a lazy progress stream.
    ///
    /// Note ids are listed up front; records are loaded [`REBUILD_BATCH`]
    /// at a time. Consuming the iterator drives the work, so dropping it is
    /// cancellation — already-processed entities stay committed. One
    /// failing entity never aborts the stream: it becomes an `error` event
    /// and processing continues.
    pub fn rebuild_all(&mut self) -> Result<Rebuild<'_, S, G, L>, IndexError> {
        let ids = self.store.note_ids().map_err(IndexError::Store)?;
        let total = ids.len();
        tracing::debug!(total, "starting index rebuild");
        Ok(Rebuild {
            engine: self,
            ids,
            next: 0,
            pending: VecDeque::new(),
            current: 0,
            total,
        })
    }

    /// Similarity search resolved back to source notes. See
    /// [`RetrievalCoordinator`].
    pub fn retrieve(&self, question: &str, k: usize) -> anyhow::Result<Vec<RetrievedNote>> {
        RetrievalCoordinator::new(&self.store, &self.gateway).retrieve(question, k)
    }

    /// Remove all chunks of `parent`. Ids `0..known_count` are deleted
    /// exactly (absent ids are fine — the count is advisory), then the
    /// probe phase walks successive ordinals until the gateway reports
    /// absence, catching strays from a crash between vector write and
    /// state write. Probe deletes persist one at a time so progress
    /// survives a crash mid-sweep.
    fn sweep(&mut self, parent: &ParentKey, known_count: u32) -> Result<(), IndexError> {
        let mut removed = 0usize;
        for id in chunk_ids(parent, known_count as usize) {
            if self.gateway.delete(&id).map_err(IndexError::IndexWrite)? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.gateway.persist().map_err(IndexError::IndexWrite)?;
        }

        let mut ordinal = known_count as usize;
        loop {
            if ordinal >= MAX_SWEEP_ORDINALS {
                tracing::warn!(parent = %parent, "deletion sweep hit the {MAX_SWEEP_ORDINALS}-ordinal ceiling");
                break;
            }
            let id = chunk_id(parent, ordinal);
            if !self.gateway.delete(&id).map_err(IndexError::IndexWrite)? {
                break;
            }
            self.gateway.persist().map_err(IndexError::IndexWrite)?;
            removed += 1;
            ordinal += 1;
        }
        if removed > 0 {
            tracing::debug!(parent = %parent, removed, "swept parent chunks");
        }
        Ok(())
    }

    /// Embed and write `chunks` under contiguous ordinals, batched, with a
    /// single persist once every batch has succeeded.
    fn write_chunks(
        &mut self,
        parent: &ParentKey,
        note_id: i64,
        chunks: &[String],
    ) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Ok(());
        }
        // Ordinals at or past the sweep ceiling could never be deleted
        // again, so refuse to write them in the first place.
        if chunks.len() > MAX_SWEEP_ORDINALS {
            return Err(IndexError::Chunk(format!(
                "{parent} split into {} chunks, more than the {MAX_SWEEP_ORDINALS} a deletion sweep can reverse",
                chunks.len()
            )));
        }
        let ids = chunk_ids(parent, chunks.len());
        let records: Vec<NewRecord> = chunks
            .iter()
            .zip(&ids)
            .enumerate()
            .map(|(ordinal, (text, id))| NewRecord {
                id: id.clone(),
                text: text.clone(),
                meta: ChunkMeta {
                    note_id,
                    parent_key: parent.to_string(),
                    ordinal,
                },
            })
            .collect();

        for batch in records.chunks(ADD_BATCH) {
            self.gateway
                .add(batch.to_vec())
                .map_err(IndexError::IndexWrite)?;
        }
        self.gateway.persist().map_err(IndexError::IndexWrite)?;
        Ok(())
    }

    /// Rebuild step for one note. Returns true when the note was skipped
    /// (nothing to do, zero gateway writes).
    fn rebuild_note(&mut self, note: &NoteRecord) -> Result<bool, IndexError> {
        let content_fresh =
            note.state.content_hash.as_deref() == Some(content_hash(&note.content).as_str());
        let attachments = self
            .store
            .find_attachments(note.id)
            .map_err(IndexError::Store)?;
        let attachments_settled = attachments.is_empty() || note.state.attachments_indexed;

        if content_fresh && attachments_settled {
            tracing::debug!(note_id = note.id, "skipping indexed note");
            return Ok(true);
        }

        if !content_fresh {
            let mode = if note.state.is_indexed() || note.state.chunk_count > 0 {
                UpsertMode::Update
            } else {
                UpsertMode::Insert
            };
            self.upsert(note.id, &note.content, mode)?;
        }

        if !attachments_settled {
            for attachment in &attachments {
                self.upsert_attachment(note.id, &attachment.path)?;
            }
            if let Err(e) = self
                .store
                .set_attachments_indexed(note.id, true)
                .map_err(IndexError::FlagUpdate)
            {
                tracing::warn!(note_id = note.id, error = ?e, "swallowed attachments flag write failure");
            }
        }
        Ok(false)
    }
}

/// Lazy rebuild progress stream. See [`IndexSyncEngine::rebuild_all`].
pub struct Rebuild<'a, S, G, L> {
    engine: &'a mut IndexSyncEngine<S, G, L>,
    ids: Vec<i64>,
    next: usize,
    pending: VecDeque<Pending>,
    current: usize,
    total: usize,
}

enum Pending {
    Loaded(NoteRecord),
    /// Listed at stream start but gone by the time its batch loaded.
    Missing,
    LoadFailed(String),
}

impl<S, G, L> Iterator for Rebuild<'_, S, G, L>
where
    S: RelationalStore,
    G: VectorIndexGateway,
    L: ContentLoader,
{
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        if self.pending.is_empty() {
            if self.next >= self.ids.len() {
                return None;
            }
            let end = (self.next + REBUILD_BATCH).min(self.ids.len());
            let batch = &self.ids[self.next..end];
            self.next = end;
            match self.engine.store.load_notes(batch) {
                Ok(notes) => {
                    for id in batch {
                        match notes.iter().find(|n| n.id == *id) {
                            Some(note) => self.pending.push_back(Pending::Loaded(note.clone())),
                            None => self.pending.push_back(Pending::Missing),
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("rebuild batch load failed: {e:#}");
                    for _ in batch {
                        self.pending.push_back(Pending::LoadFailed(format!("{e:#}")));
                    }
                }
            }
        }

        let item = self.pending.pop_front()?;
        self.current += 1;

        let event = match item {
            Pending::Missing => ProgressEvent {
                status: ProgressStatus::Skip,
                preview: String::new(),
                error: None,
                current: self.current,
                total: self.total,
            },
            Pending::LoadFailed(error) => ProgressEvent {
                status: ProgressStatus::Error,
                preview: String::new(),
                error: Some(error),
                current: self.current,
                total: self.total,
            },
            Pending::Loaded(note) => {
                let note_preview = preview(&note.content);
                match self.engine.rebuild_note(&note) {
                    Ok(true) => ProgressEvent {
                        status: ProgressStatus::Skip,
                        preview: note_preview,
                        error: None,
                        current: self.current,
                        total: self.total,
                    },
                    Ok(false) => ProgressEvent {
                        status: ProgressStatus::Success,
                        preview: note_preview,
                        error: None,
                        current: self.current,
                        total: self.total,
                    },
                    Err(e) => {
                        tracing::error!(note_id = note.id, "rebuild entity failed: {e:#}");
                        ProgressEvent {
                            status: ProgressStatus::Error,
                            preview: note_preview,
                            error: Some(format!("{e:#}")),
                            current: self.current,
                            total: self.total,
                        }
                    }
                }
            }
        };
        Some(event)
    }
}
