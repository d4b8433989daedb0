use anyhow::Result;
use serde::Serialize;

use crate::gateway::VectorIndexGateway;
use crate::store::{AttachmentRecord, NoteRecord, RelationalStore};

/// How many chunks to pull from the index per question by default.
pub const DEFAULT_TOP_K: usize = 2;

/// One retrieved source note with the chunk that matched it best.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedNote {
    pub note: NoteRecord,
    pub attachments: Vec<AttachmentRecord>,
    /// Text of the note's best-ranked chunk.
    pub best_chunk: String,
    pub score: f32,
}

/// Resolves similarity hits back to source notes, ordered by relevance.
pub struct RetrievalCoordinator<'a, S, G> {
    store: &'a S,
    gateway: &'a G,
}

impl<'a, S, G> RetrievalCoordinator<'a, S, G>
where
    S: RelationalStore,
    G: VectorIndexGateway,
{
    pub fn new(store: &'a S, gateway: &'a G) -> Self {
        Self { store, gateway }
    }

    /// Search the index, dedupe hits by owning note, bulk-load the notes
    /// with their attachments, and order them by the rank of each note's
    /// best-scoring chunk — not by storage order, and not by raw score
    /// (only relative order from the search call is meaningful).
    ///
    /// Zero hits yield an empty list, not an error; the consumer may still
    /// proceed with no context.
    pub fn retrieve(&self, question: &str, k: usize) -> Result<Vec<RetrievedNote>> {
        let hits = self.gateway.similarity_search(question, k)?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        // Dedupe note ids preserving first-hit (best-rank) order.
        let mut note_ids: Vec<i64> = Vec::new();
        for hit in &hits {
            if !note_ids.contains(&hit.meta.note_id) {
                note_ids.push(hit.meta.note_id);
            }
        }

        let notes = self.store.load_notes(&note_ids)?;
        let mut ranked: Vec<(usize, RetrievedNote)> = Vec::with_capacity(notes.len());
        for note in notes {
            // First hit for this note is its best rank.
            let Some(rank) = hits.iter().position(|h| h.meta.note_id == note.id) else {
                continue;
            };
            let attachments = self.store.find_attachments(note.id)?;
            ranked.push((
                rank,
                RetrievedNote {
                    note,
                    attachments,
                    best_chunk: hits[rank].text.clone(),
                    score: hits[rank].score,
                },
            ));
        }
        ranked.sort_by_key(|(rank, _)| *rank);
        Ok(ranked.into_iter().map(|(_, note)| note).collect())
    }
}
