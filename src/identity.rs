use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the owner of a group of chunks: either a note (integer id)
/// or one of its file attachments (path string). The two id spaces are
/// disjoint by construction, so rendered keys never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentKey {
    Note(i64),
    Attachment(String),
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentKey::Note(id) => write!(f, "{id}"),
            ParentKey::Attachment(path) => f.write_str(path),
        }
    }
}

/// Metadata stored alongside every index record.
///
/// Attachment chunks carry the owning note's id so that a similarity hit on
/// attachment text still resolves to a note at retrieval time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub note_id: i64,
    pub parent_key: String,
    pub ordinal: usize,
}

/// The id of one chunk: `"{parent}-{ordinal}"`.
///
/// Pure and stable: the same (parent, ordinal) always yields the same id,
/// which is what lets a delete-before-add upsert overwrite instead of
/// accumulate.
pub fn chunk_id(parent: &ParentKey, ordinal: usize) -> String {
    format!("{parent}-{ordinal}")
}

/// Ids for `count` chunks of `parent`, ordinals contiguous from 0.
pub fn chunk_ids(parent: &ParentKey, count: usize) -> Vec<String> {
    (0..count).map(|ordinal| chunk_id(parent, ordinal)).collect()
}
