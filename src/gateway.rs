use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::embedder::Embedder;
use crate::identity::ChunkMeta;

/// A chunk to be embedded and written into the index.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
}

/// One similarity hit, ordered by descending relevance.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
    /// Cosine similarity in [0, 1] — higher means more semantically similar.
    pub score: f32,
}

/// Abstraction over the vector store.
///
/// `add` and `delete` mutate in-memory state only; `persist` is the sole
/// durability boundary. Callers persist after every mutating batch so a
/// crash loses at most the in-flight batch.
pub trait VectorIndexGateway {
    /// Embed and store records. A record whose id already exists is
    /// overwritten, which is what makes repeated identical upserts
    /// idempotent.
    fn add(&mut self, records: Vec<NewRecord>) -> Result<()>;

    /// Remove one record. `Ok(false)` means the id was not present — the
    /// deletion sweep's loop terminator, never an error. `Err` is genuine
    /// failure and must propagate.
    fn delete(&mut self, id: &str) -> Result<bool>;

    /// Best-effort nearest neighbors for `query`, descending relevance.
    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;

    /// Flush the index to durable storage.
    fn persist(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    text: String,
    meta: ChunkMeta,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    records: Vec<StoredRecord>,
}

/// How many texts to hand the embedder per inference call.
const EMBED_BATCH: usize = 32;

/// Exact-scan vector index over an in-memory id → record map.
///
/// Chunk collections for a personal note store are small enough that a flat
/// cosine scan beats an ANN structure once exact per-id deletion is a
/// requirement. Vectors are unit-normalized on the way in, so scoring is a
/// plain dot product.
pub struct FlatVectorIndex {
    embedder: Arc<dyn Embedder>,
    records: HashMap<String, StoredRecord>,
    path: PathBuf,
}

impl FlatVectorIndex {
    /// Open the index at `path`, loading the persisted file if one exists.
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let records = if path.exists() {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read index file {}", path.display()))?;
            let persisted: PersistedIndex = serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt index file {}", path.display()))?;
            persisted
                .records
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            embedder,
            records,
            path: path.to_path_buf(),
        })
    }

    /// Number of records currently in the index.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if a record with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }
}

impl VectorIndexGateway for FlatVectorIndex {
    fn add(&mut self, records: Vec<NewRecord>) -> Result<()> {
        for batch in records.chunks(EMBED_BATCH) {
            let texts: Vec<&str> = batch.iter().map(|r| r.text.as_str()).collect();
            let vectors = self.embedder.embed_batch(&texts)?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            for (record, vector) in batch.iter().zip(vectors) {
                self.records.insert(
                    record.id.clone(),
                    StoredRecord {
                        id: record.id.clone(),
                        text: record.text.clone(),
                        meta: record.meta.clone(),
                        vector,
                    },
                );
            }
        }
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed_one(query)?;

        let mut hits: Vec<SearchHit> = self
            .records
            .values()
            .map(|r| SearchHit {
                id: r.id.clone(),
                text: r.text.clone(),
                meta: r.meta.clone(),
                score: dot(&query_vector, &r.vector).clamp(0.0, 1.0),
            })
            .collect();

        // Descending score, ties broken by id so results are deterministic.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist to disk atomically (write temp file, then rename).
    /// Prevents partial writes from corrupting the saved index.
    fn persist(&self) -> Result<()> {
        let mut records: Vec<&StoredRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let persisted = PersistedIndex {
            records: records
                .into_iter()
                .map(|r| StoredRecord {
                    id: r.id.clone(),
                    text: r.text.clone(),
                    meta: r.meta.clone(),
                    vector: r.vector.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&persisted).context("index serialize failed")?;

        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChunkMeta;

    /// Deterministic embedder: hashes each text into a fixed unit vector so
    /// identical texts collide and different texts (almost surely) don't.
    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 8];
                    for (i, b) in t.bytes().enumerate() {
                        v[i % 8] += b as f32;
                    }
                    crate::embedder::normalize(v)
                })
                .collect())
        }
    }

    fn meta(note_id: i64, ordinal: usize) -> ChunkMeta {
        ChunkMeta {
            note_id,
            parent_key: note_id.to_string(),
            ordinal,
        }
    }

    fn record(id: &str, text: &str) -> NewRecord {
        NewRecord {
            id: id.to_string(),
            text: text.to_string(),
            meta: meta(1, 0),
        }
    }

    fn open_index(dir: &tempfile::TempDir) -> FlatVectorIndex {
        FlatVectorIndex::open(&dir.path().join("index.json"), Arc::new(StubEmbedder)).unwrap()
    }

    #[test]
    fn add_overwrites_existing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index.add(vec![record("1-0", "first")]).unwrap();
        index.add(vec![record("1-0", "second")]).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_reports_absence_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index.add(vec![record("1-0", "text")]).unwrap();
        assert!(index.delete("1-0").unwrap());
        assert!(!index.delete("1-0").unwrap());
        assert!(!index.delete("never-existed").unwrap());
    }

    #[test]
    fn search_finds_the_identical_text_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .add(vec![
                record("1-0", "rust borrow checker"),
                record("2-0", "gardening tips for spring"),
            ])
            .unwrap();
        let hits = index.similarity_search("rust borrow checker", 2).unwrap();
        assert_eq!(hits[0].id, "1-0");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn persist_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let mut index =
                FlatVectorIndex::open(&path, Arc::new(StubEmbedder)).unwrap();
            index.add(vec![record("7-0", "hello world")]).unwrap();
            index.persist().unwrap();
        }
        let reopened = FlatVectorIndex::open(&path, Arc::new(StubEmbedder)).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.contains("7-0"));
    }
}
