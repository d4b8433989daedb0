//! End-to-end engine tests over an in-memory sqlite store, a deterministic
//! stub embedder, and a temp-dir index file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use notedex::{
    AttachmentRecord, ContentLoader, Embedder, FlatVectorIndex, IndexError, IndexSyncEngine,
    MarkdownSplitter, NewRecord, NoteRecord, ProgressStatus, RelationalStore, SearchHit,
    SqliteStore, TokenSplitter, UpsertMode, VectorIndexGateway,
};

/// Deterministic embedder: hashes bytes into a fixed unit vector, so
/// identical texts score 1.0 against each other and different texts score
/// lower.
struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 16];
                for (i, b) in t.bytes().enumerate() {
                    v[(i * 7 + b as usize) % 16] += b as f32;
                }
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 1e-10 {
                    v.iter_mut().for_each(|x| *x /= norm);
                }
                v
            })
            .collect())
    }
}

/// Wraps the real index to count writes and inject add failures.
struct RecordingGateway {
    inner: FlatVectorIndex,
    added_ids: Vec<String>,
    fail_on: Option<&'static str>,
}

impl RecordingGateway {
    fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl VectorIndexGateway for RecordingGateway {
    fn add(&mut self, records: Vec<NewRecord>) -> Result<()> {
        if let Some(marker) = self.fail_on {
            if records.iter().any(|r| r.text.contains(marker)) {
                anyhow::bail!("injected add failure");
            }
        }
        self.added_ids.extend(records.iter().map(|r| r.id.clone()));
        self.inner.add(records)
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }

    fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        self.inner.similarity_search(query, k)
    }

    fn persist(&self) -> Result<()> {
        self.inner.persist()
    }
}

/// Loader serving canned text by path; unknown paths fail like unreadable
/// files.
#[derive(Default)]
struct StubLoader {
    files: HashMap<String, String>,
}

impl ContentLoader for StubLoader {
    fn load_text(&self, path: &Path) -> Result<String> {
        self.files
            .get(&path.to_string_lossy().to_string())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unreadable"))
    }
}

type TestEngine = IndexSyncEngine<SqliteStore, RecordingGateway, StubLoader>;

fn engine_in(dir: &tempfile::TempDir) -> TestEngine {
    engine_with_loader(dir, StubLoader::default())
}

fn engine_with_loader(dir: &tempfile::TempDir, loader: StubLoader) -> TestEngine {
    let store = SqliteStore::open_in_memory().unwrap();
    let inner =
        FlatVectorIndex::open(&dir.path().join("index.json"), Arc::new(StubEmbedder)).unwrap();
    let gateway = RecordingGateway {
        inner,
        added_ids: Vec::new(),
        fail_on: None,
    };
    IndexSyncEngine::new(store, gateway, loader).with_splitters(
        // Small chunks so short test notes still split into several.
        MarkdownSplitter { max_chars: 10 },
        TokenSplitter {
            chunk_tokens: 4,
            overlap_tokens: 0,
        },
    )
}

/// Three blocks that cannot pack together under max_chars = 10.
const THREE_CHUNKS: &str = "aaaaaaaa\n\nbbbbbbbb\n\ncccccccc";

#[test]
fn upsert_writes_contiguous_ids_and_nothing_beyond() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let id = engine.store().insert_note(THREE_CHUNKS).unwrap();

    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();

    for ordinal in 0..3 {
        assert!(engine.gateway().contains(&format!("{id}-{ordinal}")));
    }
    assert!(!engine.gateway().contains(&format!("{id}-3")));

    let note = engine.store().find_note(id).unwrap().unwrap();
    assert_eq!(note.state.chunk_count, 3);
    assert!(note.state.is_indexed());
}

#[test]
fn update_that_shrinks_chunk_count_leaves_no_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let id = engine.store().insert_note(THREE_CHUNKS).unwrap();
    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();

    engine.store().update_note_content(id, "tiny").unwrap();
    engine.upsert(id, "tiny", UpsertMode::Update).unwrap();

    assert!(engine.gateway().contains(&format!("{id}-0")));
    assert!(!engine.gateway().contains(&format!("{id}-1")));
    assert!(!engine.gateway().contains(&format!("{id}-2")));
    assert_eq!(engine.gateway().len(), 1);
}

#[test]
fn double_insert_of_identical_content_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let id = engine.store().insert_note(THREE_CHUNKS).unwrap();

    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();
    let after_first = engine.gateway().len();
    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();

    assert_eq!(engine.gateway().len(), after_first);
    for ordinal in 0..3 {
        assert!(engine.gateway().contains(&format!("{id}-{ordinal}")));
    }
}

#[test]
fn deleting_a_parent_with_nothing_indexed_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let id = engine.store().insert_note("never indexed").unwrap();

    engine.delete_entity(id).unwrap();
    assert_eq!(engine.gateway().len(), 0);
}

#[test]
fn delete_cascades_to_attachment_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = StubLoader::default();
    loader.files.insert(
        "files/report.txt".into(),
        "one two three four five six".into(),
    );
    let mut engine = engine_with_loader(&dir, loader);

    let id = engine.store().insert_note("note body").unwrap();
    engine.store().add_attachment(id, "files/report.txt").unwrap();
    engine.upsert(id, "note body", UpsertMode::Insert).unwrap();
    engine.upsert_attachment(id, "files/report.txt").unwrap();

    assert!(engine.gateway().contains("files/report.txt-0"));

    engine.delete_entity(id).unwrap();
    assert_eq!(engine.gateway().len(), 0);
}

#[test]
fn sweep_probe_phase_removes_strays_beyond_the_recorded_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let id = engine.store().insert_note(THREE_CHUNKS).unwrap();
    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();

    // Simulate a crash between vector write and state write: the store
    // remembers fewer chunks than the index holds.
    engine
        .store()
        .set_note_index_state(id, Some("stale"), 1)
        .unwrap();

    engine.upsert(id, "tiny", UpsertMode::Update).unwrap();
    assert!(!engine.gateway().contains(&format!("{id}-1")));
    assert!(!engine.gateway().contains(&format!("{id}-2")));
    assert_eq!(engine.gateway().len(), 1);
}

#[test]
fn rebuild_skips_indexed_notes_with_zero_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let indexed = engine.store().insert_note("already done").unwrap();
    let fresh = engine.store().insert_note("still pending").unwrap();
    engine
        .upsert(indexed, "already done", UpsertMode::Insert)
        .unwrap();

    let writes_before = engine.gateway().added_ids.len();
    let events: Vec<_> = engine.rebuild_all().unwrap().collect();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].status, ProgressStatus::Skip);
    assert_eq!(events[1].status, ProgressStatus::Success);
    assert_eq!(events[1].total, 2);

    let new_writes = &engine.gateway().added_ids[writes_before..];
    assert!(new_writes.iter().all(|id| id.starts_with(&fresh.to_string())));
    assert!(!new_writes.iter().any(|id| id.starts_with(&format!("{indexed}-"))));
}

#[test]
fn rebuild_reembeds_only_the_edited_note() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let edited = engine.store().insert_note("original").unwrap();
    let untouched = engine.store().insert_note("stable note").unwrap();
    engine.upsert(edited, "original", UpsertMode::Insert).unwrap();
    engine
        .upsert(untouched, "stable note", UpsertMode::Insert)
        .unwrap();

    engine.store().update_note_content(edited, "edited!").unwrap();

    let events: Vec<_> = engine.rebuild_all().unwrap().collect();
    assert_eq!(events[0].status, ProgressStatus::Success);
    assert_eq!(events[0].preview, "edited!");
    assert_eq!(events[1].status, ProgressStatus::Skip);
}

#[test]
fn rebuild_continues_past_a_failing_entity() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    for n in 1..=7 {
        let content = if n == 4 {
            "note BOOM four".to_string()
        } else {
            format!("note number {n}")
        };
        engine.store().insert_note(&content).unwrap();
    }
    // Inject failures after setup so only rebuild adds can trip it.
    engine.gateway_mut().fail_on = Some("BOOM");

    let events: Vec<_> = engine.rebuild_all().unwrap().collect();

    assert_eq!(events.len(), 7);
    assert_eq!(events[3].status, ProgressStatus::Error);
    assert!(events[3].error.is_some());
    assert!(events[3].preview.contains("BOOM"));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.current, i + 1);
        assert_eq!(event.total, 7);
        if i != 3 {
            assert_eq!(event.status, ProgressStatus::Success);
        }
    }
}

#[test]
fn rebuild_indexes_pending_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = StubLoader::default();
    loader
        .files
        .insert("files/a.txt".into(), "alpha beta gamma delta".into());
    let mut engine = engine_with_loader(&dir, loader);

    let id = engine.store().insert_note("has attachment").unwrap();
    engine.store().add_attachment(id, "files/a.txt").unwrap();

    let events: Vec<_> = engine.rebuild_all().unwrap().collect();
    assert_eq!(events[0].status, ProgressStatus::Success);
    assert!(engine.gateway().contains("files/a.txt-0"));
    let note = engine.store().find_note(id).unwrap().unwrap();
    assert!(note.state.attachments_indexed);

    // Second pass: everything settled now.
    let events: Vec<_> = engine.rebuild_all().unwrap().collect();
    assert_eq!(events[0].status, ProgressStatus::Skip);
}

#[test]
fn retrieve_with_zero_hits_returns_an_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);
    let notes = engine.retrieve("anything", 2).unwrap();
    assert!(notes.is_empty());
}

#[test]
fn retrieve_orders_notes_by_similarity_rank_not_storage_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    let first = engine.store().insert_note("rust memo").unwrap();
    let second = engine.store().insert_note("tea guide").unwrap();
    engine.upsert(first, "rust memo", UpsertMode::Insert).unwrap();
    engine.upsert(second, "tea guide", UpsertMode::Insert).unwrap();

    // The query is the second note's exact chunk text, so it must rank
    // first despite its later storage position.
    let notes = engine.retrieve("tea guide", 2).unwrap();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].note.id, second);
    assert_eq!(notes[0].best_chunk, "tea guide");
    assert_eq!(notes[1].note.id, first);
}

#[test]
fn retrieve_resolves_attachment_hits_to_the_owning_note() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = StubLoader::default();
    loader
        .files
        .insert("files/spec.txt".into(), "quarterly revenue projections".into());
    let mut engine = engine_with_loader(&dir, loader);

    let id = engine.store().insert_note("finance note").unwrap();
    engine.store().add_attachment(id, "files/spec.txt").unwrap();
    engine.upsert(id, "finance note", UpsertMode::Insert).unwrap();
    engine.upsert_attachment(id, "files/spec.txt").unwrap();

    let notes = engine.retrieve("quarterly revenue projections", 2).unwrap();
    assert_eq!(notes[0].note.id, id);
    assert_eq!(notes[0].attachments.len(), 1);
}

#[test]
fn delete_entity_resets_attachment_state_for_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = StubLoader::default();
    loader
        .files
        .insert("files/a.txt".into(), "alpha beta gamma delta".into());
    let mut engine = engine_with_loader(&dir, loader);

    let id = engine.store().insert_note("has attachment").unwrap();
    engine.store().add_attachment(id, "files/a.txt").unwrap();
    let _ = engine.rebuild_all().unwrap().count();
    assert!(engine.gateway().contains("files/a.txt-0"));

    engine.delete_entity(id).unwrap();
    let note = engine.store().find_note(id).unwrap().unwrap();
    assert!(!note.state.is_indexed());
    assert!(!note.state.attachments_indexed);
    let attachments = engine.store().find_attachments(id).unwrap();
    assert_eq!(attachments[0].chunk_count, 0);

    // The relational rows survived the delete, so a rebuild must treat the
    // note and its attachment as unindexed and write both back.
    let events: Vec<_> = engine.rebuild_all().unwrap().collect();
    assert_eq!(events[0].status, ProgressStatus::Success);
    assert!(engine.gateway().contains(&format!("{id}-0")));
    assert!(engine.gateway().contains("files/a.txt-0"));
}

#[test]
fn oversized_chunk_count_is_refused_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_in(&dir);
    // One unbreakable block that wraps into 10_001 chunks at max_chars 10.
    let content = "a".repeat(100_010);
    let id = engine.store().insert_note(&content).unwrap();

    let err = engine.upsert(id, &content, UpsertMode::Insert).unwrap_err();

    assert!(matches!(err, IndexError::Chunk(_)));
    assert_eq!(engine.gateway().len(), 0);
    let note = engine.store().find_note(id).unwrap().unwrap();
    assert!(!note.state.is_indexed());
}

/// Delegating store that refuses index-state writes, for exercising the
/// engine's swallow path.
struct FlakyStore {
    inner: SqliteStore,
}

impl RelationalStore for FlakyStore {
    fn note_ids(&self) -> Result<Vec<i64>> {
        self.inner.note_ids()
    }

    fn find_note(&self, id: i64) -> Result<Option<NoteRecord>> {
        self.inner.find_note(id)
    }

    fn load_notes(&self, ids: &[i64]) -> Result<Vec<NoteRecord>> {
        self.inner.load_notes(ids)
    }

    fn find_attachments(&self, note_id: i64) -> Result<Vec<AttachmentRecord>> {
        self.inner.find_attachments(note_id)
    }

    fn set_note_index_state(&self, _id: i64, _hash: Option<&str>, _count: u32) -> Result<()> {
        anyhow::bail!("state writes refused")
    }

    fn set_attachments_indexed(&self, id: i64, indexed: bool) -> Result<()> {
        self.inner.set_attachments_indexed(id, indexed)
    }

    fn set_attachment_chunk_count(&self, path: &str, chunk_count: u32) -> Result<()> {
        self.inner.set_attachment_chunk_count(path, chunk_count)
    }
}

#[test]
fn failed_index_state_write_does_not_abort_the_upsert() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    let id = store.insert_note(THREE_CHUNKS).unwrap();
    let inner =
        FlatVectorIndex::open(&dir.path().join("index.json"), Arc::new(StubEmbedder)).unwrap();
    let gateway = RecordingGateway {
        inner,
        added_ids: Vec::new(),
        fail_on: None,
    };
    let mut engine = IndexSyncEngine::new(FlakyStore { inner: store }, gateway, StubLoader::default())
        .with_splitters(
            MarkdownSplitter { max_chars: 10 },
            TokenSplitter {
                chunk_tokens: 4,
                overlap_tokens: 0,
            },
        );

    // The vector writes land even though the state write is refused.
    engine.upsert(id, THREE_CHUNKS, UpsertMode::Insert).unwrap();

    assert_eq!(engine.gateway().len(), 3);
    let note = engine.store().inner.find_note(id).unwrap().unwrap();
    assert!(!note.state.is_indexed());
}

#[test]
fn index_survives_a_restart_via_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    let id;
    {
        let mut engine = engine_in(&dir);
        id = engine.store().insert_note("durable note").unwrap();
        engine.upsert(id, "durable note", UpsertMode::Insert).unwrap();
    }
    let reopened = FlatVectorIndex::open(&path, Arc::new(StubEmbedder)).unwrap();
    assert!(reopened.contains(&format!("{id}-0")));
}
