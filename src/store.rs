use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Per-note index state, the engine's resumability record.
///
/// `content_hash` is the SHA-256 hex of the last successfully indexed
/// content: a note counts as indexed when the stored hash matches its
/// current content, so an edit automatically invalidates it. `chunk_count`
/// lets the deletion sweep remove exactly the chunks that were written.
/// This state is advisory, written best-effort after the vector writes; a
/// crash in between is repaired by the next rebuild pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub content_hash: Option<String>,
    pub chunk_count: u32,
    pub attachments_indexed: bool,
}

impl IndexState {
    pub fn is_indexed(&self) -> bool {
        self.content_hash.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: i64,
    pub content: String,
    pub state: IndexState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub path: String,
    pub note_id: i64,
    pub chunk_count: u32,
}

/// Narrow view of the relational store consumed by the sync engine and the
/// retrieval coordinator. Entity content and index state live here; the
/// engine never defines schema.
pub trait RelationalStore {
    /// Ids of every note, in storage order. Rebuild walks this list.
    fn note_ids(&self) -> Result<Vec<i64>>;

    fn find_note(&self, id: i64) -> Result<Option<NoteRecord>>;

    /// Bulk-load notes by id. Missing ids are silently absent from the
    /// result; order follows storage order, not `ids` order.
    fn load_notes(&self, ids: &[i64]) -> Result<Vec<NoteRecord>>;

    fn find_attachments(&self, note_id: i64) -> Result<Vec<AttachmentRecord>>;

    fn set_note_index_state(
        &self,
        id: i64,
        content_hash: Option<&str>,
        chunk_count: u32,
    ) -> Result<()>;

    fn set_attachments_indexed(&self, id: i64, indexed: bool) -> Result<()>;

    fn set_attachment_chunk_count(&self, path: &str, chunk_count: u32) -> Result<()>;
}

/// SQLite-backed store. Owns the notes/attachments schema and provides the
/// insert/update/delete helpers an integration layer needs around the
/// `RelationalStore` view.
pub struct SqliteStore {
    conn: Connection,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notes (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    content             TEXT NOT NULL,
    content_hash        TEXT,
    chunk_count         INTEGER NOT NULL DEFAULT 0,
    attachments_indexed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS attachments (
    path        TEXT PRIMARY KEY,
    note_id     INTEGER NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
    chunk_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_attachments_note ON attachments(note_id);
";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert_note(&self, content: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO notes (content) VALUES (?1)", params![content])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update content only — index state is the engine's to maintain.
    pub fn update_note_content(&self, id: i64, content: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE notes SET content = ?2 WHERE id = ?1",
            params![id, content],
        )?;
        anyhow::ensure!(changed == 1, "note {id} not found");
        Ok(())
    }

    /// Remove the note row (attachments cascade). The caller is expected to
    /// scrub the vector index first via the engine's delete path.
    pub fn delete_note(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM notes WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn add_attachment(&self, note_id: i64, path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO attachments (path, note_id) VALUES (?1, ?2)",
            params![path, note_id],
        )?;
        Ok(())
    }

    pub fn remove_attachment(&self, path: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM attachments WHERE path = ?1", params![path])?;
        Ok(())
    }
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteRecord> {
    Ok(NoteRecord {
        id: row.get(0)?,
        content: row.get(1)?,
        state: IndexState {
            content_hash: row.get(2)?,
            chunk_count: row.get::<_, i64>(3)?.max(0) as u32,
            attachments_indexed: row.get::<_, i64>(4)? != 0,
        },
    })
}

const NOTE_COLUMNS: &str = "id, content, content_hash, chunk_count, attachments_indexed";

impl RelationalStore for SqliteStore {
    fn note_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM notes ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn find_note(&self, id: i64) -> Result<Option<NoteRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"))?;
        Ok(stmt.query_row(params![id], row_to_note).optional()?)
    }

    fn load_notes(&self, ids: &[i64]) -> Result<Vec<NoteRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id IN ({placeholders}) ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let notes = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), row_to_note)?
            .filter_map(|r| {
                r.map_err(|e| tracing::warn!("skipping malformed note row: {e}"))
                    .ok()
            })
            .collect();
        Ok(notes)
    }

    fn find_attachments(&self, note_id: i64) -> Result<Vec<AttachmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, note_id, chunk_count FROM attachments WHERE note_id = ?1 ORDER BY path",
        )?;
        let attachments = stmt
            .query_map(params![note_id], |row| {
                Ok(AttachmentRecord {
                    path: row.get(0)?,
                    note_id: row.get(1)?,
                    chunk_count: row.get::<_, i64>(2)?.max(0) as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attachments)
    }

    fn set_note_index_state(
        &self,
        id: i64,
        content_hash: Option<&str>,
        chunk_count: u32,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE notes SET content_hash = ?2, chunk_count = ?3 WHERE id = ?1",
            params![id, content_hash, chunk_count],
        )?;
        anyhow::ensure!(changed == 1, "note {id} not found");
        Ok(())
    }

    fn set_attachments_indexed(&self, id: i64, indexed: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE notes SET attachments_indexed = ?2 WHERE id = ?1",
            params![id, indexed],
        )?;
        anyhow::ensure!(changed == 1, "note {id} not found");
        Ok(())
    }

    fn set_attachment_chunk_count(&self, path: &str, chunk_count: u32) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE attachments SET chunk_count = ?2 WHERE path = ?1",
            params![path, chunk_count],
        )?;
        anyhow::ensure!(changed == 1, "attachment {path} not found");
        Ok(())
    }
}
