use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::debug;

use atlas_core::{Error, Result};

use crate::db::{parse_ts, ts, Store, EMBEDDING_DIM};
use crate::types::{MemoryEntry, MemoryHit, MemorySource};

const MEMORY_COLS: &str = "id, content, source, thread_id, created_at, updated_at";

impl Store {
    /// Insert a memory entry and its embedding in one transaction.
    pub fn insert_memory(
        &self,
        content: &str,
        embedding: &[f32],
        source: MemorySource,
        thread_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<MemoryEntry> {
        check_dimension(embedding)?;
        let vector_json = serde_json::to_string(embedding)?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now_str = ts(now);
        tx.execute(
            "INSERT INTO memory_entries (content, source, thread_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![content, source.to_string(), thread_id, now_str],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO memory_vectors (rowid, embedding) VALUES (?1, ?2)",
            rusqlite::params![id, vector_json],
        )?;
        tx.commit()?;
        debug!(memory_id = id, %source, "memory stored");
        Ok(MemoryEntry {
            id,
            content: content.to_string(),
            source,
            thread_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace content and embedding together so the index never drifts
    /// from the text.
    pub fn update_memory(
        &self,
        id: i64,
        content: &str,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<MemoryEntry> {
        check_dimension(embedding)?;
        let vector_json = serde_json::to_string(embedding)?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let changed = tx.execute(
            "UPDATE memory_entries SET content = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            rusqlite::params![content, ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("memory entry {id}")));
        }
        tx.execute("DELETE FROM memory_vectors WHERE rowid = ?1", [id])?;
        tx.execute(
            "INSERT INTO memory_vectors (rowid, embedding) VALUES (?1, ?2)",
            rusqlite::params![id, vector_json],
        )?;
        tx.commit()?;
        drop(db);

        self.memory(id)
    }

    pub fn memory(&self, id: i64) -> Result<MemoryEntry> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!(
                "SELECT {MEMORY_COLS} FROM memory_entries
                 WHERE id = ?1 AND deleted_at IS NULL"
            ),
            [id],
            row_to_memory,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("memory entry {id}")),
            other => other.into(),
        })
    }

    pub fn list_memories(&self) -> Result<Vec<MemoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MEMORY_COLS} FROM memory_entries
             WHERE deleted_at IS NULL
             ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Soft-delete the entry and drop its vector so the index never returns
    /// dead rows.
    pub fn delete_memory(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let changed = tx.execute(
            "UPDATE memory_entries SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            rusqlite::params![ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("memory entry {id}")));
        }
        tx.execute("DELETE FROM memory_vectors WHERE rowid = ?1", [id])?;
        tx.commit()?;
        debug!(memory_id = id, "memory soft-deleted");
        Ok(())
    }

    /// KNN over the vector index: top `k` live entries with cosine
    /// similarity at or above `threshold`, best first.
    pub fn search_memories(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<MemoryHit>> {
        check_dimension(query)?;
        let vector_json = serde_json::to_string(query)?;
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.content, m.source, m.thread_id, m.created_at, m.updated_at,
                    v.distance
             FROM memory_vectors v
             JOIN memory_entries m ON m.id = v.rowid
             WHERE v.embedding MATCH ?1 AND v.k = ?2 AND m.deleted_at IS NULL
             ORDER BY v.distance ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![vector_json, k as i64], |row| {
            let entry = row_to_memory(row)?;
            let distance: f64 = row.get(6)?;
            Ok(MemoryHit {
                entry,
                similarity: (1.0 - distance) as f32,
            })
        })?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter(|hit| hit.similarity >= threshold)
            .collect())
    }
}

fn check_dimension(embedding: &[f32]) -> Result<()> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(Error::internal(format!(
            "embedding dimension {} does not match index dimension {EMBEDDING_DIM}",
            embedding.len()
        )));
    }
    Ok(())
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let source_str: String = row.get(2)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        content: row.get(1)?,
        source: source_str.parse().unwrap_or(MemorySource::Agent),
        thread_id: row.get(3)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}
