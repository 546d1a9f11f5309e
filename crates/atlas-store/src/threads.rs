use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::debug;

use atlas_core::{Error, Result};

use crate::db::{parse_ts, ts, Store};
use crate::types::{Message, MessageDoc, Thread, ThreadSource};

const THREAD_COLS: &str = "id, title, source, job_run_id, created_at, updated_at";
const MESSAGE_COLS: &str = "id, thread_id, role, model, content, created_at";

impl Store {
    /// Create a thread. Wake threads carry a back-link to the run that
    /// produced them.
    pub fn create_thread(
        &self,
        source: ThreadSource,
        title: Option<&str>,
        job_run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Thread> {
        let db = self.db.lock().unwrap();
        let now_str = ts(now);
        db.execute(
            "INSERT INTO threads (title, source, job_run_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![title, source.to_string(), job_run_id, now_str],
        )?;
        let id = db.last_insert_rowid();
        debug!(thread_id = id, %source, "thread created");
        Ok(Thread {
            id,
            title: title.map(String::from),
            source,
            job_run_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn thread(&self, id: i64) -> Result<Thread> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {THREAD_COLS} FROM threads WHERE id = ?1 AND deleted_at IS NULL"),
            [id],
            row_to_thread,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("thread {id}")),
            other => other.into(),
        })
    }

    /// All live threads, most recently touched first.
    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {THREAD_COLS} FROM threads
             WHERE deleted_at IS NULL
             ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], row_to_thread)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_thread_title(&self, id: i64, title: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE threads SET title = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            rusqlite::params![title, ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("thread {id}")));
        }
        Ok(())
    }

    /// Soft-delete. Deleting an already-deleted thread reports NotFound
    /// instead of re-stamping.
    pub fn delete_thread(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE threads SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            rusqlite::params![ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("thread {id}")));
        }
        debug!(thread_id = id, "thread soft-deleted");
        Ok(())
    }

    /// Append a message. The row's role column is taken from the document,
    /// so the two can never disagree. Bumps the thread's `updated_at`.
    pub fn add_message(
        &self,
        thread_id: i64,
        doc: &MessageDoc,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let content = serde_json::to_string(doc)?;
        let db = self.db.lock().unwrap();
        let now_str = ts(now);

        let thread_live: bool = db.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1 AND deleted_at IS NULL)",
            [thread_id],
            |row| row.get(0),
        )?;
        if !thread_live {
            return Err(Error::not_found(format!("thread {thread_id}")));
        }

        db.execute(
            "INSERT INTO messages (thread_id, role, model, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![thread_id, doc.role.to_string(), model, content, now_str],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now_str, thread_id],
        )?;

        Ok(Message {
            id,
            thread_id,
            role: doc.role,
            model: model.map(String::from),
            doc: doc.clone(),
            created_at: now,
        })
    }

    /// Live messages of a thread in ascending id order, the canonical
    /// conversation order.
    pub fn list_messages(&self, thread_id: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE thread_id = ?1 AND deleted_at IS NULL
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([thread_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let source_str: String = row.get(2)?;
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(Thread {
        id: row.get(0)?,
        title: row.get(1)?,
        source: source_str.parse().unwrap_or(ThreadSource::User),
        job_run_id: row.get(3)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let content: String = row.get(4)?;
    let created: String = row.get(5)?;
    let doc: MessageDoc = serde_json::from_str(&content).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: role_str.parse().unwrap_or(doc.role),
        model: row.get(3)?,
        doc,
        created_at: parse_ts(&created),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, Usage};

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn create_and_fetch_thread() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        let got = store.thread(t.id).unwrap();
        assert_eq!(got.id, t.id);
        assert_eq!(got.source, ThreadSource::User);
        assert!(got.title.is_none());
    }

    #[test]
    fn deleted_thread_is_invisible_everywhere() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        store.delete_thread(t.id, now()).unwrap();

        assert!(matches!(store.thread(t.id), Err(Error::NotFound(_))));
        assert!(store.list_threads().unwrap().is_empty());
        // Second delete reports NotFound rather than re-stamping.
        assert!(matches!(
            store.delete_thread(t.id, now()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn messages_come_back_in_id_order() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        for i in 0..5 {
            store
                .add_message(
                    t.id,
                    &MessageDoc::new(Role::User, format!("m{i}")),
                    None,
                    now(),
                )
                .unwrap();
        }
        let messages = store.list_messages(t.id).unwrap();
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(messages[0].doc.content, "m0");
        assert_eq!(messages[4].doc.content, "m4");
    }

    #[test]
    fn structured_content_roundtrips_deeply() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        let doc = MessageDoc::new(Role::Assistant, "the reply").with_usage(Some(Usage {
            input_tokens: 120,
            output_tokens: 48,
            total_tokens: 168,
        }));
        store
            .add_message(t.id, &doc, Some("gpt-4o-mini"), now())
            .unwrap();
        let got = &store.list_messages(t.id).unwrap()[0];
        assert_eq!(got.doc, doc);
        assert_eq!(got.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(got.role, Role::Assistant);
    }

    #[test]
    fn add_message_to_deleted_thread_fails() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        store.delete_thread(t.id, now()).unwrap();
        let res = store.add_message(t.id, &MessageDoc::new(Role::User, "x"), None, now());
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[test]
    fn title_update_bumps_updated_at() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        let later: DateTime<Utc> = "2026-03-01T13:00:00Z".parse().unwrap();
        store.update_thread_title(t.id, "Trip planning", later).unwrap();
        let got = store.thread(t.id).unwrap();
        assert_eq!(got.title.as_deref(), Some("Trip planning"));
        assert_eq!(got.updated_at, later);
    }

    #[test]
    fn wake_thread_keeps_run_backlink() {
        let store = Store::open_in_memory().unwrap();
        let t = store
            .create_thread(ThreadSource::Wake, None, Some(77), now())
            .unwrap();
        let got = store.thread(t.id).unwrap();
        assert_eq!(got.source, ThreadSource::Wake);
        assert_eq!(got.job_run_id, Some(77));
    }

    #[test]
    fn list_threads_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let t1 = store
            .create_thread(ThreadSource::User, None, None, now())
            .unwrap();
        let later: DateTime<Utc> = "2026-03-01T14:00:00Z".parse().unwrap();
        let t2 = store
            .create_thread(ThreadSource::User, None, None, later)
            .unwrap();
        let listed = store.list_threads().unwrap();
        assert_eq!(listed[0].id, t2.id);
        assert_eq!(listed[1].id, t1.id);
    }
}
