use std::sync::{Mutex, Once};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi::sqlite3_auto_extension, Connection};

use atlas_core::Result;

/// Dimension of the embedding vectors the memory index stores.
pub const EMBEDDING_DIM: usize = 1536;

static VEC_EXTENSION: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards.
/// Idempotent; must run before the first `Connection::open`.
fn register_vector_extension() {
    VEC_EXTENSION.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

/// Typed access to the Atlas database.
///
/// Wraps a single SQLite connection in a `Mutex`; writes are short and the
/// deployment target is one server process per database, so a pool buys
/// nothing here. Operations take `now` as an argument so callers (and tests)
/// control the clock.
pub struct Store {
    pub(crate) db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        register_vector_extension();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        register_vector_extension();
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

/// Create all tables and indexes. Safe to call on every startup.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS threads (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            title       TEXT,
            source      TEXT    NOT NULL DEFAULT 'user'
                        CHECK (source IN ('user','wake')),
            job_run_id  INTEGER,
            deleted_at  TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id   INTEGER NOT NULL REFERENCES threads(id),
            role        TEXT    NOT NULL
                        CHECK (role IN ('system','user','assistant','tool')),
            model       TEXT,
            content     TEXT    NOT NULL,   -- JSON document, source of truth
            deleted_at  TEXT,
            created_at  TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, id);

        CREATE TABLE IF NOT EXISTS memory_entries (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            content     TEXT    NOT NULL,
            source      TEXT    NOT NULL DEFAULT 'agent'
                        CHECK (source IN ('agent','user')),
            thread_id   INTEGER,
            deleted_at  TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    NOT NULL,
            cron         TEXT,
            prompt       TEXT,
            skill_name   TEXT,
            skill_config TEXT,
            enabled      INTEGER NOT NULL DEFAULT 1,
            max_retries  INTEGER NOT NULL DEFAULT 0,
            next_run_at  TEXT    NOT NULL,
            last_run_at  TEXT,
            deleted_at   TEXT,
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL,
            CHECK ((prompt IS NOT NULL) <> (skill_name IS NOT NULL))
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_due
            ON jobs(enabled, next_run_at);

        CREATE TABLE IF NOT EXISTS job_runs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id        INTEGER NOT NULL REFERENCES jobs(id),
            scheduled_for TEXT    NOT NULL,
            locked_until  TEXT,
            status        TEXT    NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending','running','completed','failed')),
            retry_count   INTEGER NOT NULL DEFAULT 0,
            thread_id     INTEGER,
            error         TEXT,
            started_at    TEXT,
            completed_at  TEXT,
            created_at    TEXT    NOT NULL,
            UNIQUE (job_id, scheduled_for)
        );
        CREATE INDEX IF NOT EXISTS idx_job_runs_claim
            ON job_runs(status, id);
        ",
    )?;

    // The vector index lives in its own virtual table, keyed by the
    // memory_entries rowid. Kept in sync by every memory mutation.
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_vectors USING vec0(
            embedding float[{EMBEDDING_DIM}] distance_metric=cosine
        );"
    ))?;

    Ok(())
}

/// Canonical timestamp encoding: RFC3339 UTC with microsecond precision, so
/// lexicographic comparison in SQL matches chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

pub(crate) fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}
