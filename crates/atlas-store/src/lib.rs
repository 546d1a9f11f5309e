//! `atlas-store` — typed SQLite access for the five Atlas entities.
//!
//! Threads, messages, memory entries, jobs and job runs live here. Every
//! read filters soft-deleted rows unconditionally; every mutation that
//! changes row content bumps `updated_at`. Correctness properties the rest
//! of the system leans on (idempotent run enqueue, single-claim, lease
//! expiry) are enforced at the SQL level, not in callers.

pub mod db;
pub mod jobs;
pub mod memories;
pub mod threads;
pub mod types;

pub use db::{Store, EMBEDDING_DIM};
pub use types::*;
