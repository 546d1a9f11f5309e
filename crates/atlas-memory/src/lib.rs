//! `atlas-memory` — long-term memory for the assistant.
//!
//! An [`Embedder`] turns text into fixed-dimension vectors via the remote
//! embeddings API; the [`MemoryService`] stores, searches and maintains the
//! entries on top of the vector index in `atlas-store`. Deduplication is
//! deliberately not done here: the LM is instructed to recall before it
//! remembers and to pass `replace_id` when updating.

pub mod embeddings;
pub mod service;

pub use embeddings::{Embedder, OpenAiEmbedder};
pub use service::MemoryService;
