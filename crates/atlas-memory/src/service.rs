use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use atlas_core::Result;
use atlas_store::{MemoryEntry, MemoryHit, MemorySource, Store};

use crate::embeddings::Embedder;

/// Minimum cosine similarity for a recall hit.
pub const RECALL_THRESHOLD: f32 = 0.30;
/// Default number of entries returned by recall.
pub const DEFAULT_RECALL_LIMIT: usize = 10;

/// Embed, store, search and maintain memory entries.
pub struct MemoryService {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryService {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Store one fact. With `replace_id`, the existing entry's content and
    /// embedding are replaced together; without it a new entry is created.
    /// The service never merges on its own.
    #[instrument(skip(self, content))]
    pub async fn remember(
        &self,
        content: &str,
        source: MemorySource,
        thread_id: Option<i64>,
        replace_id: Option<i64>,
    ) -> Result<MemoryEntry> {
        let embedding = self.embedder.embed(content).await?;
        let now = Utc::now();
        match replace_id {
            Some(id) => self.store.update_memory(id, content, &embedding, now),
            None => self
                .store
                .insert_memory(content, &embedding, source, thread_id, now),
        }
    }

    /// Top `limit` entries similar to `query`, best first.
    #[instrument(skip(self, query))]
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let embedding = self.embedder.embed(query).await?;
        let hits = self
            .store
            .search_memories(&embedding, limit, RECALL_THRESHOLD)?;
        debug!(hits = hits.len(), "recall complete");
        Ok(hits)
    }

    pub fn list(&self) -> Result<Vec<MemoryEntry>> {
        self.store.list_memories()
    }

    /// Rewrite an entry; the new content is re-embedded in the same
    /// operation.
    pub async fn update(&self, id: i64, content: &str) -> Result<MemoryEntry> {
        let embedding = self.embedder.embed(content).await?;
        self.store.update_memory(id, content, &embedding, Utc::now())
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.store.delete_memory(id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atlas_core::Error;
    use atlas_store::EMBEDDING_DIM;

    /// Deterministic embedder: identical text maps to an identical basis
    /// vector, distinct texts (in these tests) to orthogonal ones.
    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let hot = text.bytes().map(|b| b as usize).sum::<usize>() % EMBEDDING_DIM;
            let mut v = vec![0.0_f32; EMBEDDING_DIM];
            v[hot] = 1.0;
            Ok(v)
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::upstream("embeddings service down"))
        }
    }

    fn service() -> MemoryService {
        MemoryService::new(Arc::new(Store::open_in_memory().unwrap()), Arc::new(FakeEmbedder))
    }

    #[tokio::test]
    async fn remember_then_recall_same_text() {
        let svc = service();
        svc.remember("my name is Alex", MemorySource::Agent, None, None)
            .await
            .unwrap();

        let hits = svc.recall("my name is Alex", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity > RECALL_THRESHOLD);
        assert_eq!(hits[0].entry.content, "my name is Alex");
    }

    #[tokio::test]
    async fn remember_with_replace_id_overwrites() {
        let svc = service();
        let original = svc
            .remember("lives in Oslo", MemorySource::Agent, None, None)
            .await
            .unwrap();
        let updated = svc
            .remember("lives in Bergen", MemorySource::Agent, None, Some(original.id))
            .await
            .unwrap();

        assert_eq!(updated.id, original.id);
        assert_eq!(svc.list().unwrap().len(), 1);
        assert_eq!(svc.list().unwrap()[0].content, "lives in Bergen");
    }

    #[tokio::test]
    async fn replace_of_deleted_entry_is_not_found() {
        let svc = service();
        let entry = svc
            .remember("gone soon", MemorySource::User, None, None)
            .await
            .unwrap();
        svc.delete(entry.id).unwrap();

        let res = svc
            .remember("anything", MemorySource::User, None, Some(entry.id))
            .await;
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn update_keeps_recall_coherent() {
        let svc = service();
        let entry = svc
            .remember("drinks tea", MemorySource::Agent, None, None)
            .await
            .unwrap();
        svc.update(entry.id, "drinks coffee").await.unwrap();

        let hits = svc.recall("drinks coffee", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, entry.id);
        assert!(hits[0].similarity > RECALL_THRESHOLD);
    }

    #[tokio::test]
    async fn embedder_failure_propagates_as_upstream() {
        let svc = MemoryService::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(BrokenEmbedder),
        );
        let res = svc.remember("x", MemorySource::Agent, None, None).await;
        assert!(matches!(res, Err(Error::Upstream(_))));
        let res = svc.recall("x", 10).await;
        assert!(matches!(res, Err(Error::Upstream(_))));
    }
}
