use std::sync::Arc;

use tracing::warn;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::store::MemoryStore;
use crate::types::{EventType, MemoryBlock, MutationStatus, PendingMutation, Permission, Tier};

/// Outcome of [`MemoryManager::write`].
pub enum WriteOutcome {
    Applied(MemoryBlock),
    Queued(PendingMutation),
    Rejected(String),
}

/// A ranked hit from [`MemoryManager::read`].
pub struct SearchHit {
    pub block: MemoryBlock,
    pub similarity: f32,
}

/// Policy layer over [`MemoryStore`]: enforces the permission matrix and
/// owns embedding calls. One instance is shared across every conversation
/// for a given agent; blocks are namespaced by `owner`.
pub struct MemoryManager {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl MemoryManager {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    /// Concatenates every core-tier block's content, in insertion order.
    pub fn build_system_prompt(&self, owner: &str) -> Result<String> {
        let blocks = self.store.get_blocks_by_tier(owner, Tier::Core)?;
        Ok(blocks
            .into_iter()
            .map(|b| b.content)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    pub fn get_core_blocks(&self, owner: &str) -> Result<Vec<MemoryBlock>> {
        self.store.get_blocks_by_tier(owner, Tier::Core)
    }

    pub fn get_working_blocks(&self, owner: &str) -> Result<Vec<MemoryBlock>> {
        self.store.get_blocks_by_tier(owner, Tier::Working)
    }

    pub fn list(&self, owner: &str, tier: Option<Tier>) -> Result<Vec<MemoryBlock>> {
        match tier {
            Some(t) => self.store.get_blocks_by_tier(owner, t),
            None => {
                let mut all = Vec::new();
                for t in [Tier::Core, Tier::Working, Tier::Archival] {
                    all.extend(self.store.get_blocks_by_tier(owner, t)?);
                }
                Ok(all)
            }
        }
    }

    /// Embeds `query`, runs semantic search, and returns ranked hits.
    pub async fn read(
        &self,
        owner: &str,
        query: &str,
        limit: usize,
        tier: Option<Tier>,
    ) -> Result<Vec<SearchHit>> {
        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding provider failed on read; returning no hits");
                return Ok(Vec::new());
            }
        };
        let hits = self
            .store
            .search_by_embedding(owner, &vector, limit, tier)?;
        Ok(hits
            .into_iter()
            .map(|(block, similarity)| SearchHit { block, similarity })
            .collect())
    }

    /// Applies the permission matrix for a write against `(owner, label)`.
    pub async fn write(
        &self,
        owner: &str,
        label: &str,
        content: &str,
        tier: Option<Tier>,
        reason: Option<&str>,
    ) -> Result<WriteOutcome> {
        let existing = self.store.get_block_by_label(owner, label)?;

        let Some(block) = existing else {
            let embedding = self.try_embed(content).await;
            let now = chrono::Utc::now().to_rfc3339();
            let block = self.store.create_block(MemoryBlock {
                id: String::new(),
                owner: owner.to_string(),
                tier: tier.unwrap_or(Tier::Working),
                label: label.to_string(),
                content: content.to_string(),
                embedding,
                permission: Permission::Readwrite,
                pinned: false,
                created_at: now.clone(),
                updated_at: now,
            })?;
            self.store
                .log_event(&block.id, EventType::Create, None, Some(content))?;
            return Ok(WriteOutcome::Applied(block));
        };

        match block.permission {
            Permission::Readonly => Ok(WriteOutcome::Rejected("block is readonly".to_string())),
            Permission::Familiar => {
                let mutation = self.store.create_mutation(&block.id, content, reason)?;
                Ok(WriteOutcome::Queued(mutation))
            }
            Permission::Append => {
                let new_content = format!("{}\n{}", block.content, content);
                let embedding = self.try_embed(&new_content).await;
                let updated =
                    self.store
                        .update_block(&block.id, &new_content, embedding.as_deref())?;
                self.store.log_event(
                    &block.id,
                    EventType::Update,
                    Some(&block.content),
                    Some(&new_content),
                )?;
                Ok(WriteOutcome::Applied(updated))
            }
            Permission::Readwrite => {
                let embedding = self.try_embed(content).await;
                let updated = self
                    .store
                    .update_block(&block.id, content, embedding.as_deref())?;
                self.store.log_event(
                    &block.id,
                    EventType::Update,
                    Some(&block.content),
                    Some(content),
                )?;
                Ok(WriteOutcome::Applied(updated))
            }
        }
    }

    pub async fn approve_mutation(&self, mutation_id: &str) -> Result<MemoryBlock> {
        let mutation = self
            .store
            .get_mutation(mutation_id)?
            .ok_or_else(|| crate::error::MemoryError::MutationNotFound(mutation_id.to_string()))?;
        let old_block = self
            .store
            .get_block(&mutation.block_id)?
            .ok_or_else(|| crate::error::MemoryError::BlockNotFound(mutation.block_id.clone()))?;
        let embedding = self.try_embed(&mutation.proposed_content).await;
        let updated = self.store.update_block(
            &mutation.block_id,
            &mutation.proposed_content,
            embedding.as_deref(),
        )?;
        self.store.log_event(
            &mutation.block_id,
            EventType::Update,
            Some(&old_block.content),
            Some(&mutation.proposed_content),
        )?;
        self.store
            .resolve_mutation(mutation_id, MutationStatus::Approved, None)?;
        Ok(updated)
    }

    pub fn reject_mutation(
        &self,
        mutation_id: &str,
        feedback: Option<&str>,
    ) -> Result<PendingMutation> {
        self.store
            .resolve_mutation(mutation_id, MutationStatus::Rejected, feedback)
    }

    pub fn pending_mutations(&self, owner: Option<&str>) -> Result<Vec<PendingMutation>> {
        self.store.get_pending_mutations(owner)
    }

    /// Used only by the compactor, for its own archival blocks.
    pub fn delete_block(&self, id: &str) -> Result<()> {
        self.store.delete_block(id)
    }

    async fn try_embed(&self, content: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(content).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "embedding provider failed on apply; storing without embedding");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rusqlite::Connection;

    struct StubEmbedder {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            if self.fail {
                anyhow::bail!("embedding provider unavailable");
            }
            Ok(vec![text.len() as f32, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    fn manager(fail_embed: bool) -> MemoryManager {
        let store = Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        MemoryManager::new(store, Arc::new(StubEmbedder { fail: fail_embed }))
    }

    #[tokio::test]
    async fn write_creates_block_with_default_readwrite_permission() {
        let mgr = manager(false);
        let outcome = mgr
            .write("alice", "nickname", "Al", None, None)
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Applied(block) => {
                assert_eq!(block.tier, Tier::Working);
                assert_eq!(block.permission, Permission::Readwrite);
                assert_eq!(block.content, "Al");
            }
            _ => panic!("expected Applied on create"),
        }
    }

    #[tokio::test]
    async fn write_against_readonly_block_is_rejected() {
        let mgr = manager(false);
        mgr.write("alice", "policy", "v1", None, None).await.unwrap();

        // The manager never downgrades a block's permission itself, so
        // simulate an admin-set readonly block directly through the store.
        let mut readonly_block = mgr.store.get_block_by_label("alice", "policy").unwrap().unwrap();
        readonly_block.permission = Permission::Readonly;
        mgr.store.delete_block(&readonly_block.id).unwrap();
        mgr.store.create_block(readonly_block).unwrap();

        let outcome = mgr.write("alice", "policy", "v2", None, None).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn write_against_familiar_block_queues_a_mutation() {
        let mgr = manager(false);
        mgr.write("alice", "tone", "formal", None, None).await.unwrap();
        let mut existing = mgr.store.get_block_by_label("alice", "tone").unwrap().unwrap();
        existing.permission = Permission::Familiar;
        mgr.store.delete_block(&existing.id).unwrap();
        mgr.store.create_block(existing).unwrap();

        let outcome = mgr
            .write("alice", "tone", "casual", None, Some("user asked to relax"))
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Queued(mutation) => {
                assert_eq!(mutation.status, MutationStatus::Pending);
                assert_eq!(mutation.proposed_content, "casual");
            }
            _ => panic!("expected Queued for a familiar block"),
        }
        let block = mgr.store.get_block_by_label("alice", "tone").unwrap().unwrap();
        assert_eq!(block.content, "formal", "familiar block must not mutate until approved");
    }

    #[tokio::test]
    async fn write_against_append_block_concatenates_with_newline() {
        let mgr = manager(false);
        mgr.write("alice", "log", "first", None, None).await.unwrap();
        let mut existing = mgr.store.get_block_by_label("alice", "log").unwrap().unwrap();
        existing.permission = Permission::Append;
        mgr.store.delete_block(&existing.id).unwrap();
        mgr.store.create_block(existing).unwrap();

        let outcome = mgr.write("alice", "log", "second", None, None).await.unwrap();
        match outcome {
            WriteOutcome::Applied(block) => assert_eq!(block.content, "first\nsecond"),
            _ => panic!("expected Applied for an append block"),
        }
    }

    #[tokio::test]
    async fn apply_with_failing_embedder_persists_without_embedding() {
        let mgr = manager(true);
        let outcome = mgr.write("alice", "nickname", "Al", None, None).await.unwrap();
        match outcome {
            WriteOutcome::Applied(block) => assert!(block.embedding.is_none()),
            _ => panic!("expected Applied"),
        }
    }

    #[tokio::test]
    async fn approve_mutation_updates_block_and_resolves_status() {
        let mgr = manager(false);
        mgr.write("alice", "tone", "formal", None, None).await.unwrap();
        let mut existing = mgr.store.get_block_by_label("alice", "tone").unwrap().unwrap();
        existing.permission = Permission::Familiar;
        mgr.store.delete_block(&existing.id).unwrap();
        mgr.store.create_block(existing).unwrap();

        let mutation = match mgr.write("alice", "tone", "casual", None, None).await.unwrap() {
            WriteOutcome::Queued(m) => m,
            _ => panic!("expected Queued"),
        };

        let updated = mgr.approve_mutation(&mutation.id).await.unwrap();
        assert_eq!(updated.content, "casual");

        let pending = mgr.pending_mutations(Some("alice")).unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn build_system_prompt_concatenates_core_blocks_in_order() {
        let mgr = manager(false);
        mgr.write("alice", "identity", "You are helpful.", Some(Tier::Core), None)
            .await
            .unwrap();
        mgr.write("alice", "values", "Be honest.", Some(Tier::Core), None)
            .await
            .unwrap();
        let prompt = mgr.build_system_prompt("alice").unwrap();
        assert_eq!(prompt, "You are helpful.\n\nBe honest.");
    }
}
