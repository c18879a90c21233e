//! Perceptual tier: recent message blocks with activation-based promotion
//!
//! Incoming messages accumulate into bounded blocks, one open block per chat.
//! Recalls score blocks against the query; a block that keeps getting
//! recalled crosses the activation threshold and is marked for promotion to
//! the short-term tier. Blocks are destroyed once promoted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::message::Message;
use crate::similarity::{cosine_similarity, jaccard_similarity};
use crate::storage::BlockLog;

/// A contiguous, capped sequence of messages within one chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Unique block ID
    pub id: Uuid,

    /// Chat this block belongs to
    pub chat_id: String,

    /// Messages in arrival order, at most `perceptual_block_size`
    pub messages: Vec<Message>,

    /// When the block was opened
    pub created_at: DateTime<Utc>,

    /// Number of recalls that scored above the recall threshold
    pub activation_count: u32,

    /// Block-level embedding cache; never persisted
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    /// Set once the block is eligible for promotion to short-term
    #[serde(default)]
    pub needs_transfer: bool,
}

impl MemoryBlock {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            messages: Vec::new(),
            created_at: Utc::now(),
            activation_count: 0,
            embedding: None,
            needs_transfer: false,
        }
    }

    /// All message texts joined, the unit the short-term extractor sees
    pub fn combined_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.sender_id, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_full(&self, block_size: usize) -> bool {
        self.messages.len() >= block_size
    }
}

/// A block returned by recall, with its activation score
#[derive(Debug, Clone)]
pub struct RecalledBlock {
    pub block: MemoryBlock,
    pub score: f32,
}

/// Manager for the perceptual tier
pub struct PerceptualManager {
    block_size: usize,
    max_blocks: usize,
    activation_threshold: u32,
    recall_threshold: f32,

    embedder: Arc<dyn EmbeddingProvider>,
    log: BlockLog,

    /// chat id → blocks, oldest first; the last block is the open one
    blocks: Mutex<HashMap<String, Vec<MemoryBlock>>>,

    /// message id → embedding, filled lazily on recall
    message_embeddings: Mutex<HashMap<Uuid, Vec<f32>>>,
}

impl PerceptualManager {
    /// Create the manager and replay persisted blocks from disk
    pub fn new(config: &MemoryConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let log = BlockLog::new(config)?;

        let mut blocks: HashMap<String, Vec<MemoryBlock>> = HashMap::new();
        for chat_id in log.list_chats()? {
            let chat_blocks = log.load_chat(&chat_id)?;
            if !chat_blocks.is_empty() {
                // Compact the replayed log so tombstones don't accumulate
                log.compact_chat(&chat_id, &chat_blocks)?;
                blocks.insert(chat_id, chat_blocks);
            }
        }

        Ok(Self {
            block_size: config.perceptual_block_size,
            max_blocks: config.perceptual_max_blocks,
            activation_threshold: config.perceptual_activation_threshold,
            recall_threshold: config.perceptual_recall_threshold,
            embedder,
            log,
            blocks: Mutex::new(blocks),
            message_embeddings: Mutex::new(HashMap::new()),
        })
    }

    /// Append a message to the chat's current block, opening a new block when
    /// there is none or the previous one is full. Returns the id of a newly
    /// opened block, if any.
    pub async fn add_message(&self, message: Message) -> Result<Option<Uuid>> {
        let mut blocks = self.blocks.lock().await;
        let chat_blocks = blocks.entry(message.chat_id.clone()).or_default();

        let needs_new = match chat_blocks.last() {
            Some(last) => last.is_full(self.block_size) || last.needs_transfer,
            None => true,
        };

        let new_block_id = if needs_new {
            let block = MemoryBlock::new(&message.chat_id);
            let id = block.id;
            chat_blocks.push(block);
            Some(id)
        } else {
            None
        };

        let block = chat_blocks.last_mut().expect("block exists");
        block.messages.push(message);
        block.embedding = None;
        self.log.append(block)?;

        // Over the heap cap: the oldest full untransferred block is promoted
        // instead of being dropped; anything older than that is evicted.
        if chat_blocks.len() > self.max_blocks {
            if let Some(oldest_full) = chat_blocks
                .iter_mut()
                .find(|b| b.is_full(self.block_size) && !b.needs_transfer)
            {
                oldest_full.needs_transfer = true;
                self.log.append(oldest_full)?;
            }
            while chat_blocks.len() > self.max_blocks + 1 {
                let evicted = chat_blocks.remove(0);
                warn!(block_id = %evicted.id, "perceptual heap over capacity, evicting oldest block");
                self.log.append_remove(&evicted.chat_id, evicted.id)?;
            }
        }

        Ok(new_block_id)
    }

    /// Recall blocks whose activation against the query clears the
    /// similarity threshold, best first.
    ///
    /// Side effect: every returned block's `activation_count` is bumped, and
    /// blocks reaching the activation threshold are flagged `needs_transfer`.
    pub async fn recall_blocks(
        &self,
        query_text: &str,
        top_k: usize,
        similarity_threshold: Option<f32>,
    ) -> Result<Vec<RecalledBlock>> {
        let threshold = similarity_threshold.unwrap_or(self.recall_threshold);

        let query_embedding = match self.embedder.embed(query_text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, falling back to lexical recall");
                None
            }
        };

        self.embed_missing_messages().await;

        let mut blocks = self.blocks.lock().await;
        let message_embeddings = self.message_embeddings.lock().await;

        let mut scored: Vec<(String, Uuid, f32)> = Vec::new();
        for (chat_id, chat_blocks) in blocks.iter() {
            for block in chat_blocks {
                if block.messages.is_empty() {
                    continue;
                }
                let score = block
                    .messages
                    .iter()
                    .map(|m| {
                        match (&query_embedding, message_embeddings.get(&m.id)) {
                            (Some(q), Some(e)) => cosine_similarity(q, e),
                            _ => jaccard_similarity(query_text, &m.text),
                        }
                    })
                    .fold(0.0f32, f32::max);
                if score >= threshold {
                    scored.push((chat_id.clone(), block.id, score));
                }
            }
        }

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut recalled = Vec::with_capacity(scored.len());
        for (chat_id, block_id, score) in scored {
            let chat_blocks = blocks.get_mut(&chat_id).expect("chat exists");
            let block = chat_blocks
                .iter_mut()
                .find(|b| b.id == block_id)
                .expect("block exists");

            block.activation_count += 1;
            if block.activation_count >= self.activation_threshold {
                block.needs_transfer = true;
            }
            self.log.append(block)?;

            recalled.push(RecalledBlock {
                block: block.clone(),
                score,
            });
        }

        debug!(count = recalled.len(), "perceptual recall complete");
        Ok(recalled)
    }

    /// Batch-embed messages that have no cached embedding yet. Failures are
    /// swallowed; those messages keep using the lexical fallback.
    async fn embed_missing_messages(&self) {
        let missing: Vec<(Uuid, String)> = {
            let blocks = self.blocks.lock().await;
            let cache = self.message_embeddings.lock().await;
            blocks
                .values()
                .flatten()
                .flat_map(|b| b.messages.iter())
                .filter(|m| !cache.contains_key(&m.id))
                .map(|m| (m.id, m.text.clone()))
                .collect()
        };

        if missing.is_empty() {
            return;
        }

        let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
        match self.embedder.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == missing.len() => {
                let mut cache = self.message_embeddings.lock().await;
                for ((id, _), vector) in missing.into_iter().zip(vectors) {
                    cache.insert(id, vector);
                }
            }
            Ok(_) => warn!("message embedding batch returned wrong count"),
            Err(e) => warn!(error = %e, "message embedding batch failed"),
        }
    }

    /// Remove a successfully promoted block
    pub async fn remove_block(&self, id: Uuid) -> Result<bool> {
        let mut blocks = self.blocks.lock().await;
        for chat_blocks in blocks.values_mut() {
            if let Some(pos) = chat_blocks.iter().position(|b| b.id == id) {
                let removed = chat_blocks.remove(pos);
                self.log.append_remove(&removed.chat_id, removed.id)?;

                let mut cache = self.message_embeddings.lock().await;
                for message in &removed.messages {
                    cache.remove(&message.id);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Look up a block by id
    pub async fn get_block(&self, id: Uuid) -> Option<MemoryBlock> {
        let blocks = self.blocks.lock().await;
        blocks
            .values()
            .flatten()
            .find(|b| b.id == id)
            .cloned()
    }

    /// Blocks currently flagged for promotion
    pub async fn pending_transfer_blocks(&self) -> Vec<MemoryBlock> {
        let blocks = self.blocks.lock().await;
        blocks
            .values()
            .flatten()
            .filter(|b| b.needs_transfer)
            .cloned()
            .collect()
    }

    /// Tier statistics
    pub async fn statistics(&self) -> PerceptualStatistics {
        let blocks = self.blocks.lock().await;
        let total_blocks = blocks.values().map(|v| v.len()).sum();
        let total_messages = blocks
            .values()
            .flatten()
            .map(|b| b.messages.len())
            .sum();
        PerceptualStatistics {
            total_blocks,
            total_messages,
            chats: blocks.len(),
        }
    }
}

/// Counters reported by [`PerceptualManager::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct PerceptualStatistics {
    pub total_blocks: usize,
    pub total_messages: usize,
    pub chats: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;

    fn test_config(dir: &std::path::Path, block_size: usize, activation: u32) -> MemoryConfig {
        MemoryConfig {
            perceptual_block_size: block_size,
            perceptual_activation_threshold: activation,
            perceptual_recall_threshold: 0.3,
            embedding_dimensions: 32,
            ..MemoryConfig::with_data_dir(dir)
        }
    }

    fn make_manager(config: &MemoryConfig) -> PerceptualManager {
        config.ensure_dirs().unwrap();
        PerceptualManager::new(config, Arc::new(MockEmbedder::new(32))).unwrap()
    }

    #[tokio::test]
    async fn blocks_fill_and_roll_over() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);
        let manager = make_manager(&config);

        let first = manager
            .add_message(Message::new("chat-a", "alice", "message one"))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = manager
            .add_message(Message::new("chat-a", "alice", "message two"))
            .await
            .unwrap();
        assert!(second.is_none());

        // Third message opens a second block
        let third = manager
            .add_message(Message::new("chat-a", "alice", "message three"))
            .await
            .unwrap();
        assert!(third.is_some());

        let stats = manager.statistics().await;
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.total_messages, 3);
    }

    #[tokio::test]
    async fn recall_increments_activation_and_marks_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);
        let manager = make_manager(&config);

        manager
            .add_message(Message::new("chat-a", "alice", "the quarterly report deadline"))
            .await
            .unwrap();
        manager
            .add_message(Message::new("chat-a", "bob", "noted, thanks"))
            .await
            .unwrap();

        let first = manager
            .recall_blocks("quarterly report deadline", 5, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].block.activation_count, 1);
        assert!(!first[0].block.needs_transfer);

        let second = manager
            .recall_blocks("quarterly report deadline", 5, None)
            .await
            .unwrap();
        assert_eq!(second[0].block.activation_count, 2);
        assert!(second[0].block.needs_transfer);
    }

    #[tokio::test]
    async fn recall_misses_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);
        let manager = make_manager(&config);

        manager
            .add_message(Message::new("chat-a", "alice", "cats are great"))
            .await
            .unwrap();

        let recalled = manager
            .recall_blocks("completely unrelated zebra topic", 5, Some(0.9))
            .await
            .unwrap();
        assert!(recalled.is_empty());
    }

    #[tokio::test]
    async fn lexical_fallback_when_embeddings_fail() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);
        config.ensure_dirs().unwrap();

        let embedder = Arc::new(MockEmbedder::new(32));
        embedder.set_failing(true);
        let manager = PerceptualManager::new(&config, embedder).unwrap();

        manager
            .add_message(Message::new("chat-a", "alice", "tea ceremony this sunday"))
            .await
            .unwrap();

        // Embedding gateway down: recall still works via Jaccard
        let recalled = manager
            .recall_blocks("tea ceremony sunday", 5, Some(0.3))
            .await
            .unwrap();
        assert_eq!(recalled.len(), 1);
    }

    #[tokio::test]
    async fn remove_block_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);
        let manager = make_manager(&config);

        manager
            .add_message(Message::new("chat-a", "alice", "hello"))
            .await
            .unwrap();
        let block = manager.pending_transfer_blocks().await;
        assert!(block.is_empty());

        let stats = manager.statistics().await;
        assert_eq!(stats.total_blocks, 1);

        let blocks = manager.blocks.lock().await;
        let id = blocks.get("chat-a").unwrap()[0].id;
        drop(blocks);

        assert!(manager.remove_block(id).await.unwrap());
        assert!(!manager.remove_block(id).await.unwrap());
        assert_eq!(manager.statistics().await.total_blocks, 0);
    }

    #[tokio::test]
    async fn blocks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2);

        {
            let manager = make_manager(&config);
            manager
                .add_message(Message::new("chat-a", "alice", "persist me"))
                .await
                .unwrap();
        }

        let manager = make_manager(&config);
        let stats = manager.statistics().await;
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.total_messages, 1);
    }
}
