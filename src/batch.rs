//! Coalesced writes for graph and vector mutations
//!
//! Node creations queue their embedding work here instead of calling the
//! gateway inline. The queue is flushed when it reaches the configured batch
//! size, right before a search that may need the vectors, and on shutdown.
//! Graph persistence is likewise coalesced behind a dirty flag so a burst of
//! edits costs one SQLite write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::storage::{GraphPersistence, GraphStore, VectorEntry, VectorIndex};

/// A node awaiting embedding generation
#[derive(Debug, Clone)]
struct PendingEmbedding {
    node_id: Uuid,
    content: String,
    node_type: String,
}

/// Write scheduler shared by the long-term manager and the coordinator
pub struct BatchScheduler {
    graph: Arc<RwLock<GraphStore>>,
    vector: Arc<VectorIndex>,
    persistence: Arc<GraphPersistence>,
    embedder: Arc<dyn EmbeddingProvider>,

    pending: Mutex<Vec<PendingEmbedding>>,
    graph_dirty: AtomicBool,

    embed_batch_size: usize,
    embed_timeout: Duration,
    embed_limit: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(
        graph: Arc<RwLock<GraphStore>>,
        vector: Arc<VectorIndex>,
        persistence: Arc<GraphPersistence>,
        embedder: Arc<dyn EmbeddingProvider>,
        embed_batch_size: usize,
        embed_timeout: Duration,
        embed_max_inflight: usize,
    ) -> Self {
        Self {
            graph,
            vector,
            persistence,
            embedder,
            pending: Mutex::new(Vec::new()),
            graph_dirty: AtomicBool::new(false),
            embed_batch_size: embed_batch_size.max(1),
            embed_timeout,
            embed_limit: Arc::new(Semaphore::new(embed_max_inflight.max(1))),
        }
    }

    /// Queue a node for batched embedding. Flushes when the queue is full.
    pub async fn queue_embedding(
        &self,
        node_id: Uuid,
        content: String,
        node_type: String,
    ) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.push(PendingEmbedding {
                node_id,
                content,
                node_type,
            });
            pending.len() >= self.embed_batch_size
        };

        if should_flush {
            self.flush_embeddings().await?;
        }
        Ok(())
    }

    /// Number of nodes waiting for a vector
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Embed everything in the queue and bulk-insert into the vector index.
    ///
    /// Returns the number of nodes indexed. On a failed batch call, each item
    /// is retried individually so one bad input cannot sink the rest.
    pub async fn flush_embeddings(&self) -> Result<usize> {
        let batch: Vec<PendingEmbedding> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
        let embeddings = match self.embed_with_limit(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                vectors.into_iter().map(Some).collect::<Vec<_>>()
            }
            Ok(_) | Err(_) => {
                warn!("batched embedding failed, falling back to per-node calls");
                let mut vectors = Vec::with_capacity(batch.len());
                for item in &batch {
                    match self.embed_with_limit(std::slice::from_ref(&item.content)).await {
                        Ok(mut v) if !v.is_empty() => vectors.push(Some(v.remove(0))),
                        _ => vectors.push(None),
                    }
                }
                vectors
            }
        };

        let mut entries = Vec::new();
        for (item, embedding) in batch.iter().zip(embeddings) {
            let Some(embedding) = embedding else {
                warn!(node_id = %item.node_id, "embedding unavailable, node stays unindexed");
                continue;
            };
            entries.push(VectorEntry {
                node_id: item.node_id,
                content: item.content.clone(),
                node_type: item.node_type.clone(),
                embedding,
            });
        }

        if entries.is_empty() {
            return Ok(0);
        }

        self.vector.upsert_batch(entries.clone()).await?;

        {
            let mut graph = self.graph.write().await;
            for entry in &entries {
                if let Some(node) = graph.get_node_mut(entry.node_id) {
                    node.embedding = Some(entry.embedding.clone());
                }
                graph.mark_node_indexed(entry.node_id);
            }
        }
        self.mark_graph_dirty();

        debug!(count = entries.len(), "flushed pending embeddings");
        Ok(entries.len())
    }

    async fn embed_with_limit(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .embed_limit
            .acquire()
            .await
            .map_err(|e| crate::error::Error::embedding(e.to_string()))?;
        tokio::time::timeout(self.embed_timeout, self.embedder.embed_batch(texts))
            .await
            .map_err(|_| {
                crate::error::Error::timeout(format!(
                    "embedding batch exceeded {:?}",
                    self.embed_timeout
                ))
            })?
    }

    /// The embedding gateway behind this scheduler
    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    /// Record that the graph changed since the last persistence flush
    pub fn mark_graph_dirty(&self) {
        self.graph_dirty.store(true, Ordering::SeqCst);
    }

    /// Persist the graph store if it changed. Returns whether a save ran.
    pub async fn flush_graph(&self) -> Result<bool> {
        if !self.graph_dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let graph = self.graph.read().await;
        self.persistence.save(&graph)?;
        debug!("graph store persisted");
        Ok(true)
    }

    /// Flush both queues; used before searches and at shutdown
    pub async fn flush_all(&self) -> Result<()> {
        self.flush_embeddings().await?;
        self.flush_graph().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::embedding::MockEmbedder;
    use crate::storage::{Node, NodeType};

    async fn make_scheduler(dir: &std::path::Path, batch_size: usize) -> (BatchScheduler, Arc<RwLock<GraphStore>>) {
        let config = MemoryConfig {
            embedding_dimensions: 16,
            ..MemoryConfig::with_data_dir(dir)
        };
        config.ensure_dirs().unwrap();

        let graph = Arc::new(RwLock::new(GraphStore::new()));
        let vector = Arc::new(VectorIndex::new(&config).await.unwrap());
        let persistence = Arc::new(GraphPersistence::new(&config.graph_db_path()).unwrap());
        let embedder = Arc::new(MockEmbedder::new(16));

        let scheduler = BatchScheduler::new(
            graph.clone(),
            vector,
            persistence,
            embedder,
            batch_size,
            Duration::from_secs(5),
            2,
        );
        (scheduler, graph)
    }

    #[tokio::test]
    async fn queue_flushes_at_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, graph) = make_scheduler(dir.path(), 2).await;

        let first = Node::new("first node", NodeType::Entity);
        let second = Node::new("second node", NodeType::Entity);
        {
            let mut g = graph.write().await;
            g.upsert_node(first.clone());
            g.upsert_node(second.clone());
        }

        scheduler
            .queue_embedding(first.id, "first node".into(), "entity".into())
            .await
            .unwrap();
        assert_eq!(scheduler.pending_len().await, 1);

        scheduler
            .queue_embedding(second.id, "second node".into(), "entity".into())
            .await
            .unwrap();
        // Hit the batch size: queue drained, nodes indexed
        assert_eq!(scheduler.pending_len().await, 0);
        assert!(graph.read().await.get_node(first.id).unwrap().has_vector);
        assert!(graph.read().await.get_node(second.id).unwrap().embedding.is_some());
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, graph) = make_scheduler(dir.path(), 10).await;

        let node = Node::new("lonely node", NodeType::Topic);
        graph.write().await.upsert_node(node.clone());

        scheduler
            .queue_embedding(node.id, "lonely node".into(), "topic".into())
            .await
            .unwrap();
        let flushed = scheduler.flush_embeddings().await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(scheduler.pending_len().await, 0);
    }

    #[tokio::test]
    async fn graph_flush_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _graph) = make_scheduler(dir.path(), 10).await;

        assert!(!scheduler.flush_graph().await.unwrap());
        scheduler.mark_graph_dirty();
        scheduler.mark_graph_dirty();
        assert!(scheduler.flush_graph().await.unwrap());
        assert!(!scheduler.flush_graph().await.unwrap());
    }
}
