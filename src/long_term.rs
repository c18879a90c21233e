//! Long-term tier: the knowledge graph behind the memory engine
//!
//! Short-term rows arrive in batches. For each row the manager retrieves
//! similar existing memories, asks the LLM for a graph-edit program, and
//! executes it against the graph store with batched embedding generation.
//! The tier also owns activation decay, consolidation of near-duplicates,
//! forgetting, and graph-backed retrieval via path expansion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::BatchScheduler;
use crate::cache::TwoLevelCache;
use crate::config::{ExpansionConfig, MemoryConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::expansion::PathExpansion;
use crate::llm::{complete_with_timeout, LlmClient, LlmOptions};
use crate::parse::{normalize_op, operations_of, parse_lenient};
use crate::short_term::ShortTermMemory;
use crate::similarity::jaccard_similarity;
use crate::storage::{
    Edge, EdgeType, GraphPersistence, GraphStore, Memory, MemoryKind, Node, NodeType, VectorIndex,
};

/// Seconds inside which an identical create is treated as a duplicate
const CREATE_DEDUP_WINDOW_SECS: i64 = 120;

/// Lifecycle of a row staged for transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedStatus {
    Staged,
    Consolidated,
}

/// A short-term row while its transfer batch is in flight
#[derive(Debug, Clone)]
pub struct StagedMemory {
    pub memory: ShortTermMemory,
    pub status: StagedStatus,
}

/// Outcome of one transfer batch
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub transferred_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    pub created: usize,
    pub updated: usize,
    pub merged: usize,
}

/// One operation of a graph-edit program
#[derive(Debug, Clone)]
enum GraphOp {
    CreateNode {
        temp_id: Option<String>,
        content: String,
        node_type: NodeType,
    },
    CreateEdge {
        source_id: String,
        target_id: String,
        edge_type: EdgeType,
        relation_text: String,
        importance: f32,
    },
    CreateMemory {
        temp_id: Option<String>,
        node_ids: Vec<String>,
        memory_type: MemoryKind,
        importance: f32,
        privacy_label: Option<String>,
    },
    UpdateMemory {
        memory_id: String,
        importance: Option<f32>,
        privacy_label: Option<String>,
        metadata: HashMap<String, String>,
    },
    MergeMemories {
        memory_ids: Vec<String>,
        merged_importance: Option<f32>,
    },
}

/// Manager for the long-term tier
pub struct LongTermManager {
    graph: Arc<RwLock<GraphStore>>,
    vector: Arc<VectorIndex>,
    batch: Arc<BatchScheduler>,
    llm: Arc<dyn LlmClient>,
    llm_options: LlmOptions,
    llm_limit: Arc<Semaphore>,

    batch_size: usize,
    search_top_k: usize,
    decay_factor: f32,
    decay_cache: [f32; 30],
    expansion: ExpansionConfig,
    max_retry: u32,

    consolidation_similarity_threshold: f32,
    consolidation_window_hours: i64,
    forget_activation_threshold: f32,
    forget_min_importance: f32,
    activation_propagation_strength: f32,

    /// stm id → similar memory ids, reused within one batch
    similar_cache: Mutex<TwoLevelCache<String, Vec<Uuid>>>,
    /// query text → ranked (memory id, score) pairs
    query_cache: Mutex<TwoLevelCache<String, Vec<(Uuid, f32)>>>,
    /// content+type → recently created id, the duplicate-detection window
    recent_creations: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
}

impl LongTermManager {
    /// Open the tier: loads the persisted graph and the vector index
    pub async fn new(
        config: &MemoryConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let persistence = Arc::new(GraphPersistence::new(&config.graph_db_path())?);
        let graph = Arc::new(RwLock::new(persistence.load()?));
        let vector = Arc::new(VectorIndex::new(config).await?);

        let batch = Arc::new(BatchScheduler::new(
            graph.clone(),
            vector.clone(),
            persistence,
            embedder,
            config.embed_batch_size,
            Duration::from_secs(config.embed_timeout_secs),
            config.embed_max_inflight,
        ));

        let mut decay_cache = [0.0f32; 30];
        for (i, slot) in decay_cache.iter_mut().enumerate() {
            *slot = config.long_term_decay_factor.powi(i as i32 + 1);
        }

        Ok(Self {
            graph,
            vector,
            batch,
            llm,
            llm_options: LlmOptions::default()
                .with_max_tokens(2000)
                .with_timeout(Duration::from_secs(config.llm_timeout_secs)),
            llm_limit: Arc::new(Semaphore::new(config.llm_max_inflight.max(1))),
            batch_size: config.long_term_batch_size.max(1),
            search_top_k: config.search_top_k,
            decay_factor: config.long_term_decay_factor,
            decay_cache,
            expansion: config.expansion.clone(),
            max_retry: config.max_retry,
            consolidation_similarity_threshold: config.consolidation_similarity_threshold,
            consolidation_window_hours: config.consolidation_window_hours,
            forget_activation_threshold: config.forget_activation_threshold,
            forget_min_importance: config.forget_min_importance,
            activation_propagation_strength: config.activation_propagation_strength,
            similar_cache: Mutex::new(TwoLevelCache::with_defaults()),
            query_cache: Mutex::new(TwoLevelCache::with_defaults()),
            recent_creations: Mutex::new(HashMap::new()),
        })
    }

    /// Shared graph handle (read-mostly; the coordinator's relation scoring
    /// and the tests use it)
    pub fn graph(&self) -> Arc<RwLock<GraphStore>> {
        self.graph.clone()
    }

    /// Write scheduler handle, exposed for shutdown flushing
    pub fn scheduler(&self) -> Arc<BatchScheduler> {
        self.batch.clone()
    }

    // ==================== transfer ====================

    /// Transfer a batch of short-term rows into the graph.
    ///
    /// Rows are staged, processed in sub-batches with bounded concurrency,
    /// and one failure never aborts the rest: the result enumerates
    /// `transferred_ids` and `failed_ids` separately.
    pub async fn transfer_from_short_term(
        &self,
        batch: Vec<ShortTermMemory>,
    ) -> Result<TransferResult> {
        let staged: Vec<StagedMemory> = batch
            .into_iter()
            .map(|memory| StagedMemory {
                memory,
                status: StagedStatus::Staged,
            })
            .collect();

        let mut result = TransferResult::default();
        debug!(count = staged.len(), "starting short-term transfer");

        for chunk in staged.chunks(self.batch_size) {
            let outcomes = futures::future::join_all(chunk.iter().map(|staged| async {
                let id = staged.memory.id.clone();
                (id, self.process_single(&staged.memory).await)
            }))
            .await;

            for (id, outcome) in outcomes {
                match outcome {
                    Ok(counts) => {
                        result.transferred_ids.push(id);
                        result.created += counts.0;
                        result.updated += counts.1;
                        result.merged += counts.2;
                    }
                    Err(e) => {
                        warn!(stm_id = %id, error = %e, "short-term row failed to transfer");
                        result.failed_ids.push(id);
                    }
                }
            }

            // Vectors and graph writes land after every sub-batch
            self.batch.flush_embeddings().await?;
            self.batch.flush_graph().await?;
        }

        self.similar_cache.lock().await.clear();
        self.query_cache.lock().await.clear();

        info!(
            transferred = result.transferred_ids.len(),
            failed = result.failed_ids.len(),
            "short-term transfer complete"
        );
        Ok(result)
    }

    /// One row: similar-memory lookup, LLM program, execution.
    /// Retries transient failures with linear backoff.
    async fn process_single(&self, stm: &ShortTermMemory) -> Result<(usize, usize, usize)> {
        let mut last_error = None;

        for attempt in 0..=self.max_retry {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }

            match self.try_process(stm).await {
                Ok(counts) => return Ok(counts),
                Err(e) => {
                    if attempt < self.max_retry && e.is_transient() {
                        warn!(stm_id = %stm.id, attempt, error = %e, "transfer attempt failed, retrying");
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::llm("transfer retries exhausted")))
    }

    async fn try_process(&self, stm: &ShortTermMemory) -> Result<(usize, usize, usize)> {
        let similar = self.similar_memories(stm).await?;
        let operations = self.decide_operations(stm, &similar).await?;
        if operations.is_empty() {
            return Err(Error::llm("empty graph-edit program"));
        }
        self.execute_program(operations, stm).await
    }

    /// Top-K similar long-term memories for one row, cached per stm id so a
    /// retry within the batch skips the vector round-trip.
    async fn similar_memories(&self, stm: &ShortTermMemory) -> Result<Vec<Memory>> {
        if let Some(ids) = self.similar_cache.lock().await.get(&stm.id) {
            let graph = self.graph.read().await;
            return Ok(ids.iter().filter_map(|id| graph.get_memory(*id).cloned()).collect());
        }

        let memories = self
            .search_ranked(&stm.text(), self.search_top_k, &[])
            .await?;
        let ids: Vec<Uuid> = memories.iter().map(|(m, _)| m.id).collect();
        self.similar_cache.lock().await.insert(stm.id.clone(), ids);
        Ok(memories.into_iter().map(|(m, _)| m).collect())
    }

    async fn decide_operations(
        &self,
        stm: &ShortTermMemory,
        similar: &[Memory],
    ) -> Result<Vec<GraphOp>> {
        let prompt = {
            let graph = self.graph.read().await;
            graph_program_prompt(stm, similar, &graph)
        };

        let _permit = self
            .llm_limit
            .acquire()
            .await
            .map_err(|e| Error::llm(e.to_string()))?;
        let response = complete_with_timeout(self.llm.as_ref(), &prompt, &self.llm_options).await?;
        drop(_permit);

        let value = match parse_lenient(&response) {
            Ok(v) => v,
            Err(_) => {
                // Safe default for graph edits is the empty program
                debug!(raw = %response.chars().take(200).collect::<String>(), "unparseable graph program");
                return Ok(Vec::new());
            }
        };

        let mut operations = Vec::new();
        for item in operations_of(value) {
            match parse_graph_op(&item) {
                Some(op) => operations.push(op),
                None => warn!(item = %item, "unrecognized graph operation, skipping"),
            }
        }
        Ok(operations)
    }

    /// Execute a program in order, resolving temp ids as they are created.
    /// Invalid references drop the single operation, not the program.
    async fn execute_program(
        &self,
        operations: Vec<GraphOp>,
        stm: &ShortTermMemory,
    ) -> Result<(usize, usize, usize)> {
        let mut temp_ids: HashMap<String, Uuid> = HashMap::new();
        let (mut created, mut updated, mut merged) = (0usize, 0usize, 0usize);
        let mut applied = 0usize;

        for op in operations {
            match op {
                GraphOp::CreateNode {
                    temp_id,
                    content,
                    node_type,
                } => {
                    let node_id = self.create_node_deduped(&content, node_type).await?;
                    if let Some(temp) = temp_id {
                        temp_ids.insert(temp, node_id);
                    }
                    applied += 1;
                }

                GraphOp::CreateEdge {
                    source_id,
                    target_id,
                    edge_type,
                    relation_text,
                    importance,
                } => {
                    let source = resolve_id(&source_id, &temp_ids);
                    let target = resolve_id(&target_id, &temp_ids);
                    let (Some(source), Some(target)) = (source, target) else {
                        warn!(%source_id, %target_id, "edge endpoint unresolvable, dropping op");
                        continue;
                    };

                    let mut graph = self.graph.write().await;
                    match graph.upsert_edge(Edge::new(
                        source,
                        target,
                        edge_type,
                        relation_text,
                        importance,
                    )) {
                        Ok(()) => {
                            applied += 1;
                        }
                        Err(e) => {
                            // Unknown endpoint: drop and log, per the tie-break rules
                            warn!(error = %e, "edge references unknown endpoint, dropping op");
                        }
                    }
                }

                GraphOp::CreateMemory {
                    temp_id,
                    node_ids,
                    memory_type,
                    importance,
                    privacy_label,
                } => {
                    let resolved: Vec<Uuid> = node_ids
                        .iter()
                        .filter_map(|raw| resolve_id(raw, &temp_ids))
                        .collect();
                    if resolved.is_empty() {
                        warn!("create_memory with no resolvable nodes, dropping op");
                        continue;
                    }

                    match self
                        .create_memory_deduped(
                            resolved,
                            memory_type,
                            importance,
                            privacy_label,
                            stm,
                        )
                        .await
                    {
                        Ok(memory_id) => {
                            if let Some(temp) = temp_id {
                                temp_ids.insert(temp, memory_id);
                            }
                            created += 1;
                            applied += 1;
                        }
                        Err(e) => warn!(error = %e, "create_memory failed, dropping op"),
                    }
                }

                GraphOp::UpdateMemory {
                    memory_id,
                    importance,
                    privacy_label,
                    metadata,
                } => {
                    let Some(id) = resolve_id(&memory_id, &temp_ids) else {
                        warn!(%memory_id, "update target unresolvable, dropping op");
                        continue;
                    };
                    let mut graph = self.graph.write().await;
                    let Some(memory) = graph.get_memory_mut(id) else {
                        warn!(%id, "update target missing, dropping op");
                        continue;
                    };
                    if let Some(importance) = importance {
                        memory.importance = importance.clamp(0.0, 1.0);
                    }
                    if privacy_label.is_some() {
                        memory.privacy_label = privacy_label;
                    }
                    memory.metadata.extend(metadata);
                    memory.mark_accessed();
                    updated += 1;
                    applied += 1;
                }

                GraphOp::MergeMemories {
                    memory_ids,
                    merged_importance,
                } => {
                    let resolved: Vec<Uuid> = memory_ids
                        .iter()
                        .filter_map(|raw| resolve_id(raw, &temp_ids))
                        .collect();

                    let mut graph = self.graph.write().await;
                    // Missing targets degrade the merge to an update on the
                    // extant subset
                    let extant: Vec<Uuid> = resolved
                        .iter()
                        .copied()
                        .filter(|id| graph.get_memory(*id).is_some())
                        .collect();

                    match extant.len() {
                        0 => {
                            warn!("merge_memories with no extant targets, dropping op");
                            continue;
                        }
                        1 => {
                            let memory = graph.get_memory_mut(extant[0]).expect("extant");
                            if let Some(importance) = merged_importance {
                                memory.importance = memory.importance.max(importance);
                            }
                            memory.mark_accessed();
                            updated += 1;
                        }
                        _ => {
                            let target = extant[0];
                            graph.merge_memories(target, &extant[1..])?;
                            let memory = graph.get_memory_mut(target).expect("target extant");
                            if let Some(importance) = merged_importance {
                                memory.importance = memory.importance.max(importance);
                            }
                            memory
                                .metadata
                                .insert("merged_from_stm".to_string(), stm.id.clone());
                            memory.mark_accessed();
                            merged += 1;
                        }
                    }
                    applied += 1;
                }
            }
        }

        if applied == 0 {
            return Err(Error::invalid_input("no graph operation applied"));
        }

        self.batch.mark_graph_dirty();
        Ok((created, updated, merged))
    }

    /// Create a node unless an identical one was created inside the dedup
    /// window, making duplicate program application idempotent.
    async fn create_node_deduped(&self, content: &str, node_type: NodeType) -> Result<Uuid> {
        let key = format!("node:{}:{}", node_type, content);
        let now = Utc::now();

        {
            let recent = self.recent_creations.lock().await;
            if let Some((id, at)) = recent.get(&key) {
                if (now - *at).num_seconds() < CREATE_DEDUP_WINDOW_SECS {
                    return Ok(*id);
                }
            }
        }

        let node = Node::new(content, node_type);
        let node_id = node.id;
        self.graph.write().await.upsert_node(node);
        self.batch
            .queue_embedding(node_id, content.to_string(), node_type.to_string())
            .await?;

        self.recent_creations.lock().await.insert(key, (node_id, now));
        Ok(node_id)
    }

    async fn create_memory_deduped(
        &self,
        node_ids: Vec<Uuid>,
        memory_type: MemoryKind,
        importance: f32,
        privacy_label: Option<String>,
        stm: &ShortTermMemory,
    ) -> Result<Uuid> {
        let mut sorted = node_ids.clone();
        sorted.sort();
        let key = format!(
            "memory:{}:{}",
            memory_type,
            sorted
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        let now = Utc::now();

        {
            let recent = self.recent_creations.lock().await;
            if let Some((id, at)) = recent.get(&key) {
                if (now - *at).num_seconds() < CREATE_DEDUP_WINDOW_SECS {
                    return Ok(*id);
                }
            }
        }

        let mut memory = Memory::new(memory_type, importance, self.decay_factor);
        memory.node_ids = node_ids;
        memory.privacy_label = privacy_label;
        memory
            .metadata
            .insert("transferred_from_stm".to_string(), stm.id.clone());
        let memory_id = memory.id;
        self.graph.write().await.upsert_memory(memory)?;

        self.recent_creations.lock().await.insert(key, (memory_id, now));
        Ok(memory_id)
    }

    // ==================== retrieval ====================

    /// Search long-term memories: vector TopK over nodes, candidate mapping
    /// through the node→memories index, then path-scored expansion.
    pub async fn search_memories(&self, query_text: &str, top_k: usize) -> Result<Vec<Memory>> {
        Ok(self
            .search_scored(query_text, top_k, &[])
            .await?
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }

    /// Scored variant used by the coordinator's multi-query merge. Preferred
    /// node types boost expansion scores.
    pub async fn search_scored(
        &self,
        query_text: &str,
        top_k: usize,
        preferred_types: &[NodeType],
    ) -> Result<Vec<(Memory, f32)>> {
        let memories = self.search_ranked(query_text, top_k, preferred_types).await?;

        // Retrieval is an access: bump activation with propagation
        for (memory, _) in &memories {
            self.activate_memory(memory.id, 0.2).await;
        }
        Ok(memories)
    }

    async fn search_ranked(
        &self,
        query_text: &str,
        top_k: usize,
        preferred_types: &[NodeType],
    ) -> Result<Vec<(Memory, f32)>> {
        // Vectors queued by recent writes must be visible to this search
        self.batch.flush_embeddings().await?;
        self.index_missing_nodes().await?;

        let cache_key = format!("{}|{}", top_k, query_text);
        if let Some(hits) = self.query_cache.lock().await.get(&cache_key) {
            let graph = self.graph.read().await;
            let memories: Vec<(Memory, f32)> = hits
                .iter()
                .filter_map(|(id, score)| graph.get_memory(*id).map(|m| (m, *score)))
                .filter(|(m, _)| !m.forgotten)
                .map(|(m, score)| (m.clone(), score))
                .collect();
            if !memories.is_empty() {
                return Ok(memories);
            }
        }

        let query_embedding = match self.batch_embed_query(query_text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, lexical seed fallback");
                None
            }
        };

        let seeds: Vec<(Uuid, f32)> = match &query_embedding {
            Some(query) => self
                .vector
                .query(query, self.search_top_k.max(top_k), None)
                .await?
                .into_iter()
                .map(|hit| (hit.node_id, hit.score))
                .collect(),
            None => {
                // Lexical fallback over node contents
                let graph = self.graph.read().await;
                let mut scored: Vec<(Uuid, f32)> = graph
                    .all_nodes()
                    .map(|n| (n.id, jaccard_similarity(query_text, &n.content)))
                    .filter(|(_, s)| *s > 0.0)
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(self.search_top_k.max(top_k));
                scored
            }
        };

        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let graph = self.graph.read().await;
        let engine = PathExpansion::new(&graph, &self.expansion);
        let ranked = engine.expand(
            &seeds,
            query_embedding.as_deref(),
            preferred_types,
            top_k,
            Utc::now(),
        );

        let memories: Vec<(Memory, f32)> = ranked
            .iter()
            .filter_map(|r| {
                graph
                    .get_memory(r.memory_id)
                    .map(|m| (m.clone(), r.final_score))
            })
            .collect();
        drop(graph);

        self.query_cache.lock().await.insert(
            cache_key,
            memories.iter().map(|(m, score)| (m.id, *score)).collect(),
        );
        Ok(memories)
    }

    async fn batch_embed_query(&self, query_text: &str) -> Result<Vec<f32>> {
        // The scheduler's embedder handles limits and timeouts for node
        // batches; queries reuse the same gateway path
        let vectors = self
            .batch_embedder()
            .embed_batch(&[query_text.to_string()])
            .await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("no query embedding returned"))
    }

    fn batch_embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.batch.embedder()
    }

    /// Nodes created without vectors are indexed lazily before any search
    /// that might need them
    async fn index_missing_nodes(&self) -> Result<()> {
        let missing: Vec<(Uuid, String, String)> = {
            let graph = self.graph.read().await;
            graph
                .unindexed_nodes()
                .iter()
                .map(|n| (n.id, n.content.clone(), n.node_type.to_string()))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        for (id, content, node_type) in missing {
            self.batch.queue_embedding(id, content, node_type).await?;
        }
        self.batch.flush_embeddings().await?;
        Ok(())
    }

    // ==================== lifecycle ====================

    /// Access-time activation bump with one-hop propagation to memories that
    /// share nodes with the accessed one.
    pub async fn activate_memory(&self, memory_id: Uuid, strength: f32) {
        let related: Vec<Uuid> = {
            let mut graph = self.graph.write().await;
            let Some(memory) = graph.get_memory_mut(memory_id) else {
                return;
            };
            memory.activation = (memory.activation + strength).min(1.0);
            memory.mark_accessed();

            let node_ids = memory.node_ids.clone();
            node_ids
                .iter()
                .flat_map(|n| graph.memories_by_node(*n))
                .filter(|id| *id != memory_id)
                .collect()
        };

        let propagated = strength * self.activation_propagation_strength;
        if propagated > 0.01 {
            let mut graph = self.graph.write().await;
            for related_id in related {
                if let Some(memory) = graph.get_memory_mut(related_id) {
                    memory.activation = (memory.activation + propagated).min(1.0);
                }
            }
        }
        self.batch.mark_graph_dirty();
    }

    /// Apply activation decay as of `now`. Idempotent per timestamp: the
    /// second call with the same `now` changes nothing. Only changed
    /// memories are written back, through the batch scheduler.
    pub async fn apply_decay(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut decayed = 0usize;

        {
            let mut graph = self.graph.write().await;
            for memory in graph.all_memories_mut() {
                if memory.forgotten {
                    continue;
                }

                let days_now = (now - memory.last_accessed_at).num_seconds() / 86_400;
                if days_now < 1 {
                    continue;
                }
                let days_done = memory
                    .last_decayed_at
                    .map(|at| (at - memory.last_accessed_at).num_seconds() / 86_400)
                    .unwrap_or(0);
                let pending = days_now - days_done;
                if pending <= 0 {
                    continue;
                }

                let factor = if pending <= 30 {
                    self.decay_cache[(pending - 1) as usize]
                } else {
                    self.decay_factor.powi(pending as i32)
                };
                memory.activation *= factor;
                memory.last_decayed_at = Some(now);
                decayed += 1;
            }
        }

        if decayed > 0 {
            self.batch.mark_graph_dirty();
            self.batch.flush_graph().await?;
        }
        debug!(decayed, "activation decay applied");
        Ok(decayed)
    }

    /// Merge near-duplicate memories created within the recent window, then
    /// rebuild the lazy vector index entries.
    pub async fn consolidate(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.consolidation_window_hours);
        let mut merged_count = 0usize;

        {
            let mut graph = self.graph.write().await;

            let mut by_type: HashMap<MemoryKind, Vec<(Uuid, f32, Option<Vec<f32>>)>> =
                HashMap::new();
            for memory in graph.all_memories() {
                if memory.forgotten || memory.created_at < cutoff {
                    continue;
                }
                let anchor = memory
                    .node_ids
                    .iter()
                    .filter_map(|id| graph.get_node(*id))
                    .find_map(|n| n.embedding.clone());
                by_type.entry(memory.memory_type).or_default().push((
                    memory.id,
                    memory.importance,
                    anchor,
                ));
            }

            for group in by_type.values() {
                for i in 0..group.len() {
                    for j in (i + 1)..group.len() {
                        let (id_a, imp_a, Some(emb_a)) = &group[i] else {
                            continue;
                        };
                        let (id_b, imp_b, Some(emb_b)) = &group[j] else {
                            continue;
                        };
                        // A pair may already be gone through an earlier merge
                        if graph.get_memory(*id_a).is_none() || graph.get_memory(*id_b).is_none() {
                            continue;
                        }

                        let similarity = crate::similarity::cosine_similarity(emb_a, emb_b);
                        if similarity < self.consolidation_similarity_threshold {
                            continue;
                        }

                        let (keep, drop) = if imp_a >= imp_b {
                            (*id_a, *id_b)
                        } else {
                            (*id_b, *id_a)
                        };
                        info!(%keep, %drop, similarity, "consolidating near-duplicate memories");
                        graph.merge_memories(keep, &[drop])?;
                        if let Some(memory) = graph.get_memory_mut(keep) {
                            memory.importance = (memory.importance + 0.1).min(1.0);
                            memory.activation = (memory.activation + 0.1).min(1.0);
                        }
                        merged_count += 1;
                    }
                }
            }
        }

        if merged_count > 0 {
            self.batch.mark_graph_dirty();
        }
        self.index_missing_nodes().await?;
        self.batch.flush_graph().await?;
        Ok(merged_count)
    }

    /// Mark low-activation, low-importance memories as forgotten. Importance
    /// at or above the protection floor is never forgotten.
    pub async fn forget(&self) -> Result<usize> {
        let mut forgotten = 0usize;
        {
            let mut graph = self.graph.write().await;
            for memory in graph.all_memories_mut() {
                if memory.forgotten {
                    continue;
                }
                if memory.importance >= self.forget_min_importance {
                    continue;
                }
                if memory.activation < self.forget_activation_threshold {
                    memory.forgotten = true;
                    memory
                        .metadata
                        .insert("forgotten_at".to_string(), Utc::now().to_rfc3339());
                    forgotten += 1;
                }
            }
        }

        if forgotten > 0 {
            info!(forgotten, "memories forgotten");
            self.batch.mark_graph_dirty();
            self.batch.flush_graph().await?;
        }
        Ok(forgotten)
    }

    /// Tier statistics
    pub async fn statistics(&self) -> LongTermStatistics {
        let graph = self.graph.read().await;
        let stats = graph.statistics();
        let active: Vec<f32> = graph
            .all_memories()
            .filter(|m| !m.forgotten)
            .map(|m| m.activation)
            .collect();
        let avg_activation = if active.is_empty() {
            0.0
        } else {
            active.iter().sum::<f32>() / active.len() as f32
        };

        LongTermStatistics {
            total_memories: stats.total_memories,
            total_nodes: stats.total_nodes,
            total_edges: stats.total_edges,
            forgotten_memories: stats.forgotten_memories,
            avg_activation,
            decay_factor: self.decay_factor,
        }
    }

    /// Flush pending embeddings and persist the graph
    pub async fn shutdown(&self) -> Result<()> {
        self.batch.flush_all().await
    }
}

/// Counters reported by [`LongTermManager::statistics`]
#[derive(Debug, Clone, serde::Serialize)]
pub struct LongTermStatistics {
    pub total_memories: usize,
    pub total_nodes: usize,
    pub total_edges: usize,
    pub forgotten_memories: usize,
    pub avg_activation: f32,
    pub decay_factor: f32,
}

/// Single-lookup temp-id resolution: a raw value resolves through the map
/// once, otherwise it must already be a UUID. Empty maps short-circuit.
fn resolve_id(raw: &str, temp_ids: &HashMap<String, Uuid>) -> Option<Uuid> {
    if !temp_ids.is_empty() {
        if let Some(id) = temp_ids.get(raw) {
            return Some(*id);
        }
    }
    Uuid::parse_str(raw).ok()
}

fn parse_graph_op(item: &Value) -> Option<GraphOp> {
    let raw_op = item
        .get("op")
        .or_else(|| item.get("operation"))
        .or_else(|| item.get("operation_type"))
        .and_then(Value::as_str)?;
    let args = item
        .get("args")
        .or_else(|| item.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let temp_id = item
        .get("temp_id")
        .or_else(|| item.get("target_id"))
        .and_then(Value::as_str)
        .map(String::from);

    match normalize_op(raw_op).as_str() {
        "create_node" => Some(GraphOp::CreateNode {
            temp_id,
            content: args.get("content").and_then(Value::as_str)?.to_string(),
            node_type: args
                .get("type")
                .or_else(|| args.get("node_type"))
                .and_then(Value::as_str)
                .map(NodeType::parse)
                .unwrap_or(NodeType::Other),
        }),

        "create_edge" => Some(GraphOp::CreateEdge {
            source_id: args.get("source_id").and_then(Value::as_str)?.to_string(),
            target_id: args.get("target_id").and_then(Value::as_str)?.to_string(),
            edge_type: args
                .get("edge_type")
                .and_then(Value::as_str)
                .map(EdgeType::parse)
                .unwrap_or(EdgeType::Default),
            relation_text: args
                .get("relation_text")
                .or_else(|| args.get("relation"))
                .and_then(Value::as_str)
                .unwrap_or("related")
                .to_string(),
            importance: args
                .get("importance")
                .and_then(Value::as_f64)
                .unwrap_or(0.5) as f32,
        }),

        "create_memory" => Some(GraphOp::CreateMemory {
            temp_id,
            node_ids: args
                .get("node_ids")
                .and_then(Value::as_array)?
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            memory_type: args
                .get("memory_type")
                .and_then(Value::as_str)
                .map(MemoryKind::parse)
                .unwrap_or(MemoryKind::Fact),
            importance: args
                .get("importance")
                .and_then(Value::as_f64)
                .unwrap_or(0.5) as f32,
            privacy_label: args
                .get("privacy_label")
                .and_then(Value::as_str)
                .map(String::from),
        }),

        "update_memory" => Some(GraphOp::UpdateMemory {
            memory_id: args
                .get("memory_id")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| temp_id.clone())?,
            importance: args
                .get("importance")
                .or_else(|| args.get("updated_fields").and_then(|f| f.get("importance")))
                .and_then(Value::as_f64)
                .map(|v| v as f32),
            privacy_label: args
                .get("privacy_label")
                .and_then(Value::as_str)
                .map(String::from),
            metadata: args
                .get("metadata")
                .or_else(|| args.get("updated_fields"))
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| {
                            v.as_str().map(|s| (k.clone(), s.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }),

        "merge_memories" => Some(GraphOp::MergeMemories {
            memory_ids: args
                .get("memory_ids")
                .or_else(|| args.get("source_memory_ids"))
                .and_then(Value::as_array)?
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            merged_importance: args
                .get("merged_importance")
                .and_then(Value::as_f64)
                .map(|v| v as f32),
        }),

        _ => None,
    }
}

fn graph_program_prompt(stm: &ShortTermMemory, similar: &[Memory], graph: &GraphStore) -> String {
    let similar_desc = if similar.is_empty() {
        "(no similar memories found)".to_string()
    } else {
        similar
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let node_texts: Vec<String> = m
                    .node_ids
                    .iter()
                    .filter_map(|id| graph.get_node(*id))
                    .map(|n| format!("{} ({})", n.content, n.node_type))
                    .collect();
                format!(
                    "{}. [id: {}] importance {:.2}, activation {:.2}, nodes: {}",
                    i + 1,
                    m.id,
                    m.importance,
                    m.activation,
                    node_texts.join("; ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are a knowledge-graph curator. Fold the short-term memory below into the long-term graph.

**Short-term memory:**
- subject: {}
- topic: {}
- object: {}
- type: {}
- importance: {:.2}
- attributes: {}

**Similar long-term memories:**
{}

**Operations:**
1. create_node - args: content, type (person/entity/event/topic/attribute/value/time/location/other). May declare "temp_id".
2. create_edge - args: source_id, target_id, edge_type (reference/attribute/has_property/relation/temporal/core_relation), relation_text, importance.
3. create_memory - args: node_ids (list), memory_type, importance. May declare "temp_id".
4. update_memory - args: memory_id, importance, metadata.
5. merge_memories - args: memory_ids (first one is kept), merged_importance.

**Temp-id rules (important):**
- Newly created nodes/memories declare a short ASCII temp_id such as "t1".
- Later operations reference those temp ids in place of real ids.
- Never invent real-looking UUIDs.

**Strategy:**
- No similar memory or clearly new information: create nodes, edges, and one memory.
- Highly similar memory exists: update_memory or merge_memories.
- Supplementary detail: create_node + create_edge attached to existing nodes.

Output a JSON array of operations only."#,
        stm.subject,
        stm.topic,
        stm.object.as_deref().unwrap_or("-"),
        stm.memory_type,
        stm.importance,
        serde_json::to_string(&stm.attributes).unwrap_or_else(|_| "{}".to_string()),
        similar_desc
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::llm::MockLlm;

    fn test_config(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            embedding_dimensions: 32,
            embed_batch_size: 4,
            max_retry: 0,
            ..MemoryConfig::with_data_dir(dir)
        }
    }

    fn sample_stm(topic: &str) -> ShortTermMemory {
        ShortTermMemory {
            id: format!("stm_{}", topic.replace(' ', "_")),
            chat_id: "chat-a".to_string(),
            subject: "alice".to_string(),
            memory_type: MemoryKind::Fact,
            topic: topic.to_string(),
            object: None,
            attributes: HashMap::new(),
            importance: 0.7,
            embedding: None,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_count: 0,
            source_block_ids: vec![Uuid::new_v4()],
        }
    }

    async fn manager_with(dir: &std::path::Path, llm: Arc<MockLlm>) -> LongTermManager {
        let config = test_config(dir);
        config.ensure_dirs().unwrap();
        LongTermManager::new(&config, llm, Arc::new(MockEmbedder::new(32)))
            .await
            .unwrap()
    }

    const TEMP_ID_PROGRAM: &str = r#"[
  {"op":"create_node","temp_id":"t1","args":{"content":"Alice","type":"person"}},
  {"op":"create_node","temp_id":"t2","args":{"content":"likes tea","type":"event"}},
  {"op":"create_edge","args":{"source_id":"t1","target_id":"t2","edge_type":"relation","relation_text":"does","importance":0.6}},
  {"op":"create_memory","args":{"node_ids":["t1","t2"],"importance":0.7}}
]"#;

    #[tokio::test]
    async fn temp_id_program_builds_graph() {
        // Two fresh nodes, one edge between them, one memory over both
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        let result = manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();

        assert_eq!(result.transferred_ids.len(), 1);
        assert_eq!(result.created, 1);
        assert!(result.failed_ids.is_empty());

        let graph = manager.graph();
        let graph = graph.read().await;
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.memory_count(), 1);

        let memory = graph.all_memories().next().unwrap();
        assert_eq!(memory.node_ids.len(), 2);
        for node_id in &memory.node_ids {
            assert_eq!(graph.memories_by_node(*node_id), vec![memory.id]);
        }
    }

    #[tokio::test]
    async fn duplicate_program_application_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();
        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();

        let graph = manager.graph();
        let graph = graph.read().await;
        // Creates inside the dedup window collapse onto the same objects
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.memory_count(), 1);
    }

    #[tokio::test]
    async fn edge_with_unknown_endpoint_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let program = r#"[
  {"op":"create_node","temp_id":"t1","args":{"content":"Alice","type":"person"}},
  {"op":"create_edge","args":{"source_id":"t1","target_id":"no_such_temp","edge_type":"relation","relation_text":"does","importance":0.6}},
  {"op":"create_memory","args":{"node_ids":["t1"],"importance":0.5}}
]"#;
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(program))).await;

        let result = manager
            .transfer_from_short_term(vec![sample_stm("solo")])
            .await
            .unwrap();
        assert_eq!(result.transferred_ids.len(), 1);

        let graph = manager.graph();
        let graph = graph.read().await;
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.memory_count(), 1);
    }

    #[tokio::test]
    async fn merge_with_missing_targets_degrades_to_update() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlm::always(TEMP_ID_PROGRAM));
        let manager = manager_with(dir.path(), llm.clone()).await;

        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();
        let existing_id = {
            let graph = manager.graph();
            let id = graph.read().await.all_memories().next().unwrap().id;
            id
        };

        let merge_program = format!(
            r#"[{{"op":"merge_memories","args":{{"memory_ids":["{}","{}"],"merged_importance":0.95}}}}]"#,
            existing_id,
            Uuid::new_v4()
        );
        llm.push(&merge_program);

        let result = manager
            .transfer_from_short_term(vec![sample_stm("tea merge")])
            .await
            .unwrap();
        assert_eq!(result.transferred_ids.len(), 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.merged, 0);

        let graph = manager.graph();
        let graph = graph.read().await;
        let memory = graph.get_memory(existing_id).unwrap();
        assert!((memory.importance - 0.95).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn merge_memories_concatenates_and_sums() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlm::new(vec![
            r#"[{"op":"create_node","temp_id":"t1","args":{"content":"Alpha","type":"entity"}},
                {"op":"create_memory","temp_id":"m1","args":{"node_ids":["t1"],"importance":0.4}}]"#,
            r#"[{"op":"create_node","temp_id":"t1","args":{"content":"Beta","type":"entity"}},
                {"op":"create_memory","temp_id":"m1","args":{"node_ids":["t1"],"importance":0.9}}]"#,
        ]));
        let manager = manager_with(dir.path(), llm.clone()).await;

        manager
            .transfer_from_short_term(vec![sample_stm("alpha")])
            .await
            .unwrap();
        manager
            .transfer_from_short_term(vec![sample_stm("beta")])
            .await
            .unwrap();

        let (first, second) = {
            let graph = manager.graph();
            let graph = graph.read().await;
            let mut ids: Vec<Uuid> = graph.all_memories().map(|m| m.id).collect();
            ids.sort();
            (ids[0], ids[1])
        };

        llm.push(&format!(
            r#"[{{"op":"merge_memories","args":{{"memory_ids":["{}","{}"]}}}}]"#,
            first, second
        ));
        let result = manager
            .transfer_from_short_term(vec![sample_stm("merge them")])
            .await
            .unwrap();
        assert_eq!(result.merged, 1);

        let graph = manager.graph();
        let graph = graph.read().await;
        assert_eq!(graph.memory_count(), 1);
        let memory = graph.get_memory(first).unwrap();
        assert_eq!(memory.node_ids.len(), 2);
        // Max importance survives the merge
        assert!(memory.importance >= 0.9);
    }

    #[tokio::test]
    async fn unparseable_program_fails_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            manager_with(dir.path(), Arc::new(MockLlm::always("no json here at all"))).await;

        let result = manager
            .transfer_from_short_term(vec![sample_stm("broken")])
            .await
            .unwrap();
        assert!(result.transferred_ids.is_empty());
        assert_eq!(result.failed_ids.len(), 1);
    }

    #[tokio::test]
    async fn empty_object_is_empty_program_and_fails_row() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always("{}"))).await;

        let result = manager
            .transfer_from_short_term(vec![sample_stm("empty")])
            .await
            .unwrap();
        // An empty program writes nothing, so the row must stay in short-term
        assert!(result.transferred_ids.is_empty());
        assert_eq!(result.failed_ids.len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlm::new(vec!["garbage response", TEMP_ID_PROGRAM]));
        let manager = manager_with(dir.path(), llm).await;

        let result = manager
            .transfer_from_short_term(vec![sample_stm("bad"), sample_stm("good")])
            .await
            .unwrap();

        assert_eq!(result.transferred_ids.len(), 1);
        assert_eq!(result.failed_ids.len(), 1);
    }

    #[tokio::test]
    async fn decay_is_idempotent_per_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();

        // Age the memory by three days
        {
            let graph = manager.graph();
            let mut graph = graph.write().await;
            for memory in graph.all_memories_mut() {
                memory.last_accessed_at = Utc::now() - chrono::Duration::days(3);
                memory.activation = 1.0;
            }
        }

        let now = Utc::now();
        let first = manager.apply_decay(now).await.unwrap();
        assert_eq!(first, 1);

        let after_first = {
            let graph = manager.graph();
            let activation = graph.read().await.all_memories().next().unwrap().activation;
            activation
        };
        let expected = 0.95f32.powi(3);
        assert!((after_first - expected).abs() < 1e-5);

        // Same timestamp again: a no-op
        let second = manager.apply_decay(now).await.unwrap();
        assert_eq!(second, 0);
        let after_second = {
            let graph = manager.graph();
            let activation = graph.read().await.all_memories().next().unwrap().activation;
            activation
        };
        assert!((after_second - after_first).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn forgetting_respects_importance_protection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        {
            let graph = manager.graph();
            let mut g = graph.write().await;
            let node = Node::new("anchor", NodeType::Entity);
            let node_id = node.id;
            g.upsert_node(node);

            let mut weak = Memory::new(MemoryKind::Fact, 0.2, 0.95);
            weak.node_ids = vec![node_id];
            weak.activation = 0.05;
            g.upsert_memory(weak).unwrap();

            let mut protected = Memory::new(MemoryKind::Fact, 0.9, 0.95);
            protected.node_ids = vec![node_id];
            protected.activation = 0.05;
            g.upsert_memory(protected).unwrap();
        }

        let forgotten = manager.forget().await.unwrap();
        assert_eq!(forgotten, 1);

        let graph = manager.graph();
        let graph = graph.read().await;
        let protected_survives = graph
            .all_memories()
            .any(|m| m.importance >= 0.9 && !m.forgotten);
        assert!(protected_survives);
    }

    #[tokio::test]
    async fn consolidation_merges_near_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        {
            let graph = manager.graph();
            let mut g = graph.write().await;
            for importance in [0.4f32, 0.8] {
                let mut node = Node::new("alice drinks tea daily", NodeType::Topic);
                node.embedding = Some(vec![1.0, 0.0, 0.0]);
                let node_id = node.id;
                g.upsert_node(node);
                let mut memory = Memory::new(MemoryKind::Fact, importance, 0.95);
                memory.node_ids = vec![node_id];
                g.upsert_memory(memory).unwrap();
            }
        }

        let merged = manager.consolidate().await.unwrap();
        assert_eq!(merged, 1);

        let graph = manager.graph();
        let graph = graph.read().await;
        assert_eq!(graph.memory_count(), 1);
        let survivor = graph.all_memories().next().unwrap();
        // Higher-importance memory won and got the consolidation boost
        assert!(survivor.importance >= 0.8);
    }

    #[tokio::test]
    async fn search_finds_transferred_memory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();

        let results = manager.search_memories("Alice likes tea", 5).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn search_bumps_activation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), Arc::new(MockLlm::always(TEMP_ID_PROGRAM))).await;

        manager
            .transfer_from_short_term(vec![sample_stm("likes tea")])
            .await
            .unwrap();
        {
            let graph = manager.graph();
            let mut g = graph.write().await;
            for memory in g.all_memories_mut() {
                memory.activation = 0.3;
            }
        }

        manager.search_memories("Alice likes tea", 5).await.unwrap();

        let graph = manager.graph();
        let graph = graph.read().await;
        let memory = graph.all_memories().next().unwrap();
        assert!(memory.activation > 0.3);
        assert!(memory.access_count > 0);
    }
}
