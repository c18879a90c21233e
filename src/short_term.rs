//! Short-term tier: structured memories with LLM-guided mutation
//!
//! Each promoted block is distilled into one structured memory. An LLM
//! decision then folds it into the existing set: create a new row, merge or
//! update an existing one, or discard it. The set is hard-bounded; a full
//! store promotes wholesale to the long-term tier and applies the configured
//! overflow policy afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{MemoryConfig, OverflowStrategy};
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::llm::{complete_with_timeout, LlmClient, LlmOptions};
use crate::parse::{normalize_op, parse_lenient};
use crate::perceptual::MemoryBlock;
use crate::similarity::{batch_cosine_similarity, jaccard_similarity};
use crate::storage::{snapshot, MemoryKind};

/// A structured short-term memory distilled from one block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemory {
    /// Row id, `stm_` + 12 hex chars
    pub id: String,

    /// Chat the source block belonged to
    pub chat_id: String,

    /// Who the memory is about
    pub subject: String,

    /// Semantic category
    pub memory_type: MemoryKind,

    /// What happened / what is asserted
    pub topic: String,

    /// Optional object of the assertion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,

    /// Free-form attributes (time, place, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,

    /// LLM-assigned long-term value, in [0, 1]
    pub importance: f32,

    /// Lazily generated; cached in memory only, never persisted
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,

    #[serde(default)]
    pub access_count: u32,

    /// Blocks this row was distilled from
    pub source_block_ids: Vec<Uuid>,
}

impl ShortTermMemory {
    fn fresh_id() -> String {
        format!("stm_{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    /// Natural-language rendering used for embedding and prompts
    pub fn text(&self) -> String {
        let mut parts = vec![self.subject.clone(), self.topic.clone()];
        if let Some(object) = &self.object {
            parts.push(object.clone());
        }
        let mut text = parts.join(" ");
        if !self.attributes.is_empty() {
            let mut attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            attrs.sort();
            text.push_str(" (");
            text.push_str(&attrs.join(", "));
            text.push(')');
        }
        text
    }

    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }
}

/// Decision op for a freshly extracted memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortTermOp {
    CreateNew,
    Merge,
    Update,
    Discard,
}

impl ShortTermOp {
    /// Closed-set normalizer: lowercased, `-` → `_`, anything unknown is a
    /// create (the safe default).
    pub fn parse(raw: &str) -> Self {
        match normalize_op(raw).as_str() {
            "merge" => Self::Merge,
            "update" => Self::Update,
            "discard" => Self::Discard,
            _ => Self::CreateNew,
        }
    }
}

/// Parsed LLM decision
#[derive(Debug, Clone)]
pub struct ShortTermDecision {
    pub op: ShortTermOp,
    pub target_id: Option<String>,
    pub memory_fields: Option<Value>,
    pub reasoning: String,
}

/// Inner state: the row set and its similarity matrix share one lock, which
/// is the cache-invalidation contract from the design.
struct ShortTermState {
    memories: Vec<ShortTermMemory>,
    /// Row-major embedding matrix over `matrix_ids`, rebuilt lazily
    matrix: Option<Vec<Vec<f32>>>,
    matrix_ids: Vec<String>,
}

impl ShortTermState {
    fn invalidate_matrix(&mut self) {
        self.matrix = None;
        self.matrix_ids.clear();
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.memories.iter().position(|m| m.id == id)
    }
}

/// Manager for the short-term tier
pub struct ShortTermManager {
    max_memories: usize,
    transfer_threshold: f32,
    overflow_strategy: OverflowStrategy,
    enable_force_cleanup: bool,
    cleanup_keep_ratio: f32,
    similarity_threshold: f32,

    llm: Arc<dyn LlmClient>,
    llm_options: LlmOptions,
    embedder: Arc<dyn EmbeddingProvider>,
    snapshot_path: std::path::PathBuf,

    state: Mutex<ShortTermState>,
}

impl ShortTermManager {
    /// Create the manager, loading any persisted snapshot. Embeddings are
    /// not stored in the snapshot; loaded rows are re-embedded in one batch.
    pub async fn new(
        config: &MemoryConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let snapshot_path = config.short_term_snapshot_path();
        let memories: Vec<ShortTermMemory> = match snapshot::read(&snapshot_path) {
            Ok(rows) => rows.unwrap_or_default(),
            Err(e) => {
                // A corrupt snapshot costs the short-term state, not startup
                warn!(error = %e, "short-term snapshot unreadable, starting empty");
                Vec::new()
            }
        };

        let manager = Self {
            max_memories: config.short_term_max,
            transfer_threshold: config.short_term_transfer_threshold,
            overflow_strategy: config.short_term_overflow_strategy,
            enable_force_cleanup: config.short_term_enable_force_cleanup,
            cleanup_keep_ratio: config.short_term_cleanup_keep_ratio,
            similarity_threshold: config.search_similarity_threshold,
            llm,
            llm_options: LlmOptions::default()
                .with_timeout(Duration::from_secs(config.llm_timeout_secs)),
            embedder,
            snapshot_path,
            state: Mutex::new(ShortTermState {
                memories,
                matrix: None,
                matrix_ids: Vec::new(),
            }),
        };

        manager.reload_embeddings().await;
        Ok(manager)
    }

    /// Re-embed rows that lost their vectors (fresh start from a snapshot)
    async fn reload_embeddings(&self) {
        let texts: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .memories
                .iter()
                .filter(|m| m.embedding.is_none())
                .map(|m| (m.id.clone(), m.text()))
                .collect()
        };
        if texts.is_empty() {
            return;
        }

        let contents: Vec<String> = texts.iter().map(|(_, t)| t.clone()).collect();
        match self.embedder.embed_batch(&contents).await {
            Ok(vectors) if vectors.len() == texts.len() => {
                let mut state = self.state.lock().await;
                for ((id, _), vector) in texts.into_iter().zip(vectors) {
                    if let Some(pos) = state.find(&id) {
                        state.memories[pos].embedding = Some(vector);
                    }
                }
                state.invalidate_matrix();
            }
            Ok(_) => warn!("short-term re-embedding returned wrong count"),
            Err(e) => warn!(error = %e, "short-term re-embedding failed, rows stay lexical"),
        }
    }

    /// Distill a promoted block into the store.
    ///
    /// Runs one extraction call, then a decision call against the most
    /// similar existing rows. Returns the resulting row, or `None` when the
    /// decision was a discard. An unrecoverable LLM failure is an error so
    /// the caller can leave the block in the perceptual tier for retry.
    pub async fn add_from_block(&self, block: &MemoryBlock) -> Result<Option<ShortTermMemory>> {
        let extracted = self.extract_structured(block).await?;
        let decision = self.decide_operation(&extracted).await;
        debug!(op = ?decision.op, reasoning = %decision.reasoning, "short-term decision");

        let result = self.execute_decision(extracted, decision).await;
        self.save_snapshot().await?;
        Ok(result)
    }

    async fn extract_structured(&self, block: &MemoryBlock) -> Result<ShortTermMemory> {
        let prompt = extraction_prompt(&block.combined_text());
        let response = match complete_with_timeout(self.llm.as_ref(), &prompt, &self.llm_options)
            .await
        {
            Ok(r) => r,
            Err(first_err) => {
                // One retry with a simplified prompt before giving up
                warn!(error = %first_err, "extraction failed, retrying with simplified prompt");
                let simplified = simplified_extraction_prompt(&block.combined_text());
                complete_with_timeout(self.llm.as_ref(), &simplified, &self.llm_options).await?
            }
        };

        let data = match parse_lenient(&response) {
            Ok(value) => value,
            Err(_) => {
                debug!(raw = %response.chars().take(200).collect::<String>(), "unparseable extraction");
                let simplified = simplified_extraction_prompt(&block.combined_text());
                let retry =
                    complete_with_timeout(self.llm.as_ref(), &simplified, &self.llm_options)
                        .await?;
                parse_lenient(&retry)?
            }
        };

        let subject = string_field(&data, "subject").unwrap_or_else(|| "unknown".to_string());
        let topic = string_field(&data, "topic")
            .unwrap_or_else(|| block.combined_text().chars().take(50).collect());

        let mut memory = ShortTermMemory {
            id: ShortTermMemory::fresh_id(),
            chat_id: block.chat_id.clone(),
            subject,
            memory_type: data
                .get("memory_type")
                .and_then(Value::as_str)
                .map(MemoryKind::parse)
                .unwrap_or(MemoryKind::Other),
            topic,
            object: string_field(&data, "object"),
            attributes: attributes_field(&data),
            importance: data
                .get("importance")
                .and_then(Value::as_f64)
                .map(|v| v as f32)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            embedding: None,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_count: 0,
            source_block_ids: vec![block.id],
        };

        // An embedding failure leaves the row searchable via the lexical path
        match self.embedder.embed(&memory.text()).await {
            Ok(vector) => memory.embedding = Some(vector),
            Err(e) => warn!(error = %e, "short-term embedding failed, row stays lexical"),
        }

        Ok(memory)
    }

    async fn decide_operation(&self, candidate: &ShortTermMemory) -> ShortTermDecision {
        let similar = self.find_similar(candidate, 5).await;
        if similar.is_empty() {
            return ShortTermDecision {
                op: ShortTermOp::CreateNew,
                target_id: None,
                memory_fields: None,
                reasoning: "no similar rows".to_string(),
            };
        }

        let prompt = decision_prompt(candidate, &similar);
        let response =
            match complete_with_timeout(self.llm.as_ref(), &prompt, &self.llm_options).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "decision call failed, defaulting to create");
                    return ShortTermDecision {
                        op: ShortTermOp::CreateNew,
                        target_id: None,
                        memory_fields: None,
                        reasoning: format!("decision call failed: {}", e),
                    };
                }
            };

        match parse_lenient(&response) {
            Ok(data) => ShortTermDecision {
                op: data
                    .get("op")
                    .or_else(|| data.get("operation"))
                    .and_then(Value::as_str)
                    .map(ShortTermOp::parse)
                    .unwrap_or(ShortTermOp::CreateNew),
                target_id: string_field(&data, "target_id"),
                memory_fields: data.get("memory_fields").cloned(),
                reasoning: string_field(&data, "reasoning").unwrap_or_default(),
            },
            Err(_) => {
                debug!(raw = %response.chars().take(200).collect::<String>(), "unparseable decision");
                ShortTermDecision {
                    op: ShortTermOp::CreateNew,
                    target_id: None,
                    memory_fields: None,
                    reasoning: "decision parse failed".to_string(),
                }
            }
        }
    }

    async fn execute_decision(
        &self,
        mut candidate: ShortTermMemory,
        decision: ShortTermDecision,
    ) -> Option<ShortTermMemory> {
        let mut state = self.state.lock().await;

        match decision.op {
            ShortTermOp::Discard => {
                debug!(reasoning = %decision.reasoning, "discarding low-value memory");
                None
            }

            ShortTermOp::CreateNew => {
                state.memories.push(candidate.clone());
                state.invalidate_matrix();
                Some(candidate)
            }

            ShortTermOp::Merge | ShortTermOp::Update => {
                let target_pos = decision.target_id.as_deref().and_then(|id| state.find(id));
                let Some(pos) = target_pos else {
                    // Missing target falls back to a create; the cache is
                    // invalidated on this path too (contract)
                    warn!(target_id = ?decision.target_id, "decision target missing, creating new row");
                    state.memories.push(candidate.clone());
                    state.invalidate_matrix();
                    return Some(candidate);
                };

                let fields = decision.memory_fields.as_ref();
                {
                    let target = &mut state.memories[pos];
                    if let Some(fields) = fields {
                        apply_memory_fields(target, fields);
                    }
                    if decision.op == ShortTermOp::Merge {
                        // A merge absorbs the candidate's lineage and keeps
                        // the richer importance
                        target.importance = target.importance.max(candidate.importance);
                        for (key, value) in candidate.attributes.drain() {
                            target.attributes.entry(key).or_insert(value);
                        }
                    }
                    target.source_block_ids.append(&mut candidate.source_block_ids);
                    target.mark_accessed();
                }

                let text = state.memories[pos].text();
                let embedding = match self.embedder.embed(&text).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!(error = %e, "re-embedding after mutation failed");
                        None
                    }
                };
                state.memories[pos].embedding = embedding;
                state.invalidate_matrix();
                Some(state.memories[pos].clone())
            }
        }
    }

    async fn find_similar(
        &self,
        candidate: &ShortTermMemory,
        top_k: usize,
    ) -> Vec<(ShortTermMemory, f32)> {
        let Some(query) = candidate.embedding.clone() else {
            return Vec::new();
        };

        let mut state = self.state.lock().await;
        Self::ensure_matrix(&mut state);

        let Some(matrix) = state.matrix.as_ref() else {
            return Vec::new();
        };
        let sims = batch_cosine_similarity(&query, matrix);

        let mut scored: Vec<(ShortTermMemory, f32)> = state
            .matrix_ids
            .iter()
            .zip(sims)
            .filter_map(|(id, sim)| {
                state
                    .find(id)
                    .map(|pos| (state.memories[pos].clone(), sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    fn ensure_matrix(state: &mut ShortTermState) {
        if state.matrix.is_some() {
            return;
        }
        let mut matrix = Vec::new();
        let mut ids = Vec::new();
        for memory in &state.memories {
            if let Some(embedding) = &memory.embedding {
                matrix.push(embedding.clone());
                ids.push(memory.id.clone());
            }
        }
        if matrix.is_empty() {
            state.matrix = None;
            state.matrix_ids.clear();
        } else {
            state.matrix = Some(matrix);
            state.matrix_ids = ids;
        }
    }

    /// Search rows by cosine over the cached matrix, lexical fallback for
    /// rows without a vector. Hits update access stats.
    pub async fn search_memories(
        &self,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<ShortTermMemory>> {
        let query_embedding = match self.embedder.embed(query_text).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "query embedding failed, lexical search only");
                None
            }
        };

        let mut state = self.state.lock().await;
        Self::ensure_matrix(&mut state);

        let mut scored: Vec<(String, f32)> = Vec::new();

        if let (Some(query), Some(matrix)) = (&query_embedding, state.matrix.as_ref()) {
            for (id, sim) in state.matrix_ids.iter().zip(batch_cosine_similarity(query, matrix)) {
                if sim >= self.similarity_threshold {
                    scored.push((id.clone(), sim));
                }
            }
        }

        // Rows without an embedding still participate lexically
        for memory in &state.memories {
            if memory.embedding.is_none() {
                let sim = jaccard_similarity(query_text, &memory.text());
                if sim >= self.similarity_threshold {
                    scored.push((memory.id.clone(), sim));
                }
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        let mut results = Vec::with_capacity(scored.len());
        for (id, _) in scored {
            if let Some(pos) = state.find(&id) {
                state.memories[pos].mark_accessed();
                results.push(state.memories[pos].clone());
            }
        }
        Ok(results)
    }

    /// Promotion candidates. The store promotes only at full occupancy:
    /// `transfer_all` stages every row, `selective_cleanup` stages the
    /// high-importance ones.
    pub async fn get_memories_for_transfer(&self) -> Vec<ShortTermMemory> {
        let state = self.state.lock().await;
        if self.max_memories == 0 || state.memories.len() < self.max_memories {
            return Vec::new();
        }

        match self.overflow_strategy {
            OverflowStrategy::TransferAll => state.memories.clone(),
            OverflowStrategy::SelectiveCleanup => state
                .memories
                .iter()
                .filter(|m| m.importance >= self.transfer_threshold)
                .cloned()
                .collect(),
        }
    }

    /// Remove successfully transferred rows, then apply the overflow policy:
    /// leftover rows below the importance threshold are deleted (under
    /// `selective_cleanup` they were never transferred at all).
    pub async fn clear_transferred(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.memories.len();
        state.memories.retain(|m| !ids.contains(&m.id));
        let transferred = before - state.memories.len();

        let deleted = {
            let threshold = self.transfer_threshold;
            let before = state.memories.len();
            // Only runs in the overflow context: an under-capacity store has
            // no transferred ids to clear
            if transferred > 0 {
                state.memories.retain(|m| m.importance >= threshold);
            }
            before - state.memories.len()
        };

        state.invalidate_matrix();
        debug!(transferred, deleted, "cleared transferred short-term rows");
        drop(state);

        self.force_cleanup_overflow().await?;
        self.save_snapshot().await
    }

    /// Pressure relief: when over capacity, delete the lowest
    /// `(importance, created_at)` rows down to `max * keep_ratio`.
    /// Returns how many rows were dropped.
    pub async fn force_cleanup_overflow(&self) -> Result<usize> {
        if !self.enable_force_cleanup || self.max_memories == 0 {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        let current = state.memories.len();
        if current <= self.max_memories {
            return Ok(0);
        }

        let keep = (self.max_memories as f32 * self.cleanup_keep_ratio).floor() as usize;
        let remove_count = current.saturating_sub(keep);

        let mut order: Vec<(String, f32, DateTime<Utc>)> = state
            .memories
            .iter()
            .map(|m| (m.id.clone(), m.importance, m.created_at))
            .collect();
        order.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        let doomed: Vec<String> = order.into_iter().take(remove_count).map(|(id, _, _)| id).collect();

        state.memories.retain(|m| !doomed.contains(&m.id));
        state.invalidate_matrix();
        warn!(removed = doomed.len(), remaining = state.memories.len(), "short-term pressure relief");
        Ok(doomed.len())
    }

    /// Current row count
    pub async fn len(&self) -> usize {
        self.state.lock().await.memories.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.memories.is_empty()
    }

    /// Occupancy in [0, 1] against the configured maximum
    pub async fn occupancy(&self) -> f32 {
        if self.max_memories == 0 {
            return 0.0;
        }
        self.state.lock().await.memories.len() as f32 / self.max_memories as f32
    }

    /// Snapshot of all rows (tests and statistics)
    pub async fn all_memories(&self) -> Vec<ShortTermMemory> {
        self.state.lock().await.memories.clone()
    }

    /// Insert a prepared row directly, bypassing the LLM flow (snapshot
    /// restore and tests)
    pub async fn insert_direct(&self, memory: ShortTermMemory) {
        let mut state = self.state.lock().await;
        state.memories.push(memory);
        state.invalidate_matrix();
    }

    /// Tier statistics
    pub async fn statistics(&self) -> ShortTermStatistics {
        let state = self.state.lock().await;
        let total = state.memories.len();
        let avg_importance = if total == 0 {
            0.0
        } else {
            state.memories.iter().map(|m| m.importance).sum::<f32>() / total as f32
        };
        ShortTermStatistics {
            total_memories: total,
            max_memories: self.max_memories,
            avg_importance,
            total_access_count: state.memories.iter().map(|m| m.access_count).sum(),
        }
    }

    /// Persist the row set (embeddings are stripped by serde)
    pub async fn save_snapshot(&self) -> Result<()> {
        let state = self.state.lock().await;
        snapshot::write_atomic(&self.snapshot_path, &state.memories)
    }
}

/// Counters reported by [`ShortTermManager::statistics`]
#[derive(Debug, Clone, Serialize)]
pub struct ShortTermStatistics {
    pub total_memories: usize,
    pub max_memories: usize,
    pub avg_importance: f32,
    pub total_access_count: u32,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn attributes_field(value: &Value) -> HashMap<String, String> {
    value
        .get("attributes")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if rendered.is_empty() {
                        None
                    } else {
                        Some((k.clone(), rendered))
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn apply_memory_fields(target: &mut ShortTermMemory, fields: &Value) {
    if let Some(subject) = string_field(fields, "subject") {
        target.subject = subject;
    }
    if let Some(topic) = string_field(fields, "topic") {
        target.topic = topic;
    }
    if let Some(object) = string_field(fields, "object") {
        target.object = Some(object);
    }
    if let Some(kind) = fields.get("memory_type").and_then(Value::as_str) {
        target.memory_type = MemoryKind::parse(kind);
    }
    if let Some(importance) = fields.get("importance").and_then(Value::as_f64) {
        target.importance = (importance as f32).clamp(0.0, 1.0);
    }
    for (key, value) in attributes_field(fields) {
        target.attributes.insert(key, value);
    }
}

fn extraction_prompt(block_text: &str) -> String {
    format!(
        r#"You are a memory extraction expert. Distill the conversation below into one structured memory.

**Conversation:**
```
{}
```

**Task:**
1. Identify the subject (who), topic (what happened / what is asserted), and object (about whom/what).
2. Classify the memory type: fact, opinion, relation, event, or other.
3. Rate long-term importance from 0.0 to 1.0.
4. Capture remaining details (time, place, ...) as attributes.

**Output (JSON only):**
```json
{{
  "subject": "...",
  "topic": "...",
  "object": "...",
  "memory_type": "fact",
  "importance": 0.7,
  "attributes": {{"time": "..."}}
}}
```"#,
        block_text
    )
}

fn simplified_extraction_prompt(block_text: &str) -> String {
    format!(
        "Summarize this conversation as JSON with keys subject, topic, memory_type \
         (fact/opinion/relation/event/other) and importance (0.0-1.0). Output JSON only.\n\n{}",
        block_text
    )
}

fn decision_prompt(candidate: &ShortTermMemory, similar: &[(ShortTermMemory, f32)]) -> String {
    let existing = similar
        .iter()
        .enumerate()
        .map(|(i, (m, sim))| {
            format!(
                "{}. (id: {}, importance: {:.2}, similarity: {:.2}) {}",
                i + 1,
                m.id,
                m.importance,
                sim,
                m.text()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a memory curator. A new memory arrived; decide how to fold it into the existing set.

**New memory:**
{}

**Existing similar memories:**
{}

**Ops:**
- create_new: independent information, keep as a new row
- merge: highly overlapping with one existing row (set target_id)
- update: corrects or extends one existing row (set target_id)
- discard: worthless or an exact duplicate

**Output (JSON only):**
```json
{{
  "op": "create_new | merge | update | discard",
  "target_id": "id when merging or updating",
  "memory_fields": {{"subject": "...", "topic": "...", "importance": 0.7}},
  "reasoning": "..."
}}
```"#,
        candidate.text(),
        existing
    )
}
