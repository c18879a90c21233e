//! Unified coordinator over the three memory tiers
//!
//! The coordinator is the single process-wide handle. Its lifecycle is a
//! strict init → run → shutdown: `new` wires the tiers, `start` launches the
//! auto-transfer loop, `shutdown` drains it and persists state.
//!
//! Per chat, content moves through the tiers as
//! `accumulating → short-term ingest → transfer pending → idle`: messages
//! accumulate in perceptual blocks, recalled blocks promote into the
//! short-term store, and a full short-term store transfers wholesale into
//! the long-term graph.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::judge::Judge;
use crate::llm::LlmClient;
use crate::long_term::{LongTermManager, TransferResult};
use crate::message::Message;
use crate::perceptual::{MemoryBlock, PerceptualManager, PerceptualStatistics};
use crate::retrieval::{
    mention_score, relation_score, render_memory, InterestScorer, RetrievalResult,
};
use crate::short_term::{ShortTermManager, ShortTermStatistics};
use crate::storage::Memory;

/// Weight decay per extra query in a multi-query search
const MULTI_QUERY_WEIGHT_DECAY: f32 = 0.1;

/// Floor for multi-query weights
const MULTI_QUERY_WEIGHT_MIN: f32 = 0.3;

/// The process-wide memory engine handle
pub struct UnifiedMemoryManager {
    config: MemoryConfig,
    perceptual: Arc<PerceptualManager>,
    short_term: Arc<ShortTermManager>,
    long_term: Arc<LongTermManager>,
    judge: Judge,
    interest: InterestScorer,

    /// Bounds the long-term fan-out of a multi-query search
    search_limit: Arc<Semaphore>,

    /// Single in-flight transfer batch at a time
    transfer_lock: Arc<Mutex<()>>,

    /// Wakes the auto-transfer loop after promotions
    wakeup: Arc<Notify>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    auto_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UnifiedMemoryManager {
    /// Wire up all three tiers. Heavy resources (graph, vector index,
    /// snapshots) load here; nothing background runs until [`Self::start`].
    pub async fn new(
        config: MemoryConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config
            .ensure_dirs()
            .map_err(crate::error::Error::from)?;

        let perceptual = Arc::new(PerceptualManager::new(&config, embedder.clone())?);
        let short_term =
            Arc::new(ShortTermManager::new(&config, llm.clone(), embedder.clone()).await?);
        let long_term = Arc::new(LongTermManager::new(&config, llm.clone(), embedder).await?);
        let judge = Judge::new(&config, llm.clone());
        let interest = InterestScorer::new(&config, llm);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let search_limit = Arc::new(Semaphore::new(config.llm_max_inflight.max(1)));

        info!(data_dir = %config.data_dir.display(), "memory engine initialized");
        Ok(Self {
            config,
            perceptual,
            short_term,
            long_term,
            judge,
            interest,
            search_limit,
            transfer_lock: Arc::new(Mutex::new(())),
            wakeup: Arc::new(Notify::new()),
            shutdown_tx,
            shutdown_rx,
            auto_task: std::sync::Mutex::new(None),
        })
    }

    /// Launch the auto-transfer loop. Idempotent.
    pub fn start(&self) {
        let mut slot = self.auto_task.lock().unwrap();
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            warn!("auto-transfer loop already running");
            return;
        }

        let loop_state = TransferLoop {
            short_term: self.short_term.clone(),
            long_term: self.long_term.clone(),
            transfer_lock: self.transfer_lock.clone(),
            wakeup: self.wakeup.clone(),
            base_interval: self.config.long_term_auto_transfer_interval,
        };
        let shutdown_rx = self.shutdown_rx.clone();
        *slot = Some(tokio::spawn(async move {
            loop_state.run(shutdown_rx).await;
        }));
        // First check runs immediately rather than after a full interval
        self.wakeup.notify_one();
        debug!("auto-transfer loop started");
    }

    /// Get the perceptual tier
    pub fn perceptual(&self) -> &Arc<PerceptualManager> {
        &self.perceptual
    }

    /// Get the short-term tier
    pub fn short_term(&self) -> &Arc<ShortTermManager> {
        &self.short_term
    }

    /// Get the long-term tier
    pub fn long_term(&self) -> &Arc<LongTermManager> {
        &self.long_term
    }

    // ==================== write path ====================

    /// Append a message to the perceptual tier. Never blocks on the LLM or
    /// embedding gateways; all heavy work happens in the transfer loop.
    pub async fn add_message(&self, message: Message) -> Result<Option<Uuid>> {
        self.perceptual.add_message(message).await
    }

    // ==================== read path ====================

    /// Retrieve memories for a query across all three tiers.
    ///
    /// Perceptual and short-term search run in parallel. The judge then
    /// decides whether the long-term graph is needed; with `use_judge` off
    /// the graph is always consulted. Blocks that crossed their activation
    /// threshold are promoted in the background, never on this call path.
    pub async fn search_memories(
        &self,
        query: &str,
        use_judge: bool,
        recent_chat_history: &str,
    ) -> Result<RetrievalResult> {
        let (blocks, short_hits) = tokio::join!(
            self.perceptual
                .recall_blocks(query, self.config.perceptual_recall_top_k, None),
            self.short_term.search_memories(query, self.config.search_top_k),
        );

        let blocks = blocks.unwrap_or_else(|e| {
            warn!(error = %e, "perceptual recall failed");
            Vec::new()
        });
        let short_hits = short_hits.unwrap_or_else(|e| {
            warn!(error = %e, "short-term search failed");
            Vec::new()
        });

        // Promotion is deferred to the background so retrieval never waits
        // on the LLM
        let to_promote: Vec<MemoryBlock> = blocks
            .iter()
            .filter(|r| r.block.needs_transfer)
            .map(|r| r.block.clone())
            .collect();
        if !to_promote.is_empty() {
            debug!(count = to_promote.len(), "scheduling block promotion");
            let perceptual = self.perceptual.clone();
            let short_term = self.short_term.clone();
            let wakeup = self.wakeup.clone();
            tokio::spawn(async move {
                promote_blocks(&perceptual, &short_term, &wakeup, to_promote).await;
            });
        }

        let mut result = RetrievalResult {
            perceptual_blocks: blocks,
            short_term: short_hits,
            long_term: Vec::new(),
            judge: None,
        };

        let (need_long_term, supplemental) = if use_judge {
            let decision = self
                .judge
                .evaluate(
                    query,
                    &result.perceptual_blocks,
                    &result.short_term,
                    recent_chat_history,
                )
                .await;
            let skip = decision.sufficient
                && decision.confidence >= self.config.judge_confidence_threshold;
            let supplemental = decision.supplemental_queries.clone();
            result.judge = Some(decision);
            (!skip, supplemental)
        } else {
            (true, Vec::new())
        };

        if need_long_term {
            let base = self.judge.refine_query(query, recent_chat_history).await;
            let mut queries = vec![base];
            queries.extend(supplemental);
            let weighted = build_manual_multi_queries(&queries);

            result.long_term = self
                .retrieve_long_term(query, weighted, self.config.search_top_k)
                .await;
        }

        Ok(result)
    }

    /// Fan out one weighted search per query, merge by memory id with
    /// weight-summed scores, then order by the composite of summed score,
    /// interest match, mention, and relation signals.
    async fn retrieve_long_term(
        &self,
        original_query: &str,
        weighted_queries: Vec<(String, f32)>,
        top_k: usize,
    ) -> Vec<(Memory, f32)> {
        let searches = weighted_queries.into_iter().map(|(query, weight)| {
            let long_term = &self.long_term;
            let search_limit = &self.search_limit;
            async move {
                let _permit = search_limit.acquire().await;
                let hits = long_term
                    .search_scored(&query, top_k, &[])
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, query, "long-term search failed");
                        Vec::new()
                    });
                (weight, hits)
            }
        });
        let per_query = futures::future::join_all(searches).await;

        let mut merged: HashMap<Uuid, (Memory, f32)> = HashMap::new();
        for (weight, hits) in per_query {
            for (memory, score) in hits {
                merged
                    .entry(memory.id)
                    .and_modify(|(_, total)| *total += weight * score)
                    .or_insert((memory, weight * score));
            }
        }

        let candidates: Vec<Memory> = merged.values().map(|(m, _)| m.clone()).collect();
        let graph = self.long_term.graph();
        let graph = graph.read().await;

        let scored = futures::future::join_all(merged.into_values().map(|(memory, base)| {
            let text = render_memory(&graph, &memory);
            let candidates = &candidates;
            let interest = &self.interest;
            async move {
                let interest_score = interest
                    .calculate_interest_match(original_query, &text)
                    .await;
                let composite = base
                    + interest_score
                    + mention_score(original_query, &text)
                    + relation_score(&memory, candidates);
                (memory, composite)
            }
        }))
        .await;
        drop(graph);

        let mut scored = scored;
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    // ==================== promotion and transfer ====================

    /// Manually trigger a transfer. Like the loop, it only fires at full
    /// occupancy; returns `None` when there was nothing to do.
    pub async fn manual_transfer(&self) -> Result<Option<TransferResult>> {
        if self.short_term.occupancy().await < 1.0 {
            debug!("short-term store not full, manual transfer skipped");
            return Ok(None);
        }
        run_transfer_once(&self.short_term, &self.long_term, &self.transfer_lock).await
    }

    // ==================== lifecycle ====================

    /// Aggregate statistics across all tiers
    pub async fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            perceptual: self.perceptual.statistics().await,
            short_term: self.short_term.statistics().await,
            long_term: self.long_term.statistics().await,
        }
    }

    /// Stop the background loop, wait for any in-flight transfer, flush
    /// pending embeddings, and persist short-term state.
    pub async fn shutdown(&self) -> Result<()> {
        info!("memory engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let task = self.auto_task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(30), task)
                .await
                .is_err()
            {
                warn!("auto-transfer loop did not stop in time");
            }
        }

        // Wait for an in-flight transfer to drain (bounded)
        let _ = tokio::time::timeout(Duration::from_secs(30), self.transfer_lock.lock()).await;

        self.long_term.shutdown().await?;
        self.short_term.save_snapshot().await?;
        info!("memory engine shut down");
        Ok(())
    }
}

/// Aggregated statistics over the three tiers
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatistics {
    pub perceptual: PerceptualStatistics,
    pub short_term: ShortTermStatistics,
    pub long_term: crate::long_term::LongTermStatistics,
}

/// Everything the background transfer loop needs, detached from the
/// coordinator so the spawned task owns its handles.
struct TransferLoop {
    short_term: Arc<ShortTermManager>,
    long_term: Arc<LongTermManager>,
    transfer_lock: Arc<Mutex<()>>,
    wakeup: Arc<Notify>,
    base_interval: u64,
}

impl TransferLoop {
    /// Poll short-term occupancy on an adaptive interval and transfer the
    /// whole store once it fills.
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let occupancy = self.short_term.occupancy().await;
            let interval = sleep_interval(self.base_interval, occupancy);

            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            if self.short_term.occupancy().await < 1.0 {
                continue;
            }
            if let Err(e) =
                run_transfer_once(&self.short_term, &self.long_term, &self.transfer_lock).await
            {
                warn!(error = %e, "auto transfer failed");
            }
        }
        debug!("auto-transfer loop stopped");
    }
}

/// One transfer batch, guarded so only a single batch is in flight.
async fn run_transfer_once(
    short_term: &ShortTermManager,
    long_term: &LongTermManager,
    transfer_lock: &Mutex<()>,
) -> Result<Option<TransferResult>> {
    let Ok(_guard) = transfer_lock.try_lock() else {
        debug!("transfer already in flight, skipping");
        return Ok(None);
    };

    let batch = short_term.get_memories_for_transfer().await;
    if batch.is_empty() {
        return Ok(None);
    }

    info!(count = batch.len(), "short-term store full, transferring to long-term");
    let result = long_term.transfer_from_short_term(batch).await?;
    short_term.clear_transferred(&result.transferred_ids).await?;
    Ok(Some(result))
}

/// Promote recalled blocks into the short-term tier. A block whose
/// distillation fails stays in the perceptual tier for a later retry.
async fn promote_blocks(
    perceptual: &PerceptualManager,
    short_term: &ShortTermManager,
    wakeup: &Notify,
    blocks: Vec<MemoryBlock>,
) {
    let mut promoted = 0usize;
    for block in blocks {
        match short_term.add_from_block(&block).await {
            // A discard decision still consumes the block
            Ok(_) => match perceptual.remove_block(block.id).await {
                Ok(_) => promoted += 1,
                Err(e) => warn!(block_id = %block.id, error = %e, "failed to drop promoted block"),
            },
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "block promotion failed, leaving in place");
            }
        }
    }

    if promoted > 0 {
        debug!(promoted, "blocks promoted to short-term");
        wakeup.notify_one();
    }
}

/// Strip, dedupe, and weight supplemental queries in one pass:
/// the i-th distinct query gets weight `max(0.3, 1.0 − i·0.1)`.
fn build_manual_multi_queries(queries: &[String]) -> Vec<(String, f32)> {
    let mut seen = std::collections::HashSet::new();
    let mut weighted = Vec::new();

    for raw in queries {
        let text = raw.trim();
        if text.is_empty() || !seen.insert(text.to_string()) {
            continue;
        }
        let weight =
            (1.0 - weighted.len() as f32 * MULTI_QUERY_WEIGHT_DECAY).max(MULTI_QUERY_WEIGHT_MIN);
        weighted.push((text.to_string(), weight));
    }

    weighted
}

/// Adaptive sleep for the transfer loop: the fuller the short-term store,
/// the shorter the wait.
fn sleep_interval(base_secs: u64, occupancy: f32) -> Duration {
    let base = base_secs as f64;
    let table: [(f32, f64, f64); 4] = [
        (0.8, 2.0, 0.1),
        (0.5, 5.0, 0.2),
        (0.3, 10.0, 0.4),
        (0.1, 15.0, 0.6),
    ];

    for (threshold, min_secs, factor) in table {
        if occupancy >= threshold {
            return Duration::from_secs_f64((base * factor).max(min_secs));
        }
    }
    Duration::from_secs_f64(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_query_weights_decay_linearly() {
        let queries = vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let weighted = build_manual_multi_queries(&queries);
        assert_eq!(weighted.len(), 3);
        assert!((weighted[0].1 - 1.0).abs() < 1e-6);
        assert!((weighted[1].1 - 0.9).abs() < 1e-6);
        assert!((weighted[2].1 - 0.8).abs() < 1e-6);
    }

    #[test]
    fn multi_query_weights_floor_at_point_three() {
        let queries: Vec<String> = (0..12).map(|i| format!("query {}", i)).collect();
        let weighted = build_manual_multi_queries(&queries);
        assert!((weighted.last().unwrap().1 - 0.3).abs() < 1e-6);
    }

    #[test]
    fn multi_query_strips_and_dedupes_in_one_pass() {
        let queries = vec![
            "  alice  ".to_string(),
            "alice".to_string(),
            String::new(),
            "bob".to_string(),
        ];
        let weighted = build_manual_multi_queries(&queries);
        assert_eq!(weighted.len(), 2);
        assert_eq!(weighted[0].0, "alice");
        assert_eq!(weighted[1].0, "bob");
        assert!((weighted[1].1 - 0.9).abs() < 1e-6);
    }

    fn close_to(d: Duration, secs: f64) -> bool {
        (d.as_secs_f64() - secs).abs() < 1e-6
    }

    #[test]
    fn sleep_interval_table() {
        let base = 180;
        assert!(close_to(sleep_interval(base, 0.9), 18.0));
        assert!(close_to(sleep_interval(base, 0.6), 36.0));
        assert!(close_to(sleep_interval(base, 0.4), 72.0));
        assert!(close_to(sleep_interval(base, 0.2), 108.0));
        assert!(close_to(sleep_interval(base, 0.05), 180.0));
    }

    #[test]
    fn sleep_interval_respects_minimums() {
        // A small base interval still polls no faster than the table minima
        assert!(close_to(sleep_interval(10, 0.9), 2.0));
        assert!(close_to(sleep_interval(10, 0.6), 5.0));
    }
}
