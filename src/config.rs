//! Configuration for the three-tier memory engine

use std::path::PathBuf;

/// Strategy applied when the short-term store reaches capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Transfer the entire set, then delete rows below the importance threshold
    TransferAll,

    /// Transfer only high-importance rows, delete the rest without transfer
    SelectiveCleanup,
}

/// How scores are combined when two paths reach the same node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Geometric mean of the two scores with a 1.2 bonus
    WeightedGeometric,

    /// Maximum of the two scores with a 1.3 bonus
    MaxBonus,
}

/// Edge-type weights and final scoring weights for path expansion
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Maximum number of hops from a seed node
    pub max_hops: usize,

    /// Damping factor applied per hop
    pub damping_factor: f32,

    /// Base branch budget per node
    pub max_branches_per_node: usize,

    /// Merge rule when a node is reached twice with similar scores
    pub merge_strategy: MergeStrategy,

    /// Paths below `pruning_threshold * max_score_this_hop` are dropped
    pub pruning_threshold: f32,

    /// Weight per edge type: (reference, attribute, has_property, relation,
    /// temporal, core_relation, default)
    pub edge_type_weights: EdgeTypeWeights,

    /// Final score = w_path * path + w_importance * importance + w_recency * recency
    pub path_weight: f32,
    pub importance_weight: f32,
    pub recency_weight: f32,
}

/// Per-edge-type multipliers used during propagation
#[derive(Debug, Clone)]
pub struct EdgeTypeWeights {
    pub reference: f32,
    pub attribute: f32,
    pub has_property: f32,
    pub relation: f32,
    pub temporal: f32,
    pub core_relation: f32,
    pub default: f32,
}

impl Default for EdgeTypeWeights {
    fn default() -> Self {
        Self {
            reference: 0.8,
            attribute: 0.9,
            has_property: 0.9,
            relation: 1.0,
            temporal: 0.7,
            core_relation: 1.2,
            default: 0.6,
        }
    }
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            damping_factor: 0.85,
            max_branches_per_node: 10,
            merge_strategy: MergeStrategy::WeightedGeometric,
            pruning_threshold: 0.3,
            edge_type_weights: EdgeTypeWeights::default(),
            path_weight: 0.6,
            importance_weight: 0.2,
            recency_weight: 0.2,
        }
    }
}

/// Configuration for the memory engine
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    // Perceptual tier
    /// Maximum blocks held per chat before the oldest is evicted
    pub perceptual_max_blocks: usize,

    /// Messages per block
    pub perceptual_block_size: usize,

    /// Recall count at which a block is marked for promotion
    pub perceptual_activation_threshold: u32,

    /// Minimum activation score for a recall to count
    pub perceptual_recall_threshold: f32,

    /// Maximum blocks returned by one recall
    pub perceptual_recall_top_k: usize,

    // Short-term tier
    /// Hard upper bound on short-term rows
    pub short_term_max: usize,

    /// Importance threshold used by the overflow policies
    pub short_term_transfer_threshold: f32,

    /// Policy applied after a full-capacity transfer
    pub short_term_overflow_strategy: OverflowStrategy,

    /// Enables pressure relief when over capacity
    pub short_term_enable_force_cleanup: bool,

    /// Fraction of capacity kept by pressure relief
    pub short_term_cleanup_keep_ratio: f32,

    // Long-term tier
    /// Short-term rows processed per transfer sub-batch
    pub long_term_batch_size: usize,

    /// Per-day activation decay factor
    pub long_term_decay_factor: f32,

    /// Base auto-transfer poll interval in seconds
    pub long_term_auto_transfer_interval: u64,

    // Retrieval
    /// Default result count for searches
    pub search_top_k: usize,

    /// Minimum similarity for short-term / vector hits
    pub search_similarity_threshold: f32,

    /// Judge confidence at or above which long-term search is skipped
    pub judge_confidence_threshold: f32,

    /// Path expansion parameters
    pub expansion: ExpansionConfig,

    // Gateways and background work
    /// Nodes accumulated before a batched embedding flush
    pub embed_batch_size: usize,

    /// Concurrent in-flight LLM calls
    pub llm_max_inflight: usize,

    /// Concurrent in-flight embedding calls
    pub embed_max_inflight: usize,

    /// Per-call LLM timeout in seconds
    pub llm_timeout_secs: u64,

    /// Per-call embedding timeout in seconds
    pub embed_timeout_secs: u64,

    /// Interest-matching deadline in milliseconds
    pub interest_timeout_ms: u64,

    /// Gateway retries before an item is recorded as failed
    pub max_retry: u32,

    // Maintenance
    /// Cosine threshold for consolidation merges
    pub consolidation_similarity_threshold: f32,

    /// Only memories created inside this window are consolidated
    pub consolidation_window_hours: i64,

    /// Memories below this activation are candidates for forgetting
    pub forget_activation_threshold: f32,

    /// Memories at or above this importance are never forgotten
    pub forget_min_importance: f32,

    /// Fraction of access strength propagated to adjacent memories
    pub activation_propagation_strength: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("data"))
            .join("memory_graph");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384,
            perceptual_max_blocks: 50,
            perceptual_block_size: 5,
            perceptual_activation_threshold: 3,
            perceptual_recall_threshold: 0.55,
            perceptual_recall_top_k: 5,
            short_term_max: 30,
            short_term_transfer_threshold: 0.6,
            short_term_overflow_strategy: OverflowStrategy::TransferAll,
            short_term_enable_force_cleanup: true,
            short_term_cleanup_keep_ratio: 0.9,
            long_term_batch_size: 10,
            long_term_decay_factor: 0.95,
            long_term_auto_transfer_interval: 180,
            search_top_k: 10,
            search_similarity_threshold: 0.6,
            judge_confidence_threshold: 0.7,
            expansion: ExpansionConfig::default(),
            embed_batch_size: 10,
            llm_max_inflight: 4,
            embed_max_inflight: 4,
            llm_timeout_secs: 60,
            embed_timeout_secs: 15,
            interest_timeout_ms: 1500,
            max_retry: 2,
            consolidation_similarity_threshold: 0.85,
            consolidation_window_hours: 24,
            forget_activation_threshold: 0.1,
            forget_min_importance: 0.7,
            activation_propagation_strength: 0.3,
        }
    }
}

impl MemoryConfig {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Get the path to the short-term snapshot file
    pub fn short_term_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("short_term_memory.json")
    }

    /// Get the path to the perceptual block log for a chat
    pub fn block_log_path(&self, chat_id: &str) -> PathBuf {
        self.data_dir
            .join("blocks")
            .join(format!("{}.jsonl", chat_id))
    }

    /// Get the path to the graph database
    pub fn graph_db_path(&self) -> PathBuf {
        self.data_dir.join("graph").join("graph.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vector")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("blocks"))?;
        std::fs::create_dir_all(self.data_dir.join("graph"))?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}

impl OverflowStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer_all" => Some(Self::TransferAll),
            "selective_cleanup" => Some(Self::SelectiveCleanup),
            _ => None,
        }
    }
}

impl std::fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowStrategy::TransferAll => write!(f, "transfer_all"),
            OverflowStrategy::SelectiveCleanup => write!(f, "selective_cleanup"),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::WeightedGeometric => write!(f, "weighted_geometric"),
            MergeStrategy::MaxBonus => write!(f, "max_bonus"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert_eq!(config.perceptual_max_blocks, 50);
        assert_eq!(config.perceptual_block_size, 5);
        assert_eq!(config.perceptual_activation_threshold, 3);
        assert_eq!(config.short_term_max, 30);
        assert_eq!(config.long_term_auto_transfer_interval, 180);
        assert!((config.short_term_transfer_threshold - 0.6).abs() < f32::EPSILON);
        assert!((config.long_term_decay_factor - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.short_term_overflow_strategy, OverflowStrategy::TransferAll);
    }

    #[test]
    fn expansion_defaults() {
        let exp = ExpansionConfig::default();
        assert_eq!(exp.max_hops, 2);
        assert!((exp.damping_factor - 0.85).abs() < f32::EPSILON);
        assert_eq!(exp.max_branches_per_node, 10);
    }

    #[test]
    fn overflow_strategy_parse() {
        assert_eq!(
            OverflowStrategy::parse("transfer_all"),
            Some(OverflowStrategy::TransferAll)
        );
        assert_eq!(
            OverflowStrategy::parse("selective_cleanup"),
            Some(OverflowStrategy::SelectiveCleanup)
        );
        assert_eq!(OverflowStrategy::parse("bogus"), None);
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let config = MemoryConfig::with_data_dir("/tmp/mem-test");
        assert_eq!(
            config.short_term_snapshot_path(),
            PathBuf::from("/tmp/mem-test/short_term_memory.json")
        );
        assert_eq!(
            config.block_log_path("chat-a"),
            PathBuf::from("/tmp/mem-test/blocks/chat-a.jsonl")
        );
    }
}
