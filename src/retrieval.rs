//! Merged retrieval results and final-stage scoring
//!
//! The coordinator collects hits from all three tiers into a
//! [`RetrievalResult`] that downstream prompt builders consume. Long-term
//! hits get a final composite ordering from three additive signals: an
//! LLM-scored interest match (hard deadline, neutral on expiry), a lexical
//! mention score, and a graph-relation score against the other hits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::judge::JudgeDecision;
use crate::llm::{LlmClient, LlmOptions};
use crate::parse::parse_lenient;
use crate::perceptual::RecalledBlock;
use crate::short_term::ShortTermMemory;
use crate::similarity::jaccard_similarity;
use crate::storage::{GraphStore, Memory};

/// Neutral interest score used when the matcher cannot answer in time
pub const INTEREST_NEUTRAL: f32 = 0.5;

/// Everything one retrieval produced
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Perceptual blocks above the recall threshold
    pub perceptual_blocks: Vec<RecalledBlock>,

    /// Short-term rows above the similarity threshold
    pub short_term: Vec<ShortTermMemory>,

    /// Long-term memories, best first, with their composite scores
    pub long_term: Vec<(Memory, f32)>,

    /// The judge's verdict, when the judge ran
    pub judge: Option<JudgeDecision>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.perceptual_blocks.is_empty()
            && self.short_term.is_empty()
            && self.long_term.is_empty()
    }

    /// Format the result for injection into a prompt
    pub fn format_for_prompt(&self, graph: &GraphStore) -> String {
        let mut parts = Vec::new();

        if !self.perceptual_blocks.is_empty() {
            parts.push("## Recent Conversation\n".to_string());
            for recalled in &self.perceptual_blocks {
                parts.push(format!("{}\n", recalled.block.combined_text()));
            }
        }

        if !self.short_term.is_empty() {
            parts.push("\n## Working Memories\n".to_string());
            for memory in &self.short_term {
                parts.push(format!("- [{}] {}\n", memory.memory_type, memory.text()));
            }
        }

        if !self.long_term.is_empty() {
            parts.push("\n## Long-Term Memories\n".to_string());
            for (memory, _) in &self.long_term {
                parts.push(format!(
                    "- [{}] {}\n",
                    memory.memory_type,
                    render_memory(graph, memory)
                ));
            }
        }

        parts.join("")
    }
}

/// Natural-language rendering of a graph memory from its nodes and edges
pub fn render_memory(graph: &GraphStore, memory: &Memory) -> String {
    let mut parts: Vec<String> = Vec::new();

    for edge_id in &memory.edge_ids {
        if let Some(edge) = graph.get_edge(*edge_id) {
            if let (Some(source), Some(target)) =
                (graph.get_node(edge.source_id), graph.get_node(edge.target_id))
            {
                parts.push(format!(
                    "{} {} {}",
                    source.content, edge.relation_text, target.content
                ));
            }
        }
    }

    if parts.is_empty() {
        parts = memory
            .node_ids
            .iter()
            .filter_map(|id| graph.get_node(*id))
            .map(|n| n.content.clone())
            .collect();
    }

    parts.join("; ")
}

/// LLM-backed interest matcher with a hard deadline
pub struct InterestScorer {
    llm: Arc<dyn LlmClient>,
    options: LlmOptions,
    deadline: Duration,
}

impl InterestScorer {
    pub fn new(config: &MemoryConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            options: LlmOptions::default().with_max_tokens(50),
            deadline: Duration::from_millis(config.interest_timeout_ms),
        }
    }

    /// Score how well a memory matches the query's interest, in [0, 1].
    ///
    /// The call has a hard deadline; on expiry (or any failure) the neutral
    /// 0.5 is returned so the other signals survive.
    pub async fn calculate_interest_match(&self, query: &str, memory_text: &str) -> f32 {
        let prompt = format!(
            "Rate from 0.0 to 1.0 how relevant this memory is to the message. \
             Output only the number.\n\nMessage: {}\nMemory: {}",
            query, memory_text
        );

        let call = self.llm.complete(&prompt, &self.options);
        let response = match tokio::time::timeout(self.deadline, call).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!(error = %e, "interest matching failed, using neutral score");
                return INTEREST_NEUTRAL;
            }
            Err(_) => {
                warn!(deadline = ?self.deadline, "interest matching timed out, using neutral score");
                return INTEREST_NEUTRAL;
            }
        };

        parse_score(&response).unwrap_or(INTEREST_NEUTRAL)
    }
}

fn parse_score(response: &str) -> Option<f32> {
    let trimmed = response.trim();
    if let Ok(score) = trimmed.parse::<f32>() {
        return Some(score.clamp(0.0, 1.0));
    }
    // Tolerate a JSON wrapper like {"score": 0.7}
    if let Ok(value) = parse_lenient(trimmed) {
        if let Some(score) = value.as_f64() {
            return Some((score as f32).clamp(0.0, 1.0));
        }
        if let Some(score) = value.get("score").and_then(serde_json::Value::as_f64) {
            return Some((score as f32).clamp(0.0, 1.0));
        }
    }
    None
}

/// Lexical mention score: token overlap between the query and the memory
pub fn mention_score(query: &str, memory_text: &str) -> f32 {
    jaccard_similarity(query, memory_text)
}

/// Graph-relation score: how strongly a memory shares nodes with the other
/// retrieved memories. A hit that connects to the rest of the result set is
/// worth more than an isolated one.
pub fn relation_score(memory: &Memory, others: &[Memory]) -> f32 {
    if others.is_empty() || memory.node_ids.is_empty() {
        return 0.0;
    }

    let own: HashSet<Uuid> = memory.node_ids.iter().copied().collect();
    let connected = others
        .iter()
        .filter(|other| other.id != memory.id)
        .filter(|other| other.node_ids.iter().any(|id| own.contains(id)))
        .count();
    let peers = others.iter().filter(|o| o.id != memory.id).count();
    if peers == 0 {
        return 0.0;
    }
    connected as f32 / peers as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::storage::MemoryKind;

    fn memory_with_nodes(nodes: &[Uuid]) -> Memory {
        let mut memory = Memory::new(MemoryKind::Fact, 0.5, 0.95);
        memory.node_ids = nodes.to_vec();
        memory
    }

    #[tokio::test]
    async fn interest_timeout_yields_neutral() {
        // A matcher slower than the deadline scores exactly 0.5
        struct SlowLlm;
        #[async_trait::async_trait]
        impl LlmClient for SlowLlm {
            async fn complete(
                &self,
                _prompt: &str,
                _options: &LlmOptions,
            ) -> crate::error::Result<String> {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok("0.9".to_string())
            }
        }

        let config = MemoryConfig {
            interest_timeout_ms: 1500,
            ..MemoryConfig::default()
        };
        let scorer = InterestScorer::new(&config, Arc::new(SlowLlm));

        let started = std::time::Instant::now();
        let score = scorer.calculate_interest_match("query", "memory").await;
        assert_eq!(score, INTEREST_NEUTRAL);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn interest_parses_bare_number() {
        let config = MemoryConfig::default();
        let scorer = InterestScorer::new(&config, Arc::new(MockLlm::always("0.8")));
        let score = scorer.calculate_interest_match("query", "memory").await;
        assert!((score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn interest_parses_json_wrapper() {
        let config = MemoryConfig::default();
        let scorer = InterestScorer::new(&config, Arc::new(MockLlm::always(r#"{"score": 0.3}"#)));
        let score = scorer.calculate_interest_match("query", "memory").await;
        assert!((score - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn interest_garbage_is_neutral() {
        let config = MemoryConfig::default();
        let scorer = InterestScorer::new(&config, Arc::new(MockLlm::always("very relevant!")));
        let score = scorer.calculate_interest_match("query", "memory").await;
        assert_eq!(score, INTEREST_NEUTRAL);
    }

    #[test]
    fn mention_score_overlap() {
        assert!(mention_score("alice tea", "alice likes tea") > 0.0);
        assert_eq!(mention_score("zebra", "alice likes tea"), 0.0);
    }

    #[test]
    fn relation_score_counts_shared_nodes() {
        let shared = Uuid::new_v4();
        let lonely = Uuid::new_v4();

        let target = memory_with_nodes(&[shared]);
        let connected = memory_with_nodes(&[shared, Uuid::new_v4()]);
        let unrelated = memory_with_nodes(&[lonely]);

        let others = vec![connected, unrelated];
        let score = relation_score(&target, &others);
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn relation_score_empty_is_zero() {
        let target = memory_with_nodes(&[Uuid::new_v4()]);
        assert_eq!(relation_score(&target, &[]), 0.0);
    }
}
