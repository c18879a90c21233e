//! Retrieval judge and supplemental-query planning
//!
//! After the fast tiers answer, the judge decides whether their recall is
//! enough or the long-term graph must be consulted. The bias is deliberate:
//! on any doubt (or any failure) the verdict is "not sufficient", because a
//! wasted graph search is cheaper than a missed memory.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::embedding::TokenCounter;
use crate::llm::{complete_with_timeout, LlmClient, LlmOptions};
use crate::parse::parse_lenient;
use crate::perceptual::RecalledBlock;
use crate::short_term::ShortTermMemory;

/// Token budget for the compacted evidence section of the judge prompt
const JUDGE_EVIDENCE_TOKEN_BUDGET: u32 = 1200;

/// The judge's verdict on a retrieval
#[derive(Debug, Clone)]
pub struct JudgeDecision {
    /// True when perceptual + short-term recall suffices
    pub sufficient: bool,

    /// Confidence in the verdict, in [0, 1]
    pub confidence: f32,

    /// Extra queries to run against the long-term tier
    pub supplemental_queries: Vec<String>,
}

impl JudgeDecision {
    /// The safe default: force a long-term search
    pub fn insufficient() -> Self {
        Self {
            sufficient: false,
            confidence: 0.0,
            supplemental_queries: Vec::new(),
        }
    }
}

/// LLM-backed retrieval judge
pub struct Judge {
    llm: Arc<dyn LlmClient>,
    options: LlmOptions,
    tokens: Option<TokenCounter>,
}

impl Judge {
    pub fn new(config: &MemoryConfig, llm: Arc<dyn LlmClient>) -> Self {
        // The tokenizer is an optimization for prompt compaction; estimation
        // covers the case where it cannot load
        let tokens = TokenCounter::for_gpt().ok();
        Self {
            llm,
            options: LlmOptions::default()
                .with_max_tokens(600)
                .with_timeout(Duration::from_secs(config.llm_timeout_secs)),
            tokens,
        }
    }

    fn count_tokens(&self, text: &str) -> u32 {
        match &self.tokens {
            Some(counter) => counter.count(text),
            None => TokenCounter::estimate(text),
        }
    }

    /// Evaluate whether the recalled evidence answers the query.
    /// Any failure yields the insufficient default.
    pub async fn evaluate(
        &self,
        query: &str,
        blocks: &[RecalledBlock],
        short_term: &[ShortTermMemory],
        recent_chat_history: &str,
    ) -> JudgeDecision {
        let evidence = self.compact_evidence(blocks, short_term);
        let prompt = judge_prompt(query, &evidence, recent_chat_history);

        let response = match complete_with_timeout(self.llm.as_ref(), &prompt, &self.options).await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "judge call failed, defaulting to insufficient");
                return JudgeDecision::insufficient();
            }
        };

        match parse_lenient(&response) {
            Ok(value) => {
                let decision = JudgeDecision {
                    sufficient: value
                        .get("sufficient")
                        .or_else(|| value.get("is_sufficient"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    confidence: value
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                        .clamp(0.0, 1.0) as f32,
                    supplemental_queries: value
                        .get("supplemental_queries")
                        .or_else(|| value.get("additional_queries"))
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default(),
                };
                debug!(
                    sufficient = decision.sufficient,
                    confidence = decision.confidence,
                    extra = decision.supplemental_queries.len(),
                    "judge verdict"
                );
                decision
            }
            Err(_) => {
                debug!(raw = %response.chars().take(200).collect::<String>(), "unparseable judge response");
                JudgeDecision::insufficient()
            }
        }
    }

    /// Render recalled items into the prompt, newest-relevance first,
    /// stopping at the token budget.
    fn compact_evidence(
        &self,
        blocks: &[RecalledBlock],
        short_term: &[ShortTermMemory],
    ) -> String {
        let mut lines: Vec<String> = Vec::new();
        for recalled in blocks {
            lines.push(format!(
                "[conversation, score {:.2}] {}",
                recalled.score,
                recalled.block.combined_text().replace('\n', " | ")
            ));
        }
        for memory in short_term {
            lines.push(format!(
                "[{} memory, importance {:.2}] {}",
                memory.memory_type,
                memory.importance,
                memory.text()
            ));
        }

        let mut budget = JUDGE_EVIDENCE_TOKEN_BUDGET;
        let mut kept = Vec::new();
        for line in lines {
            let cost = self.count_tokens(&line);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(line);
        }
        kept.join("\n")
    }

    /// Rewrite a query into a form better suited to semantic search, using
    /// the chat history for disambiguation. Falls back to the raw query.
    pub async fn refine_query(&self, query: &str, recent_chat_history: &str) -> String {
        if recent_chat_history.is_empty() {
            return query.to_string();
        }

        let history_tail: String = recent_chat_history
            .chars()
            .rev()
            .take(400)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        let prompt = format!(
            "Rewrite the query below for semantic memory search. Resolve pronouns and vague \
             references using the conversation excerpt. Keep it short. Output only the \
             rewritten query.\n\nQuery: {}\n\nConversation:\n{}",
            query, history_tail
        );

        let options = LlmOptions {
            max_tokens: 100,
            ..self.options.clone()
        };
        match complete_with_timeout(self.llm.as_ref(), &prompt, &options).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim();
                if rewritten.len() > 5 && !rewritten.contains('\n') {
                    debug!(original = query, rewritten, "query refined");
                    rewritten.to_string()
                } else {
                    query.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "query refinement failed, using raw query");
                query.to_string()
            }
        }
    }
}

fn judge_prompt(query: &str, evidence: &str, recent_chat_history: &str) -> String {
    let history_block = if recent_chat_history.is_empty() {
        String::new()
    } else {
        format!("**Recent chat history:**\n{}\n\n", recent_chat_history)
    };

    format!(
        r#"You are a memory-retrieval judge. Decide whether the evidence already retrieved is enough to answer the user's message accurately, or whether the long-term memory store must also be searched.

Prefer searching too much over missing a memory: when in doubt, answer sufficient=false.

**User message:**
{}

{}**Retrieved evidence:**
{}

Answer sufficient=false when any of these hold:
1. The user explicitly asks to recall something from the past.
2. You could not answer precisely from the evidence alone.
3. The message depends on the user's personal history, promises, or ongoing projects.
4. The message contains unresolved references ("that thing", "she", "last time").
5. The evidence is contradictory or fragmentary.

**Output (JSON only):**
```json
{{
  "sufficient": false,
  "confidence": 0.8,
  "supplemental_queries": ["short focused query", "..."]
}}
```"#,
        query, history_block, evidence
    )
}
