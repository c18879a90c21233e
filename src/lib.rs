//! # Strata Memory
//!
//! A three-tier memory engine for conversational agents.
//!
//! ## Architecture
//!
//! Incoming chat messages flow through three tiers of increasing
//! permanence:
//! - **Perceptual** - bounded blocks of recent messages; recall bumps a
//!   block's activation until it is promoted
//! - **Short-term** - structured memories distilled by the LLM, with
//!   merge/update/discard curation and a hard capacity bound
//! - **Long-term** - a typed knowledge graph with a vector side-index,
//!   built by LLM graph-edit programs, with decay, consolidation, and
//!   forgetting
//!
//! Retrieval runs the fast tiers first, lets a judge decide whether the
//! graph is needed, and ranks graph hits through multi-hop path expansion.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_memory::{LocalEmbedder, MemoryConfig, Message, UnifiedMemoryManager};
//!
//! let config = MemoryConfig::default();
//! let embedder = Arc::new(LocalEmbedder::new(&config)?);
//! let manager = Arc::new(UnifiedMemoryManager::new(config, llm, embedder).await?);
//! manager.start();
//!
//! manager.add_message(Message::new("chat-1", "alice", "I moved to Lisbon")).await?;
//! let result = manager.search_memories("where does alice live?", true, "").await?;
//!
//! manager.shutdown().await?;
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod expansion;
pub mod judge;
pub mod llm;
pub mod long_term;
pub mod message;
pub mod parse;
pub mod perceptual;
pub mod retrieval;
pub mod short_term;
pub mod similarity;
pub mod storage;
pub mod unified;

pub use config::{ExpansionConfig, MemoryConfig, MergeStrategy, OverflowStrategy};
pub use embedding::{EmbeddingProvider, LocalEmbedder, MockEmbedder, TokenCounter};
pub use error::{Error, Result};
pub use judge::{Judge, JudgeDecision};
pub use llm::{LlmClient, LlmOptions, MockLlm, RetryConfig, RetryingClient};
pub use long_term::{LongTermManager, StagedMemory, StagedStatus, TransferResult};
pub use message::Message;
pub use perceptual::{MemoryBlock, PerceptualManager, RecalledBlock};
pub use retrieval::{InterestScorer, RetrievalResult};
pub use short_term::{ShortTermManager, ShortTermMemory, ShortTermOp};
pub use storage::{Edge, EdgeType, GraphStore, Memory, MemoryKind, Node, NodeType};
pub use unified::UnifiedMemoryManager;
