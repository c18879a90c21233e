//! Embedding generation
//!
//! The engine talks to embeddings through the [`EmbeddingProvider`] trait so
//! the gateway can be swapped (local model, HTTP service, mock). The default
//! implementation runs fastembed locally, no API keys required.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::similarity::normalize;

/// Text-to-vector gateway. Batchable; vectors have a fixed dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, one vector per input in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimensions
    fn dimensions(&self) -> usize;
}

/// Embedding service backed by a local fastembed model
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Create a new embedding service with the local model.
    ///
    /// Uses all-MiniLM-L6-v2 by default (384 dimensions, fast, good quality).
    /// The model downloads automatically on first use to ~/.cache/fastembed.
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions: config.embedding_dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![text.to_string()], None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.model.lock().await;
        guard
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic mock embedder for tests.
///
/// Hashes tokens into a fixed-size bag-of-words vector, so identical texts
/// embed identically and overlapping texts score high cosine similarity.
pub struct MockEmbedder {
    dimensions: usize,
    fail: std::sync::atomic::AtomicBool,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent calls fail, for failure-path tests
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dimensions;
            vector[idx] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::embedding("mock embedder set to fail"));
        }
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::embedding("mock embedder set to fail"));
        }
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Token counter using tiktoken, for budgeting prompt context
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// Create a token counter with the default cl100k-family tokenizer
    pub fn for_gpt() -> Result<Self> {
        Self::new("gpt-4")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Estimate tokens without using the tokenizer (faster, less accurate)
    pub fn estimate(text: &str) -> u32 {
        // ~4 characters per token is a reasonable estimate
        (text.len() / 4) as u32
    }
}
