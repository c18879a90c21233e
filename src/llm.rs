//! LLM gateway
//!
//! A thin trait over text completion. The core only needs free-text output;
//! all structure is recovered downstream by the tolerant parser. Calls are
//! wrapped with a per-call timeout and, via [`RetryingClient`], exponential
//! backoff for transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Options for a single completion call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call deadline; the default comes from `MemoryConfig::llm_timeout_secs`
    pub timeout: Duration,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }
}

impl LlmOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// JSON-producing text completion gateway
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion. Output is free text; callers parse leniently.
    async fn complete(&self, prompt: &str, options: &LlmOptions) -> Result<String>;
}

/// Run a completion with the option's deadline applied.
pub async fn complete_with_timeout(
    client: &dyn LlmClient,
    prompt: &str,
    options: &LlmOptions,
) -> Result<String> {
    tokio::time::timeout(options.timeout, client.complete(prompt, options))
        .await
        .map_err(|_| Error::timeout(format!("LLM call exceeded {:?}", options.timeout)))?
}

/// Retry configuration for transient gateway failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Wrapper that retries transient failures with exponential backoff
pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * deterministic_jitter(attempt)) as u64;
        (base as u64).saturating_add(jitter).min(self.config.max_delay_ms)
    }
}

/// Simple deterministic jitter based on attempt number (no rand dependency).
fn deterministic_jitter(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn complete(&self, prompt: &str, options: &LlmOptions) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match complete_with_timeout(self.inner.as_ref(), prompt, options).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt == self.config.max_retries || !e.is_transient() {
                        return Err(e);
                    }

                    let delay = self.compute_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay,
                        error = %e,
                        "Retrying LLM request"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::llm("retry loop exhausted")))
    }
}

/// Scripted mock client for tests.
///
/// Responses are returned in order; the last one repeats once the script is
/// exhausted. A response of `"<error>"` produces a transient failure.
pub struct MockLlm {
    responses: std::sync::Mutex<Vec<String>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// One response repeated forever
    pub fn always(response: &str) -> Self {
        Self::new(vec![response])
    }

    /// Number of completions served so far
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Append another scripted response
    pub fn push(&self, response: &str) {
        self.responses.lock().unwrap().push(response.to_string());
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _prompt: &str, _options: &LlmOptions) -> Result<String> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        let response = responses
            .get(n)
            .or_else(|| responses.last())
            .cloned()
            .ok_or_else(|| Error::llm("mock has no scripted responses"))?;

        if response == "<error>" {
            return Err(Error::llm("503 service unavailable (mock)"));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay_ms, 500);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn compute_delay_respects_max() {
        let client = RetryingClient {
            inner: Arc::new(MockLlm::always("x")),
            config: RetryConfig {
                max_retries: 5,
                initial_delay_ms: 500,
                max_delay_ms: 2000,
                backoff_multiplier: 10.0,
            },
        };
        assert!(client.compute_delay(5) <= 2000);
    }

    #[tokio::test]
    async fn mock_serves_scripted_responses_in_order() {
        let mock = MockLlm::new(vec!["one", "two"]);
        let options = LlmOptions::default();
        assert_eq!(mock.complete("p", &options).await.unwrap(), "one");
        assert_eq!(mock.complete("p", &options).await.unwrap(), "two");
        // Script exhausted: last response repeats
        assert_eq!(mock.complete("p", &options).await.unwrap(), "two");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn retrying_client_recovers_from_transient_error() {
        let mock = Arc::new(MockLlm::new(vec!["<error>", "recovered"]));
        let client = RetryingClient::new(
            mock.clone(),
            RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 1.0,
            },
        );

        let out = client
            .complete("p", &LlmOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "recovered");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn retrying_client_gives_up_after_max_retries() {
        let mock = Arc::new(MockLlm::always("<error>"));
        let client = RetryingClient::new(
            mock.clone(),
            RetryConfig {
                max_retries: 1,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 1.0,
            },
        );

        assert!(client.complete("p", &LlmOptions::default()).await.is_err());
        assert_eq!(mock.call_count(), 2);
    }
}
