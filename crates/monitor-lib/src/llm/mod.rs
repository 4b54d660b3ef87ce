//! Generative text service abstraction
//!
//! Callers branch on a typed [`GenerationOutcome`] instead of inspecting
//! error text, so quota exhaustion is distinguishable from other failures.

mod gemini;

pub use gemini::{classify_failure, GeminiClient, GeminiConfig};

use async_trait::async_trait;
use std::fmt::Debug;

/// Result of one generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Text produced by the service (may be empty)
    Generated(String),
    /// The service rejected the call for quota or rate-limit reasons
    QuotaExceeded(String),
    /// Any other failure: transport, HTTP status, malformed response
    Failed(String),
}

/// External text generator
#[async_trait]
pub trait TextGenerator: Send + Sync + Debug {
    /// Generator name for logs
    fn name(&self) -> &str;

    /// Generate text for a prompt; never panics, failures are folded into the outcome
    async fn generate(&self, prompt: &str) -> GenerationOutcome;
}
