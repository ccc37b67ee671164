//! Typed errors for the engine's public seams.
//!
//! Operational code inside modules uses `anyhow::Result`; these enums exist at
//! the boundaries where callers need to branch on the failure kind (validation
//! vs. storage, transient upstream vs. malformed output).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Hard storage failure. Propagated to the caller, never retried here.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Synchronous rejection: empty content, wrong vector dimension, bad id.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// LLM call failures. `Transport`, `Api` and `ParseFailed` are all treated as
/// transient by the dreaming retry policy (retry_count += 1, retried next
/// cycle up to the cap).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("stream error: {0}")]
    Stream(String),

    /// The model returned something that is not the JSON we asked for.
    #[error("failed to parse model output: {0}")]
    ParseFailed(String),
}
