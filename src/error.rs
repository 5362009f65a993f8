//! Error taxonomy for the engine.
//!
//! Manual enum-plus-`Display`-plus-`Error` style rather than pulling in a
//! derive-macro error crate.

use std::fmt;

/// Coarse classification of a provider failure, used by the retry wrapper to
/// decide whether an attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    Timeout,
    ServerError,
    BadRequest,
    MalformedResponse,
    Other,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Timeout | ProviderErrorKind::ServerError
        )
    }
}

/// Top-level error type surfaced by a `Run`.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid construction parameters (iteration count, temperature, reasoning effort, credentials).
    Configuration(String),
    /// A provider error that exhausted retries or was non-retryable to begin with.
    Provider(ProviderErrorKind, String),
    /// Malformed chunk, error chunk, or inter-chunk timeout while streaming.
    Stream(String),
    /// The run's context was cancelled or its deadline elapsed.
    Cancelled,
    /// A nested delegation (sub-agent/handoff/collaboration) terminated in error.
    Delegation(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            EngineError::Provider(kind, msg) => write!(f, "provider error ({kind:?}): {msg}"),
            EngineError::Stream(msg) => write!(f, "stream error: {msg}"),
            EngineError::Cancelled => write!(f, "run cancelled"),
            EngineError::Delegation(msg) => write!(f, "delegation error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Errors contained within a single tool call; never fatal to the run.
#[derive(Debug)]
pub enum ToolError {
    NotFound(String),
    ExecutionFailed(String),
    InvalidParameters(String),
    TimedOut(String),
    ApprovalDenied(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {name}"),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {msg}"),
            ToolError::InvalidParameters(msg) => write!(f, "invalid tool parameters: {msg}"),
            ToolError::TimedOut(name) => write!(f, "tool timed out: {name}"),
            ToolError::ApprovalDenied(name) => write!(f, "tool call denied: {name}"),
        }
    }
}

impl std::error::Error for ToolError {}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
