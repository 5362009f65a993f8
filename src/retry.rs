//! Retry backoff and timeout policy.
//!
//! The numeric shape (`max_retries`/`initial_delay`/`max_delay`/`multiplier`)
//! plus named presets follows a standard exponential-backoff-with-cap
//! design.

use crate::context::RunContext;
use crate::error::{EngineError, ProviderErrorKind};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPreset {
    None,
    Standard,
    Aggressive,
    Linear,
    Patient,
}

impl RetryPreset {
    pub fn to_policy(self) -> RetryPolicy {
        match self {
            RetryPreset::None => RetryPolicy { max_retries: 0, ..RetryPolicy::default() },
            RetryPreset::Standard => RetryPolicy {
                max_retries: 5,
                initial_delay: Duration::from_millis(200),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            RetryPreset::Aggressive => RetryPolicy {
                max_retries: 5,
                initial_delay: Duration::from_millis(500),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            RetryPreset::Linear => RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(500),
                multiplier: 1.0,
                max_delay: Duration::from_secs(60),
            },
            RetryPreset::Patient => RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_secs(2),
                multiplier: 3.0,
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPreset::Standard.to_policy()
    }
}

impl RetryPolicy {
    pub fn preset(preset: RetryPreset) -> Self {
        preset.to_policy()
    }

    /// Delay for attempt `n` (0-indexed): `min(initial_delay * multiplier^n, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Deadlines for the four suspension-point families a run can block on; any
/// may be `None` (disabled).
#[derive(Debug, Clone, Default)]
pub struct TimeoutPolicy {
    pub total_run: Option<Duration>,
    pub llm_call: Option<Duration>,
    pub tool_execution: Option<Duration>,
    pub inter_chunk: Option<Duration>,
}

/// Runs `op` under `policy`, retrying on [`ProviderErrorKind::is_retryable`]
/// errors and honoring cancellation at each backoff boundary.
pub async fn retry_provider_call<T, F, Fut>(
    ctx: &RunContext,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, Box<dyn std::error::Error + Send + Sync>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>>,
{
    let mut attempt = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(Box::new(EngineError::Cancelled));
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err
                    .downcast_ref::<EngineError>()
                    .map(|e| matches!(e, EngineError::Provider(kind, _) if kind.is_retryable()))
                    .unwrap_or(false);
                if !retryable || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                log::debug!("retrying provider call after {:?} (attempt {})", delay, attempt + 1);
                if !ctx.sleep_cancellable(delay).await {
                    return Err(Box::new(EngineError::Cancelled));
                }
                attempt += 1;
            }
        }
    }
}

/// Classifies a boxed error for retry purposes; a transient provider error
/// (rate-limit, timeout, 5xx) is retryable, everything else is not.
pub fn is_retryable(kind: ProviderErrorKind) -> bool {
    kind.is_retryable()
}
