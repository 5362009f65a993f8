//! Ambient engine defaults.
//!
//! A plain struct with a manual `Default` impl — no TOML/YAML parsing
//! dependency.

use crate::retry::{RetryPolicy, RetryPreset};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_event_buffer_size: usize,
    pub default_retry_policy: RetryPolicy,
    pub default_max_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_event_buffer_size: 10,
            default_retry_policy: RetryPreset::Standard.to_policy(),
            default_max_iterations: 10,
        }
    }
}
