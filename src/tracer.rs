//! Observability backend contract.
//!
//! An `async_trait` with default no-op method bodies so a caller only
//! overrides what it needs, and `Send + Sync` so `Arc<dyn Tracer>` can be
//! shared across concurrently running agents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
    Span,
    Generation,
    Event,
    Tool,
    Retrieval,
}

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub input: Option<Value>,
    pub environment: Option<String>,
    pub release: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub span_type: Option<SpanType>,
    pub start_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub model: String,
    pub parameters: HashMap<String, Value>,
    pub input: Value,
    pub output: Option<Value>,
    pub usage: Option<crate::provider::Usage>,
    pub cost: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub completion_start_time: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, Value>,
}

/// A handle for a trace or span in progress. Calling `end` closes it.
/// Every field is opaque to callers; only the tracer implementation
/// interprets it.
pub struct Handle {
    pub trace_id: String,
    pub span_id: String,
}

/// `Tracer` contract: start a trace, start nested spans, log
/// generations, set attributes, flush. A no-op implementation must satisfy
/// the full contract without side effects — see [`NoopTracer`].
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn start_trace(&self, name: &str, options: TraceOptions) -> Handle;
    async fn start_span(&self, parent: &Handle, name: &str, options: SpanOptions) -> Handle {
        let _ = (name, options);
        Handle {
            trace_id: parent.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().to_string(),
        }
    }
    async fn end_span(&self, _handle: &Handle) {}
    async fn end_trace(&self, _handle: &Handle) {}
    async fn log_generation(&self, _handle: &Handle, _options: GenerationOptions) {}
    async fn set_span_output(&self, _handle: &Handle, _output: Value) {}
    async fn set_span_attributes(&self, _handle: &Handle, _attributes: HashMap<String, Value>) {}
    async fn set_trace_attributes(&self, _handle: &Handle, _attributes: HashMap<String, Value>) {}
    async fn log_event(&self, _handle: &Handle, _name: &str, _attributes: HashMap<String, Value>) {}
    async fn flush(&self) {}
}

/// Satisfies [`Tracer`] with no side effects; the default tracer for an
/// `Agent` that has not been configured with a real backend.
#[derive(Debug, Default, Clone)]
pub struct NoopTracer;

#[async_trait]
impl Tracer for NoopTracer {
    async fn start_trace(&self, _name: &str, _options: TraceOptions) -> Handle {
        Handle {
            trace_id: uuid::Uuid::new_v4().to_string(),
            span_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_tracer_satisfies_full_contract() {
        let tracer = NoopTracer;
        let root = tracer.start_trace("agent.run", TraceOptions::default()).await;
        let span = tracer.start_span(&root, "tool", SpanOptions::default()).await;
        tracer.log_generation(&span, GenerationOptions::default()).await;
        tracer.set_span_output(&span, Value::Null).await;
        tracer.end_span(&span).await;
        tracer.end_trace(&root).await;
        tracer.flush().await;
    }
}
