//! Request-scoped context carrier.
//!
//! Rust has no implicit `ctx` propagation the way Go does, so the engine
//! threads an explicit [`RunContext`] by reference (cheaply, since it is
//! `Clone` over `Arc`s) through every call site, with `with_x` constructors
//! that return a derived context rather than mutating in place.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::event::Publisher;
use crate::tracer::{Handle, Tracer};

/// A cooperative cancellation signal shared by every task descended from a
/// `Run`. Cancelling unblocks provider calls, tool handlers, and retry
/// sleeps.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called; used with `tokio::select!` at
    /// every suspension point that can block.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call timing installed before each LLM call so the tracer can compute
/// latency and time-to-first-token without threading explicit parameters
/// through the reducer.
#[derive(Debug, Clone)]
pub struct CallTiming {
    pub started_at: DateTime<Utc>,
    pub completion_start: Option<DateTime<Utc>>,
}

/// Request-scoped carrier: dependencies, conversation id, trace/span ids,
/// tracer, event publisher, per-call timing, and the cancellation token.
#[derive(Clone)]
pub struct RunContext {
    pub conversation_id: Option<String>,
    pub dependencies: Arc<HashMap<String, String>>,
    pub tracer: Arc<dyn Tracer>,
    pub trace_handle: Option<Arc<Handle>>,
    pub publisher: Option<Publisher>,
    pub parent_publisher: Option<Publisher>,
    pub call_timing: Option<CallTiming>,
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        RunContext {
            conversation_id: None,
            dependencies: Arc::new(HashMap::new()),
            tracer,
            trace_handle: None,
            publisher: None,
            parent_publisher: None,
            call_timing: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_tracer(&self, tracer: Arc<dyn Tracer>) -> Self {
        let mut ctx = self.clone();
        ctx.tracer = tracer;
        ctx
    }

    pub fn with_trace_handle(&self, handle: Handle) -> Self {
        let mut ctx = self.clone();
        ctx.trace_handle = Some(Arc::new(handle));
        ctx
    }

    pub fn with_conversation_id(&self, id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.conversation_id = Some(id.into());
        ctx
    }

    pub fn with_publisher(&self, publisher: Publisher) -> Self {
        let mut ctx = self.clone();
        ctx.publisher = Some(publisher);
        ctx
    }

    /// Marks this context as having an active parent publisher; the caller
    /// (the delegation subsystem) uses this to detect it should interpose a
    /// bubbling pump rather than publish directly.
    pub fn with_parent_publisher(&self, publisher: Publisher) -> Self {
        let mut ctx = self.clone();
        ctx.parent_publisher = Some(publisher);
        ctx
    }

    pub fn with_call_timing(&self, started_at: DateTime<Utc>) -> Self {
        let mut ctx = self.clone();
        ctx.call_timing = Some(CallTiming { started_at, completion_start: None });
        ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancellation.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;

    #[test]
    fn with_tracer_returns_derived_context_without_mutating_original() {
        let ctx = RunContext::new(Arc::new(NoopTracer));
        let ctx2 = ctx.with_conversation_id("conv-1");
        assert!(ctx.conversation_id.is_none());
        assert_eq!(ctx2.conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn cancellation_wakes_pending_sleep() {
        let token = CancellationToken::new();
        let token2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token2.cancel();
        });
        let completed = RunContext::new(Arc::new(NoopTracer))
            .sleep_cancellable(Duration::from_secs(5))
            .await;
        assert!(!completed);
    }
}
