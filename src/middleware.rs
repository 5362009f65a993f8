//! Middleware contract: six hooks, "start" hooks return a derived context,
//! "complete" hooks fire in reverse registration order.
//!
//! An `async_trait` with default no-op bodies, `Arc<dyn Middleware>` sharing
//! across concurrent runs of the same agent.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::provider::{CompletionRequest, CompletionResponse};
use crate::tool::{ToolCall, ToolOutput};

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_agent_start(&self, ctx: RunContext, _user_message: &str) -> RunContext {
        ctx
    }
    async fn on_agent_complete(&self, _ctx: &RunContext, _final_text: &str) {}
    async fn on_llm_call(&self, ctx: RunContext, _request: &CompletionRequest) -> RunContext {
        ctx
    }
    async fn on_llm_response(&self, _ctx: &RunContext, _response: &CompletionResponse) {}
    async fn on_tool_start(&self, ctx: RunContext, _call: &ToolCall) -> RunContext {
        ctx
    }
    async fn on_tool_complete(&self, _ctx: &RunContext, _output: &ToolOutput) {}
}

/// Runs the ordered middleware stack's "start" hooks of one kind, threading
/// the derived context through each in registration order.
pub async fn run_start_hooks<F, Fut>(middleware: &[std::sync::Arc<dyn Middleware>], ctx: RunContext, hook: F) -> RunContext
where
    F: Fn(std::sync::Arc<dyn Middleware>, RunContext) -> Fut,
    Fut: std::future::Future<Output = RunContext>,
{
    let mut ctx = ctx;
    for m in middleware {
        ctx = hook(m.clone(), ctx).await;
    }
    ctx
}

/// Runs a stack's "complete" hooks in reverse registration order so the
/// most-recently-installed wrapper tears down first.
pub async fn run_complete_hooks<F, Fut>(middleware: &[std::sync::Arc<dyn Middleware>], ctx: &RunContext, hook: F)
where
    F: Fn(std::sync::Arc<dyn Middleware>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let _ = ctx;
    for m in middleware.iter().rev() {
        hook(m.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Recorder {
        id: usize,
        order: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn on_agent_complete(&self, _ctx: &RunContext, _final_text: &str) {
            self.order.lock().unwrap().push(self.id);
        }
    }

    #[tokio::test]
    async fn complete_hooks_fire_in_reverse_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder { id: 1, order: order.clone() }),
            Arc::new(Recorder { id: 2, order: order.clone() }),
        ];
        let ctx = RunContext::new(Arc::new(NoopTracer));
        let ctx_for_hook = ctx.clone();
        run_complete_hooks(&stack, &ctx, move |m| {
            let ctx = ctx_for_hook.clone();
            async move { m.on_agent_complete(&ctx, "").await }
        })
        .await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
        let _ = AtomicUsize::new(0);
    }
}
