//! Tool dispatcher: parses tool calls, enforces per-tool concurrency,
//! requests approval, runs handlers with per-call deadlines, and formats
//! results back into provider-accepted form.
//!
//! Dispatch is keyed by tool name, generalized to a bounded worker pool
//! with serial-tool barriers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::context::RunContext;
use crate::error::ToolError;
use crate::event::{data, EventType, Publisher};
use crate::tool::{Concurrency, ToolCall, ToolOutput, ToolSet};
use crate::tracer::SpanOptions;

/// A decision for whether a given tool call requires human approval before
/// running.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    /// Tool names that require approval before dispatch.
    fn requires_approval(&self, tool_name: &str) -> bool;
    /// Invoked once approval is required; returns true to grant. Approval
    /// errors (e.g. the handler itself failing) are treated as denials.
    async fn approve(&self, tool_name: &str, arguments: &Value) -> bool;
}

/// Approves nothing requires approval; the default policy.
#[derive(Debug, Default, Clone)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalPolicy for AutoApprove {
    fn requires_approval(&self, _tool_name: &str) -> bool {
        false
    }
    async fn approve(&self, _tool_name: &str, _arguments: &Value) -> bool {
        true
    }
}

/// Controls the dispatcher's concurrency strategy.
#[derive(Debug, Clone)]
pub struct ParallelToolPolicy {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub pessimistic_safety: bool,
}

impl Default for ParallelToolPolicy {
    fn default() -> Self {
        ParallelToolPolicy { enabled: true, max_concurrent: 4, pessimistic_safety: false }
    }
}

impl ParallelToolPolicy {
    fn is_sequential(&self) -> bool {
        !self.enabled || self.max_concurrent <= 1 || self.pessimistic_safety
    }
}

pub struct Dispatcher {
    pub tools: ToolSet,
    pub policy: ParallelToolPolicy,
    pub approval: Arc<dyn ApprovalPolicy>,
    pub tool_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(tools: ToolSet, policy: ParallelToolPolicy, approval: Arc<dyn ApprovalPolicy>, tool_timeout: Option<Duration>) -> Self {
        Dispatcher { tools, policy, approval, tool_timeout }
    }

    /// Dispatches one turn's tool calls, returning outputs in the same
    /// order as `calls` regardless of execution strategy or completion
    /// order.
    pub async fn dispatch(&self, ctx: &RunContext, publisher: &Publisher, calls: Vec<ToolCall>) -> Vec<ToolOutput> {
        if self.policy.is_sequential() {
            let mut outputs = Vec::with_capacity(calls.len());
            for call in calls {
                outputs.push(self.run_one(ctx, publisher, call).await);
            }
            return outputs;
        }

        let mut outputs: Vec<Option<ToolOutput>> = (0..calls.len()).map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent));
        let mut index = 0usize;
        let mut pending: Vec<tokio::task::JoinHandle<(usize, ToolOutput)>> = Vec::new();

        while index < calls.len() {
            let call = calls[index].clone();
            let serial = self
                .tools
                .get(&call.name)
                .map(|t| t.concurrency == Concurrency::Serial)
                .unwrap_or(false);

            if serial {
                // Drain all in-flight parallel tools before the barrier runs.
                for handle in pending.drain(..) {
                    let (i, out) = handle.await.expect("tool task panicked");
                    outputs[i] = Some(out);
                }
                let out = self.run_one(ctx, publisher, call).await;
                outputs[index] = Some(out);
            } else {
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let dispatcher_self = self.clone_for_task();
                let ctx = ctx.clone();
                let publisher = publisher.clone();
                let i = index;
                pending.push(tokio::spawn(async move {
                    let out = dispatcher_self.run_one(&ctx, &publisher, call).await;
                    drop(permit);
                    (i, out)
                }));
            }
            index += 1;
        }

        for handle in pending {
            let (i, out) = handle.await.expect("tool task panicked");
            outputs[i] = Some(out);
        }

        outputs.into_iter().map(|o| o.expect("every index written")).collect()
    }

    fn clone_for_task(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            tools: self.tools.clone(),
            policy: self.policy.clone(),
            approval: self.approval.clone(),
            tool_timeout: self.tool_timeout,
        })
    }

    async fn run_one(&self, ctx: &RunContext, publisher: &Publisher, call: ToolCall) -> ToolOutput {
        let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| {
            log::warn!("malformed tool-call arguments for {}: {}", call.name, call.arguments);
            json!({})
        });

        let tool = match self.tools.get(&call.name) {
            Some(tool) => tool,
            None => {
                return error_output(&call, &ToolError::NotFound(call.name.clone()).to_string());
            }
        };

        let pending_description = tool.format_pending(&arguments);
        publisher
            .emit(EventType::ActionDetected, data("description", json!(pending_description)))
            .await;

        if self.approval.requires_approval(&call.name) {
            publisher
                .emit(EventType::ApprovalRequired, data("tool_id", json!(call.call_id.clone())))
                .await;
            // An approval handler that never resolves (a human walked away
            // from a prompt) must not hang the run forever; it inherits the
            // same deadline as tool execution itself.
            let granted = match self.tool_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.approval.approve(&call.name, &arguments)).await.unwrap_or(false),
                None => self.approval.approve(&call.name, &arguments).await,
            };
            if granted {
                publisher.emit(EventType::ApprovalGranted, data("tool_id", json!(call.call_id.clone()))).await;
            } else {
                publisher.emit(EventType::ApprovalDenied, data("tool_id", json!(call.call_id.clone()))).await;
                return denied_output(&call);
            }
        }

        let root_handle = crate::tracer::Handle { trace_id: String::new(), span_id: String::new() };
        let parent_handle = ctx.trace_handle.as_deref().unwrap_or(&root_handle);
        let end_span = ctx
            .tracer
            .start_span(
                parent_handle,
                "tool",
                SpanOptions { span_type: Some(crate::tracer::SpanType::Tool), input: Some(arguments.clone()), ..Default::default() },
            )
            .await;

        let result = match self.tool_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, tool.execute(ctx.clone(), arguments)).await {
                Ok(result) => result,
                Err(_) => {
                    let message = ToolError::TimedOut(call.name.clone()).to_string();
                    ctx.tracer.set_span_attributes(&end_span, data_to_map("error", &message)).await;
                    ctx.tracer.end_span(&end_span).await;
                    return timeout_output(&call);
                }
            },
            None => tool.execute(ctx.clone(), arguments).await,
        };

        match result {
            Ok(value) => {
                ctx.tracer.set_span_output(&end_span, value.clone()).await;
                ctx.tracer.end_span(&end_span).await;
                let formatted = tool.format_result(&value);
                publisher
                    .emit(EventType::ActionResult, data("result", value.clone()))
                    .await;
                ToolOutput { call_id: call.call_id, output: json!({"result": value, "formatted": formatted}).to_string() }
            }
            Err(err) => {
                let message = ToolError::ExecutionFailed(err.to_string()).to_string();
                ctx.tracer.set_span_attributes(&end_span, data_to_map("error", &message)).await;
                ctx.tracer.end_span(&end_span).await;
                error_output(&call, &message)
            }
        }
    }
}

fn data_to_map(key: &str, value: &str) -> std::collections::HashMap<String, Value> {
    let mut m = std::collections::HashMap::new();
    m.insert(key.to_string(), json!(value));
    m
}

fn error_output(call: &ToolCall, message: &str) -> ToolOutput {
    ToolOutput {
        call_id: call.call_id.clone(),
        output: json!({"error": message, "approved": true}).to_string(),
    }
}

fn denied_output(call: &ToolCall) -> ToolOutput {
    ToolOutput {
        call_id: call.call_id.clone(),
        output: json!({"error": "tool call denied", "approved": false}).to_string(),
    }
}

fn timeout_output(call: &ToolCall) -> ToolOutput {
    ToolOutput {
        call_id: call.call_id.clone(),
        output: json!({"error": "tool execution timed out", "approved": true}).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Tool;
    use crate::tracer::NoopTracer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RunContext {
        RunContext::new(Arc::new(NoopTracer))
    }

    fn publisher() -> (Publisher, tokio::sync::mpsc::Receiver<crate::event::Event>) {
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        (Publisher::new(tx), rx)
    }

    #[tokio::test]
    async fn preserves_output_order_regardless_of_completion_order() {
        let slow = Tool::builder("slow", "sleeps then returns")
            .handler(|_ctx, _args| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("slow-done"))
            })
            .build();
        let fast = Tool::builder("fast", "returns immediately")
            .handler(|_ctx, _args| async move { Ok(json!("fast-done")) })
            .build();
        let dispatcher = Dispatcher::new(
            ToolSet::new(vec![slow, fast]),
            ParallelToolPolicy { enabled: true, max_concurrent: 2, pessimistic_safety: false },
            Arc::new(AutoApprove),
            None,
        );
        let (publisher, _rx) = publisher();
        let calls = vec![
            ToolCall { id: "1".into(), call_id: "c1".into(), name: "slow".into(), arguments: "{}".into() },
            ToolCall { id: "2".into(), call_id: "c2".into(), name: "fast".into(), arguments: "{}".into() },
        ];
        let outputs = dispatcher.dispatch(&ctx(), &publisher, calls).await;
        assert_eq!(outputs[0].call_id, "c1");
        assert_eq!(outputs[1].call_id, "c2");
    }

    #[tokio::test]
    async fn serial_tool_acts_as_a_barrier() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_a = counter.clone();

        let parallel = Tool::builder("par", "parallel tool")
            .handler(move |_ctx, _args| {
                let order = order_a.clone();
                let counter = counter_a.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    order.lock().unwrap().push("par");
                    Ok(json!("ok"))
                }
            })
            .build();
        let serial = Tool::builder("ser", "serial barrier tool")
            .concurrency(Concurrency::Serial)
            .handler(move |_ctx, _args| {
                let order = order_b.clone();
                async move {
                    order.lock().unwrap().push("ser");
                    Ok(json!("ok"))
                }
            })
            .build();

        let dispatcher = Dispatcher::new(
            ToolSet::new(vec![parallel, serial]),
            ParallelToolPolicy { enabled: true, max_concurrent: 4, pessimistic_safety: false },
            Arc::new(AutoApprove),
            None,
        );
        let (publisher, _rx) = publisher();
        let calls = vec![
            ToolCall { id: "1".into(), call_id: "c1".into(), name: "par".into(), arguments: "{}".into() },
            ToolCall { id: "2".into(), call_id: "c2".into(), name: "ser".into(), arguments: "{}".into() },
        ];
        dispatcher.dispatch(&ctx(), &publisher, calls).await;
        assert_eq!(*order.lock().unwrap(), vec!["par", "ser"]);
    }

    #[tokio::test]
    async fn tool_failure_is_contained_as_a_structured_error_output() {
        let failing = Tool::builder("failing", "always fails")
            .handler(|_ctx, _args| async move { Err("boom".into()) })
            .build();
        let dispatcher = Dispatcher::new(ToolSet::new(vec![failing]), ParallelToolPolicy::default(), Arc::new(AutoApprove), None);
        let (publisher, _rx) = publisher();
        let calls = vec![ToolCall { id: "1".into(), call_id: "c1".into(), name: "failing".into(), arguments: "{}".into() }];
        let outputs = dispatcher.dispatch(&ctx(), &publisher, calls).await;
        assert!(outputs[0].output.contains("error"));
    }
}
