//! The agent iteration loop: alternates between provider calls and tool
//! dispatch until a terminating condition holds.
//!
//! Builder-pattern construction and an `emit`-style helper for surfacing
//! lifecycle events, generalized to native provider tool calls, a hard
//! `MaxIterations` ceiling, retry, and per-call timeouts.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::conversation_store::ConversationStore;
use crate::dispatcher::{ApprovalPolicy, AutoApprove, Dispatcher, ParallelToolPolicy};
use crate::error::{BoxError, EngineError};
use crate::event::{data, Event, EventType, Publisher};
use crate::middleware::Middleware;
use crate::provider::{CompletionRequest, InputItem, Provider, ReasoningEffort, Sampling, ToolChoice};
use crate::reducer::reduce_stream;
use crate::retry::{retry_provider_call, RetryPolicy, TimeoutPolicy};
use crate::tool::{Tool, ToolCall, ToolSet};
use crate::tracer::{GenerationOptions, SpanOptions, SpanType, Tracer, TraceOptions};

/// A constructed, reusable agent. Cheap to clone (every field is an `Arc`
/// or small value) so the same configuration can back concurrently running
/// `Run`s — resolved
/// here by making every shared field read-only after `build()`.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    model: String,
    system_prompt: Option<Arc<dyn Fn(&RunContext) -> String + Send + Sync>>,
    tools: ToolSet,
    max_iterations: u32,
    sampling: Option<Sampling>,
    reasoning_effort: Option<ReasoningEffort>,
    retry_policy: RetryPolicy,
    timeout_policy: TimeoutPolicy,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    approval_policy: Arc<dyn ApprovalPolicy>,
    parallel_tool_policy: ParallelToolPolicy,
    event_buffer_size: usize,
    tracer: Arc<dyn Tracer>,
    middleware: Vec<Arc<dyn Middleware>>,
}

pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    model: String,
    system_prompt: Option<Arc<dyn Fn(&RunContext) -> String + Send + Sync>>,
    tools: Vec<Tool>,
    max_iterations: u32,
    sampling: Option<Sampling>,
    reasoning_effort: Option<ReasoningEffort>,
    retry_policy: RetryPolicy,
    timeout_policy: TimeoutPolicy,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    approval_policy: Arc<dyn ApprovalPolicy>,
    parallel_tool_policy: ParallelToolPolicy,
    event_buffer_size: usize,
    tracer: Arc<dyn Tracer>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Agent {
    pub fn builder(provider: Arc<dyn Provider>, model: impl Into<String>) -> AgentBuilder {
        let config = EngineConfig::default();
        AgentBuilder {
            provider,
            model: model.into(),
            system_prompt: None,
            tools: Vec::new(),
            max_iterations: config.default_max_iterations,
            sampling: None,
            reasoning_effort: None,
            retry_policy: config.default_retry_policy,
            timeout_policy: TimeoutPolicy::default(),
            conversation_store: None,
            approval_policy: Arc::new(AutoApprove),
            parallel_tool_policy: ParallelToolPolicy::default(),
            event_buffer_size: config.default_event_buffer_size,
            tracer: Arc::new(crate::tracer::NoopTracer),
            middleware: Vec::new(),
        }
    }

    /// Returns a shallow-copy-and-override clone with a different tracer.
    /// Used by the delegation subsystem so a sub-agent's
    /// descendant LLM calls are recorded under the caller's trace without
    /// mutating the shared inner agent.
    pub fn with_tracer(&self, tracer: Arc<dyn Tracer>) -> Self {
        let mut clone = self.clone();
        clone.tracer = tracer;
        clone
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn as_tool(self: &Arc<Self>, name: &str, description: &str) -> Tool {
        crate::delegation::sub_agent_tool(self.clone(), name, description)
    }

    /// `Run(ctx, userMessage) -> stream of Event`. Returns
    /// immediately; a worker task does all the work. `parent_ctx` supplies
    /// the cancellation token, dependencies, and (if this run is a child)
    /// the parent publisher to bubble through.
    pub fn run(self: &Arc<Self>, parent_ctx: RunContext, user_message: String) -> mpsc::Receiver<Event> {
        // Captured before spawning the worker so trace timestamps precede
        // any descendant work.
        let start_time = chrono::Utc::now();
        let agent = self.clone();
        let (out_tx, out_rx) = mpsc::channel(agent.event_buffer_size);

        if let Some(parent_publisher) = parent_ctx.parent_publisher.clone() {
            // Child run: interpose a pump.
            let (inner_tx, inner_rx) = mpsc::channel(agent.event_buffer_size);
            crate::event::bubble(inner_rx, parent_publisher, out_tx.clone());
            tokio::spawn(async move {
                agent.run_worker(parent_ctx, user_message, inner_tx, start_time).await;
            });
        } else {
            tokio::spawn(async move {
                agent.run_worker(parent_ctx, user_message, out_tx, start_time).await;
            });
        }
        out_rx
    }

    async fn run_worker(&self, parent_ctx: RunContext, user_message: String, tx: mpsc::Sender<Event>, start_time: chrono::DateTime<chrono::Utc>) {
        let publisher = Publisher::new(tx);
        let trace_handle = self
            .tracer
            .start_trace(
                "agent.run",
                TraceOptions { start_time: Some(start_time), input: Some(json!(user_message)), ..Default::default() },
            )
            .await;
        let publisher = publisher.with_span(Some(trace_handle.trace_id.clone()), Some(trace_handle.span_id.clone()));
        let mut ctx = parent_ctx
            .with_tracer(self.tracer.clone())
            .with_trace_handle(crate::tracer::Handle { trace_id: trace_handle.trace_id.clone(), span_id: trace_handle.span_id.clone() })
            .with_publisher(publisher.clone());

        if let Some(total_run) = self.timeout_policy.total_run {
            let cancellation = ctx.cancellation.clone();
            let deadline_ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(total_run) => cancellation.cancel(),
                    _ = deadline_ctx.cancellation.cancelled() => {}
                }
            });
        }

        publisher.emit(EventType::AgentStart, data("input", json!(user_message))).await;
        for m in &self.middleware {
            ctx = m.on_agent_start(ctx.clone(), &user_message).await;
        }

        let result = self.iterate(&mut ctx, &publisher, user_message).await;

        match result {
            Ok(final_text) => {
                // Reverse registration order: the most-recently-installed
                // wrapper tears down first.
                for m in self.middleware.iter().rev() {
                    m.on_agent_complete(&ctx, &final_text).await;
                }
                let duration_ms = (chrono::Utc::now() - start_time).num_milliseconds();
                publisher.emit(EventType::AgentComplete, data("duration_ms", json!(duration_ms))).await;
            }
            Err(err) => {
                publisher.emit(EventType::Error, data("error", json!(err.to_string()))).await;
            }
        }
        self.tracer.end_trace(&trace_handle).await;
        // `publisher`/`tx` dropped here, closing the channel exactly once.
    }

    async fn iterate(&self, ctx: &mut RunContext, publisher: &Publisher, user_message: String) -> Result<String, BoxError> {
        let dispatcher = Dispatcher::new(self.tools.clone(), self.parallel_tool_policy.clone(), self.approval_policy.clone(), self.timeout_policy.tool_execution);

        let mut previous_response_id: Option<String> = None;
        let mut next_input: Vec<InputItem> = vec![InputItem::UserMessage(user_message)];
        let mut final_text = String::new();

        for _iteration in 0..self.max_iterations {
            if ctx.is_cancelled() {
                return Err(Box::new(EngineError::Cancelled));
            }

            let system_prompt = match &self.system_prompt {
                Some(f) => f(ctx),
                None => String::new(),
            };

            let request = CompletionRequest {
                model: self.model.clone(),
                system_prompt,
                input: std::mem::take(&mut next_input),
                tools: self.tools.schemas(),
                sampling: self.sampling.clone(),
                reasoning_effort: self.reasoning_effort,
                tool_choice: Some(ToolChoice::Auto),
                parallel_tool_calls: true,
                previous_response_id: previous_response_id.clone(),
                store: true,
                stream: false,
                metadata: Default::default(),
            };

            for m in &self.middleware {
                *ctx = m.on_llm_call(ctx.clone(), &request).await;
            }
            let call_ctx = ctx.with_call_timing(chrono::Utc::now());

            let response = self.call_provider(&call_ctx, publisher, request.clone()).await?;

            for m in &self.middleware {
                m.on_llm_response(ctx, &response).await;
            }

            if response.id.is_empty() && response.content.is_empty() && response.tool_calls.is_empty() {
                return Err(Box::new(EngineError::Provider(crate::error::ProviderErrorKind::MalformedResponse, "provider returned zero output items".into())));
            }
            if matches!(response.finish_reason, crate::provider::FinishReason::Error) {
                return Err(Box::new(EngineError::Provider(crate::error::ProviderErrorKind::Other, "response.failed".into())));
            }

            previous_response_id = if response.id.is_empty() { None } else { Some(response.id.clone()) };
            final_text = response.content.clone();

            if response.tool_calls.is_empty() {
                publisher.emit(EventType::FinalOutput, data("response", json!(final_text))).await;
                return Ok(final_text);
            }

            let calls: Vec<ToolCall> = response
                .tool_calls
                .iter()
                .map(|c| ToolCall { id: c.id.clone(), call_id: c.call_id.clone(), name: c.name.clone(), arguments: c.arguments.clone() })
                .collect();

            for call in &calls {
                for m in &self.middleware {
                    *ctx = m.on_tool_start(ctx.clone(), call).await;
                }
            }

            let outputs = dispatcher.dispatch(ctx, publisher, calls).await;
            for output in &outputs {
                for m in self.middleware.iter().rev() {
                    m.on_tool_complete(ctx, output).await;
                }
            }

            if let Some(store) = &self.conversation_store {
                if let Some(conversation_id) = &ctx.conversation_id {
                    let turn = crate::conversation_store::Turn {
                        role: "assistant".into(),
                        content: final_text.clone(),
                        tool_calls: Vec::new(),
                        tool_outputs: outputs.clone(),
                        response_id: previous_response_id.clone(),
                        timestamp: chrono::Utc::now(),
                    };
                    if let Err(err) = store.append(conversation_id, turn).await {
                        log::warn!("failed to append turn to conversation store: {err}");
                    }
                }
            }

            next_input = outputs.into_iter().map(|o| InputItem::ToolOutput { call_id: o.call_id, output: o.output }).collect();
        }

        // MaxIterations exhausted: hard ceiling, terminate without error.
        Ok(final_text)
    }

    async fn call_provider(&self, ctx: &RunContext, publisher: &Publisher, request: CompletionRequest) -> Result<crate::provider::CompletionResponse, BoxError> {
        let provider = self.provider.clone();
        let stream = request.stream;
        let llm_timeout = self.timeout_policy.llm_call;
        let inter_chunk_timeout = self.timeout_policy.inter_chunk;
        let publisher = publisher.clone();
        let model = request.model.clone();
        let input_repr = json!(format!("{:?}", request.input));

        let root_handle = crate::tracer::Handle { trace_id: String::new(), span_id: String::new() };
        let parent_handle = ctx.trace_handle.as_deref().unwrap_or(&root_handle);
        let started_at = ctx.call_timing.as_ref().map(|t| t.started_at).unwrap_or_else(chrono::Utc::now);
        let completion_start = ctx.call_timing.as_ref().and_then(|t| t.completion_start);
        let generation_span = ctx
            .tracer
            .start_span(
                parent_handle,
                "generation",
                SpanOptions { span_type: Some(SpanType::Generation), start_time: Some(started_at), input: Some(input_repr.clone()), ..Default::default() },
            )
            .await;

        let result = retry_provider_call(ctx, &self.retry_policy, move || {
            let provider = provider.clone();
            let request = request.clone();
            let publisher = publisher.clone();
            async move {
                let call = async {
                    if stream {
                        let reader = provider.stream(request).await?;
                        reduce_stream(reader, &publisher, inter_chunk_timeout).await
                    } else {
                        provider.complete(request).await
                    }
                };
                match llm_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(Box::new(EngineError::Provider(crate::error::ProviderErrorKind::Timeout, "llm call timed out".into())) as BoxError),
                    },
                    None => call.await,
                }
            }
        })
        .await;

        match &result {
            Ok(response) => {
                ctx.tracer
                    .log_generation(
                        &generation_span,
                        GenerationOptions {
                            model,
                            input: input_repr,
                            output: Some(json!(response.content)),
                            usage: response.usage.clone(),
                            start_time: Some(started_at),
                            end_time: Some(chrono::Utc::now()),
                            completion_start_time: completion_start,
                            ..Default::default()
                        },
                    )
                    .await;
                ctx.tracer.set_span_output(&generation_span, json!(response.content)).await;
            }
            Err(err) => {
                let mut attributes = std::collections::HashMap::new();
                attributes.insert("error".to_string(), json!(err.to_string()));
                ctx.tracer.set_span_attributes(&generation_span, attributes).await;
            }
        }
        ctx.tracer.end_span(&generation_span).await;

        result
    }
}

impl Clone for CompletionRequest {
    fn clone(&self) -> Self {
        CompletionRequest {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            input: self.input.clone(),
            tools: self.tools.clone(),
            sampling: self.sampling.clone(),
            reasoning_effort: self.reasoning_effort,
            tool_choice: self.tool_choice,
            parallel_tool_calls: self.parallel_tool_calls,
            previous_response_id: self.previous_response_id.clone(),
            store: self.store,
            stream: self.stream,
            metadata: self.metadata.clone(),
        }
    }
}

impl Clone for InputItem {
    fn clone(&self) -> Self {
        match self {
            InputItem::UserMessage(s) => InputItem::UserMessage(s.clone()),
            InputItem::ToolOutput { call_id, output } => InputItem::ToolOutput { call_id: call_id.clone(), output: output.clone() },
        }
    }
}

impl AgentBuilder {
    pub fn system_prompt<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunContext) -> String + Send + Sync + 'static,
    {
        self.system_prompt = Some(Arc::new(f));
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = Some(sampling);
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn approval_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.approval_policy = policy;
        self
    }

    pub fn parallel_tool_policy(mut self, policy: ParallelToolPolicy) -> Self {
        self.parallel_tool_policy = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Validates construction-time invariants and
    /// returns the built, immutable `Agent`.
    pub fn build(self) -> Result<Arc<Agent>, EngineError> {
        if !(1..=100).contains(&self.max_iterations) {
            return Err(EngineError::Configuration(format!("max_iterations must be in 1..=100, got {}", self.max_iterations)));
        }
        if let Some(sampling) = &self.sampling {
            if let Some(temp) = sampling.temperature {
                if !(0.0..=2.0).contains(&temp) {
                    return Err(EngineError::Configuration(format!("temperature must be in 0.0..=2.0, got {temp}")));
                }
            }
        }
        Ok(Arc::new(Agent {
            provider: self.provider,
            model: self.model,
            system_prompt: self.system_prompt,
            tools: ToolSet::new(self.tools),
            max_iterations: self.max_iterations,
            sampling: self.sampling,
            reasoning_effort: self.reasoning_effort,
            retry_policy: self.retry_policy,
            timeout_policy: self.timeout_policy,
            conversation_store: self.conversation_store,
            approval_policy: self.approval_policy,
            parallel_tool_policy: self.parallel_tool_policy,
            event_buffer_size: self.event_buffer_size,
            tracer: self.tracer,
            middleware: self.middleware,
        }))
    }
}
