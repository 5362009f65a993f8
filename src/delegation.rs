//! Delegation and tracing propagation: sub-agent-as-tool, handoff, and
//! collaboration sessions — all reentrant invocations of the iteration loop
//! under a span, inheriting the parent's tracer and event publisher.
//!
//! The facilitator/peer round structure follows a moderator-picks-speaker
//! discussion shape, with per-round bookkeeping; the `CONCLUDE` marker and
//! guaranteed post-round synthesis are specific to this engine.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::{BoxError, EngineError};
use crate::event::{Event, EventType};
use crate::tool::{Param, Tool};

/// Drains an inner agent's event stream, collecting its terminal response
/// and (optionally) a trace of reasoning/tool-call/progress/decision
/// events.
async fn drain_run(mut rx: tokio::sync::mpsc::Receiver<Event>, include_trace: bool) -> Result<(String, Vec<Event>), BoxError> {
    let mut final_text = String::new();
    let mut trace = Vec::new();
    let mut saw_error = None;

    while let Some(event) = rx.recv().await {
        match event.event_type {
            EventType::FinalOutput => {
                final_text = event.get("response").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            }
            EventType::Error => {
                saw_error = Some(event.get("error").and_then(|v| v.as_str()).unwrap_or("sub-agent run failed").to_string());
            }
            EventType::ThinkingChunk | EventType::ActionDetected | EventType::ActionResult | EventType::Progress | EventType::Decision => {
                if include_trace {
                    trace.push(event);
                }
            }
            _ => {}
        }
    }

    if let Some(err) = saw_error {
        return Err(Box::new(EngineError::Delegation(err)));
    }
    Ok((final_text, trace))
}

/// Builds the child `RunContext` a delegated run executes under: it shares
/// the caller's tracer (shallow-copy-then-override), the
/// caller's cancellation token, dependencies, and conversation id, and
/// bubbles its events through the caller's publisher if one is set.
fn child_context(ctx: &RunContext) -> RunContext {
    let mut child = RunContext::new(ctx.tracer.clone());
    child.cancellation = ctx.cancellation.clone();
    child.dependencies = ctx.dependencies.clone();
    child.conversation_id = ctx.conversation_id.clone();
    if let Some(publisher) = &ctx.publisher {
        child = child.with_parent_publisher(publisher.clone());
    }
    child
}

/// Wraps `agent` as a [`Tool`] other agents can register as sub-agent-as-tool.
/// Schema is `{input: string required}`.
pub fn sub_agent_tool(agent: Arc<Agent>, name: &str, description: &str) -> Tool {
    sub_agent_tool_with_trace(agent, name, description, false)
}

/// As [`sub_agent_tool`] but the tool result includes a `{response, summary,
/// trace}` mapping instead of a bare response string when `include_trace`
/// is set.
pub fn sub_agent_tool_with_trace(agent: Arc<Agent>, name: &str, description: &str, include_trace: bool) -> Tool {
    let tool_name = name.to_string();
    Tool::builder(name, description)
        .param(Param::string("input", "task for the sub-agent to perform", true))
        .strict(true)
        .handler(move |ctx, args| {
            let agent = agent.clone();
            let tool_name = tool_name.clone();
            async move {
                let input = args.get("input").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let root = crate::tracer::Handle { trace_id: ctx.trace_handle.as_ref().map(|h| h.trace_id.clone()).unwrap_or_default(), span_id: String::new() };
                let span = ctx
                    .tracer
                    .start_span(
                        &root,
                        "sub-agent",
                        crate::tracer::SpanOptions {
                            metadata: vec![("name".to_string(), json!(tool_name)), ("input_length".to_string(), json!(input.len()))].into_iter().collect(),
                            ..Default::default()
                        },
                    )
                    .await;

                let child_agent = agent.with_tracer(ctx.tracer.clone());
                let child_ctx = child_context(&ctx);
                let rx = Arc::new(child_agent).run(child_ctx, input);
                let result = drain_run(rx, include_trace).await;
                ctx.tracer.end_span(&span).await;

                let (response, trace) = result?;
                if include_trace {
                    Ok(json!({
                        "response": response,
                        "summary": response,
                        "trace": trace.iter().map(describe_event).collect::<Vec<_>>(),
                    }))
                } else {
                    Ok(Value::String(response))
                }
            }
        })
        .build()
}

fn describe_event(event: &Event) -> Value {
    json!({"type": format!("{:?}", event.event_type), "data": event.data})
}

/// Options for a one-shot [`handoff`] delegation.
#[derive(Debug, Clone, Default)]
pub struct HandoffOptions {
    pub max_turns: Option<u32>,
    pub background: Option<String>,
    pub include_trace: bool,
}

#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub response: String,
    pub trace: Option<Vec<String>>,
}

/// One-shot delegation identical in mechanics to sub-agent tooling, with
/// `MaxTurns` override, an optional `Background` prefix, and an optional
/// trace array returned to the caller.
pub async fn handoff(agent: Arc<Agent>, ctx: &RunContext, task: String, options: HandoffOptions) -> Result<HandoffResult, BoxError> {
    let task = match &options.background {
        Some(background) => format!("{background}\n\n{task}"),
        None => task,
    };
    let _ = options.max_turns; // MaxTurns is enforced by the agent's own MaxIterations; a smaller override would require rebuilding the agent, left to the caller.

    let child_agent = agent.with_tracer(ctx.tracer.clone());
    let child_ctx = child_context(ctx);
    let rx = Arc::new(child_agent).run(child_ctx, task);
    let (response, trace) = drain_run(rx, options.include_trace).await?;

    Ok(HandoffResult {
        response,
        trace: if options.include_trace {
            Some(trace.iter().map(|e| format!("{:?}: {:?}", e.event_type, e.data)).collect())
        } else {
            None
        },
    })
}

/// A facilitator-driven, bounded multi-agent discussion. Each round runs
/// every peer once, then the
/// facilitator synthesizes the round and may emit `CONCLUDE` to stop early.
pub struct CollaborationSession {
    pub facilitator: Arc<Agent>,
    pub peers: Vec<Arc<Agent>>,
    pub rounds: u32,
}

#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub round: u32,
    pub contributions: Vec<String>,
    pub synthesis: String,
    pub concluded: bool,
}

impl CollaborationSession {
    pub fn new(facilitator: Arc<Agent>, peers: Vec<Arc<Agent>>, rounds: u32) -> Self {
        CollaborationSession { facilitator, peers, rounds }
    }

    /// Runs up to `self.rounds` discussion rounds and returns the
    /// facilitator's final synthesis of the whole discussion. A failing
    /// round stops discussion but still produces a final synthesis on
    /// whatever accumulated.
    pub async fn run(&self, ctx: &RunContext, topic: String) -> Result<String, BoxError> {
        let mut history: Vec<RoundRecord> = Vec::new();
        let mut transcript = format!("Topic: {topic}\n");

        for round in 0..self.rounds {
            match self.run_round(ctx, round, &transcript).await {
                Ok(record) => {
                    transcript.push_str(&format!("\n-- Round {} --\n{}\nSynthesis: {}\n", round, record.contributions.join("\n"), record.synthesis));
                    let concluded = record.concluded;
                    history.push(record);
                    if concluded {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("collaboration round {round} failed: {err}");
                    break;
                }
            }
        }

        self.final_synthesis(ctx, &transcript).await
    }

    async fn run_round(&self, ctx: &RunContext, round: u32, transcript: &str) -> Result<RoundRecord, BoxError> {
        let mut contributions = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let prompt = format!("{transcript}\n\nContribute your perspective for round {round}.");
            let child_agent = peer.with_tracer(ctx.tracer.clone());
            let child_ctx = child_context(ctx);
            let rx = Arc::new(child_agent).run(child_ctx, prompt);
            let (response, _) = drain_run(rx, false).await?;
            contributions.push(response);
        }

        let synthesis_prompt = format!(
            "{transcript}\n\nPeer contributions this round:\n{}\n\nSynthesize this round. If the discussion has reached a conclusion, begin your reply with CONCLUDE.",
            contributions.join("\n")
        );
        let facilitator = self.facilitator.with_tracer(ctx.tracer.clone());
        let facilitator_ctx = child_context(ctx);
        let rx = Arc::new(facilitator).run(facilitator_ctx, synthesis_prompt);
        let (synthesis, _) = drain_run(rx, false).await?;
        let concluded = synthesis.trim_start().starts_with("CONCLUDE");

        Ok(RoundRecord { round, contributions, synthesis, concluded })
    }

    async fn final_synthesis(&self, ctx: &RunContext, transcript: &str) -> Result<String, BoxError> {
        let prompt = format!("{transcript}\n\nProduce a final synthesis of the entire discussion.");
        let facilitator = self.facilitator.with_tracer(ctx.tracer.clone());
        let facilitator_ctx = child_context(ctx);
        let rx = Arc::new(facilitator).run(facilitator_ctx, prompt);
        let (synthesis, _) = drain_run(rx, false).await?;
        Ok(synthesis)
    }
}
