//! The `Provider` contract: request/response/stream-chunk value types plus
//! the `Provider` trait itself and a scriptable [`MockProvider`].
//!
//! A two-method async contract (`complete`/`stream`), widened to
//! Responses-API-style fields (`previous_response_id`, `reasoning_effort`)
//! for native, agentic tool calling. This crate does not implement a vendor
//! HTTP client — that is explicitly out of scope — only the contract and a
//! test double.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::BoxError;
use crate::tool::ToolSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: u64,
}

/// Sampling parameters for a non-reasoning model. Mutually exclusive with
/// [`ReasoningEffort`] — reasoning models ignore temperature/top-p.
#[derive(Debug, Clone, Default)]
pub struct Sampling {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One prior input to the model: either the original user message or a
/// tool's output, keyed by its `CallID`.
#[derive(Debug)]
pub enum InputItem {
    UserMessage(String),
    ToolOutput { call_id: String, output: String },
}

#[derive(Debug, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub input: Vec<InputItem>,
    pub tools: Vec<ToolSchema>,
    pub sampling: Option<Sampling>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub tool_choice: Option<ToolChoice>,
    pub parallel_tool_calls: bool,
    pub previous_response_id: Option<String>,
    pub store: bool,
    pub stream: bool,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ResponseToolCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub content: String,
    pub tool_calls: Vec<ResponseToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

/// A single delta event from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    ItemAdded { output_index: usize, is_tool_call: bool },
    TextDelta { output_index: usize, delta: String },
    FunctionArgumentsDelta { output_index: usize, delta: String },
    FunctionArgumentsDone { output_index: usize, name: String, arguments: String },
    OutputItemDone { output_index: usize, id: String, call_id: Option<String>, name: Option<String>, arguments: Option<String> },
    ResponseDone { response_id: String, usage: Option<Usage> },
    Error(String),
}

/// Pull-based stream of [`StreamChunk`]s. Dropping the reader releases
/// resources; the idiomatic substitute for an explicit `Close()` method.
#[async_trait]
pub trait StreamReader: Send {
    async fn next(&mut self) -> Option<Result<StreamChunk, BoxError>>;
}

/// The `Provider` contract.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, BoxError>;
    async fn stream(&self, request: CompletionRequest) -> Result<Box<dyn StreamReader>, BoxError>;
}

/// One scripted turn for [`MockProvider`]: either a canned non-streaming
/// response or a canned sequence of stream chunks.
pub enum ScriptedTurn {
    Response(CompletionResponse),
    Stream(Vec<StreamChunk>),
    /// Fails the call `attempts_to_fail` times with the given provider error
    /// kind before the engine's retry wrapper would need to move on; used to
    /// test transient-failure retry behavior.
    Failing(crate::error::ProviderErrorKind, String),
}

/// A provider test double driven by a scripted sequence of turns, consumed
/// in order as the agent loop calls `complete`/`stream` repeatedly. Required
/// by the integration test scenarios (weather tool, parallel tools,
/// iteration ceiling, cancellation, sub-agent trace inheritance).
pub struct MockProvider {
    turns: Mutex<std::collections::VecDeque<ScriptedTurn>>,
    repeat_last: bool,
}

impl MockProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        MockProvider {
            turns: Mutex::new(turns.into()),
            repeat_last: false,
        }
    }

    /// When the scripted sequence is exhausted, keep returning the last
    /// turn instead of erroring — used by the iteration-ceiling scenario
    /// where the mock provider returns the same tool call ad infinitum.
    pub fn repeating(turns: Vec<ScriptedTurn>) -> Self {
        MockProvider {
            turns: Mutex::new(turns.into()),
            repeat_last: true,
        }
    }

    fn pop(&self) -> Option<ScriptedTurn> {
        let mut turns = self.turns.lock().unwrap();
        if self.repeat_last && turns.len() == 1 {
            // Clone the shape of the last turn without consuming it.
            return Some(clone_turn(turns.front().unwrap()));
        }
        turns.pop_front()
    }
}

fn clone_turn(turn: &ScriptedTurn) -> ScriptedTurn {
    match turn {
        ScriptedTurn::Response(r) => ScriptedTurn::Response(r.clone()),
        ScriptedTurn::Stream(chunks) => ScriptedTurn::Stream(chunks.clone()),
        ScriptedTurn::Failing(kind, msg) => ScriptedTurn::Failing(*kind, msg.clone()),
    }
}

impl Clone for CompletionResponse {
    fn clone(&self) -> Self {
        CompletionResponse {
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            finish_reason: self.finish_reason,
            usage: self.usage.clone(),
        }
    }
}

struct VecStreamReader {
    chunks: std::vec::IntoIter<StreamChunk>,
}

#[async_trait]
impl StreamReader for VecStreamReader {
    async fn next(&mut self) -> Option<Result<StreamChunk, BoxError>> {
        match self.chunks.next() {
            Some(StreamChunk::Error(msg)) => Some(Err(Box::new(crate::error::EngineError::Stream(msg)))),
            Some(chunk) => Some(Ok(chunk)),
            None => None,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, BoxError> {
        match self.pop() {
            Some(ScriptedTurn::Response(response)) => Ok(response),
            Some(ScriptedTurn::Stream(chunks)) => {
                // Non-streaming call against a scripted stream turn: reduce
                // it client-side into a single response for convenience.
                reduce_chunks_to_response(chunks)
            }
            Some(ScriptedTurn::Failing(kind, msg)) => Err(Box::new(crate::error::EngineError::Provider(kind, msg))),
            None => Err(Box::new(crate::error::EngineError::Provider(
                crate::error::ProviderErrorKind::Other,
                "mock provider script exhausted".into(),
            ))),
        }
    }

    async fn stream(&self, _request: CompletionRequest) -> Result<Box<dyn StreamReader>, BoxError> {
        match self.pop() {
            Some(ScriptedTurn::Stream(chunks)) => Ok(Box::new(VecStreamReader { chunks: chunks.into_iter() })),
            Some(ScriptedTurn::Response(response)) => Ok(Box::new(VecStreamReader {
                chunks: response_to_chunks(response).into_iter(),
            })),
            Some(ScriptedTurn::Failing(kind, msg)) => Err(Box::new(crate::error::EngineError::Provider(kind, msg))),
            None => Err(Box::new(crate::error::EngineError::Provider(
                crate::error::ProviderErrorKind::Other,
                "mock provider script exhausted".into(),
            ))),
        }
    }
}

fn response_to_chunks(response: CompletionResponse) -> Vec<StreamChunk> {
    let mut chunks = vec![StreamChunk::ItemAdded { output_index: 0, is_tool_call: false }];
    if !response.content.is_empty() {
        chunks.push(StreamChunk::TextDelta { output_index: 0, delta: response.content.clone() });
    }
    for (i, call) in response.tool_calls.iter().enumerate() {
        let idx = i + 1;
        chunks.push(StreamChunk::ItemAdded { output_index: idx, is_tool_call: true });
        chunks.push(StreamChunk::FunctionArgumentsDone {
            output_index: idx,
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        chunks.push(StreamChunk::OutputItemDone {
            output_index: idx,
            id: call.id.clone(),
            call_id: Some(call.call_id.clone()),
            name: Some(call.name.clone()),
            arguments: Some(call.arguments.clone()),
        });
    }
    chunks.push(StreamChunk::ResponseDone { response_id: response.id.clone(), usage: response.usage.clone() });
    chunks
}

fn reduce_chunks_to_response(chunks: Vec<StreamChunk>) -> Result<CompletionResponse, BoxError> {
    use crate::reducer::ChunkReducer;
    let mut reducer = ChunkReducer::new();
    for chunk in chunks {
        reducer.apply(chunk)?;
    }
    Ok(reducer.into_response())
}
