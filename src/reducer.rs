//! Streaming chunk reducer.
//!
//! A tagged-variant state machine (Rust enum dispatch via
//! [`crate::provider::StreamChunk`]); the slot table is keyed by
//! provider-assigned output index and never assumes monotonic arrival.

use crate::error::{BoxError, EngineError};
use crate::event::{data, EventType, Publisher};
use crate::provider::{CompletionResponse, FinishReason, ResponseToolCall, StreamChunk, StreamReader, Usage};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct Slot {
    id: String,
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
    is_tool_call: bool,
}

/// Accumulates delta events from the provider into a coherent per-turn state
/// (text, tool calls, usage). Discarded at iteration end.
pub struct ChunkReducer {
    slots: BTreeMap<usize, Slot>,
    final_text: String,
    response_id: Option<String>,
    usage: Option<Usage>,
    chunk_count: usize,
}

impl ChunkReducer {
    pub fn new() -> Self {
        ChunkReducer {
            slots: BTreeMap::new(),
            final_text: String::new(),
            response_id: None,
            usage: None,
            chunk_count: 0,
        }
    }

    /// Applies one chunk. Returns an error only for `StreamChunk::Error`,
    /// which also terminates the reducer.
    pub fn apply(&mut self, chunk: StreamChunk) -> Result<(), BoxError> {
        self.chunk_count += 1;
        match chunk {
            StreamChunk::ItemAdded { output_index, is_tool_call } => {
                let slot = self.slots.entry(output_index).or_default();
                slot.is_tool_call = is_tool_call;
            }
            StreamChunk::TextDelta { output_index: _, delta } => {
                self.final_text.push_str(&delta);
            }
            StreamChunk::FunctionArgumentsDelta { output_index, delta } => {
                self.slots.entry(output_index).or_default().arguments.push_str(&delta);
            }
            StreamChunk::FunctionArgumentsDone { output_index, name, arguments } => {
                let slot = self.slots.entry(output_index).or_default();
                slot.is_tool_call = true;
                slot.name = Some(name);
                // The `done` event is authoritative over any prior deltas.
                slot.arguments = arguments;
            }
            StreamChunk::OutputItemDone { output_index, id, call_id, name, arguments } => {
                let slot = self.slots.entry(output_index).or_default();
                slot.id = id;
                if call_id.is_some() {
                    slot.call_id = call_id;
                }
                if let Some(name) = name {
                    slot.name = Some(name);
                    slot.is_tool_call = true;
                }
                if let Some(arguments) = arguments {
                    slot.arguments = arguments;
                }
            }
            StreamChunk::ResponseDone { response_id, usage } => {
                self.response_id = Some(response_id);
                if usage.is_some() {
                    self.usage = usage;
                } else {
                    log::warn!("response.done chunk carried no usage data");
                }
            }
            StreamChunk::Error(msg) => {
                return Err(Box::new(EngineError::Stream(msg)));
            }
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Emits a `thinking_chunk` event for a text delta as it streams in;
    /// called by the agent loop alongside `apply` so the reducer itself
    /// stays free of channel plumbing.
    pub async fn emit_text_delta(publisher: &Publisher, delta: &str) {
        publisher.emit(EventType::ThinkingChunk, data("chunk", json!(delta))).await;
    }

    pub fn into_response(self) -> CompletionResponse {
        let mut tool_calls = Vec::new();
        for slot in self.slots.values() {
            if slot.is_tool_call {
                tool_calls.push(ResponseToolCall {
                    id: slot.id.clone(),
                    call_id: slot.call_id.clone().unwrap_or_else(|| slot.id.clone()),
                    name: slot.name.clone().unwrap_or_default(),
                    arguments: slot.arguments.clone(),
                });
            }
        }
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        CompletionResponse {
            id: self.response_id.unwrap_or_default(),
            model: String::new(),
            created: chrono::Utc::now(),
            content: self.final_text,
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

impl Default for ChunkReducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`StreamReader`] to completion through a [`ChunkReducer`],
/// emitting `thinking_chunk` events as text deltas arrive and honoring an
/// inter-chunk timeout if configured.
pub async fn reduce_stream(
    mut reader: Box<dyn StreamReader>,
    publisher: &Publisher,
    inter_chunk_timeout: Option<std::time::Duration>,
) -> Result<CompletionResponse, BoxError> {
    let mut reducer = ChunkReducer::new();
    loop {
        let next = match inter_chunk_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.next()).await {
                Ok(next) => next,
                Err(_) => return Err(Box::new(EngineError::Stream("inter-chunk timeout".into()))),
            },
            None => reader.next().await,
        };
        match next {
            None => break,
            Some(Err(err)) => return Err(err),
            Some(Ok(chunk)) => {
                if let StreamChunk::TextDelta { ref delta, .. } = chunk {
                    ChunkReducer::emit_text_delta(publisher, delta).await;
                }
                reducer.apply(chunk)?;
            }
        }
    }
    Ok(reducer.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_event_is_authoritative_over_prior_deltas() {
        let mut reducer = ChunkReducer::new();
        reducer.apply(StreamChunk::ItemAdded { output_index: 0, is_tool_call: true }).unwrap();
        reducer.apply(StreamChunk::FunctionArgumentsDelta { output_index: 0, delta: "{\"loc".into() }).unwrap();
        reducer
            .apply(StreamChunk::FunctionArgumentsDone {
                output_index: 0,
                name: "get_weather".into(),
                arguments: "{\"location\":\"SF\"}".into(),
            })
            .unwrap();
        let response = reducer.into_response();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, "{\"location\":\"SF\"}");
    }

    #[test]
    fn slots_keyed_by_index_survive_out_of_order_arrival() {
        let mut reducer = ChunkReducer::new();
        reducer
            .apply(StreamChunk::FunctionArgumentsDone { output_index: 1, name: "b".into(), arguments: "{}".into() })
            .unwrap();
        reducer
            .apply(StreamChunk::FunctionArgumentsDone { output_index: 0, name: "a".into(), arguments: "{}".into() })
            .unwrap();
        let response = reducer.into_response();
        assert_eq!(response.tool_calls[0].name, "a");
        assert_eq!(response.tool_calls[1].name, "b");
    }

    #[test]
    fn error_chunk_terminates_reduction() {
        let mut reducer = ChunkReducer::new();
        let err = reducer.apply(StreamChunk::Error("boom".into()));
        assert!(err.is_err());
    }
}
