//! Core execution engine for LLM-powered agents: an iteration loop that
//! drives a multi-turn conversation with a language-model provider,
//! dispatches tool invocations, streams events to a consumer, and
//! propagates observability and delegation context through nested agent
//! hierarchies.

pub mod agent;
pub mod config;
pub mod context;
pub mod conversation_store;
pub mod delegation;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod middleware;
pub mod provider;
pub mod reducer;
pub mod retry;
pub mod tool;
pub mod tools;
pub mod tracer;

pub use agent::{Agent, AgentBuilder};
pub use context::RunContext;
pub use event::{Event, EventType, Publisher};
pub use provider::{CompletionRequest, CompletionResponse, MockProvider, Provider, StreamChunk};
pub use tool::{Tool, ToolBuilder};
pub use tracer::{NoopTracer, Tracer};
