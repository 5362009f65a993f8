//! Typed event records streamed out of a [`crate::agent::Agent::run`] call.
//!
//! # Event flow
//!
//! ```text
//! worker task                    consumer
//!     |  emit(agent_start)           |
//!     |------------------------------>|
//!     |  emit(action_detected)       |
//!     |------------------------------>|
//!     |  emit(action_result)         |
//!     |------------------------------>|
//!     |  emit(final_output)          |
//!     |------------------------------>|
//!     |  emit(agent_complete)        |
//!     |------------------------------>|
//!     X  channel closed               |
//! ```
//!
//! When a run is a child of another run, an intermediate channel and a pump
//! task sit between the worker and the child's own output channel, forwarding
//! every event to the parent's publisher as well (see [`bubble`]).

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// The kind of lifecycle moment an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ThinkingChunk,
    ActionDetected,
    ActionResult,
    ApprovalRequired,
    ApprovalGranted,
    ApprovalDenied,
    Progress,
    Decision,
    AgentStart,
    AgentComplete,
    FinalOutput,
    Error,
}

/// An immutable record of something that happened during a run.
///
/// Created exclusively through [`Event::new`] / the `emit_*` helpers on
/// [`Publisher`]; never mutated after emission.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub data: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, data: HashMap<String, Value>) -> Self {
        Event {
            event_type,
            data,
            timestamp: Utc::now(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_trace(mut self, trace_id: Option<String>, span_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self.span_id = span_id;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Builds a one-entry data map; a small convenience used throughout the
/// engine so call sites read as `data("chunk", json!(text))`.
pub fn data(key: &str, value: Value) -> HashMap<String, Value> {
    let mut m = HashMap::new();
    m.insert(key.to_string(), value);
    m
}

/// The write half of a run's event channel.
///
/// A worker task owns its `Publisher` exclusively (single-writer discipline,
/// per the invariant that the channel is written only by the owning run's
/// worker plus child bubblers feeding through a pump).
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Event>,
    trace_id: Option<String>,
    span_id: Option<String>,
}

impl Publisher {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Publisher {
            tx,
            trace_id: None,
            span_id: None,
        }
    }

    /// Derive a publisher that stamps a given trace/span onto every event it emits.
    pub fn with_span(&self, trace_id: Option<String>, span_id: Option<String>) -> Self {
        Publisher {
            tx: self.tx.clone(),
            trace_id,
            span_id,
        }
    }

    pub async fn emit(&self, event_type: EventType, data: HashMap<String, Value>) {
        let event = Event::new(event_type, data).with_trace(self.trace_id.clone(), self.span_id.clone());
        if self.tx.send(event).await.is_err() {
            log::debug!("event receiver dropped; discarding {event_type:?} event");
        }
    }
}

/// Spawns a pump task that forwards every event read from `rx` to both
/// `parent` and the child's own outbound sender `child_tx`, then returns a
/// join handle. The caller must await the handle before treating the child
/// run as fully drained, guaranteeing no event is lost and no task leaks.
pub fn bubble(
    mut rx: mpsc::Receiver<Event>,
    parent: Publisher,
    child_tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let _ = parent.tx.send(event.clone()).await;
            if child_tx.send(event).await.is_err() {
                log::debug!("child event receiver dropped while bubbling");
            }
        }
    })
}
