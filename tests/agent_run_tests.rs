//! Integration tests for the agent iteration loop against `MockProvider`:
//! tool dispatch, parallel ordering, the iteration ceiling, and the
//! boundary behaviors around channel closure and malformed responses.

use agentforge::agent::Agent;
use agentforge::context::RunContext;
use agentforge::dispatcher::ParallelToolPolicy;
use agentforge::event::EventType;
use agentforge::provider::{CompletionResponse, FinishReason, MockProvider, ResponseToolCall, ScriptedTurn};
use agentforge::tool::{Param, Tool};
use agentforge::tracer::NoopTracer;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn response(id: &str, content: &str, tool_calls: Vec<ResponseToolCall>) -> CompletionResponse {
    CompletionResponse {
        id: id.to_string(),
        model: "mock-model".into(),
        created: chrono::Utc::now(),
        content: content.to_string(),
        finish_reason: if tool_calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls },
        tool_calls,
        usage: None,
    }
}

fn weather_tool() -> Tool {
    Tool::builder("get_weather", "fetch current weather for a location")
        .param(Param::string("location", "city name", true))
        .handler(|_ctx, args| async move {
            let _ = args;
            Ok(json!({"temperature": 72, "condition": "sunny"}))
        })
        .build()
}

#[tokio::test]
async fn weather_tool_call_then_final_response() {
    let provider = MockProvider::new(vec![
        ScriptedTurn::Response(response(
            "resp-1",
            "checking weather",
            vec![ResponseToolCall { id: "tc-1".into(), call_id: "call-1".into(), name: "get_weather".into(), arguments: json!({"location": "SF"}).to_string() }],
        )),
        ScriptedTurn::Response(response("resp-2", "72\u{00b0}F and sunny", vec![])),
    ]);

    let agent = Agent::builder(Arc::new(provider), "mock-model")
        .tool(weather_tool())
        .build()
        .unwrap();

    let ctx = RunContext::new(Arc::new(NoopTracer));
    let mut rx = agent.run(ctx, "what's the weather in SF?".to_string());

    let mut kinds = Vec::new();
    let mut final_output = String::new();
    while let Some(event) = rx.recv().await {
        if event.event_type == EventType::FinalOutput {
            final_output = event.get("response").unwrap().as_str().unwrap().to_string();
        }
        kinds.push(event.event_type);
    }

    assert_eq!(kinds.first(), Some(&EventType::AgentStart));
    assert!(kinds.contains(&EventType::ActionDetected));
    assert!(kinds.contains(&EventType::ActionResult));
    assert!(kinds.contains(&EventType::FinalOutput));
    assert_eq!(kinds.last(), Some(&EventType::AgentComplete));
    assert!(final_output.contains("72"));
    assert!(final_output.contains("sunny"));
}

#[tokio::test]
async fn parallel_tools_preserve_order() {
    let started = Arc::new(std::sync::Mutex::new(Vec::new()));
    let s1 = started.clone();
    let s2 = started.clone();

    let tool_1 = Tool::builder("tool_1", "slow tool 1")
        .handler(move |_ctx, _args| {
            let started = s1.clone();
            async move {
                started.lock().unwrap().push(("tool_1", std::time::Instant::now()));
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("done-1"))
            }
        })
        .build();
    let tool_2 = Tool::builder("tool_2", "slow tool 2")
        .handler(move |_ctx, _args| {
            let started = s2.clone();
            async move {
                started.lock().unwrap().push(("tool_2", std::time::Instant::now()));
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("done-2"))
            }
        })
        .build();

    let provider = MockProvider::new(vec![
        ScriptedTurn::Response(response(
            "resp-1",
            "",
            vec![
                ResponseToolCall { id: "1".into(), call_id: "call-1".into(), name: "tool_1".into(), arguments: "{}".into() },
                ResponseToolCall { id: "2".into(), call_id: "call-2".into(), name: "tool_2".into(), arguments: "{}".into() },
            ],
        )),
        ScriptedTurn::Response(response("resp-2", "done", vec![])),
    ]);

    let agent = Agent::builder(Arc::new(provider), "mock-model")
        .tools(vec![tool_1, tool_2])
        .parallel_tool_policy(ParallelToolPolicy { enabled: true, max_concurrent: 2, pessimistic_safety: false })
        .build()
        .unwrap();

    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), "go".into());
    let mut action_results = Vec::new();
    while let Some(event) = rx.recv().await {
        if event.event_type == EventType::ActionResult {
            action_results.push(event.get("result").unwrap().clone());
        }
    }

    assert_eq!(action_results, vec![json!("done-1"), json!("done-2")]);

    let started = started.lock().unwrap();
    let delta = started[1].1.duration_since(started[0].1);
    assert!(delta < Duration::from_millis(5), "both tools should start within 5ms of each other, started {delta:?} apart");
}

#[tokio::test]
async fn serial_tool_drains_in_flight_parallel_tools_before_running() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();
    let o3 = order.clone();

    let slow_parallel = Tool::builder("slow_parallel", "a slow parallel tool")
        .handler(move |_ctx, _args| {
            let order = o1.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().unwrap().push("slow_parallel");
                Ok(json!("done-parallel"))
            }
        })
        .build();
    let fast_parallel = Tool::builder("fast_parallel", "a fast parallel tool")
        .handler(move |_ctx, _args| {
            let order = o2.clone();
            async move {
                order.lock().unwrap().push("fast_parallel");
                Ok(json!("done-fast"))
            }
        })
        .build();
    let barrier = Tool::builder("barrier", "a serial barrier tool")
        .concurrency(agentforge::tool::Concurrency::Serial)
        .handler(move |_ctx, _args| {
            let order = o3.clone();
            async move {
                order.lock().unwrap().push("barrier");
                Ok(json!("done-barrier"))
            }
        })
        .build();

    let provider = MockProvider::new(vec![
        ScriptedTurn::Response(response(
            "resp-1",
            "",
            vec![
                ResponseToolCall { id: "1".into(), call_id: "call-1".into(), name: "slow_parallel".into(), arguments: "{}".into() },
                ResponseToolCall { id: "2".into(), call_id: "call-2".into(), name: "fast_parallel".into(), arguments: "{}".into() },
                ResponseToolCall { id: "3".into(), call_id: "call-3".into(), name: "barrier".into(), arguments: "{}".into() },
            ],
        )),
        ScriptedTurn::Response(response("resp-2", "done", vec![])),
    ]);

    let agent = Agent::builder(Arc::new(provider), "mock-model")
        .tools(vec![slow_parallel, fast_parallel, barrier])
        .parallel_tool_policy(ParallelToolPolicy { enabled: true, max_concurrent: 2, pessimistic_safety: false })
        .build()
        .unwrap();

    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), "go".into());
    let mut action_results = Vec::new();
    while let Some(event) = rx.recv().await {
        if event.event_type == EventType::ActionResult {
            action_results.push(event.get("result").unwrap().clone());
        }
    }

    // Output order still follows call order regardless of the barrier.
    assert_eq!(action_results, vec![json!("done-parallel"), json!("done-fast"), json!("done-barrier")]);
    // But the barrier only actually ran after both parallel tools finished.
    assert_eq!(*order.lock().unwrap(), vec!["fast_parallel", "slow_parallel", "barrier"]);
}

#[tokio::test]
async fn iteration_ceiling_terminates_without_error() {
    let pinger = Tool::builder("ping", "always returns pong")
        .handler(|_ctx, _args| async move { Ok(json!("pong")) })
        .build();

    // The provider keeps returning the same tool call forever.
    let provider = MockProvider::repeating(vec![ScriptedTurn::Response(response(
        "resp",
        "",
        vec![ResponseToolCall { id: "1".into(), call_id: "call-1".into(), name: "ping".into(), arguments: "{}".into() }],
    ))]);

    let agent = Agent::builder(Arc::new(provider), "mock-model")
        .tool(pinger)
        .max_iterations(3)
        .build()
        .unwrap();

    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), "go".into());
    let mut action_results = 0;
    let mut final_output_seen = false;
    let mut saw_complete = false;
    while let Some(event) = rx.recv().await {
        match event.event_type {
            EventType::ActionResult => action_results += 1,
            EventType::FinalOutput => final_output_seen = true,
            EventType::AgentComplete => saw_complete = true,
            _ => {}
        }
    }

    assert_eq!(action_results, 3);
    assert!(!final_output_seen, "iteration ceiling should terminate without a final_output event");
    assert!(saw_complete);
}

#[tokio::test]
async fn event_channel_closes_exactly_once_and_empty_message_passes_through() {
    let provider = MockProvider::new(vec![ScriptedTurn::Response(response("resp-1", "ok", vec![]))]);
    let agent = Agent::builder(Arc::new(provider), "mock-model").build().unwrap();
    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), String::new());

    let mut count = 0;
    while rx.recv().await.is_some() {
        count += 1;
    }
    assert!(count >= 2); // at least agent_start + agent_complete
    assert!(rx.recv().await.is_none(), "channel stays closed after drain");
}

#[tokio::test]
async fn max_iterations_of_one_allows_exactly_one_provider_call() {
    let pinger = Tool::builder("ping", "always returns pong")
        .handler(|_ctx, _args| async move { Ok(json!("pong")) })
        .build();
    let provider = MockProvider::new(vec![ScriptedTurn::Response(response(
        "resp",
        "",
        vec![ResponseToolCall { id: "1".into(), call_id: "call-1".into(), name: "ping".into(), arguments: "{}".into() }],
    ))]);
    let agent = Agent::builder(Arc::new(provider), "mock-model").tool(pinger).max_iterations(1).build().unwrap();

    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), "go".into());
    let mut action_results = 0;
    while let Some(event) = rx.recv().await {
        if event.event_type == EventType::ActionResult {
            action_results += 1;
        }
    }
    assert_eq!(action_results, 1, "the single tool call still executes even though no follow-up LLM call is made");
}

#[tokio::test]
async fn zero_output_items_yields_error_event_and_no_final_output() {
    let provider = MockProvider::new(vec![ScriptedTurn::Response(response("", "", vec![]))]);
    let agent = Agent::builder(Arc::new(provider), "mock-model").build().unwrap();
    let mut rx = agent.run(RunContext::new(Arc::new(NoopTracer)), "go".into());

    let mut saw_error = false;
    let mut saw_final_output = false;
    while let Some(event) = rx.recv().await {
        match event.event_type {
            EventType::Error => saw_error = true,
            EventType::FinalOutput => saw_final_output = true,
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(!saw_final_output);
}

#[tokio::test]
async fn construction_rejects_invalid_max_iterations() {
    let provider = MockProvider::new(vec![]);
    let result = Agent::builder(Arc::new(provider), "mock-model").max_iterations(0).build();
    assert!(result.is_err());
}
