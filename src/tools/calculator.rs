//! A scientific calculator tool illustrating the [`crate::tool::Tool`]
//! builder end to end.
//!
//! Wraps the `evalexpr` crate to evaluate arithmetic expressions, narrowed
//! to plain arithmetic and the built-in math functions `evalexpr` ships
//! with; a richer statistics surface isn't needed to exercise the
//! dispatcher.

use evalexpr::eval;
use serde_json::json;

use crate::tool::{Param, Tool};

/// Builds the `calculator` tool: `{expression: string required}` in,
/// `{result: number}` out.
pub fn calculator_tool() -> Tool {
    Tool::builder("calculator", "Evaluates a scientific arithmetic expression and returns the numeric result.")
        .param(Param::string("expression", "the arithmetic expression to evaluate, e.g. \"2 + 2 * 3\"", true))
        .strict(true)
        .handler(|_ctx, args| async move {
            let expression = args
                .get("expression")
                .and_then(|v| v.as_str())
                .ok_or("missing required field: expression")?;
            let value = eval(expression).map_err(|e| format!("failed to evaluate '{expression}': {e}"))?;
            let number = value
                .as_number()
                .map_err(|_| format!("expression '{expression}' did not evaluate to a number"))?;
            Ok(json!({ "result": number }))
        })
        .result_formatter(std::sync::Arc::new(|_name, result| format!("= {}", result.get("result").cloned().unwrap_or_default())))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::tracer::NoopTracer;
    use std::sync::Arc;

    #[tokio::test]
    async fn evaluates_basic_arithmetic() {
        let tool = calculator_tool();
        let ctx = RunContext::new(Arc::new(NoopTracer));
        let result = tool.execute(ctx, json!({"expression": "2 + 2 * 3"})).await.unwrap();
        assert_eq!(result["result"], json!(8));
    }

    #[tokio::test]
    async fn rejects_malformed_expressions() {
        let tool = calculator_tool();
        let ctx = RunContext::new(Arc::new(NoopTracer));
        let result = tool.execute(ctx, json!({"expression": "2 +"})).await;
        assert!(result.is_err());
    }
}
