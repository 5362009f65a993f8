//! Tool descriptors and the turn-local `ToolCall` the dispatcher consumes.
//!
//! The closure-based handler type aliases wrap a tool's implementation as a
//! boxed future; the structured JSON-Schema parameter shape lets strict
//! mode mechanically enforce `additionalProperties: false` and a
//! fully-populated `required` list.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::RunContext;
use crate::error::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Parallel,
    Serial,
}

/// A single JSON-Schema property: name, type, description, and whether it is
/// required. Composed into the tool's top-level object schema by
/// [`ToolBuilder::build`].
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub schema: Value,
    pub required: bool,
}

impl Param {
    pub fn new(name: &str, schema: Value, required: bool) -> Self {
        Param { name: name.to_string(), schema, required }
    }

    pub fn string(name: &str, description: &str, required: bool) -> Self {
        Param::new(name, json!({"type": "string", "description": description}), required)
    }

    pub fn number(name: &str, description: &str, required: bool) -> Self {
        Param::new(name, json!({"type": "number", "description": description}), required)
    }
}

/// The JSON-Schema view of a tool's parameters plus its name/description,
/// i.e. exactly what a `Provider` needs in a `CompletionRequest`.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub strict: bool,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;
pub type Handler = Arc<dyn Fn(RunContext, Value) -> HandlerFuture + Send + Sync>;
pub type Formatter = Arc<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Immutable after [`ToolBuilder::build`].
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    params: Vec<Param>,
    pub strict: bool,
    pub concurrency: Concurrency,
    pub handler: Handler,
    pub pending_formatter: Option<Formatter>,
    pub result_formatter: Option<Formatter>,
}

impl Tool {
    pub fn builder(name: &str, description: &str) -> ToolBuilder {
        ToolBuilder::new(name, description)
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: build_parameters_schema(&self.params, self.strict),
            strict: self.strict,
        }
    }

    pub fn format_pending(&self, arguments: &Value) -> String {
        match &self.pending_formatter {
            Some(f) => f(&self.name, arguments),
            None => format!("calling {}({})", self.name, arguments),
        }
    }

    pub fn format_result(&self, result: &Value) -> String {
        match &self.result_formatter {
            Some(f) => f(&self.name, result),
            None => result.to_string(),
        }
    }

    pub async fn execute(&self, ctx: RunContext, arguments: Value) -> Result<Value, BoxError> {
        (self.handler)(ctx, arguments).await
    }
}

fn build_parameters_schema(params: &[Param], strict: bool) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();
    for p in params {
        let schema = if strict && !p.required {
            // anyOf:[T, {type:null}] so optional fields remain expressible
            // while every top-level key still appears in `required`.
            json!({"anyOf": [p.schema.clone(), {"type": "null"}]})
        } else {
            p.schema.clone()
        };
        properties.insert(p.name.clone(), schema);
        if p.required || strict {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
        "additionalProperties": !strict,
    })
}

pub struct ToolBuilder {
    name: String,
    description: String,
    params: Vec<Param>,
    strict: bool,
    concurrency: Concurrency,
    handler: Option<Handler>,
    pending_formatter: Option<Formatter>,
    result_formatter: Option<Formatter>,
}

impl ToolBuilder {
    pub fn new(name: &str, description: &str) -> Self {
        ToolBuilder {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            strict: true,
            concurrency: Concurrency::Parallel,
            handler: None,
            pending_formatter: None,
            result_formatter: None,
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn pending_formatter(mut self, f: Formatter) -> Self {
        self.pending_formatter = Some(f);
        self
    }

    pub fn result_formatter(mut self, f: Formatter) -> Self {
        self.result_formatter = Some(f);
        self
    }

    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx, args| Box::pin(f(ctx, args))));
        self
    }

    pub fn build(self) -> Tool {
        Tool {
            name: self.name,
            description: self.description,
            params: self.params,
            strict: self.strict,
            concurrency: self.concurrency,
            handler: self.handler.expect("tool handler must be set before build()"),
            pending_formatter: self.pending_formatter,
            result_formatter: self.result_formatter,
        }
    }
}

/// A model-requested tool invocation, parsed from provider output.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// The JSON-stringified result of one tool call, keyed by its `CallID`, fed
/// back as next-turn input.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub output: String,
}

/// Registry of tools keyed by name; overwrites on duplicate registration.
/// Immutable after construction from the agent's perspective — only
/// `ToolSet::new` mutates the map.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolSet {
    pub fn new(tools: Vec<Tool>) -> Self {
        let mut map = HashMap::new();
        for tool in tools {
            map.insert(tool.name.clone(), Arc::new(tool));
        }
        ToolSet { tools: map }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_schema_marks_every_property_required_and_disallows_extras() {
        let tool = Tool::builder("get_weather", "fetch current weather")
            .param(Param::string("location", "city name", true))
            .param(Param::string("unit", "celsius or fahrenheit", false))
            .strict(true)
            .handler(|_ctx, args| async move { Ok(args) })
            .build();

        let schema = tool.schema().parameters;
        assert_eq!(schema["additionalProperties"], json!(false));
        let required: Vec<String> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(required.contains(&"location".to_string()));
        assert!(required.contains(&"unit".to_string()));
        assert!(schema["properties"]["unit"]["anyOf"].is_array());
    }

    #[test]
    fn schema_round_trips_through_json() {
        let tool = Tool::builder("noop", "does nothing")
            .handler(|_ctx, args| async move { Ok(args) })
            .build();
        let schema = tool.schema().parameters;
        let text = serde_json::to_string(&schema).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(schema, parsed);
    }
}
