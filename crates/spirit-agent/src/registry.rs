use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use spirit_sandbox::ToolResult;

pub const EXECUTE_CODE_TOOL: &str = "execute_code";
pub const COMPACT_CONTEXT_TOOL: &str = "compact_context";

/// Parameter scalar type, matched against `typeof` of the incoming JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub type_: ParamType,
    pub description: String,
    pub required: bool,
    pub enum_values: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
}

/// Implemented once per tool; invoked only after [`ToolRegistry::dispatch`]
/// has validated `params` against the tool's [`Parameter`] list.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value) -> ToolResult;
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Box<dyn ToolHandler>,
}

/// Tool definitions and handlers, in registration order. `execute_code` and
/// `compact_context` are registered here so they appear in the model's tool
/// list, but the agent loop intercepts those two names before ever calling
/// `dispatch` — their handlers are never meant to run.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// A registry pre-loaded with the two agent-loop-routed placeholder tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(
                ToolDefinition {
                    name: EXECUTE_CODE_TOOL.to_string(),
                    description: "Execute a snippet of code in the sandbox and return its output."
                        .to_string(),
                    parameters: vec![Parameter {
                        name: "code".to_string(),
                        type_: ParamType::String,
                        description: "Source code to run.".to_string(),
                        required: true,
                        enum_values: None,
                    }],
                },
                Box::new(RoutedElsewhere),
            )
            .expect("builtin tool names are unique");
        registry
            .register(
                ToolDefinition {
                    name: COMPACT_CONTEXT_TOOL.to_string(),
                    description: "Compress the current conversation history into a bounded summary."
                        .to_string(),
                    parameters: Vec::new(),
                },
                Box::new(RoutedElsewhere),
            )
            .expect("builtin tool names are unique");
        registry
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Box<dyn ToolHandler>,
    ) -> Result<(), String> {
        if self.index.contains_key(&definition.name) {
            return Err(format!("duplicate tool registration: {}", definition.name));
        }
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool { definition, handler });
        Ok(())
    }

    pub fn get_definitions(&self) -> Vec<&ToolDefinition> {
        self.tools.iter().map(|t| &t.definition).collect()
    }

    pub async fn dispatch(&self, name: &str, params: Value) -> ToolResult {
        let Some(&idx) = self.index.get(name) else {
            return ToolResult::error(format!("unknown tool: {name}"));
        };
        let tool = &self.tools[idx];
        if let Err(e) = validate(&tool.definition, &params) {
            return ToolResult::error(e);
        }
        tool.handler.call(params).await
    }

    /// JSON-Schema-shaped descriptors for the model's tool list.
    pub fn to_model_tools(&self) -> Vec<crate::provider::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for p in &t.definition.parameters {
                    let mut prop = serde_json::json!({
                        "type": p.type_.to_string(),
                        "description": p.description,
                    });
                    if let Some(values) = &p.enum_values {
                        prop["enum"] = serde_json::json!(values);
                    }
                    properties.insert(p.name.clone(), prop);
                    if p.required {
                        required.push(Value::String(p.name.clone()));
                    }
                }
                crate::provider::ToolDefinition {
                    name: t.definition.name.clone(),
                    description: t.definition.description.clone(),
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }),
                }
            })
            .collect()
    }

    /// Language-neutral stub declarations, loaded into the sandboxed process.
    /// Each stub forwards to the bridge-provided `__callTool__` IPC helper.
    pub fn generate_stubs(&self) -> String {
        let mut out = String::new();
        for t in &self.tools {
            out.push_str(&format!(
                "async function {name}(params) {{ return await __callTool__(\"{name}\", params); }}\n",
                name = t.definition.name,
            ));
        }
        out
    }
}

fn validate(def: &ToolDefinition, params: &Value) -> Result<(), String> {
    let obj = params.as_object();
    for p in &def.parameters {
        let value = obj.and_then(|o| o.get(&p.name));
        let Some(value) = value else {
            if p.required {
                return Err(format!("missing required parameter: {}", p.name));
            }
            continue;
        };
        if !type_matches(p.type_, value) {
            return Err(format!(
                "invalid type for parameter {}: expected {}, got {}",
                p.name,
                p.type_,
                typeof_str(value)
            ));
        }
        if let Some(enum_values) = &p.enum_values {
            let matches = value
                .as_str()
                .map(|s| enum_values.iter().any(|v| v == s))
                .unwrap_or(false);
            if !matches {
                return Err(format!("invalid value for {}", p.name));
            }
        }
    }
    Ok(())
}

fn type_matches(t: ParamType, v: &Value) -> bool {
    match t {
        ParamType::String => v.is_string(),
        ParamType::Number => v.is_number(),
        ParamType::Boolean => v.is_boolean(),
        ParamType::Object => v.is_object(),
        ParamType::Array => v.is_array(),
    }
}

fn typeof_str(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct RoutedElsewhere;

#[async_trait]
impl ToolHandler for RoutedElsewhere {
    async fn call(&self, _params: Value) -> ToolResult {
        ToolResult::error("this tool is routed by the agent loop, not dispatched directly")
    }
}
