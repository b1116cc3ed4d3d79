//! Tool registration, schema derivation, and dispatch.
//!
//! Rust has no runtime reflection, so schema derivation is explicit: a tool's
//! parameter record implements [`ToolParams`] and hand-describes its own
//! fields via [`FieldSchema`]. [`SchemaDeriver`] turns that description into
//! a JSON-Schema-shaped object once, at registration time, and
//! [`ToolRegistry`] stores the result alongside a type-erased executor.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

// ── Schema derivation ─────────────────────────────────────────────────────────

/// The JSON-Schema primitive a field maps to.
#[derive(Debug, Clone)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array(Box<FieldKind>),
    Object,
    Unknown,
}

impl FieldKind {
    fn json_type(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array(_) => "array",
            FieldKind::Object => "object",
            FieldKind::Unknown => "string",
        }
    }
}

/// One property of a tool's parameter schema, hand-described by the tool
/// author (there is no reflection to derive this from).
pub struct FieldSchema {
    /// Property name as it appears in the JSON argument blob.
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub kind: FieldKind,
    pub enum_values: Option<Vec<serde_json::Value>>,
}

impl FieldSchema {
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            description: "",
            required: false,
            kind,
            enum_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn with_enum(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// A tool's argument record. Implementors list their own fields; there is
/// no derive macro here on purpose — see the module docs.
pub trait ToolParams: DeserializeOwned + Send + Sync + 'static {
    fn fields() -> Vec<FieldSchema>;
}

/// Builds the JSON-Schema-shaped object the model sees for a tool.
pub struct SchemaDeriver;

impl SchemaDeriver {
    pub fn derive<P: ToolParams>() -> serde_json::Value {
        let fields = P::fields();
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for field in &fields {
            let mut prop = serde_json::Map::new();
            prop.insert("type".to_string(), json!(field.kind.json_type()));
            if !field.description.is_empty() {
                prop.insert("description".to_string(), json!(field.description));
            }
            if let Some(values) = &field.enum_values {
                prop.insert("enum".to_string(), json!(values));
            }
            if let FieldKind::Array(item) = &field.kind {
                prop.insert("items".to_string(), json!({ "type": item.json_type() }));
            }
            properties.insert(field.name.to_string(), serde_json::Value::Object(prop));
            if field.required {
                required.push(json!(field.name));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments for tool `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("validation failed for tool `{tool}`: {message}")]
    ValidationError { tool: String, message: String },
    #[error("tool `{tool}` invocation failed: {message}")]
    InvocationError {
        tool: String,
        message: String,
        retryable: bool,
    },
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("invalid tool registration for `{0}`: {1}")]
    InvalidTool(String, String),
}

impl ToolError {
    /// Whether the orchestrator should treat this as worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::InvocationError { retryable: true, .. })
    }
}

/// What a tool callable reports on failure: a message plus whether retrying
/// the same arguments might succeed. Callables that don't care classify as
/// permanent by returning any `E: Into<CallFailure>` the ordinary way —
/// `anyhow::Error` and `String` both convert to a permanent failure — while
/// a callable that knows a failure is transient (a timed-out upstream call,
/// a rate limit) returns [`CallFailure::transient`] instead.
pub struct CallFailure {
    pub message: String,
    pub retryable: bool,
}

impl CallFailure {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }
}

impl From<anyhow::Error> for CallFailure {
    fn from(error: anyhow::Error) -> Self {
        CallFailure::permanent(error.to_string())
    }
}

impl From<String> for CallFailure {
    fn from(message: String) -> Self {
        CallFailure::permanent(message)
    }
}

impl From<&str> for CallFailure {
    fn from(message: &str) -> Self {
        CallFailure::permanent(message.to_string())
    }
}

/// Tool names must not contain underscores — at least one target model's
/// schema rejects them. Registration fails loudly rather than silently
/// rewriting the name.
fn validate_tool_name(name: &str) -> Result<(), ToolError> {
    if name.is_empty() {
        return Err(ToolError::InvalidTool(
            name.to_string(),
            "tool name must not be empty".to_string(),
        ));
    }
    if name.contains('_') {
        return Err(ToolError::InvalidTool(
            name.to_string(),
            "tool names must not contain underscores; use camelCase".to_string(),
        ));
    }
    Ok(())
}

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Static metadata about a tool, used by the model to decide which tool to
/// call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// Trait implemented by every registered tool. The executor consumes a JSON
/// argument blob and produces a JSON-serialisable result — the registry
/// never sees the tool's concrete parameter type.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> &serde_json::Value;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Adapts a typed async callable `Fn(P) -> Future<Output = Result<R, E>>`
/// into a [`Tool`], deriving its schema from `P: ToolParams` once at
/// construction.
pub struct TypedTool<P, F> {
    name: String,
    description: String,
    schema: serde_json::Value,
    callable: F,
    _params: PhantomData<fn() -> P>,
}

impl<P, F, Fut, R, E> TypedTool<P, F>
where
    P: ToolParams,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Serialize,
    E: Into<CallFailure>,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        callable: F,
    ) -> Result<Self, ToolError> {
        let name = name.into();
        validate_tool_name(&name)?;
        Ok(Self {
            schema: SchemaDeriver::derive::<P>(),
            name,
            description: description.into(),
            callable,
            _params: PhantomData,
        })
    }
}

#[async_trait]
impl<P, F, Fut, R, E> Tool for TypedTool<P, F>
where
    P: ToolParams,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Serialize,
    E: Into<CallFailure>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &serde_json::Value {
        &self.schema
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let params: P = serde_json::from_value(arguments).map_err(|error| ToolError::InvalidArguments {
            tool: self.name.clone(),
            message: error.to_string(),
        })?;

        let result = (self.callable)(params).await.map_err(|error| {
            let failure: CallFailure = error.into();
            ToolError::InvocationError {
                tool: self.name.clone(),
                message: failure.message,
                retryable: failure.retryable,
            }
        })?;

        serde_json::to_value(result).map_err(|error| ToolError::InvocationError {
            tool: self.name.clone(),
            message: error.to_string(),
            retryable: false,
        })
    }
}

/// Central, thread-safe registry of available tools.
///
/// Reads (`describe`/`list`/`execute`) dominate; writes (`register`/
/// `remove`) are rare, so a plain `RwLock` over a map is sufficient —
/// `execute` clones the `Arc<dyn Tool>` out and drops the guard before
/// awaiting the tool body.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        validate_tool_name(tool.name())?;
        let mut tools = self.tools.write().expect("tool registry lock poisoned");
        if tools.contains_key(tool.name()) {
            return Err(ToolError::DuplicateTool(tool.name().to_string()));
        }
        tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), ToolError> {
        let mut tools = self.tools.write().expect("tool registry lock poisoned");
        tools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn describe(&self, name: &str) -> Result<serde_json::Value, ToolError> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        tools
            .get(name)
            .map(|tool| tool.schema().clone())
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn list(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                schema: tool.schema().clone(),
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    impl ToolParams for AddParams {
        fn fields() -> Vec<FieldSchema> {
            vec![
                FieldSchema::new("a", FieldKind::Number).required().describe("first addend"),
                FieldSchema::new("b", FieldKind::Number).required().describe("second addend"),
            ]
        }
    }

    fn add_tool() -> Arc<dyn Tool> {
        Arc::new(
            TypedTool::<AddParams, _>::new("add", "adds two numbers", |params: AddParams| async move {
                Ok::<_, anyhow::Error>(params.a + params.b)
            })
            .unwrap(),
        )
    }

    #[test]
    fn schema_derivation_marks_required_fields_and_types() {
        let schema = SchemaDeriver::derive::<AddParams>();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"]["type"], "number");
        assert_eq!(schema["properties"]["b"]["type"], "number");
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn schema_derivation_is_deterministic() {
        let first = SchemaDeriver::derive::<AddParams>();
        let second = SchemaDeriver::derive::<AddParams>();
        assert_eq!(first, second);
    }

    #[test]
    fn array_field_emits_items_type() {
        struct Params;
        impl<'de> serde::Deserialize<'de> for Params {
            fn deserialize<D>(_: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Ok(Params)
            }
        }
        impl ToolParams for Params {
            fn fields() -> Vec<FieldSchema> {
                vec![FieldSchema::new("tags", FieldKind::Array(Box::new(FieldKind::String)))]
            }
        }

        let schema = SchemaDeriver::derive::<Params>();
        assert_eq!(schema["properties"]["tags"]["type"], "array");
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
    }

    #[test]
    fn empty_registry_has_no_tools() {
        let registry = ToolRegistry::new();
        assert!(registry.list().is_empty());
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn register_rejects_underscore_names() {
        let result = TypedTool::<AddParams, _>::new("add_two", "bad name", |params: AddParams| async move {
            Ok::<_, anyhow::Error>(params.a + params.b)
        });
        assert!(matches!(result, Err(ToolError::InvalidTool(_, _))));
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();
        let result = registry.register(add_tool());
        assert!(matches!(result, Err(ToolError::DuplicateTool(_))));
    }

    #[test]
    fn describe_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        assert!(matches!(registry.describe("ghost"), Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn remove_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        assert!(matches!(registry.remove("ghost"), Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn remove_then_list_drops_the_tool() {
        let registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();
        registry.remove("add").unwrap();
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn execute_runs_the_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();

        let result = registry.execute("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn execute_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let result = registry.execute("ghost", json!({})).await;
        assert!(matches!(result, Err(ToolError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn execute_invalid_json_yields_invalid_arguments() {
        let registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();

        let result = registry.execute("add", json!({"a": "not a number", "b": 3})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn execute_is_idempotent_with_respect_to_registry_state() {
        let registry = ToolRegistry::new();
        registry.register(add_tool()).unwrap();

        let first = registry.execute("add", json!({"a": 2, "b": 3})).await.unwrap();
        let second = registry.execute("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.list().len(), 1);
    }
}
