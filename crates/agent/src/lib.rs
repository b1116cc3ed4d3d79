//! The top-level run loop: guardrails, prompt assembly, the model/tool
//! iteration cycle, streaming, and session persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use agentcore_chain::ChainExecutor;
use agentcore_config::{RunOptions, StreamingSink};
use agentcore_exec::{CancelHandle, ExecutionConfig, ToolCallOrchestrator, ToolCallRequest};
use agentcore_guardrails::{GuardrailContext, GuardrailSet};
use agentcore_llm::{
    extract_json_output, ChatMessage, ChatResponse, ChatRole, ModelClient, ModelError, ModelEvent,
    ToolCall, ToolCallFunction,
};
use agentcore_tools::ToolRegistry;
use serde::Deserialize;

/// Shape recognised by the legacy text tool-call fallback: a model that
/// doesn't support native tool calling can still ask for one by emitting a
/// fenced ```json block of this form instead of structured `tool_calls`.
#[derive(Debug, Clone, Deserialize)]
struct LegacyToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

// ── Message history ───────────────────────────────────────────────────────────

/// Append-only, role-tagged conversation history.
///
/// Invariant: every tool-role message carries a `tool_call_id` referring to
/// a tool call emitted by a preceding assistant message.
#[derive(Debug, Clone, Default)]
pub struct MessageHistory {
    messages: Vec<ChatMessage>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn carries_tool_call(message: &ChatMessage) -> bool {
        !message.tool_calls.is_empty() || message.tool_call_id.is_some()
    }

    /// Messages to send to the model: when `max_tool_calls_from_history` is
    /// `0`, the full history is kept. Otherwise the newest-to-oldest scan
    /// keeps at most that many tool-call-bearing messages; every other
    /// message is always kept.
    pub fn filtered_for_prompt(&self, max_tool_calls_from_history: usize) -> Vec<ChatMessage> {
        if max_tool_calls_from_history == 0 {
            return self.messages.clone();
        }

        let mut kept_tool_messages = 0usize;
        let mut kept: Vec<ChatMessage> = Vec::with_capacity(self.messages.len());
        for message in self.messages.iter().rev() {
            if Self::carries_tool_call(message) {
                if kept_tool_messages < max_tool_calls_from_history {
                    kept_tool_messages += 1;
                    kept.push(message.clone());
                }
            } else {
                kept.push(message.clone());
            }
        }
        kept.reverse();
        kept
    }
}

// ── Session persistence ───────────────────────────────────────────────────────

/// Persists and restores a session's message history. An external boundary
/// — callers may supply any implementation (e.g. a database-backed one);
/// [`JsonlSessionStore`] is the file-backed default.
pub trait SessionStore: Send + Sync {
    fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()>;
    fn load(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
    fn clear(&self, session_id: &str) -> Result<()>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredMessage {
    role: ChatRole,
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Append-only JSONL session transcripts, one file per session id under a
/// root directory.
pub struct JsonlSessionStore {
    root: PathBuf,
}

impl JsonlSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }
}

impl SessionStore for JsonlSessionStore {
    fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        use std::io::Write;

        let path = self.session_path(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let record = StoredMessage {
            role: message.role.clone(),
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            timestamp: chrono::Utc::now(),
        };
        let line = serde_json::to_string(&record)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        use std::io::{BufRead, BufReader};

        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let messages = reader
            .lines()
            .filter_map(|line| {
                let line = line.ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let stored: StoredMessage = serde_json::from_str(trimmed).ok()?;
                Some(ChatMessage {
                    role: stored.role,
                    content: stored.content,
                    tool_calls: stored.tool_calls,
                    tool_call_id: stored.tool_call_id,
                })
            })
            .collect();
        Ok(messages)
    }

    fn clear(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

// ── Run context and outcome ────────────────────────────────────────────────────

/// Immutable per-invocation bundle: [`RunOptions`] plus the guardrail
/// chains and cancellation scope that [`agentcore_config`] deliberately
/// doesn't know about.
#[derive(Clone)]
pub struct RunContext {
    pub options: RunOptions,
    pub guardrails: GuardrailSet,
    pub cancel: CancelHandle,
}

impl RunContext {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            guardrails: GuardrailSet::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailSet) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    fn guardrail_ctx(&self, prompt: &str) -> GuardrailContext {
        GuardrailContext {
            user_id: self.options.user_id.clone(),
            run_id: self.options.session_id.clone(),
            prompt: Some(prompt.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub message: ChatMessage,
    pub iterations: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("blocked by guardrail `{guardrail}`: {reason}")]
    GuardrailBlocked { guardrail: String, reason: String },
    #[error("iteration limit of {max_iterations} exceeded")]
    IterationLimitExceeded {
        max_iterations: usize,
        last_message: Option<ChatMessage>,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("session store error: {0}")]
    SessionStore(String),
}

impl From<agentcore_guardrails::BlockError> for AgentError {
    fn from(error: agentcore_guardrails::BlockError) -> Self {
        AgentError::GuardrailBlocked {
            guardrail: error.guardrail,
            reason: error.reason,
        }
    }
}

// ── Streaming ─────────────────────────────────────────────────────────────────

const FLUSH_INTERVAL: Duration = Duration::from_millis(300);
const SENTENCE_BOUNDARIES: [char; 5] = ['.', '?', '!', '\n', ':'];

struct StreamFlusher {
    sink: Arc<dyn StreamingSink>,
    buffer: String,
    last_flush: Instant,
}

impl StreamFlusher {
    fn new(sink: Arc<dyn StreamingSink>) -> Self {
        Self {
            sink,
            buffer: String::new(),
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        let at_boundary = self.buffer.ends_with(SENTENCE_BOUNDARIES.as_slice());
        if at_boundary || self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(error) = self.sink.write(&self.buffer) {
            warn!(%error, "streaming sink rejected a fragment");
        }
        self.buffer.clear();
        self.last_flush = Instant::now();
    }
}

// ── Tool dispatch mode ─────────────────────────────────────────────────────────

/// How tool calls emitted by the model get dispatched within one iteration.
pub enum Dispatch {
    /// Every tool call in a turn runs independently via the orchestrator.
    Orchestrator(ToolCallOrchestrator),
    /// Tool calls are concatenated into a single chain run seeded by the
    /// first call's arguments; used when the agent is configured in chain
    /// mode for multi-step pipelines declared ahead of time.
    Chain(ChainExecutor),
}

// ── Run loop ──────────────────────────────────────────────────────────────────

pub struct AgentRunLoop {
    model: Arc<dyn ModelClient>,
    registry: ToolRegistry,
    dispatch: Dispatch,
    session_store: Option<Arc<dyn SessionStore>>,
    execution_config: ExecutionConfig,
}

impl AgentRunLoop {
    pub fn new(model: Arc<dyn ModelClient>, registry: ToolRegistry, dispatch: Dispatch, execution_config: ExecutionConfig) -> Self {
        Self {
            model,
            registry,
            dispatch,
            session_store: None,
            execution_config,
        }
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    fn tool_schemas(&self) -> Option<serde_json::Value> {
        let tools = self.registry.list();
        if tools.is_empty() {
            return None;
        }
        let schemas: Vec<serde_json::Value> = tools
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.schema,
                    }
                })
            })
            .collect();
        Some(json!(schemas))
    }

    pub async fn run(
        &self,
        system_prompt: Option<&str>,
        history: &mut MessageHistory,
        user_message: ChatMessage,
        ctx: &RunContext,
    ) -> Result<RunOutcome, AgentError> {
        let user_text = user_message.content.clone().unwrap_or_default();
        ctx.guardrails.input.evaluate(&ctx.guardrail_ctx(&user_text), &user_text)?;

        history.push(user_message.clone());
        if let Some(store) = &self.session_store {
            if let Some(session_id) = &ctx.options.session_id {
                store
                    .append(session_id, &user_message)
                    .map_err(|e| AgentError::SessionStore(e.to_string()))?;
            }
        }

        let tool_schemas = self.tool_schemas();
        let mut last_assistant: Option<ChatMessage> = None;

        for iteration in 1..=ctx.options.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let prompt_messages = history.filtered_for_prompt(ctx.options.max_tool_calls_from_history);
            let response = self
                .invoke_with_retries(system_prompt, &prompt_messages, tool_schemas.as_ref(), ctx)
                .await?;

            let tool_calls = if !response.tool_calls.is_empty() {
                response.tool_calls.clone()
            } else {
                extract_json_output::<LegacyToolCall>(&response.content)
                    .map(|legacy| {
                        vec![ToolCall {
                            id: format!("legacy-{iteration}"),
                            r#type: "function".to_string(),
                            function: ToolCallFunction {
                                name: legacy.tool,
                                arguments: legacy.args,
                            },
                        }]
                    })
                    .unwrap_or_default()
            };

            if !tool_calls.is_empty() {
                let assistant_message = ChatMessage::assistant_tool_calls(tool_calls.clone());
                history.push(assistant_message.clone());
                last_assistant = Some(assistant_message);

                let results = self.dispatch_tool_calls(&tool_calls, ctx).await;
                for (tool_call, result_text) in tool_calls.iter().zip(results.into_iter()) {
                    let tool_call_id = if tool_call.id.is_empty() {
                        tool_call.function.name.clone()
                    } else {
                        tool_call.id.clone()
                    };

                    ctx.guardrails.tool_output.evaluate(&ctx.guardrail_ctx(&user_text), &result_text)?;

                    let tool_message = ChatMessage::tool_result(tool_call_id, result_text);
                    history.push(tool_message.clone());
                    if let Some(store) = &self.session_store {
                        if let Some(session_id) = &ctx.options.session_id {
                            store
                                .append(session_id, &tool_message)
                                .map_err(|e| AgentError::SessionStore(e.to_string()))?;
                        }
                    }
                }
                continue;
            }

            // A final message: no tool calls.
            let final_message = ChatMessage::assistant(response.content.clone());
            ctx.guardrails.output.evaluate(&ctx.guardrail_ctx(&user_text), &response.content)?;

            history.push(final_message.clone());
            if let Some(store) = &self.session_store {
                if let Some(session_id) = &ctx.options.session_id {
                    store
                        .append(session_id, &final_message)
                        .map_err(|e| AgentError::SessionStore(e.to_string()))?;
                }
            }

            info!(iterations = iteration, "agent run completed");
            return Ok(RunOutcome {
                message: final_message,
                iterations: iteration,
            });
        }

        Err(AgentError::IterationLimitExceeded {
            max_iterations: ctx.options.max_iterations,
            last_message: last_assistant,
        })
    }

    async fn dispatch_tool_calls(&self, tool_calls: &[ToolCall], ctx: &RunContext) -> Vec<String> {
        match &self.dispatch {
            Dispatch::Orchestrator(orchestrator) => {
                let requests: Vec<ToolCallRequest> = tool_calls
                    .iter()
                    .map(|call| {
                        let id = if call.id.is_empty() { call.function.name.clone() } else { call.id.clone() };
                        ToolCallRequest::new(call.function.name.clone(), call.function.arguments.clone()).with_id(id)
                    })
                    .collect();

                let results = orchestrator
                    .execute_batch(requests, self.execution_config.clone(), ctx.cancel.clone())
                    .await;

                results
                    .into_iter()
                    .map(|result| match (result.success, result.result, result.error) {
                        (true, Some(value), _) => serde_json::to_string(&value).unwrap_or_default(),
                        (_, _, Some(error)) => format!("error: {error}"),
                        _ => "error: tool produced no result".to_string(),
                    })
                    .collect()
            }
            Dispatch::Chain(chain) => {
                let mut outputs = Vec::with_capacity(tool_calls.len());
                for call in tool_calls {
                    let seed = call.function.arguments.to_string();
                    let state = chain.run(seed, ctx.cancel.clone()).await;
                    outputs.push(state.last_successful_output.unwrap_or_default());
                }
                outputs
            }
        }
    }

    async fn invoke_with_retries(
        &self,
        system_prompt: Option<&str>,
        messages: &[ChatMessage],
        tool_schemas: Option<&serde_json::Value>,
        ctx: &RunContext,
    ) -> Result<ChatResponse, AgentError> {
        let mut attempt = 0usize;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let (events_tx, events_rx) = mpsc::channel(64);
            let flush_task = match ctx.options.streaming_sink.clone() {
                Some(sink) => Some(tokio::spawn(forward_events(events_rx, sink))),
                None => {
                    // Drain the channel so the model call doesn't block on a full buffer.
                    tokio::spawn(drain_events(events_rx));
                    None
                }
            };

            let outcome = self.model.invoke(system_prompt, messages, tool_schemas, events_tx).await;
            if let Some(task) = flush_task {
                let _ = task.await;
            }

            match outcome {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < ctx.options.max_retries => {
                    attempt += 1;
                    let delay = if ctx.options.exponential_backoff {
                        ctx.options.retry_delay * 2u32.pow(attempt.saturating_sub(1) as u32)
                    } else {
                        ctx.options.retry_delay
                    };
                    warn!(attempt, ?delay, "transient model error, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                }
                Err(error) => return Err(AgentError::Model(error)),
            }
        }
    }
}

async fn forward_events(mut events: mpsc::Receiver<ModelEvent>, sink: Arc<dyn StreamingSink>) {
    let mut flusher = StreamFlusher::new(sink);
    while let Some(event) = events.recv().await {
        if let ModelEvent::ContentFragment(fragment) = event {
            flusher.push(&fragment);
        }
    }
    flusher.flush();
}

async fn drain_events(mut events: mpsc::Receiver<ModelEvent>) {
    while events.recv().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_llm::{ChatResponse, MockModelClient, Provider, ToolCallFunction};
    use agentcore_tools::{FieldKind, FieldSchema, ToolParams, TypedTool};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoParams {
        text: String,
    }

    impl ToolParams for EchoParams {
        fn fields() -> Vec<FieldSchema> {
            vec![FieldSchema::new("text", FieldKind::String).required()]
        }
    }

    fn echo_registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(
                TypedTool::<EchoParams, _>::new("echo", "echoes its input", |p: EchoParams| async move {
                    Ok::<_, anyhow::Error>(p.text)
                })
                .unwrap(),
            ))
            .unwrap();
        registry
    }

    fn final_response(content: &str) -> ChatResponse {
        ChatResponse {
            provider: Provider::Ollama,
            content: content.to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
        }
    }

    fn tool_call_response(tool: &str, arguments: serde_json::Value) -> ChatResponse {
        ChatResponse {
            provider: Provider::Ollama,
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction {
                    name: tool.to_string(),
                    arguments,
                },
            }],
            finish_reason: "tool_calls".to_string(),
        }
    }

    // S1: a single tool call resolves in one iteration.
    #[tokio::test]
    async fn single_tool_call_then_final_message() {
        let registry = echo_registry();
        let model = Arc::new(MockModelClient::new(vec![
            tool_call_response("echo", json!({"text": "hi"})),
            final_response("done"),
        ]));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let ctx = RunContext::new(RunOptions::default());
        let outcome = loop_
            .run(Some("system"), &mut history, ChatMessage::user("echo hi"), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.message.content.as_deref(), Some("done"));
        assert_eq!(outcome.iterations, 2);
        assert!(history.messages().iter().any(|m| m.role == ChatRole::Tool));
    }

    // A model with no native tool-calling support can still drive a tool via
    // the legacy fenced-json fallback.
    #[tokio::test]
    async fn legacy_text_tool_call_is_recognised_and_dispatched() {
        let registry = echo_registry();
        let model = Arc::new(MockModelClient::new(vec![
            final_response("sure, one sec\n```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"legacy\"}}\n```"),
            final_response("done"),
        ]));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let ctx = RunContext::new(RunOptions::default());
        let outcome = loop_
            .run(Some("system"), &mut history, ChatMessage::user("echo legacy"), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.message.content.as_deref(), Some("done"));
        let tool_message = history
            .messages()
            .iter()
            .find(|m| m.role == ChatRole::Tool)
            .expect("legacy tool call should have produced a tool-result message");
        assert_eq!(tool_message.content.as_deref(), Some("\"legacy\""));
    }

    // S6: the loop surfaces IterationLimitExceeded at exactly the configured cap.
    #[tokio::test]
    async fn iteration_cap_surfaces_last_assistant_message() {
        let registry = echo_registry();
        let responses = vec![
            tool_call_response("echo", json!({"text": "1"})),
            tool_call_response("echo", json!({"text": "2"})),
            tool_call_response("echo", json!({"text": "3"})),
        ];
        let model = Arc::new(MockModelClient::new(responses));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let mut options = RunOptions::default();
        options.max_iterations = 3;
        let ctx = RunContext::new(options);

        let error = loop_
            .run(Some("system"), &mut history, ChatMessage::user("go"), &ctx)
            .await
            .unwrap_err();

        match error {
            AgentError::IterationLimitExceeded { max_iterations, last_message } => {
                assert_eq!(max_iterations, 3);
                assert!(last_message.is_some());
            }
            other => panic!("expected IterationLimitExceeded, got {other:?}"),
        }
    }

    // S7: an input guardrail block happens before any model invocation.
    #[tokio::test]
    async fn guardrail_block_prevents_model_invocation() {
        let registry = echo_registry();
        let model = Arc::new(MockModelClient::new(vec![final_response("should not be reached")]));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let guardrails = GuardrailSet {
            input: agentcore_guardrails::GuardrailChain::new(vec![Arc::new(
                agentcore_guardrails::InputLengthGuardrail::new(1),
            )]),
            ..GuardrailSet::default()
        };
        let ctx = RunContext::new(RunOptions::default()).with_guardrails(guardrails);

        let error = loop_
            .run(Some("system"), &mut history, ChatMessage::user("too long for the limit"), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(error, AgentError::GuardrailBlocked { .. }));
        assert!(history.messages().is_empty());
    }

    // The output guardrail chain must see the run's actual prompt, not a
    // permanently-empty one — otherwise a semantic-similarity guardrail can
    // never fire.
    #[tokio::test]
    async fn output_guardrail_receives_the_run_prompt() {
        let registry = echo_registry();
        let model = Arc::new(MockModelClient::new(vec![final_response(
            "a completely unrelated reply about something else entirely",
        )]));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let guardrails = GuardrailSet {
            output: agentcore_guardrails::GuardrailChain::new(vec![Arc::new(
                agentcore_guardrails::SemanticSimilarityGuardrail::new(0.9),
            )]),
            ..GuardrailSet::default()
        };
        let ctx = RunContext::new(RunOptions::default()).with_guardrails(guardrails);

        let error = loop_
            .run(Some("system"), &mut history, ChatMessage::user("what is the weather in paris"), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(error, AgentError::GuardrailBlocked { .. }));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_before_invoking_model() {
        let registry = echo_registry();
        let model = Arc::new(MockModelClient::new(vec![final_response("unreachable")]));
        let orchestrator = ToolCallOrchestrator::new(registry.clone());
        let loop_ = AgentRunLoop::new(model, registry, Dispatch::Orchestrator(orchestrator), ExecutionConfig::default());

        let mut history = MessageHistory::new();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let ctx = RunContext::new(RunOptions::default()).with_cancel(cancel);

        let error = loop_
            .run(Some("system"), &mut history, ChatMessage::user("go"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::Cancelled));
    }

    #[test]
    fn history_filters_to_newest_n_tool_call_messages() {
        let mut history = MessageHistory::new();
        history.push(ChatMessage::user("hi"));
        history.push(ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "1".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "echo".to_string(),
                arguments: json!({}),
            },
        }]));
        history.push(ChatMessage::tool_result("1", "first"));
        history.push(ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "2".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "echo".to_string(),
                arguments: json!({}),
            },
        }]));
        history.push(ChatMessage::tool_result("2", "second"));

        let filtered = history.filtered_for_prompt(1);
        let tool_bearing = filtered
            .iter()
            .filter(|m| !m.tool_calls.is_empty() || m.tool_call_id.is_some())
            .count();
        assert_eq!(tool_bearing, 1);
        assert!(filtered.iter().any(|m| m.role == ChatRole::User));
    }

    #[test]
    fn history_unfiltered_when_max_is_zero() {
        let mut history = MessageHistory::new();
        history.push(ChatMessage::user("a"));
        history.push(ChatMessage::assistant("b"));
        assert_eq!(history.filtered_for_prompt(0).len(), 2);
    }

    #[test]
    fn jsonl_session_store_round_trips_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSessionStore::new(dir.path());

        store.append("session-1", &ChatMessage::user("hello")).unwrap();
        store.append("session-1", &ChatMessage::assistant("hi there")).unwrap();

        let loaded = store.load("session-1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content.as_deref(), Some("hello"));

        store.clear("session-1").unwrap();
        assert!(store.load("session-1").unwrap().is_empty());
    }

    #[test]
    fn jsonl_session_store_missing_session_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSessionStore::new(dir.path());
        assert!(store.load("ghost").unwrap().is_empty());
    }
}
