//! Parallel tool-call dispatch with bounded concurrency, retries, timeouts,
//! and argument validation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tracing::{info, warn};

use agentcore_config::ApprovalMode;
use agentcore_tools::{ToolError, ToolRegistry};

// ── Cancellation ──────────────────────────────────────────────────────────────

/// A cooperative cancellation primitive shared across an in-flight batch.
///
/// No `tokio-util::CancellationToken` dependency in this workspace's
/// lineage — this is the hand-rolled equivalent: an atomic flag plus a
/// `Notify` so waiters wake promptly instead of polling.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next `cancel()` call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

// ── Execution policy (optional, additive) ────────────────────────────────────

/// Approval-gated policy layered on top of raw tool dispatch. Entirely
/// optional — an orchestrator with no policy dispatches every request
/// subject only to its `ExecutionConfig`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPolicy {
    pub approval_mode: ApprovalMode,
    pub tool_allowlist: Vec<String>,
    pub tool_denylist: Vec<String>,
    pub approval_exempt_tools: Vec<String>,
}

impl ExecutionPolicy {
    fn check_capability(&self, tool_name: &str) -> Result<(), String> {
        if self.tool_denylist.iter().any(|n| n == tool_name) {
            return Err(format!("tool '{tool_name}' is blocked by policy (denylist)"));
        }
        if !self.tool_allowlist.is_empty() && !self.tool_allowlist.iter().any(|n| n == tool_name) {
            return Err(format!("tool '{tool_name}' is not in the allowlist"));
        }
        Ok(())
    }

    /// Whether this tool invocation needs interactive approval. The exempt
    /// list always short-circuits; `Autonomous` never asks; `Balanced` and
    /// `Safer` both ask for anything not explicitly exempt (the orchestrator
    /// carries no domain knowledge of which tools are read-only, unlike a
    /// caller that owns a fixed built-in tool set).
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        if self.approval_exempt_tools.iter().any(|n| n == tool_name) {
            return false;
        }
        !matches!(self.approval_mode, ApprovalMode::Autonomous)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

pub type ApprovalSender = mpsc::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;
pub type ApprovalReceiver = mpsc::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;

pub fn approval_channel() -> (ApprovalSender, ApprovalReceiver) {
    mpsc::channel(16)
}

// ── Data model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlates this request back to the model's original tool call, if
    /// any (absent for chain-executor-driven calls).
    pub id: Option<String>,
    pub tool: String,
    /// Present for parity with the data model's {tool name, method name,
    /// arguments blob} shape; unused by single-entrypoint tools.
    pub method: Option<String>,
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            tool: tool.into(),
            method: None,
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub id: Option<String>,
    pub tool: String,
    pub method: Option<String>,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub attempt: u32,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub validate_arguments: bool,
    pub per_call_timeout: Duration,
    pub continue_on_error: bool,
    pub fail_fast: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_attempts: 0,
            retry_delay_ms: 200,
            exponential_backoff: true,
            validate_arguments: true,
            per_call_timeout: Duration::from_secs(30),
            continue_on_error: true,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ToolCallBatch {
    pub requests: Vec<ToolCallRequest>,
    pub config: ExecutionConfig,
    pub results: Vec<ToolCallResult>,
    pub status: BatchStatus,
}

impl ToolCallBatch {
    pub fn new(requests: Vec<ToolCallRequest>, config: ExecutionConfig) -> Self {
        Self {
            requests,
            config,
            results: Vec::new(),
            status: BatchStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub min_duration: Duration,
    pub total_retries: u64,
}

pub fn aggregate_stats(results: &[ToolCallResult]) -> BatchStats {
    if results.is_empty() {
        return BatchStats::default();
    }

    let total = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let failed = total - successful;
    let total_duration: Duration = results.iter().map(|r| r.duration).sum();
    let max_duration = results.iter().map(|r| r.duration).max().unwrap_or_default();
    let min_duration = results.iter().map(|r| r.duration).min().unwrap_or_default();
    let total_retries = results.iter().map(|r| (r.attempt.saturating_sub(1)) as u64).sum();

    BatchStats {
        total,
        successful,
        failed,
        total_duration,
        average_duration: total_duration / total as u32,
        max_duration,
        min_duration,
        total_retries,
    }
}

// ── Error classification ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool call cancelled")]
    Cancelled,
    #[error("denied by execution policy: {0}")]
    PolicyDenied(String),
}

impl CallError {
    fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout(_) => true,
            CallError::Tool(tool_error) => tool_error.is_retryable(),
            CallError::Cancelled | CallError::PolicyDenied(_) => false,
        }
    }
}

fn validate_against_schema(schema: &serde_json::Value, arguments: &serde_json::Value) -> Result<(), String> {
    let Some(object) = arguments.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if !object.contains_key(name) {
                    return Err(format!("missing required field `{name}`"));
                }
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (name, value) in object {
            let Some(expected) = properties
                .get(name)
                .and_then(|prop| prop.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !json_type_matches(expected, value) {
                return Err(format!("field `{name}` expected type `{expected}`"));
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// `delay_i = retryDelayMs · 2^(i-1)` when exponential, else a flat delay,
/// with ±10% uniform jitter.
fn backoff_delay(base_ms: u64, attempt: u32, exponential: bool) -> Duration {
    let raw_ms = if exponential {
        base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
    } else {
        base_ms
    };
    let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
    let jittered = (raw_ms as f64) * (1.0 + jitter);
    Duration::from_millis(jittered.max(0.0) as u64)
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Dispatches a batch of tool calls against a [`ToolRegistry`] with bounded
/// concurrency, retries, per-call timeouts, and argument validation.
#[derive(Clone)]
pub struct ToolCallOrchestrator {
    registry: ToolRegistry,
    policy: Option<ExecutionPolicy>,
    approval_tx: Option<ApprovalSender>,
}

impl ToolCallOrchestrator {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            policy: None,
            approval_tx: None,
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_approval(mut self, tx: ApprovalSender) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    /// Runs every request in `requests`, preserving input order in the
    /// returned slice regardless of completion order.
    pub async fn execute_batch(
        &self,
        requests: Vec<ToolCallRequest>,
        config: ExecutionConfig,
        cancel: CancelHandle,
    ) -> Vec<ToolCallResult> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let fail_signal = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let registry = self.registry.clone();
            let policy = self.policy.clone();
            let approval_tx = self.approval_tx.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            let fail_signal = fail_signal.clone();

            handles.push(tokio::spawn(async move {
                let permit = semaphore.acquire_owned().await.expect("semaphore never closes");
                let result = run_one(
                    &registry,
                    policy.as_ref(),
                    approval_tx.as_ref(),
                    request,
                    &config,
                    &cancel,
                    &fail_signal,
                )
                .await;
                drop(permit);
                (index, result)
            }));
        }

        let mut results: Vec<Option<ToolCallResult>> = (0..handles.len()).map(|_| None).collect();
        for handle in handles {
            match handle.await {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_error) => warn!(?join_error, "tool call task panicked"),
            }
        }

        results
            .into_iter()
            .map(|result| result.expect("every index is written exactly once"))
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    registry: &ToolRegistry,
    policy: Option<&ExecutionPolicy>,
    approval_tx: Option<&ApprovalSender>,
    request: ToolCallRequest,
    config: &ExecutionConfig,
    cancel: &CancelHandle,
    fail_signal: &Arc<AtomicBool>,
) -> ToolCallResult {
    let started = Instant::now();

    if cancel.is_cancelled() {
        return terminal(request, 0, started, Err(CallError::Cancelled));
    }

    if let Some(policy) = policy {
        if let Err(reason) = policy.check_capability(&request.tool) {
            return terminal(request, 0, started, Err(CallError::PolicyDenied(reason)));
        }
        if policy.requires_approval(&request.tool) {
            match request_approval(&request, approval_tx).await {
                Ok(true) => {}
                Ok(false) => {
                    return terminal(
                        request,
                        0,
                        started,
                        Err(CallError::PolicyDenied("denied by approval".to_string())),
                    );
                }
                Err(reason) => return terminal(request, 0, started, Err(CallError::PolicyDenied(reason))),
            }
        }
    }

    if config.validate_arguments {
        match registry.describe(&request.tool) {
            Ok(schema) => {
                if let Err(message) = validate_against_schema(&schema, &request.arguments) {
                    let tool = request.tool.clone();
                    return terminal(
                        request,
                        1,
                        started,
                        Err(CallError::Tool(ToolError::ValidationError { tool, message })),
                    );
                }
            }
            Err(error) => return terminal(request, 1, started, Err(CallError::Tool(error))),
        }
    }

    let max_attempts = config.retry_attempts + 1;
    let mut last_error: Option<CallError> = None;

    for attempt in 1..=max_attempts {
        if fail_signal.load(Ordering::SeqCst) || cancel.is_cancelled() {
            let error = last_error.unwrap_or(CallError::Cancelled);
            return terminal(request, attempt.saturating_sub(1), started, Err(error));
        }

        let call = registry.execute(&request.tool, request.arguments.clone());
        let outcome = tokio::time::timeout(config.per_call_timeout, call).await;

        let error = match outcome {
            Ok(Ok(value)) => {
                info!(tool = %request.tool, attempt, "tool call succeeded");
                return terminal(request, attempt, started, Ok(value));
            }
            Ok(Err(tool_error)) => CallError::Tool(tool_error),
            Err(_elapsed) => CallError::Timeout(config.per_call_timeout),
        };

        let is_last_attempt = attempt == max_attempts;
        if !error.is_transient() || is_last_attempt {
            if !config.continue_on_error || config.fail_fast {
                fail_signal.store(true, Ordering::SeqCst);
            }
            return terminal(request, attempt, started, Err(error));
        }

        warn!(tool = %request.tool, attempt, error = %error, "tool call failed transiently, retrying");
        let delay = backoff_delay(config.retry_delay_ms, attempt, config.exponential_backoff);
        last_error = Some(error);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return terminal(request, attempt, started, Err(CallError::Cancelled));
            }
        }
    }

    terminal(request, max_attempts, started, Err(last_error.unwrap_or(CallError::Cancelled)))
}

async fn request_approval(
    request: &ToolCallRequest,
    approval_tx: Option<&ApprovalSender>,
) -> Result<bool, String> {
    let Some(tx) = approval_tx else {
        return Err("approval required but no approval channel configured".to_string());
    };

    let approval_request = ApprovalRequest {
        tool_name: request.tool.clone(),
        arguments: request.arguments.clone(),
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send((approval_request, reply_tx))
        .await
        .map_err(|_| "approval channel closed".to_string())?;

    let decision = reply_rx.await.map_err(|_| "approval response dropped".to_string())?;
    Ok(decision == ApprovalDecision::Approve)
}

fn terminal(
    request: ToolCallRequest,
    attempt: u32,
    started: Instant,
    outcome: Result<serde_json::Value, CallError>,
) -> ToolCallResult {
    let duration = started.elapsed();
    let attempt = attempt.max(1);
    match outcome {
        Ok(value) => ToolCallResult {
            id: request.id,
            tool: request.tool,
            method: request.method,
            arguments: request.arguments,
            result: Some(value),
            error: None,
            duration,
            attempt,
            success: true,
        },
        Err(error) => ToolCallResult {
            id: request.id,
            tool: request.tool,
            method: request.method,
            arguments: request.arguments,
            result: None,
            error: Some(error.to_string()),
            duration,
            attempt,
            success: false,
        },
    }
}
