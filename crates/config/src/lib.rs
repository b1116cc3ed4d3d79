//! Static and per-run configuration for the agent core.
//!
//! [`AppConfig`] is the on-disk, `toml`-backed configuration (provider
//! selection, orchestrator/chain tunables, telemetry). [`RunOptions`] is the
//! per-invocation bundle a caller builds before starting an agent run —
//! session id, user id, metadata, streaming sink, timeouts, retries, and
//! history-inclusion policy.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Static configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    pub workspace_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Agentcore".to_string(),
            user_name: String::new(),
            workspace_path: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Overridden at runtime by the `OLLAMA_BASE_URL` environment variable
    /// when set.
    pub ollama_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

/// Tunables for the tool-call orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub validate_arguments: bool,
    pub per_call_timeout_ms: u64,
    pub continue_on_error: bool,
    pub fail_fast: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_attempts: 2,
            retry_delay_ms: 200,
            exponential_backoff: true,
            validate_arguments: true,
            per_call_timeout_ms: 30_000,
            continue_on_error: true,
            fail_fast: false,
        }
    }
}

/// Tunables for the chain executor and its attached cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_concurrency: usize,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub max_rollback_retries: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            cache_capacity: 256,
            cache_ttl_secs: 300,
            max_rollback_retries: 3,
        }
    }
}

/// Tunables for the built-in guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub max_input_chars: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub loop_detection_cap: usize,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_input_chars: 8_000,
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
            loop_detection_cap: 20,
        }
    }
}

/// Governs how much autonomy the tool-call orchestrator's optional
/// execution policy grants before requiring interactive approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Autonomous,
    Balanced,
    Safer,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        ApprovalMode::Balanced
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub chain: ChainConfig,
    pub guardrails: GuardrailsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(_) => Self::default(),
        };

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.ollama_base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }
}

// ── Per-run options ──────────────────────────────────────────────────────────

/// Sink for incrementally-produced model content.
///
/// Invoked from the agent loop only; implementations must not mutate run
/// state and must not block indefinitely — a slow sink stalls the
/// iteration currently streaming.
pub trait StreamingSink: Send + Sync {
    fn write(&self, fragment: &str) -> Result<()>;
}

/// No-op sink used when the caller doesn't want streaming output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StreamingSink for NullSink {
    fn write(&self, _fragment: &str) -> Result<()> {
        Ok(())
    }
}

/// Per-invocation bundle a caller builds before starting an agent run.
///
/// Everything here is immutable for the lifetime of one run; build a fresh
/// `RunOptions` per call.
#[derive(Clone)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub temperature: Option<f32>,
    pub per_call_timeout: Duration,
    /// Bounds the number of (model call → tool dispatch) iterations before
    /// the loop surfaces an iteration-limit error. Defaults to 10.
    pub max_iterations: usize,
    /// When `N > 0`, retains at most the `N` newest tool-call-bearing
    /// messages when building the prompt; `0` disables filtering.
    pub max_tool_calls_from_history: usize,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub streaming_sink: Option<std::sync::Arc<dyn StreamingSink>>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("metadata", &self.metadata)
            .field("temperature", &self.temperature)
            .field("per_call_timeout", &self.per_call_timeout)
            .field("max_iterations", &self.max_iterations)
            .field(
                "max_tool_calls_from_history",
                &self.max_tool_calls_from_history,
            )
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("streaming_sink", &self.streaming_sink.is_some())
            .finish()
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            user_id: None,
            metadata: HashMap::new(),
            temperature: None,
            per_call_timeout: Duration::from_secs(30),
            max_iterations: 10,
            max_tool_calls_from_history: 0,
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
            exponential_backoff: true,
            streaming_sink: None,
        }
    }
}

impl RunOptions {
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_sink(mut self, sink: std::sync::Arc<dyn StreamingSink>) -> Self {
        self.streaming_sink = Some(sink);
        self
    }
}
