//! Multi-step tool pipelines with configurable error recovery and an
//! attached result cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::warn;

use agentcore_exec::CancelHandle;
use agentcore_tools::ToolRegistry;

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
}

struct StoredEntry {
    value: serde_json::Value,
    inserted_at: Instant,
}

/// Size-bounded, TTL-expiring cache of tool results keyed by a fingerprint
/// of `(tool name, canonical-JSON arguments)`.
///
/// Eviction on reaching capacity is LRU via the `lru` crate; expiry is
/// lazy — an expired entry is only dropped the next time it's looked up.
pub struct Cache {
    inner: Mutex<LruCache<String, StoredEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// `hash(tool name ∥ canonical-JSON(input))`.
    pub fn fingerprint(tool: &str, input: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update(canonical_json(input).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock().expect("chain cache lock poisoned");
        match inner.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_expired) => {
                inner.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, value: serde_json::Value) {
        let mut inner = self.inner.lock().expect("chain cache lock poisoned");
        inner.put(
            key,
            StoredEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let item_count = self.inner.lock().expect("chain cache lock poisoned").len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            item_count,
            total_hits: hits,
            total_misses: misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("chain cache lock poisoned").clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ── Chain configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStrategy {
    Sequential,
    /// Every step runs concurrently against the chain's seed input. Sound
    /// only when the caller has declared the chain's steps independent.
    Parallel,
    /// Broadcasts the seed input to every step and aggregates each step's
    /// output as a JSON array rather than piping sequentially.
    FanOut,
}

#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    RollbackNone,
    RollbackToStart { max_retries: usize },
    RollbackToPrevious,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub strategy: ChainStrategy,
    pub max_concurrency: usize,
    pub recovery: RecoveryStrategy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            strategy: ChainStrategy::Sequential,
            max_concurrency: 4,
            recovery: RecoveryStrategy::RollbackNone,
        }
    }
}

// ── Chain state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Recovered,
    Skipped,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStepResult {
    pub index: usize,
    pub tool: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainState {
    pub seed_input: String,
    pub steps: Vec<ChainStepResult>,
    pub last_successful_output: Option<String>,
    pub status: ChainStatus,
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ── Executor ──────────────────────────────────────────────────────────────────

/// Runs an ordered pipeline of registry tools, feeding each step's output
/// as the next step's input.
#[derive(Clone)]
pub struct ChainExecutor {
    registry: ToolRegistry,
    tools: Arc<RwLock<Vec<String>>>,
    config: ChainConfig,
    cache: Option<Arc<Cache>>,
}

impl ChainExecutor {
    pub fn new(registry: ToolRegistry, tools: Vec<String>, config: ChainConfig) -> Self {
        Self {
            registry,
            tools: Arc::new(RwLock::new(tools)),
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn add_tool(&self, name: impl Into<String>) {
        self.tools.write().expect("chain tool list lock poisoned").push(name.into());
    }

    pub fn remove_tool(&self, name: &str) {
        self.tools
            .write()
            .expect("chain tool list lock poisoned")
            .retain(|existing| existing != name);
    }

    pub fn tools(&self) -> Vec<String> {
        self.tools.read().expect("chain tool list lock poisoned").clone()
    }

    pub async fn run(&self, seed_input: String, cancel: CancelHandle) -> ChainState {
        let tools = self.tools();
        match self.config.strategy {
            ChainStrategy::Sequential => self.run_sequential(tools, seed_input, cancel).await,
            ChainStrategy::Parallel => self.run_concurrent(tools, seed_input, cancel, false).await,
            ChainStrategy::FanOut => self.run_concurrent(tools, seed_input, cancel, true).await,
        }
    }

    async fn invoke_step(&self, tool: &str, input: &str) -> Result<(String, bool), String> {
        let arguments = json!({ "input": input });

        if let Some(cache) = &self.cache {
            let key = Cache::fingerprint(tool, &arguments);
            if let Some(cached) = cache.get(&key) {
                return Ok((value_to_text(&cached), true));
            }
            let result = self.registry.execute(tool, arguments).await.map_err(|e| e.to_string())?;
            cache.put(key, result.clone());
            Ok((value_to_text(&result), false))
        } else {
            let result = self.registry.execute(tool, arguments).await.map_err(|e| e.to_string())?;
            Ok((value_to_text(&result), false))
        }
    }

    async fn run_sequential(&self, tools: Vec<String>, seed_input: String, cancel: CancelHandle) -> ChainState {
        let mut steps = Vec::with_capacity(tools.len());
        let mut current_input = seed_input.clone();
        let mut last_successful = Some(seed_input.clone());
        let mut rollback_failures = 0usize;
        let mut chain_failed = false;

        let mut index = 0;
        while index < tools.len() {
            if cancel.is_cancelled() {
                steps.push(ChainStepResult {
                    index,
                    tool: tools[index].clone(),
                    status: StepStatus::Terminated,
                    output: None,
                    error: Some("cancelled".to_string()),
                    cache_hit: false,
                });
                chain_failed = true;
                break;
            }

            let tool = tools[index].clone();
            match self.invoke_step(&tool, &current_input).await {
                Ok((output, cache_hit)) => {
                    steps.push(ChainStepResult {
                        index,
                        tool,
                        status: StepStatus::Succeeded,
                        output: Some(output.clone()),
                        error: None,
                        cache_hit,
                    });
                    current_input = output.clone();
                    last_successful = Some(output);
                    rollback_failures = 0;
                    index += 1;
                }
                Err(message) => match &self.config.recovery {
                    RecoveryStrategy::RollbackNone => {
                        steps.push(ChainStepResult {
                            index,
                            tool,
                            status: StepStatus::Failed,
                            output: None,
                            error: Some(message),
                            cache_hit: false,
                        });
                        chain_failed = true;
                        break;
                    }
                    RecoveryStrategy::RollbackToStart { max_retries } => {
                        rollback_failures += 1;
                        if rollback_failures > *max_retries {
                            steps.push(ChainStepResult {
                                index,
                                tool,
                                status: StepStatus::Terminated,
                                output: None,
                                error: Some(message),
                                cache_hit: false,
                            });
                            chain_failed = true;
                            break;
                        }
                        warn!(tool = %tools[index], rollback_failures, "chain step failed, rolling back to seed input");
                        steps.push(ChainStepResult {
                            index,
                            tool,
                            status: StepStatus::Failed,
                            output: None,
                            error: Some(message),
                            cache_hit: false,
                        });
                        current_input = seed_input.clone();
                    }
                    RecoveryStrategy::RollbackToPrevious => {
                        // Recovering a step that has no successor means the
                        // chain never actually produces that step's real
                        // effect (e.g. `store` never runs) — the chain as a
                        // whole is failed even though this one step reports
                        // `Recovered`.
                        let is_last_step = index + 1 == tools.len();
                        let recovered = last_successful.clone().unwrap_or_else(|| seed_input.clone());
                        steps.push(ChainStepResult {
                            index,
                            tool,
                            status: StepStatus::Recovered,
                            output: Some(recovered.clone()),
                            error: Some(message),
                            cache_hit: false,
                        });
                        current_input = recovered;
                        index += 1;
                        if is_last_step {
                            chain_failed = true;
                        }
                    }
                    RecoveryStrategy::Skip => {
                        let is_last_step = index + 1 == tools.len();
                        steps.push(ChainStepResult {
                            index,
                            tool,
                            status: StepStatus::Skipped,
                            output: Some(current_input.clone()),
                            error: Some(message),
                            cache_hit: false,
                        });
                        index += 1;
                        if is_last_step {
                            chain_failed = true;
                        }
                    }
                },
            }
        }

        ChainState {
            seed_input,
            steps,
            last_successful_output: last_successful,
            status: if chain_failed { ChainStatus::Failed } else { ChainStatus::Completed },
        }
    }

    async fn run_concurrent(
        &self,
        tools: Vec<String>,
        seed_input: String,
        cancel: CancelHandle,
        fan_out: bool,
    ) -> ChainState {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(tools.len());

        for (index, tool) in tools.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let executor = self.clone();
            let seed = seed_input.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");
                if cancel.is_cancelled() {
                    return (index, tool, Err("cancelled".to_string()));
                }
                let outcome = executor.invoke_step(&tool, &seed).await;
                (index, tool, outcome)
            }));
        }

        let mut slots: Vec<Option<ChainStepResult>> = (0..handles.len()).map(|_| None).collect();
        let mut chain_failed = false;
        let mut outputs: Vec<String> = Vec::new();

        for handle in handles {
            let (index, tool, outcome) = match handle.await {
                Ok(triple) => triple,
                Err(join_error) => {
                    warn!(?join_error, "chain step task panicked");
                    continue;
                }
            };

            let result = match outcome {
                Ok((output, cache_hit)) => {
                    outputs.push(output.clone());
                    ChainStepResult {
                        index,
                        tool,
                        status: StepStatus::Succeeded,
                        output: Some(output),
                        error: None,
                        cache_hit,
                    }
                }
                Err(message) => match self.config.recovery {
                    RecoveryStrategy::Skip | RecoveryStrategy::RollbackToPrevious => ChainStepResult {
                        index,
                        tool,
                        status: StepStatus::Recovered,
                        output: Some(seed_input.clone()),
                        error: Some(message),
                        cache_hit: false,
                    },
                    _ => {
                        chain_failed = true;
                        ChainStepResult {
                            index,
                            tool,
                            status: StepStatus::Failed,
                            output: None,
                            error: Some(message),
                            cache_hit: false,
                        }
                    }
                },
            };
            slots[index] = Some(result);
        }

        let steps: Vec<ChainStepResult> = slots.into_iter().flatten().collect();
        let aggregated = if fan_out {
            serde_json::to_string(&outputs).unwrap_or_default()
        } else {
            outputs.join("\n")
        };

        ChainState {
            seed_input,
            last_successful_output: if outputs.is_empty() { None } else { Some(aggregated) },
            steps,
            status: if chain_failed { ChainStatus::Failed } else { ChainStatus::Completed },
        }
    }
}
