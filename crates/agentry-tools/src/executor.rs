//! Dependency-ordered, bounded-parallel tool call execution.
//!
//! A call's arguments may reference another call's result with a
//! `${ref:<call_id>}` placeholder; such a call cannot start until every
//! call it references has finished. Calls are grouped into waves by that
//! dependency graph, each wave runs with up to `max_parallel` calls
//! in flight at once (further narrowed by `exclusive_key` collisions),
//! and results are returned in the original declaration order regardless
//! of which call actually finished first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agentry_core::{AgentError, ToolCall, ToolResult};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::registry::{validate_args, ToolRegistry};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    /// Spec §6 defaults: `tool_max_parallel=3`, `tool_timeout_s=30`.
    fn default() -> Self {
        Self { max_parallel: 3, default_timeout: Duration::from_secs(30) }
    }
}

fn ref_pattern() -> Regex {
    Regex::new(r"\$\{ref:([^}]+)\}").expect("static regex is valid")
}

/// Find every `${ref:<id>}` placeholder anywhere in a call's serialized
/// arguments — including nested object/array values.
fn referenced_ids(args: &Value, pattern: &Regex) -> HashSet<String> {
    let mut found = HashSet::new();
    collect_refs(args, pattern, &mut found);
    found
}

fn collect_refs(value: &Value, pattern: &Regex, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for capture in pattern.captures_iter(s) {
                out.insert(capture[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_refs(item, pattern, out)),
        Value::Object(map) => map.values().for_each(|item| collect_refs(item, pattern, out)),
        _ => {}
    }
}

/// Substitute `${ref:<id>}` placeholders with the referenced call's result
/// text. Placeholders for calls with no recorded result are left as-is.
fn substitute_refs(value: &Value, pattern: &Regex, results: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let replaced = pattern.replace_all(s, |caps: &regex::Captures| {
                results.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute_refs(item, pattern, results)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_refs(v, pattern, results))).collect())
        }
        other => other.clone(),
    }
}

/// Split calls into dependency waves: wave 0 has no unresolved references,
/// wave N depends only on calls in waves < N. A call whose reference never
/// resolves (dangling or cyclic) is placed in the final wave so it still
/// runs (and fails naturally against the missing/unsubstituted reference)
/// rather than being silently dropped.
fn build_waves(calls: &[ToolCall], pattern: &Regex) -> Vec<Vec<usize>> {
    let mut remaining: Vec<usize> = (0..calls.len()).collect();
    let mut resolved: HashSet<String> = HashSet::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, not_ready): (Vec<usize>, Vec<usize>) = remaining.iter().partition(|&&idx| {
            let deps = referenced_ids(&calls[idx].arguments, pattern);
            deps.iter().all(|dep| resolved.contains(dep))
        });

        if ready.is_empty() {
            // Cycle or dangling reference: flush everything left as one
            // final wave rather than looping forever.
            waves.push(not_ready);
            break;
        }

        for &idx in &ready {
            resolved.insert(calls[idx].id.clone());
        }
        waves.push(ready);
        remaining = not_ready;
    }

    waves
}

pub struct Executor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    pub async fn execute_all(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Vec<ToolResult> {
        let pattern = ref_pattern();
        let mut results_by_id: HashMap<String, String> = HashMap::new();
        let mut results_by_index: HashMap<usize, ToolResult> = HashMap::new();

        // Spec §4.7 step 1: validate every call against its tool's schema
        // before it ever reaches a wave; a call that fails validation gets
        // an error result and is omitted from execution entirely, never
        // acquiring a semaphore permit or a timeout slot.
        let mut runnable_indices: Vec<usize> = Vec::new();
        for (idx, call) in calls.iter().enumerate() {
            match self.registry.find(&call.name) {
                None => {
                    results_by_index.insert(idx, ToolResult::failed(call.id.clone(), format!("tool '{}' not found", call.name), 0));
                }
                Some(tool) => match validate_args(tool.as_ref(), &call.arguments) {
                    Ok(()) => runnable_indices.push(idx),
                    Err(e) => {
                        results_by_index.insert(idx, ToolResult::failed(call.id.clone(), e.to_string(), 0));
                    }
                },
            }
        }

        let runnable_calls: Vec<ToolCall> = runnable_indices.iter().map(|&idx| calls[idx].clone()).collect();
        let waves: Vec<Vec<usize>> = build_waves(&runnable_calls, &pattern)
            .into_iter()
            .map(|wave| wave.into_iter().map(|local_idx| runnable_indices[local_idx]).collect())
            .collect();

        for wave in waves {
            if cancel.is_cancelled() {
                for idx in wave {
                    let call = &calls[idx];
                    results_by_index.insert(idx, ToolResult::failed(call.id.clone(), "cancelled".to_string(), 0));
                }
                continue;
            }

            let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
            let exclusive_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>> = Arc::new(Mutex::new(HashMap::new()));
            let mut handles = Vec::new();

            for idx in wave {
                let call = calls[idx].clone();
                let substituted_args = substitute_refs(&call.arguments, &pattern, &results_by_id);
                let registry = self.registry.clone();
                let semaphore = semaphore.clone();
                let exclusive_locks = exclusive_locks.clone();
                let timeout_duration = self.config.default_timeout;
                let cancel = cancel.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");

                    let Some(tool) = registry.find(&call.name) else {
                        return (idx, call.id.clone(), ToolResult::failed(call.id.clone(), format!("tool '{}' not found", call.name), 0));
                    };
                    let timeout_duration = tool.timeout_default().unwrap_or(timeout_duration);

                    let exclusive_guard = match tool.exclusive_key(&substituted_args) {
                        Some(key) => {
                            let lock = {
                                let mut locks = exclusive_locks.lock().await;
                                locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
                            };
                            Some(lock.lock_owned().await)
                        }
                        None => None,
                    };

                    if cancel.is_cancelled() {
                        drop(exclusive_guard);
                        return (idx, call.id.clone(), ToolResult::failed(call.id.clone(), "cancelled".to_string(), 0));
                    }

                    let started = std::time::Instant::now();
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            ToolResult::failed(call.id.clone(), "cancelled".to_string(), started.elapsed().as_millis() as u64)
                        }
                        outcome = timeout(timeout_duration, tool.execute(substituted_args)) => {
                            let elapsed_ms = started.elapsed().as_millis() as u64;
                            match outcome {
                                Ok(Ok(output)) => ToolResult::ok(call.id.clone(), output, elapsed_ms),
                                Ok(Err(e)) => ToolResult::failed(call.id.clone(), e.to_string(), elapsed_ms),
                                Err(_) => ToolResult::failed(call.id.clone(), format!("timed out after {}ms", timeout_duration.as_millis()), elapsed_ms),
                            }
                        }
                    };
                    drop(exclusive_guard);
                    (idx, call.id.clone(), result)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((idx, call_id, result)) => {
                        results_by_id.insert(call_id, result.output.clone());
                        results_by_index.insert(idx, result);
                    }
                    Err(join_error) => {
                        log::error!("tool execution task panicked: {join_error}");
                    }
                }
            }
        }

        (0..calls.len())
            .map(|idx| {
                results_by_index.remove(&idx).unwrap_or_else(|| {
                    ToolResult::failed(calls[idx].id.clone(), "tool never executed".to_string(), 0)
                })
            })
            .collect()
    }
}
