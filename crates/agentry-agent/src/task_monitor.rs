//! Per-task metrics accumulation (spec §4.9, §3 `TaskRecord`), plus a
//! daily token-usage ledger (SPEC_FULL supplement 1 — §3 names `TokenUsage`
//! as tracked "per iteration, per task, and per day" but the component
//! design doesn't spell out the daily rollup operationally).

use std::collections::HashMap;

use agentry_core::{IterationRecord, TaskRecord, Timestamp, TokenUsage};
use parking_lot::Mutex;
use time::Date;

/// Accumulates `IterationRecord`s and usage for one in-flight task, and
/// rolls completed tasks into a daily ledger.
pub struct TaskMonitor {
    daily: Mutex<HashMap<Date, TokenUsage>>,
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self { daily: Mutex::new(HashMap::new()) }
    }

    /// Begin tracking a new task.
    pub fn start_task(&self, description: impl Into<String>, initial_model: impl Into<String>) -> TaskRecord {
        TaskRecord::new(description, initial_model)
    }

    /// Append a completed iteration's usage to the task record and to
    /// today's ledger.
    pub fn record_iteration(&self, task: &mut TaskRecord, iteration: IterationRecord, usage: TokenUsage) {
        if iteration.model != task.final_model {
            task.model_switched = true;
            task.final_model = iteration.model.clone();
        }
        task.iterations.push(iteration);

        let today = time::OffsetDateTime::now_utc().date();
        let mut daily = self.daily.lock();
        *daily.entry(today).or_default() += usage;
    }

    pub fn finish_task(&self, task: &mut TaskRecord, success: bool, error: Option<String>) {
        task.ended_at = Some(Timestamp::now());
        task.success = success;
        task.error = error;
    }

    /// Total usage accumulated today across every finished iteration
    /// (SPEC_FULL supplement 1).
    pub fn usage_today(&self) -> TokenUsage {
        let today = time::OffsetDateTime::now_utc().date();
        self.daily.lock().get(&today).copied().unwrap_or_default()
    }

    pub fn elapsed_secs(task: &TaskRecord) -> f64 {
        let end = task.ended_at.map(|t| t.wall_clock).unwrap_or_else(|| time::OffsetDateTime::now_utc());
        (end - task.started_at.wall_clock).as_seconds_f64().max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage { input, output, cache_read: 0, cache_creation: 0, estimated_cost: 0.0 }
    }

    #[test]
    fn records_iterations_and_detects_model_switch() {
        let monitor = TaskMonitor::new();
        let mut task = monitor.start_task("do the thing", "model-a");
        monitor.record_iteration(&mut task, IterationRecord::begin(0, "model-a"), usage(10, 5));
        assert!(!task.model_switched);
        monitor.record_iteration(&mut task, IterationRecord::begin(1, "model-b"), usage(8, 4));
        assert!(task.model_switched);
        assert_eq!(task.final_model, "model-b");
        assert_eq!(task.iterations.len(), 2);
    }

    #[test]
    fn daily_ledger_accumulates_across_tasks() {
        let monitor = TaskMonitor::new();
        let mut task1 = monitor.start_task("task one", "m");
        monitor.record_iteration(&mut task1, IterationRecord::begin(0, "m"), usage(100, 50));
        let mut task2 = monitor.start_task("task two", "m");
        monitor.record_iteration(&mut task2, IterationRecord::begin(0, "m"), usage(20, 10));

        let today = monitor.usage_today();
        assert_eq!(today.input, 120);
        assert_eq!(today.output, 60);
    }

    #[test]
    fn finish_task_sets_outcome_and_ended_at() {
        let monitor = TaskMonitor::new();
        let mut task = monitor.start_task("x", "m");
        assert!(task.ended_at.is_none());
        monitor.finish_task(&mut task, true, None);
        assert!(task.success);
        assert!(task.ended_at.is_some());
    }
}
