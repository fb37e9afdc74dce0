//! Per-provider cooldown state machine and optional background probing
//! (spec §4.10).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use agentry_core::{HealthStatus, ProviderHealth};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Tunables for the cooldown state machine (spec §4.10, defaults from §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub cooldown_base_secs: u64,
    pub cooldown_max_secs: u64,
    pub cooldown_multiplier: f64,
    pub health_check_interval_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            cooldown_base_secs: 30,
            cooldown_max_secs: 300,
            cooldown_multiplier: 2.0,
            health_check_interval_secs: 60,
        }
    }
}

impl FailoverConfig {
    /// `cooldown(n) = min(cap, base * multiplier^(n - threshold))` (spec §4.10).
    pub fn cooldown_for(&self, consecutive_failures: u32) -> StdDuration {
        let n = consecutive_failures.saturating_sub(self.failure_threshold);
        let secs = self.cooldown_base_secs as f64 * self.cooldown_multiplier.powi(n as i32);
        let capped = secs.min(self.cooldown_max_secs as f64).max(0.0);
        StdDuration::from_secs_f64(capped)
    }
}

/// Shared, mutation-short-critical-section registry of `ProviderHealth`
/// consulted by the LLM client before each attempt and updated after each
/// attempt's outcome (spec §4.10, §5 "shared resources" discipline).
pub struct HealthMonitor {
    config: FailoverConfig,
    state: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthMonitor {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn entry<'a>(
        state: &'a mut HashMap<String, ProviderHealth>,
        name: &str,
    ) -> &'a mut ProviderHealth {
        state
            .entry(name.to_string())
            .or_insert_with(|| ProviderHealth::new(name))
    }

    /// Whether `name` may currently be offered for dispatch (spec §4.2 step 1).
    pub fn is_available(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let health = Self::entry(&mut state, name);
        health.is_available(OffsetDateTime::now_utc())
    }

    pub fn snapshot(&self, name: &str) -> ProviderHealth {
        let mut state = self.state.lock();
        Self::entry(&mut state, name).clone()
    }

    /// Record a successful attempt. `_latency_ms` is accepted for callers
    /// that want to track it (e.g. for observability dashboards) even
    /// though the state machine itself doesn't key off latency.
    pub fn record_success(&self, name: &str, _latency_ms: u64) {
        let mut state = self.state.lock();
        let health = Self::entry(&mut state, name);
        health.consecutive_failures = 0;
        match health.status {
            HealthStatus::Unknown | HealthStatus::Healthy => {
                health.status = HealthStatus::Healthy;
                health.consecutive_successes = 0;
            }
            HealthStatus::Degraded => {
                health.consecutive_successes += 1;
                if health.consecutive_successes >= self.config.recovery_threshold {
                    health.status = HealthStatus::Healthy;
                    health.consecutive_successes = 0;
                    health.cooldown_until = None;
                }
            }
            HealthStatus::Unhealthy => {
                // A probe succeeded while still within nominal cooldown
                // bookkeeping; transition through Degraded like any other
                // recovery path rather than jumping straight to Healthy.
                health.status = HealthStatus::Degraded;
                health.consecutive_successes = 1;
                health.cooldown_until = None;
            }
        }
    }

    /// Record a failed attempt, transitioning toward `Unhealthy` once
    /// `failure_threshold` consecutive failures accumulate.
    pub fn record_failure(&self, name: &str, error: impl Into<String>) {
        let mut state = self.state.lock();
        let health = Self::entry(&mut state, name);
        health.consecutive_successes = 0;
        health.consecutive_failures += 1;
        health.last_error = Some(error.into());

        match health.status {
            HealthStatus::Unknown => health.status = HealthStatus::Degraded,
            HealthStatus::Healthy | HealthStatus::Degraded => {
                if health.consecutive_failures >= self.config.failure_threshold {
                    health.status = HealthStatus::Unhealthy;
                    let cooldown = self.config.cooldown_for(health.consecutive_failures);
                    health.cooldown_until =
                        Some(OffsetDateTime::now_utc() + time_duration(cooldown));
                } else {
                    health.status = HealthStatus::Degraded;
                }
            }
            HealthStatus::Unhealthy => {
                let cooldown = self.config.cooldown_for(health.consecutive_failures);
                health.cooldown_until = Some(OffsetDateTime::now_utc() + time_duration(cooldown));
            }
        }
    }

    /// After cooldown expiry, the next attempt is a probe: flip a still
    /// `Unhealthy`-but-expired entry to `Degraded` so the client is willing
    /// to try it again (spec §4.10 "After expiry status becomes degraded").
    pub fn tick_expired_cooldowns(&self) {
        let mut state = self.state.lock();
        let now = OffsetDateTime::now_utc();
        for health in state.values_mut() {
            if health.status == HealthStatus::Unhealthy {
                if let Some(until) = health.cooldown_until {
                    if now >= until {
                        health.status = HealthStatus::Degraded;
                        health.cooldown_until = None;
                    }
                }
            }
        }
    }

    /// Spawn a background task invoking `probe` for every known provider
    /// at `health_check_interval`, feeding outcomes back into the same
    /// state machine (spec §4.10's optional background probe).
    pub fn spawn_probe_loop<F, Fut>(self: &Arc<Self>, names: Vec<String>, probe: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send,
    {
        let monitor = Arc::clone(self);
        let interval = StdDuration::from_secs(monitor.config.health_check_interval_secs);
        let probe = Arc::new(probe);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.tick_expired_cooldowns();
                for name in &names {
                    if monitor.is_available(name) {
                        continue;
                    }
                    match probe(name.clone()).await {
                        Ok(()) => monitor.record_success(name, 0),
                        Err(e) => monitor.record_failure(name, e),
                    }
                }
            }
        })
    }
}

fn time_duration(std_duration: StdDuration) -> time::Duration {
    time::Duration::try_from(std_duration).unwrap_or(time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_formula_matches_spec_defaults() {
        let cfg = FailoverConfig::default();
        assert_eq!(cfg.cooldown_for(3), StdDuration::from_secs(30));
        assert_eq!(cfg.cooldown_for(4), StdDuration::from_secs(60));
        assert_eq!(cfg.cooldown_for(5), StdDuration::from_secs(120));
        // caps at 300s regardless of how many failures pile up
        assert_eq!(cfg.cooldown_for(20), StdDuration::from_secs(300));
    }

    #[test]
    fn three_failures_trip_unhealthy_and_gate_dispatch() {
        let monitor = HealthMonitor::new(FailoverConfig::default());
        assert!(monitor.is_available("primary"));
        monitor.record_failure("primary", "connection reset");
        monitor.record_failure("primary", "connection reset");
        assert!(monitor.is_available("primary"));
        monitor.record_failure("primary", "connection reset");
        assert!(!monitor.is_available("primary"));
        let snap = monitor.snapshot("primary");
        assert_eq!(snap.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn recovery_requires_recovery_threshold_successes() {
        let monitor = HealthMonitor::new(FailoverConfig::default());
        for _ in 0..3 {
            monitor.record_failure("p", "x");
        }
        assert_eq!(monitor.snapshot("p").status, HealthStatus::Unhealthy);
        // Force expiry without sleeping in the test.
        {
            let mut state = monitor.state.lock();
            state.get_mut("p").unwrap().cooldown_until = Some(OffsetDateTime::now_utc());
        }
        monitor.tick_expired_cooldowns();
        assert_eq!(monitor.snapshot("p").status, HealthStatus::Degraded);
        monitor.record_success("p", 10);
        assert_eq!(monitor.snapshot("p").status, HealthStatus::Degraded);
        monitor.record_success("p", 10);
        assert_eq!(monitor.snapshot("p").status, HealthStatus::Healthy);
    }
}
