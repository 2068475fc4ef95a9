use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use vigil_model::{ModuleId, ScanPriority};

/// Global knobs that tune orchestrator behaviour.
///
/// Every section carries defaults so a deployment only spells out what it
/// wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool sizing and cancellation grace.
    pub worker: WorkerConfig,
    /// Retry/backoff policy for transient failures.
    pub retry: RetryConfig,
    /// Feedback loop bounds and auto-scan policy.
    pub discovery: DiscoveryConfig,
    /// Recurring schedule cadence and default ceilings.
    pub scheduler: SchedulerConfig,
    /// In-process event fan-out.
    pub events: EventConfig,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent executors.
    pub pool_size: usize,
    /// Time between SIGTERM and forced kill when a running scan is cancelled
    /// or times out (ms).
    pub cancel_grace_ms: u64,
}

impl WorkerConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            cancel_grace_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry ceiling; a scan with `retry_count == max_retries` is not retried.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the computed delay added as random jitter.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay before the retry following attempt `retry_count`,
    /// capped at `backoff_max`, plus up to `jitter_ratio` of extra delay.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
        let raw = self.backoff_base_ms.saturating_mul(factor);
        let capped = raw.min(self.backoff_max_ms);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0) as f64;
        let spread = (capped as f64 * ratio) as u64;
        let jitter = if spread > 0 {
            rand::rng().random_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Deepest discovery depth that still receives follow-up scans. Assets
    /// found deeper are registered without an edge and never scheduled.
    pub max_depth: u32,
    /// Maximum auto-scans enqueued while processing one scan's candidates.
    pub fan_out_budget: usize,
    pub auto_scan_priority: ScanPriority,
    /// Discovering module -> modules to run on each newly found asset.
    pub policy: HashMap<ModuleId, Vec<ModuleId>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            fan_out_budget: 25,
            auto_scan_priority: ScanPriority::P3,
            policy: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often recurring schedules are checked for due work (ms).
    pub recurring_tick_ms: u64,
    /// Ceiling applied to modules that declare `max_concurrency = 0`.
    pub default_module_concurrency: usize,
}

impl SchedulerConfig {
    pub fn recurring_tick(&self) -> Duration {
        Duration::from_millis(self.recurring_tick_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recurring_tick_ms: 1_000,
            default_module_concurrency: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_ratio: 0.0,
        };
        assert_eq!(retry.backoff_for(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(10), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_for(63), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let retry = RetryConfig {
            jitter_ratio: 0.5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = retry.backoff_for(0);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"worker":{"pool_size":8}}"#).unwrap();
        assert_eq!(cfg.worker.pool_size, 8);
        assert_eq!(cfg.worker.cancel_grace_ms, 5_000);
        assert_eq!(cfg.discovery.max_depth, 3);
    }
}
