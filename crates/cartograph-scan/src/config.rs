//! Configuration for the cartograph-scan engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use cartograph_core::{ProviderCredentials, Target};

use crate::pool::ScanPool;

/// Top-level scan configuration.
///
/// Loaded from the `[scan]` section of `cartograph.toml` or
/// `CARTOGRAPH_SCAN__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSettings {
    /// Raise an aggregate error instead of logging and continuing.
    #[serde(default)]
    pub fail_fast: bool,

    /// Maximum age of the last full pass before an incremental-capable type
    /// must run a full pass again.
    #[serde(default = "default_full_scan_interval")]
    pub full_scan_interval_secs: u64,

    /// Delay between orchestrator cycles in daemon mode.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Concurrent scan tasks (default: max(3, cores / 2)).
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Region in which account-wide resource types are scanned.
    #[serde(default)]
    pub global_region: Option<String>,

    /// Accounts and the regions to scan in each.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Root resource types scanned for every target (default: all registered roots).
    #[serde(default)]
    pub scan_types: Vec<String>,

    /// Resource types never constructed, on any target.
    #[serde(default)]
    pub disabled_types: Vec<String>,

    /// Per-type calls/second overrides.
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,

    /// Per-type minimum interval between slow-scan inclusions.
    #[serde(default)]
    pub slow_scan_intervals_secs: HashMap<String, u64>,

    #[serde(default)]
    pub retry: RetrySettings,

    /// JSON inventory served by the file-backed provider.
    #[serde(default)]
    pub inventory_path: Option<String>,
}

/// One account and its regions.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub account: String,
    pub regions: Vec<String>,
    pub profile: Option<String>,
    pub role_arn: Option<String>,
}

/// Backoff settings for throttled provider calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_retry_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl ScanSettings {
    pub fn full_scan_interval(&self) -> Duration {
        Duration::from_secs(self.full_scan_interval_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(ScanPool::default_size)
    }

    /// Expand every configured account into one target per region.
    pub fn targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .flat_map(|t| {
                let credentials = ProviderCredentials {
                    profile: t.profile.clone(),
                    role_arn: t.role_arn.clone(),
                };
                t.regions
                    .iter()
                    .map(move |region| Target::new(t.account.clone(), credentials.clone(), region))
            })
            .collect()
    }

    pub fn slow_scan_intervals(&self) -> HashMap<String, Duration> {
        self.slow_scan_intervals_secs
            .iter()
            .map(|(k, v)| (k.clone(), Duration::from_secs(*v)))
            .collect()
    }
}

fn default_full_scan_interval() -> u64 {
    30 * 60
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    30_000
}

fn default_retry_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            timeout_secs: default_retry_timeout(),
            jitter: true,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            fail_fast: false,
            full_scan_interval_secs: default_full_scan_interval(),
            cycle_interval_secs: default_cycle_interval(),
            worker_threads: None,
            global_region: None,
            targets: Vec::new(),
            scan_types: Vec::new(),
            disabled_types: Vec::new(),
            rate_limits: HashMap::new(),
            slow_scan_intervals_secs: HashMap::new(),
            retry: RetrySettings::default(),
            inventory_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ScanSettings::default();
        assert!(!settings.fail_fast);
        assert_eq!(settings.full_scan_interval(), Duration::from_secs(1800));
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.initial_delay_ms, 30_000);
        assert!(settings.worker_threads() >= 3);
    }

    #[test]
    fn test_targets_expand_regions() {
        let settings: ScanSettings = serde_json::from_value(serde_json::json!({
            "targets": [
                {"account": "111", "regions": ["us-east-1", "us-west-2"], "profile": "prod"},
                {"account": "222", "regions": ["eu-west-1"]},
            ],
            "rate_limits": {"Subnet": 2.5},
        }))
        .unwrap();

        let targets = settings.targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[1].account, "111");
        assert_eq!(targets[1].region, "us-west-2");
        assert_eq!(targets[1].credentials.profile.as_deref(), Some("prod"));
        assert_eq!(targets[2].credentials, ProviderCredentials::default());
        assert_eq!(settings.rate_limits["Subnet"], 2.5);
    }
}
