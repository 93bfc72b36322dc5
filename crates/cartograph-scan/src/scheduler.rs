//! Scan scheduling.
//!
//! [`ScanScheduler`] decides per unit pass whether to run the full
//! enumeration or the lighter incremental pass. [`CadenceTracker`] decides,
//! before a unit is constructed, whether a slow resource type is due this
//! cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cartograph_core::types::now_millis;
use cartograph_core::Scope;
use cartograph_graph::GraphStore;

use crate::control::{scope_attributes, ScanAttributes, ScanControl};
use crate::error::Result;

/// Which pass a unit runs this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
}

/// Full-vs-incremental decision for one unit in one scope.
#[derive(Clone)]
pub struct ScanScheduler {
    control: ScanControl,
    attributes: ScanAttributes,
    full_scan_interval: Duration,
    supports_incremental: bool,
}

impl ScanScheduler {
    pub fn new(
        control: ScanControl,
        scope: &Scope,
        full_scan_interval: Duration,
        supports_incremental: bool,
    ) -> Self {
        Self {
            control,
            attributes: scope_attributes(scope),
            full_scan_interval,
            supports_incremental,
        }
    }

    pub fn supports_incremental(&self) -> bool {
        self.supports_incremental
    }

    /// True when an incremental-capable unit's last full pass is older than
    /// the interval. Always false for units without an incremental pass;
    /// those run a full pass every cycle regardless.
    pub async fn is_full_scan_required(&self, now: i64) -> Result<bool> {
        if !self.supports_incremental {
            return Ok(false);
        }
        let elapsed = self
            .control
            .time_since_last_scan(&self.attributes, now)
            .await?;
        Ok(elapsed > self.full_scan_interval)
    }

    pub async fn mode(&self, now: i64) -> Result<ScanMode> {
        if !self.supports_incremental || self.is_full_scan_required(now).await? {
            Ok(ScanMode::Full)
        } else {
            Ok(ScanMode::Incremental)
        }
    }

    /// Persist `lastScanTs` after a successful full pass.
    pub async fn mark_full_scan(&self, now: i64) -> Result<()> {
        self.control.mark_last_scan_at(&self.attributes, now).await
    }
}

/// Suffix of the scan-control type holding slow-scan inclusion times.
const SLOW_SCAN_SUFFIX: &str = ":slow";

/// Last-included times of slow resource types, per (type, account, region).
///
/// Shared by every target of an orchestrator and written through to the
/// store, so cadence survives both cycles and restarts.
pub struct CadenceTracker {
    store: Arc<dyn GraphStore>,
    last_included: Mutex<HashMap<String, i64>>,
}

impl CadenceTracker {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            last_included: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(label: &str, scope: &Scope) -> String {
        format!("{label}:{}:{}", scope.account, scope.region)
    }

    fn cached(&self, key: &str) -> Option<i64> {
        self.last_included
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn remember(&self, key: String, ts: i64) {
        self.last_included
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, ts);
    }

    fn control(&self, label: &str) -> Result<ScanControl> {
        ScanControl::new(self.store.clone(), format!("{label}{SLOW_SCAN_SUFFIX}"))
    }

    /// Whether a slow type is due at `now`. A due type is recorded as
    /// included immediately, so the decision is made once per interval.
    pub async fn should_include(
        &self,
        label: &str,
        scope: &Scope,
        min_interval: Duration,
        now: i64,
    ) -> Result<bool> {
        let key = Self::cache_key(label, scope);
        let control = self.control(label)?;
        let attributes = scope_attributes(scope);

        let last = match self.cached(&key) {
            Some(ts) => ts,
            None => control.last_scan(&attributes).await?,
        };

        if last > 0 && now.saturating_sub(last) < min_interval.as_millis() as i64 {
            self.remember(key, last);
            return Ok(false);
        }

        control.mark_last_scan_at(&attributes, now).await?;
        self.remember(key, now);
        Ok(true)
    }

    /// Include the type on the next cycle regardless of its interval.
    pub async fn force_include(&self, label: &str, scope: &Scope) -> Result<()> {
        let control = self.control(label)?;
        control.mark_force_rescan(&scope_attributes(scope)).await?;
        self.remember(Self::cache_key(label, scope), 0);
        Ok(())
    }

    pub async fn should_include_now(
        &self,
        label: &str,
        scope: &Scope,
        min_interval: Duration,
    ) -> Result<bool> {
        self.should_include(label, scope, min_interval, now_millis()).await
    }
}

impl std::fmt::Debug for CadenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceTracker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_graph::MemoryGraph;

    const MINUTE: i64 = 60_000;

    fn scope() -> Scope {
        Scope::new("1234", "us-east-1")
    }

    fn scheduler(store: Arc<MemoryGraph>, incremental: bool) -> ScanScheduler {
        let control = ScanControl::new(store, "Subnet").unwrap();
        ScanScheduler::new(control, &scope(), Duration::from_secs(30 * 60), incremental)
    }

    #[tokio::test]
    async fn test_full_scan_due_after_interval() {
        let store = Arc::new(MemoryGraph::new());
        let sched = scheduler(store, true);
        let now = 100 * MINUTE;

        sched.mark_full_scan(now - 31 * MINUTE).await.unwrap();
        assert!(sched.is_full_scan_required(now).await.unwrap());
        assert_eq!(sched.mode(now).await.unwrap(), ScanMode::Full);

        sched.mark_full_scan(now - 10 * MINUTE).await.unwrap();
        assert!(!sched.is_full_scan_required(now).await.unwrap());
        assert_eq!(sched.mode(now).await.unwrap(), ScanMode::Incremental);
    }

    #[tokio::test]
    async fn test_never_scanned_is_due() {
        let sched = scheduler(Arc::new(MemoryGraph::new()), true);
        assert!(sched.is_full_scan_required(now_millis()).await.unwrap());
    }

    #[tokio::test]
    async fn test_without_incremental_always_full() {
        let sched = scheduler(Arc::new(MemoryGraph::new()), false);
        let now = 100 * MINUTE;
        sched.mark_full_scan(now - MINUTE).await.unwrap();

        assert!(!sched.is_full_scan_required(now).await.unwrap());
        assert_eq!(sched.mode(now).await.unwrap(), ScanMode::Full);
    }

    #[tokio::test]
    async fn test_forced_rescan_makes_next_pass_full() {
        let store = Arc::new(MemoryGraph::new());
        let sched = scheduler(store.clone(), true);
        let now = 100 * MINUTE;
        sched.mark_full_scan(now - MINUTE).await.unwrap();
        assert_eq!(sched.mode(now).await.unwrap(), ScanMode::Incremental);

        ScanControl::new(store, "Subnet")
            .unwrap()
            .mark_force_rescan(&scope_attributes(&scope()))
            .await
            .unwrap();
        assert_eq!(sched.mode(now).await.unwrap(), ScanMode::Full);
    }

    #[tokio::test]
    async fn test_cadence_includes_once_per_interval() {
        let tracker = CadenceTracker::new(Arc::new(MemoryGraph::new()));
        let start = 1_000 * MINUTE;
        let interval = Duration::from_secs(5 * 60);

        let mut included = Vec::new();
        for cycle in 0..10 {
            if tracker
                .should_include("Snapshot", &scope(), interval, start + cycle * MINUTE)
                .await
                .unwrap()
            {
                included.push(cycle);
            }
        }
        assert_eq!(included, vec![0, 5]);
    }

    #[tokio::test]
    async fn test_cadence_is_per_scope_and_persisted() {
        let store = Arc::new(MemoryGraph::new());
        let interval = Duration::from_secs(5 * 60);
        let now = 1_000 * MINUTE;

        let tracker = CadenceTracker::new(store.clone());
        assert!(tracker.should_include("Snapshot", &scope(), interval, now).await.unwrap());
        let other = Scope::new("1234", "eu-west-1");
        assert!(tracker.should_include("Snapshot", &other, interval, now).await.unwrap());

        // A fresh tracker over the same store sees the recorded inclusion.
        let restarted = CadenceTracker::new(store);
        assert!(!restarted
            .should_include("Snapshot", &scope(), interval, now + MINUTE)
            .await
            .unwrap());

        restarted.force_include("Snapshot", &scope()).await.unwrap();
        assert!(restarted
            .should_include("Snapshot", &scope(), interval, now + 2 * MINUTE)
            .await
            .unwrap());
    }
}
