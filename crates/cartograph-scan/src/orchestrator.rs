//! Multi-target orchestration.
//!
//! One invocation builds a parallel group per (account, region) target and
//! runs them all under a single root parallel group, so every unit on every
//! target completes before [`MultiTargetOrchestrator::scan`] returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;
use uuid::Uuid;

use cartograph_core::Target;
use cartograph_graph::GraphStore;

use crate::config::ScanSettings;
use crate::control::{scope_attributes, ScanControl};
use crate::error::{Result, ScanError};
use crate::pool::{JoinScope, ScanPool};
use crate::registry::{Registration, ScannerRegistry};
use crate::retry::{Backoff, RetryPolicy};
use crate::tree::{ParallelGroup, ScanEnvironment, ScanTree, TreeBuilder};

pub struct MultiTargetOrchestrator {
    targets: Vec<Target>,
    roots: Vec<String>,
    registry: Arc<ScannerRegistry>,
    env: Arc<ScanEnvironment>,
    cycle: AtomicU64,
}

impl MultiTargetOrchestrator {
    pub fn builder(registry: ScannerRegistry, store: Arc<dyn GraphStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(registry, store)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Reset `lastScanTs` for every registered type on every target, so the
    /// next pass of each is a full one.
    pub async fn force_full_scan(&self) -> Result<()> {
        let labels: Vec<&str> = self
            .registry
            .tags()
            .filter(|tag| matches!(self.registry.get(tag), Some(Registration::Unit(_))))
            .collect();
        for label in &labels {
            let control = ScanControl::new(self.env.store.clone(), *label)?;
            for target in &self.targets {
                control
                    .mark_force_rescan(&scope_attributes(&target.scope()))
                    .await?;
            }
        }
        tracing::info!(types = labels.len(), targets = self.targets.len(), "Forced full rescan");
        Ok(())
    }

    /// Scan every target once. Returns after all submitted work completes;
    /// raises one aggregate when any target's tree failed.
    pub async fn scan(&self) -> Result<()> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let span = tracing::info_span!(
            "cycle",
            cycle,
            run_id = %Uuid::new_v4(),
            targets = self.targets.len()
        );
        self.run_cycle().instrument(span).await
    }

    async fn run_cycle(&self) -> Result<()> {
        let start = Instant::now();
        tracing::info!("Scan cycle started");

        let per_target = self
            .targets
            .iter()
            .map(|target| {
                let builder =
                    TreeBuilder::new(target.clone(), self.registry.clone(), self.env.clone());
                ScanTree::Parallel(ParallelGroup::new(
                    format!("{}/{}", target.account, target.region),
                    self.roots.clone(),
                    builder,
                ))
            })
            .collect();
        let root = ScanTree::Parallel(ParallelGroup::of(
            "targets",
            per_target,
            self.env.pool.clone(),
        ));

        let scope = Arc::new(JoinScope::new());
        let result = root.scan(Arc::clone(&scope)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => tracing::info!(tasks = scope.submitted(), duration_ms, "Scan cycle finished"),
            Err(e) => tracing::error!(
                tasks = scope.submitted(),
                failed = e.causes().len(),
                duration_ms,
                error = %e,
                "Scan cycle failed"
            ),
        }
        result
    }
}

pub struct OrchestratorBuilder {
    registry: ScannerRegistry,
    env: ScanEnvironment,
    targets: Vec<Target>,
    roots: Vec<String>,
}

impl OrchestratorBuilder {
    pub fn new(registry: ScannerRegistry, store: Arc<dyn GraphStore>) -> Self {
        Self {
            registry,
            env: ScanEnvironment::new(store),
            targets: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Apply file/environment settings.
    pub fn settings(mut self, settings: &ScanSettings) -> Self {
        self.targets.extend(settings.targets());
        self.roots.extend(settings.scan_types.iter().cloned());
        self.env.fail_fast = settings.fail_fast;
        self.env.full_scan_interval = settings.full_scan_interval();
        self.env.global_region = settings.global_region.clone();
        self.env.disabled_types.extend(settings.disabled_types.iter().cloned());
        self.env
            .rate_limits
            .extend(settings.rate_limits.iter().map(|(k, v)| (k.clone(), *v)));
        self.env.slow_scan_intervals.extend(settings.slow_scan_intervals());
        self.env.retry = RetryPolicy::new(Backoff::from(&settings.retry));
        self.env.pool = ScanPool::new(settings.worker_threads());
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// Root types scanned on every target (default: every registered root).
    pub fn root(mut self, tag: impl Into<String>) -> Self {
        self.roots.push(tag.into());
        self
    }

    pub fn global_region(mut self, region: impl Into<String>) -> Self {
        self.env.global_region = Some(region.into());
        self
    }

    pub fn disable_type(mut self, tag: impl Into<String>) -> Self {
        self.env.disabled_types.insert(tag.into());
        self
    }

    pub fn rate_limit(mut self, tag: impl Into<String>, per_second: f64) -> Self {
        self.env.rate_limits.insert(tag.into(), per_second);
        self
    }

    /// One rate for every type, overriding per-type settings.
    pub fn rate_limit_override(mut self, per_second: f64) -> Self {
        self.env.rate_limit_override = Some(per_second);
        self
    }

    pub fn slow_scan_interval(mut self, tag: impl Into<String>, interval: Duration) -> Self {
        self.env.slow_scan_intervals.insert(tag.into(), interval);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.env.fail_fast = fail_fast;
        self
    }

    pub fn full_scan_interval(mut self, interval: Duration) -> Self {
        self.env.full_scan_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.env.retry = retry;
        self
    }

    /// Share a pool with other orchestrators.
    pub fn pool(mut self, pool: ScanPool) -> Self {
        self.env.pool = pool;
        self
    }

    pub fn build(mut self) -> Result<MultiTargetOrchestrator> {
        if self.targets.is_empty() {
            return Err(ScanError::precondition("no scan targets configured"));
        }
        if let Some(t) = self
            .targets
            .iter()
            .find(|t| t.account.is_empty() || t.region.is_empty())
        {
            return Err(ScanError::precondition(format!(
                "target '{}/{}' missing account or region",
                t.account, t.region
            )));
        }
        self.registry.validate()?;
        if self.env.global_region.is_none() {
            let global_only = self.registry.tags().find(|tag| {
                !self.env.disabled_types.contains(*tag)
                    && matches!(self.registry.get(tag), Some(Registration::Unit(spec)) if spec.global_only)
            });
            if let Some(tag) = global_only {
                return Err(ScanError::precondition(format!(
                    "{tag} is global-only but no global region is set"
                )));
            }
        }

        if self.roots.is_empty() {
            self.roots = self.registry.roots();
        }
        if let Some(unknown) = self.roots.iter().find(|r| !self.registry.contains(r)) {
            return Err(ScanError::precondition(format!(
                "unknown scanner type {unknown}"
            )));
        }
        if self.roots.is_empty() {
            return Err(ScanError::precondition("no scanner types registered"));
        }

        tracing::info!(
            targets = self.targets.len(),
            roots = ?self.roots,
            workers = self.env.pool.size(),
            fail_fast = self.env.fail_fast,
            "Orchestrator configured"
        );

        Ok(MultiTargetOrchestrator {
            targets: self.targets,
            roots: self.roots,
            registry: Arc::new(self.registry),
            env: Arc::new(self.env),
            cycle: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ScannerSpec;
    use crate::unit::{ResourceScan, ScanContext};
    use async_trait::async_trait;
    use cartograph_core::ProviderCredentials;
    use cartograph_graph::MemoryGraph;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<BTreeSet<(String, String)>>>;

    struct Recording {
        seen: Seen,
    }

    #[async_trait]
    impl ResourceScan for Recording {
        async fn full_scan(&self, ctx: &ScanContext) -> Result<()> {
            let scope = ctx.scope();
            self.seen
                .lock()
                .unwrap()
                .insert((format!("{}/{}", scope.account, scope.region), ctx.label().to_string()));
            Ok(())
        }
    }

    fn recording(label: &str, seen: &Seen) -> ScannerSpec {
        let seen = seen.clone();
        ScannerSpec::new(label, move |_| {
            Ok(Box::new(Recording { seen: seen.clone() }) as Box<dyn ResourceScan>)
        })
    }

    fn target(account: &str, region: &str) -> Target {
        Target::new(account, ProviderCredentials::default(), region)
    }

    #[tokio::test]
    async fn test_every_target_scanned_and_global_once_per_account() {
        let seen: Seen = Arc::default();
        let mut registry = ScannerRegistry::new();
        registry.register(recording("Subnet", &seen)).unwrap();
        registry.register(recording("Role", &seen).global_only()).unwrap();

        let orchestrator = MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .target(target("111", "eu-west-1"))
            .target(target("222", "us-east-1"))
            .global_region("us-east-1")
            .build()
            .unwrap();

        orchestrator.scan().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        let subnets = seen.iter().filter(|(_, l)| l == "Subnet").count();
        let roles: Vec<&String> = seen
            .iter()
            .filter(|(_, l)| l == "Role")
            .map(|(s, _)| s)
            .collect();
        assert_eq!(subnets, 3);
        assert_eq!(roles, vec!["111/us-east-1", "222/us-east-1"]);
        assert_eq!(orchestrator.cycles(), 1);
    }

    #[tokio::test]
    async fn test_disabled_type_skipped_everywhere() {
        let seen: Seen = Arc::default();
        let mut registry = ScannerRegistry::new();
        registry.register(recording("Subnet", &seen)).unwrap();
        registry.register(recording("Volume", &seen)).unwrap();

        let orchestrator = MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .target(target("111", "eu-west-1"))
            .disable_type("Volume")
            .build()
            .unwrap();
        orchestrator.scan().await.unwrap();

        assert!(seen.lock().unwrap().iter().all(|(_, l)| l == "Subnet"));
    }

    #[tokio::test]
    async fn test_slow_type_cadence_shared_across_cycles() {
        let seen: Seen = Arc::default();
        let mut registry = ScannerRegistry::new();
        registry.register(recording("Snapshot", &seen)).unwrap();

        let orchestrator = MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .slow_scan_interval("Snapshot", Duration::from_secs(3600))
            .build()
            .unwrap();

        orchestrator.scan().await.unwrap();
        seen.lock().unwrap().clear();
        orchestrator.scan().await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(orchestrator.cycles(), 2);
    }

    #[test]
    fn test_build_preconditions() {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::new());
        let err = MultiTargetOrchestrator::builder(ScannerRegistry::new(), store.clone())
            .build()
            .err()
            .unwrap();
        assert!(err.is_precondition());

        let err = MultiTargetOrchestrator::builder(ScannerRegistry::new(), store)
            .target(target("111", "us-east-1"))
            .root("Missing")
            .build()
            .err()
            .unwrap();
        assert!(err.is_precondition());
    }

    struct Passes {
        full: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl ResourceScan for Passes {
        async fn full_scan(&self, _ctx: &ScanContext) -> Result<()> {
            self.full.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn supports_incremental(&self) -> bool {
            true
        }

        async fn incremental_scan(&self, _ctx: &ScanContext) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_force_full_scan_resets_incremental_types() {
        let full = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = full.clone();
        let mut registry = ScannerRegistry::new();
        registry
            .register(ScannerSpec::new("Instance", move |_| {
                Ok(Box::new(Passes { full: counter.clone() }) as Box<dyn ResourceScan>)
            }))
            .unwrap();

        let orchestrator = MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .build()
            .unwrap();

        orchestrator.scan().await.unwrap();
        orchestrator.scan().await.unwrap();
        assert_eq!(full.load(Ordering::SeqCst), 1);

        orchestrator.force_full_scan().await.unwrap();
        orchestrator.scan().await.unwrap();
        assert_eq!(full.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_only_type_requires_global_region() {
        let seen: Seen = Arc::default();
        let mut registry = ScannerRegistry::new();
        registry.register(recording("Subnet", &seen)).unwrap();
        registry.register(recording("Role", &seen).global_only()).unwrap();

        let err = MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .build()
            .err()
            .unwrap();
        assert!(err.is_precondition());
        assert!(err.to_string().contains("Role"));

        let mut registry = ScannerRegistry::new();
        registry.register(recording("Role", &seen).global_only()).unwrap();
        registry.register(recording("Subnet", &seen)).unwrap();
        assert!(MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(target("111", "us-east-1"))
            .disable_type("Role")
            .build()
            .is_ok());
    }
}
