//! Parallel scan trees against the in-memory graph.
//!
//! Covers completion of nested parallel groups and failure aggregation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cartograph_core::{ProviderCredentials, Target};
use cartograph_graph::MemoryGraph;
use cartograph_scan::pool::{JoinScope, ScanPool};
use cartograph_scan::tree::{ScanEnvironment, TreeBuilder};
use cartograph_scan::{
    MultiTargetOrchestrator, ProviderError, ResourceScan, Result, ScanContext, ScanError,
    ScannerRegistry, ScannerSpec,
};

#[derive(Default)]
struct Progress {
    completed: Mutex<BTreeSet<String>>,
    runs: AtomicUsize,
}

struct Sleepy {
    label: String,
    delay: Duration,
    fail: bool,
    progress: Arc<Progress>,
}

#[async_trait]
impl ResourceScan for Sleepy {
    async fn full_scan(&self, _ctx: &ScanContext) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.progress.runs.fetch_add(1, Ordering::SeqCst);
        self.progress
            .completed
            .lock()
            .unwrap()
            .insert(self.label.clone());
        if self.fail {
            return Err(ProviderError::new("InternalError", format!("{} broke", self.label)).into());
        }
        Ok(())
    }
}

fn sleepy(label: &str, delay_ms: u64, fail: bool, progress: &Arc<Progress>) -> ScannerSpec {
    let progress = progress.clone();
    let unit_label = label.to_string();
    ScannerSpec::new(label, move |_| {
        Ok(Box::new(Sleepy {
            label: unit_label.clone(),
            delay: Duration::from_millis(delay_ms),
            fail,
            progress: progress.clone(),
        }) as Box<dyn ResourceScan>)
    })
}

/// Root(parallel) = A, B, Inner(parallel: C, D, E), Chain(group: F, Leaf(parallel: G)).
fn nested_registry(progress: &Arc<Progress>, failing: &[&str]) -> ScannerRegistry {
    let mut registry = ScannerRegistry::new();
    for (label, delay) in [("A", 5), ("B", 40), ("C", 30), ("D", 10), ("E", 50), ("F", 5), ("G", 60)] {
        registry
            .register(sleepy(label, delay, failing.contains(&label), progress))
            .unwrap();
    }
    registry.register_parallel("Inner", ["C", "D", "E"]).unwrap();
    registry.register_parallel("Leaf", ["G"]).unwrap();
    registry.register_group("Chain", ["F", "Leaf"]).unwrap();
    registry.register_parallel("Root", ["A", "B", "Inner", "Chain"]).unwrap();
    registry.validate().unwrap();
    registry
}

fn builder(registry: ScannerRegistry, fail_fast: bool) -> TreeBuilder {
    let mut env = ScanEnvironment::new(Arc::new(MemoryGraph::new()));
    env.fail_fast = fail_fast;
    env.pool = ScanPool::new(3);
    TreeBuilder::new(
        Target::new("1234", ProviderCredentials::default(), "us-east-1"),
        Arc::new(registry),
        Arc::new(env),
    )
}

#[tokio::test]
async fn test_outer_join_waits_for_nested_submissions() {
    let progress = Arc::new(Progress::default());
    let tree = builder(nested_registry(&progress, &[]), true)
        .build("Root")
        .await
        .unwrap()
        .unwrap();
    let scope = Arc::new(JoinScope::new());

    tree.scan(scope.clone()).await.unwrap();

    assert_eq!(progress.runs.load(Ordering::SeqCst), 7);
    // The join was released, so the next claim succeeds.
    assert!(scope.try_claim());
    // A, B, Inner, Chain from the root; C, D, E from Inner; G from Leaf.
    assert_eq!(scope.submitted(), 8);
}

#[tokio::test]
async fn test_failures_aggregate_once_and_siblings_complete() {
    let progress = Arc::new(Progress::default());
    let tree = builder(nested_registry(&progress, &["C", "G"]), true)
        .build("Root")
        .await
        .unwrap()
        .unwrap();

    let err = tree.scan(Arc::new(JoinScope::new())).await.unwrap_err();

    assert!(matches!(err, ScanError::Aggregate { .. }));
    assert_eq!(err.causes().len(), 2);
    assert!(err
        .causes()
        .iter()
        .all(|c| matches!(c, ScanError::Provider(p) if p.message.ends_with("broke"))));

    let completed = progress.completed.lock().unwrap().clone();
    let expected: BTreeSet<String> = ["A", "B", "C", "D", "E", "F", "G"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(completed, expected);
}

#[tokio::test]
async fn test_best_effort_units_do_not_raise() {
    let progress = Arc::new(Progress::default());
    let tree = builder(nested_registry(&progress, &["C", "G"]), false)
        .build("Root")
        .await
        .unwrap()
        .unwrap();

    tree.scan(Arc::new(JoinScope::new())).await.unwrap();
    assert_eq!(progress.runs.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_independent_scans_share_pool_but_not_join() {
    let pool = ScanPool::new(2);
    let fast = Arc::new(Progress::default());
    let slow = Arc::new(Progress::default());

    let mut fast_registry = ScannerRegistry::new();
    fast_registry.register(sleepy("Quick", 5, false, &fast)).unwrap();
    let mut slow_registry = ScannerRegistry::new();
    slow_registry.register(sleepy("Sluggish", 200, false, &slow)).unwrap();

    let orchestrator = |registry, pool: ScanPool| {
        MultiTargetOrchestrator::builder(registry, Arc::new(MemoryGraph::new()))
            .target(Target::new("1234", ProviderCredentials::default(), "us-east-1"))
            .pool(pool)
            .build()
            .unwrap()
    };
    let quick = orchestrator(fast_registry, pool.clone());
    let sluggish = Arc::new(orchestrator(slow_registry, pool));

    let background = {
        let sluggish = sluggish.clone();
        tokio::spawn(async move { sluggish.scan().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    quick.scan().await.unwrap();
    assert_eq!(fast.runs.load(Ordering::SeqCst), 1);
    assert_eq!(slow.runs.load(Ordering::SeqCst), 0);

    background.await.unwrap().unwrap();
    assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
}
