//! Composite scan trees.
//!
//! A [`Group`] scans its children one after another on the calling task. A
//! [`ParallelGroup`] submits each child to the shared [`ScanPool`]; only the
//! group that claims the [`JoinScope`] waits, so nested parallel groups funnel
//! their tasks into the outermost join. Children are resolved through a
//! [`TreeBuilder`] when their parent runs, and a type excluded this cycle is
//! never constructed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use cartograph_core::Target;
use cartograph_graph::GraphStore;

use crate::control::ScanControl;
use crate::error::{Result, ScanError};
use crate::pool::{JoinScope, ScanPool};
use crate::rate_limit::RateLimiter;
use crate::registry::{Registration, ScannerRegistry, ScannerSpec};
use crate::retry::RetryPolicy;
use crate::scheduler::{CadenceTracker, ScanScheduler};
use crate::unit::ScanUnit;

/// Settings shared by every tree an orchestrator builds.
pub struct ScanEnvironment {
    pub store: Arc<dyn GraphStore>,
    pub pool: ScanPool,
    pub cadence: Arc<CadenceTracker>,
    pub retry: RetryPolicy,
    pub fail_fast: bool,
    pub full_scan_interval: Duration,
    pub global_region: Option<String>,
    pub disabled_types: HashSet<String>,
    /// Applied to every type, above any per-type setting.
    pub rate_limit_override: Option<f64>,
    pub rate_limits: HashMap<String, f64>,
    pub slow_scan_intervals: HashMap<String, Duration>,
}

impl ScanEnvironment {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            cadence: Arc::new(CadenceTracker::new(store.clone())),
            store,
            pool: ScanPool::default(),
            retry: RetryPolicy::default(),
            fail_fast: false,
            full_scan_interval: Duration::from_secs(30 * 60),
            global_region: None,
            disabled_types: HashSet::new(),
            rate_limit_override: None,
            rate_limits: HashMap::new(),
            slow_scan_intervals: HashMap::new(),
        }
    }
}

/// Resolves type tags into scan trees for one target.
#[derive(Clone)]
pub struct TreeBuilder {
    target: Target,
    registry: Arc<ScannerRegistry>,
    env: Arc<ScanEnvironment>,
}

impl TreeBuilder {
    pub fn new(target: Target, registry: Arc<ScannerRegistry>, env: Arc<ScanEnvironment>) -> Self {
        Self {
            target,
            registry,
            env,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn pool(&self) -> &ScanPool {
        &self.env.pool
    }

    /// Build the tree for `tag`, or `None` when it is excluded on this
    /// target this cycle.
    pub async fn build(&self, tag: &str) -> Result<Option<ScanTree>> {
        if self.env.disabled_types.contains(tag) {
            tracing::debug!(scanner = tag, "Scanner type disabled");
            return Ok(None);
        }
        let registration = self
            .registry
            .get(tag)
            .ok_or_else(|| ScanError::precondition(format!("unknown scanner type {tag}")))?;

        let tree = match registration {
            Registration::Group(children) => {
                Some(ScanTree::Group(Group::new(tag, children.clone(), self.clone())))
            }
            Registration::Parallel(children) => Some(ScanTree::Parallel(ParallelGroup::new(
                tag,
                children.clone(),
                self.clone(),
            ))),
            Registration::Unit(spec) => self.build_unit(spec).await?.map(ScanTree::Unit),
        };
        Ok(tree)
    }

    async fn build_unit(&self, spec: &ScannerSpec) -> Result<Option<ScanUnit>> {
        let label = spec.label.as_str();
        let scope = self.target.scope();

        if spec.global_only {
            let global = self.env.global_region.as_deref().ok_or_else(|| {
                ScanError::precondition(format!("{label} is global-only but no global region is set"))
            })?;
            if global != self.target.region {
                return Ok(None);
            }
        }

        let slow_interval = self
            .env
            .slow_scan_intervals
            .get(label)
            .copied()
            .or(spec.slow_scan);
        if let Some(interval) = slow_interval {
            if !self.env.cadence.should_include_now(label, &scope, interval).await? {
                tracing::debug!(scanner = label, scope = %scope, "Slow scanner not due this cycle");
                return Ok(None);
            }
        }

        let scan = spec.construct(&self.target)?;
        let limiter = RateLimiter::resolve(
            label,
            self.env.rate_limit_override,
            self.env.rate_limits.get(label).copied(),
            spec.default_rate_limit,
        );
        let control = ScanControl::new(self.env.store.clone(), label)?;
        let scheduler = ScanScheduler::new(
            control,
            &scope,
            self.env.full_scan_interval,
            scan.supports_incremental(),
        );

        Ok(Some(ScanUnit::new(
            label,
            self.target.clone(),
            scan,
            self.env.store.clone(),
            limiter,
            self.env.retry.clone(),
            scheduler,
            self.env.fail_fast,
        )))
    }
}

pub enum ScanTree {
    Unit(ScanUnit),
    Group(Group),
    Parallel(ParallelGroup),
}

impl ScanTree {
    pub fn label(&self) -> &str {
        match self {
            ScanTree::Unit(u) => u.label(),
            ScanTree::Group(g) => &g.label,
            ScanTree::Parallel(p) => &p.label,
        }
    }

    /// Run the tree. Parallel work submitted under an already-claimed scope
    /// completes at that scope's join, not before this returns.
    pub fn scan(self, scope: Arc<JoinScope>) -> BoxFuture<'static, Result<()>> {
        match self {
            ScanTree::Unit(unit) => async move { unit.scan().await }.boxed(),
            ScanTree::Group(group) => group.scan(scope).boxed(),
            ScanTree::Parallel(group) => group.scan(scope).boxed(),
        }
    }
}

/// Sequential composite.
pub struct Group {
    label: String,
    children: Vec<String>,
    builder: TreeBuilder,
    fail_fast: bool,
}

impl Group {
    pub fn new(label: impl Into<String>, children: Vec<String>, builder: TreeBuilder) -> Self {
        let fail_fast = builder.env.fail_fast;
        Self {
            label: label.into(),
            children,
            builder,
            fail_fast,
        }
    }

    /// Children run in order. Preconditions propagate at once; in fail-fast
    /// mode so does the first other failure and no further child runs. In
    /// best-effort mode failures are logged and every child is attempted.
    pub async fn scan(self, scope: Arc<JoinScope>) -> Result<()> {
        let mut failed = 0;
        for tag in &self.children {
            let outcome = match self.builder.build(tag).await {
                Ok(Some(child)) => child.scan(Arc::clone(&scope)).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_precondition() || self.fail_fast => {
                    tracing::error!(group = %self.label, scanner = %tag, error = %e, "Child scan failed, stopping group");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(group = %self.label, scanner = %tag, error = %e, "Child scan failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            tracing::warn!(group = %self.label, failed, "Group finished with failures");
        }
        Ok(())
    }
}

enum Children {
    Tags {
        tags: Vec<String>,
        builder: TreeBuilder,
    },
    Trees(Vec<ScanTree>),
}

/// Concurrent composite.
pub struct ParallelGroup {
    label: String,
    children: Children,
    pool: ScanPool,
}

impl ParallelGroup {
    pub fn new(label: impl Into<String>, tags: Vec<String>, builder: TreeBuilder) -> Self {
        Self {
            label: label.into(),
            pool: builder.pool().clone(),
            children: Children::Tags { tags, builder },
        }
    }

    /// Group already-built trees, such as one per target.
    pub fn of(label: impl Into<String>, trees: Vec<ScanTree>, pool: ScanPool) -> Self {
        Self {
            label: label.into(),
            children: Children::Trees(trees),
            pool,
        }
    }

    async fn resolve(children: Children) -> Result<(Vec<ScanTree>, Vec<ScanError>)> {
        match children {
            Children::Trees(trees) => Ok((trees, Vec::new())),
            Children::Tags { tags, builder } => {
                let mut trees = Vec::new();
                let mut failures = Vec::new();
                for tag in &tags {
                    match builder.build(tag).await {
                        Ok(Some(tree)) => trees.push(tree),
                        Ok(None) => {}
                        Err(e) if e.is_precondition() => return Err(e),
                        Err(e) => failures.push(e),
                    }
                }
                Ok((trees, failures))
            }
        }
    }

    /// Submit every child. The claiming invocation then joins all tasks in
    /// the scope and raises one aggregate if any failed.
    pub async fn scan(self, scope: Arc<JoinScope>) -> Result<()> {
        let (trees, mut failures) = Self::resolve(self.children).await?;

        let owner = scope.try_claim();
        tracing::debug!(group = %self.label, children = trees.len(), owner, "Submitting parallel scans");
        for tree in trees {
            let task = tree.scan(Arc::clone(&scope));
            self.pool.submit(&scope, task);
        }

        if owner {
            failures.extend(scope.join().await);
            scope.release();
        }

        if failures.is_empty() {
            return Ok(());
        }
        tracing::error!(group = %self.label, failed = failures.len(), "Parallel scan finished with failures");
        Err(ScanError::Aggregate {
            message: format!("{} scanning problems", self.label),
            causes: failures,
        })
    }
}
