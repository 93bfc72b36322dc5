//! Scan units: one resource type, one target, one pass.
//!
//! A resource type implements [`ResourceScan`]. The engine wraps it in a
//! [`ScanUnit`], which picks the full or incremental path, hands the type a
//! [`ScanContext`] for paced provider calls and tracked writes, and runs
//! garbage collection after a clean full pass.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument;

use cartograph_core::properties::PropertyMapper;
use cartograph_core::types::now_millis;
use cartograph_core::{
    GraphEntity, Properties, Scope, Target, ACCOUNT_ATTRIBUTE, REGION_ATTRIBUTE,
};
use cartograph_graph::GraphStore;

use crate::error::{Result, ScanError};
use crate::gc::GarbageCollector;
use crate::rate_limit::RateLimiter;
use crate::reconcile::RelationshipReconciler;
use crate::retry::RetryPolicy;
use crate::scheduler::{ScanMode, ScanScheduler};

/// Extraction logic for one resource type.
#[async_trait]
pub trait ResourceScan: Send + Sync {
    /// Enumerate every resource of the type in the context's scope.
    async fn full_scan(&self, ctx: &ScanContext) -> Result<()>;

    fn supports_incremental(&self) -> bool {
        false
    }

    /// Cheaper pass used while a recent full pass exists.
    async fn incremental_scan(&self, ctx: &ScanContext) -> Result<()> {
        self.full_scan(ctx).await
    }
}

/// Everything a resource type may use during one pass.
pub struct ScanContext {
    label: String,
    target: Target,
    store: Arc<dyn GraphStore>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    mapper: PropertyMapper,
    fail_fast: bool,
    failed: AtomicBool,
    collectors: Mutex<Vec<Arc<GarbageCollector>>>,
}

impl ScanContext {
    pub fn new(
        label: impl Into<String>,
        target: Target,
        store: Arc<dyn GraphStore>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        fail_fast: bool,
    ) -> Self {
        let ctx = Self {
            label: label.into(),
            target,
            store,
            limiter,
            retry,
            mapper: PropertyMapper::new(),
            fail_fast,
            failed: AtomicBool::new(false),
            collectors: Mutex::new(Vec::new()),
        };
        // The unit's own label is always collected, even if nothing is written.
        ctx.collect_label(&ctx.label.clone());
        ctx
    }

    pub fn with_mapper(mut self, mapper: PropertyMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn scope(&self) -> Scope {
        self.target.scope()
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Block until the unit's rate limit admits one more call.
    pub async fn rate_limit(&self) {
        self.limiter.acquire().await;
    }

    /// A provider call, paced before every attempt and retried on throttling.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, crate::error::ProviderError>>,
    {
        let limiter = &self.limiter;
        let value = self
            .retry
            .call(operation, || {
                let attempt = f();
                async move {
                    limiter.acquire().await;
                    attempt.await
                }
            })
            .await?;
        Ok(value)
    }

    /// Flatten a provider object and stamp the scope attributes onto it.
    pub fn to_properties(&self, object: &Value) -> Properties {
        let mut properties = self.mapper.to_properties(object);
        properties.insert(
            ACCOUNT_ATTRIBUTE.to_string(),
            Value::String(self.target.account.clone()),
        );
        properties.insert(
            REGION_ATTRIBUTE.to_string(),
            Value::String(self.target.region.clone()),
        );
        properties
    }

    /// `<service>:<region>:<account>:<entity_type>/<id>`.
    pub fn business_key(&self, service: &str, entity_type: &str, id: &str) -> String {
        format!(
            "{service}:{}:{}:{entity_type}/{id}",
            self.target.region, self.target.account
        )
    }

    /// Opt `label` into collection for this pass. Only labels the unit
    /// enumerates completely in its scope may be collected; the unit's own
    /// label always is.
    pub fn collect_label(&self, label: &str) -> Arc<GarbageCollector> {
        let mut collectors = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = collectors.iter().find(|gc| gc.label() == label) {
            return Arc::clone(existing);
        }
        let gc = Arc::new(GarbageCollector::new(
            self.store.clone(),
            label,
            self.target.scope(),
        ));
        if self.is_failed() {
            gc.mark_failed();
        }
        collectors.push(Arc::clone(&gc));
        gc
    }

    fn collector(&self, label: &str) -> Option<Arc<GarbageCollector>> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|gc| gc.label() == label)
            .cloned()
    }

    /// Upsert an entity of the unit's own label.
    pub async fn upsert(&self, key: &str, properties: Properties) -> Result<GraphEntity> {
        let label = self.label.clone();
        self.upsert_as(&label, key, properties).await
    }

    /// Upsert an entity of any label. Its `updateTs` feeds that label's
    /// collector only when the label was opted in with [`Self::collect_label`].
    pub async fn upsert_as(
        &self,
        label: &str,
        key: &str,
        mut properties: Properties,
    ) -> Result<GraphEntity> {
        properties
            .entry(ACCOUNT_ATTRIBUTE)
            .or_insert_with(|| Value::String(self.target.account.clone()));
        properties
            .entry(REGION_ATTRIBUTE)
            .or_insert_with(|| Value::String(self.target.region.clone()));

        let entity = self.store.upsert_entity(label, key, &properties).await?;
        if let Some(gc) = self.collector(label) {
            gc.observe(&entity);
        }
        Ok(entity)
    }

    /// Relationship reconciler with this unit's label as the source.
    pub fn reconciler(&self, from_key: impl Into<String>) -> RelationshipReconciler {
        RelationshipReconciler::new(self.store.clone())
            .from_label(self.label.clone())
            .from_key(from_key)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Mark the pass failed, suppressing every collector in it.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        for gc in self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            gc.mark_failed();
        }
    }

    /// Record an unrecovered failure. Preconditions and fail-fast mode
    /// return the error; otherwise it is logged and the pass continues.
    pub fn record_failure(&self, error: ScanError) -> Result<()> {
        self.mark_failed();
        if error.is_precondition() || self.fail_fast {
            return Err(error);
        }
        tracing::warn!(
            scanner = %self.label,
            account = %self.target.account,
            region = %self.target.region,
            error = %error,
            "Scan failure recorded, continuing"
        );
        Ok(())
    }

    /// Run every collector. Returns the total deleted.
    pub async fn collect_garbage(&self) -> Result<u64> {
        let collectors: Vec<Arc<GarbageCollector>> = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut deleted = 0;
        for gc in collectors {
            deleted += gc.invoke().await?;
        }
        Ok(deleted)
    }
}

/// One constructed resource type bound to one target.
pub struct ScanUnit {
    label: String,
    target: Target,
    scan: Box<dyn ResourceScan>,
    store: Arc<dyn GraphStore>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    scheduler: ScanScheduler,
    fail_fast: bool,
}

impl ScanUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        target: Target,
        scan: Box<dyn ResourceScan>,
        store: Arc<dyn GraphStore>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        scheduler: ScanScheduler,
        fail_fast: bool,
    ) -> Self {
        Self {
            label: label.into(),
            target,
            scan,
            store,
            limiter,
            retry,
            scheduler,
            fail_fast,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Perform one pass.
    pub async fn scan(&self) -> Result<()> {
        let span = tracing::info_span!(
            "scan",
            scanner = %self.label,
            account = %self.target.account,
            region = %self.target.region,
        );
        self.run_pass().instrument(span).await
    }

    async fn prepare(&self) -> Result<ScanMode> {
        self.store.ensure_key_constraint(&self.label).await?;
        self.scheduler.mode(now_millis()).await
    }

    async fn run_pass(&self) -> Result<()> {
        let start = Instant::now();
        let ctx = ScanContext::new(
            self.label.clone(),
            self.target.clone(),
            self.store.clone(),
            self.limiter.clone(),
            self.retry.clone(),
            self.fail_fast,
        );

        let mode = match self.prepare().await {
            Ok(mode) => mode,
            Err(e) => {
                ctx.record_failure(e)?;
                return Ok(());
            }
        };
        tracing::info!(?mode, "Scan pass started");

        let outcome = match mode {
            ScanMode::Full => self.scan.full_scan(&ctx).await,
            ScanMode::Incremental => self.scan.incremental_scan(&ctx).await,
        };
        if let Err(e) = outcome {
            ctx.record_failure(e)?;
        }

        // An incremental pass touches only what changed, so only a full
        // pass can prove absence.
        let mut deleted = 0;
        if mode == ScanMode::Full {
            match ctx.collect_garbage().await {
                Ok(n) => deleted = n,
                Err(e) => ctx.record_failure(e)?,
            }
            if !ctx.is_failed() {
                if let Err(e) = self.scheduler.mark_full_scan(now_millis()).await {
                    ctx.record_failure(e)?;
                }
            }
        }

        tracing::info!(
            ?mode,
            failed = ctx.is_failed(),
            deleted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Scan pass finished"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ScanUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanUnit")
            .field("label", &self.label)
            .field("account", &self.target.account)
            .field("region", &self.target.region)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
