//! Stale-entity collection scoped to (label, account, region).
//!
//! A collector is created at the start of a pass. Every successful upsert
//! feeds its `updateTs` into a running minimum (the watermark). At the end of
//! the pass, entities in scope older than the watermark are deleted, unless
//! the pass recorded a failure or wrote nothing at all.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use cartograph_core::{GraphEntity, Scope};
use cartograph_graph::GraphStore;

use crate::error::{Result, ScanError};

/// Watermark value meaning "nothing written this pass".
const NO_WATERMARK: i64 = i64::MAX;

pub struct GarbageCollector {
    label: String,
    scope: Scope,
    store: Arc<dyn GraphStore>,
    watermark: AtomicI64,
    failed: AtomicBool,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn GraphStore>, label: impl Into<String>, scope: Scope) -> Self {
        Self {
            label: label.into(),
            scope,
            store,
            watermark: AtomicI64::new(NO_WATERMARK),
            failed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Lower the watermark to `ts`. Zero and negative timestamps are ignored.
    pub fn update_earliest_timestamp(&self, ts: i64) {
        if ts > 0 {
            self.watermark.fetch_min(ts, Ordering::SeqCst);
        }
    }

    /// Record a successful upsert.
    pub fn observe(&self, entity: &GraphEntity) {
        self.update_earliest_timestamp(entity.update_ts);
    }

    /// Suppress sweeping for this pass.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Minimum `updateTs` written this pass, if anything was written.
    pub fn watermark(&self) -> Option<i64> {
        match self.watermark.load(Ordering::SeqCst) {
            NO_WATERMARK => None,
            ts => Some(ts),
        }
    }

    /// Sweep entities in scope older than the watermark. Returns the number
    /// deleted; zero when the pass failed or wrote nothing.
    pub async fn invoke(&self) -> Result<u64> {
        if self.is_failed() {
            tracing::info!(
                label = %self.label,
                scope = %self.scope,
                "Skipping garbage collection, pass recorded failures"
            );
            return Ok(0);
        }
        let Some(watermark) = self.watermark() else {
            tracing::debug!(label = %self.label, scope = %self.scope, "Nothing written, nothing to collect");
            return Ok(0);
        };

        if self.label.is_empty() {
            return Err(ScanError::precondition("garbage collector label not set"));
        }
        if self.scope.account.is_empty() {
            return Err(ScanError::precondition("garbage collector account not set"));
        }
        if self.scope.region.is_empty() {
            return Err(ScanError::precondition("garbage collector region not set"));
        }

        let deleted = self
            .store
            .delete_stale(&self.label, &self.scope, watermark)
            .await?;

        if deleted > 0 {
            tracing::info!(
                label = %self.label,
                scope = %self.scope,
                watermark,
                deleted,
                "Collected stale entities"
            );
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("label", &self.label)
            .field("scope", &self.scope)
            .field("watermark", &self.watermark())
            .field("failed", &self.is_failed())
            .finish()
    }
}
