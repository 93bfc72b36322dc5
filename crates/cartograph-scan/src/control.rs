//! Persisted scan-control records.
//!
//! One record per (scanner type, scoping attributes) holds `lastScanTs`, so
//! full-scan cadence survives process restarts. Records match on exact
//! equality of the type and the full attribute set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cartograph_core::types::now_millis;
use cartograph_core::{Scope, ACCOUNT_ATTRIBUTE, REGION_ATTRIBUTE};
use cartograph_graph::GraphStore;

use crate::error::{Result, ScanError};

/// Scoping attributes of a scan-control record.
pub type ScanAttributes = BTreeMap<String, String>;

/// The `{account, region}` attributes of a scope.
pub fn scope_attributes(scope: &Scope) -> ScanAttributes {
    BTreeMap::from([
        (ACCOUNT_ATTRIBUTE.to_string(), scope.account.clone()),
        (REGION_ATTRIBUTE.to_string(), scope.region.clone()),
    ])
}

#[derive(Clone)]
pub struct ScanControl {
    store: Arc<dyn GraphStore>,
    scan_type: String,
}

impl ScanControl {
    pub fn new(store: Arc<dyn GraphStore>, scan_type: impl Into<String>) -> Result<Self> {
        let scan_type = scan_type.into();
        if scan_type.trim().is_empty() {
            return Err(ScanError::precondition("scan control type not set"));
        }
        Ok(Self { store, scan_type })
    }

    pub fn scan_type(&self) -> &str {
        &self.scan_type
    }

    /// Canonical, unambiguous encoding of an attribute set.
    fn scope_key(attrs: &ScanAttributes) -> Result<String> {
        if attrs.contains_key("type") {
            return Err(ScanError::precondition("attributes cannot contain 'type' key"));
        }
        serde_json::to_string(attrs).map_err(|e| ScanError::precondition(e.to_string()))
    }

    /// Record a completed scan now.
    pub async fn mark_last_scan(&self, attrs: &ScanAttributes) -> Result<()> {
        self.mark_last_scan_at(attrs, now_millis()).await
    }

    pub async fn mark_last_scan_at(&self, attrs: &ScanAttributes, ts: i64) -> Result<()> {
        let key = Self::scope_key(attrs)?;
        self.store.set_last_scan_ts(&self.scan_type, &key, ts).await?;
        Ok(())
    }

    /// Reset to zero so the next pass treats the scope as never scanned.
    pub async fn mark_force_rescan(&self, attrs: &ScanAttributes) -> Result<()> {
        tracing::info!(scan_type = %self.scan_type, ?attrs, "Forcing rescan");
        self.mark_last_scan_at(attrs, 0).await
    }

    /// `lastScanTs` in epoch millis; zero when never recorded.
    pub async fn last_scan(&self, attrs: &ScanAttributes) -> Result<i64> {
        let key = Self::scope_key(attrs)?;
        Ok(self
            .store
            .last_scan_ts(&self.scan_type, &key)
            .await?
            .unwrap_or(0))
    }

    /// Time elapsed between the last recorded scan and `now` (epoch millis).
    pub async fn time_since_last_scan(&self, attrs: &ScanAttributes, now: i64) -> Result<Duration> {
        let last = self.last_scan(attrs).await?;
        Ok(Duration::from_millis(now.saturating_sub(last).max(0) as u64))
    }
}
