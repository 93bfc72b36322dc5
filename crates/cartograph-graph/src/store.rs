//! The graph store contract shared by the Neo4j client and the in-memory store.
//!
//! Scan units never build queries themselves: every write the engine performs
//! goes through one of these operations, so collection and relationship
//! convergence behave identically against either backend.

use async_trait::async_trait;

use cartograph_core::types::validate_identifier;
use cartograph_core::{GraphEntity, Properties, Scope, KEY_ATTRIBUTE};

use crate::client::GraphError;

/// Label of the persisted scan-control records.
pub const SCAN_CONTROL_LABEL: &str = "ScanControl";

/// One half-or-whole relationship convergence request.
///
/// Edges run `(from_label {key: from_key})-[link_label]->(target_label)` and
/// target nodes are selected by `target_attribute IN target_values` plus
/// equality on every entry of `target_filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub from_label: String,
    pub from_key: String,
    pub link_label: String,
    pub target_label: String,
    pub target_attribute: String,
    pub target_values: Vec<String>,
    pub target_filter: Properties,
}

impl LinkRequest {
    pub fn new(
        from_label: impl Into<String>,
        from_key: impl Into<String>,
        link_label: impl Into<String>,
        target_label: impl Into<String>,
    ) -> Self {
        Self {
            from_label: from_label.into(),
            from_key: from_key.into(),
            link_label: link_label.into(),
            target_label: target_label.into(),
            target_attribute: KEY_ATTRIBUTE.to_string(),
            target_values: Vec::new(),
            target_filter: Properties::new(),
        }
    }

    /// Reject any name that would be interpolated into a query unsafely.
    pub fn validate(&self) -> Result<(), GraphError> {
        validate_identifier("label", &self.from_label)?;
        validate_identifier("label", &self.target_label)?;
        validate_identifier("relationship type", &self.link_label)?;
        validate_identifier("attribute", &self.target_attribute)?;
        for name in self.target_filter.keys() {
            validate_identifier("attribute", name)?;
        }
        Ok(())
    }
}

/// Operations the scan engine needs from a property graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the per-label uniqueness constraint on the business key.
    async fn ensure_key_constraint(&self, label: &str) -> Result<(), GraphError>;

    /// Merge an entity by key. `createTs` is set once, the property set is
    /// replaced, and `updateTs` is refreshed. Returns the stored entity.
    async fn upsert_entity(
        &self,
        label: &str,
        key: &str,
        properties: &Properties,
    ) -> Result<GraphEntity, GraphError>;

    /// Detach-delete every entity of `label` in `scope` whose `updateTs` is
    /// strictly less than `watermark`. Returns the number deleted.
    async fn delete_stale(
        &self,
        label: &str,
        scope: &Scope,
        watermark: i64,
    ) -> Result<u64, GraphError>;

    /// Create or refresh an edge to every matching target. Returns the number
    /// of edges touched.
    async fn link_targets(&self, request: &LinkRequest) -> Result<u64, GraphError>;

    /// Delete edges of the request's type from the source to target-label
    /// nodes whose link attribute is not in `target_values`.
    async fn unlink_others(&self, request: &LinkRequest) -> Result<u64, GraphError>;

    /// Read the `lastScanTs` of the record matching `(scan_type, scope_key)`.
    async fn last_scan_ts(&self, scan_type: &str, scope_key: &str)
        -> Result<Option<i64>, GraphError>;

    /// Create or update the record matching `(scan_type, scope_key)`.
    async fn set_last_scan_ts(
        &self,
        scan_type: &str,
        scope_key: &str,
        ts: i64,
    ) -> Result<(), GraphError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_request_defaults_to_business_key() {
        let req = LinkRequest::new("Instance", "i-1", "ATTACHED_TO", "Volume");
        assert_eq!(req.target_attribute, KEY_ATTRIBUTE);
        assert!(req.target_values.is_empty());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_link_request_rejects_unsafe_names() {
        let mut req = LinkRequest::new("Instance", "i-1", "ATTACHED-TO", "Volume");
        assert!(req.validate().is_err());

        req.link_label = "ATTACHED_TO".into();
        req.target_filter.insert("region = 'x' OR true".into(), json!("x"));
        assert!(req.validate().is_err());
    }
}
