//! Idempotent relationship-set convergence.
//!
//! Given a source entity and the intended set of target identifiers computed
//! fresh this pass, converge the live edges of one relationship type so that
//! they point at exactly the intended targets that exist. Missing targets
//! simply get no edge.

use std::sync::Arc;

use serde_json::Value;

use cartograph_core::{Properties, KEY_ATTRIBUTE};
use cartograph_graph::{GraphStore, LinkRequest};

use crate::error::{Result, ScanError};

/// Counts from one convergence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub linked: u64,
    pub unlinked: u64,
}

/// Builder for one (source, relationship, target label) convergence.
#[derive(Clone)]
pub struct RelationshipReconciler {
    store: Arc<dyn GraphStore>,
    from_label: Option<String>,
    from_key: Option<String>,
    link_label: Option<String>,
    target_label: Option<String>,
    target_attribute: String,
    target_values: Vec<String>,
    target_filter: Properties,
}

impl RelationshipReconciler {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            from_label: None,
            from_key: None,
            link_label: None,
            target_label: None,
            target_attribute: KEY_ATTRIBUTE.to_string(),
            target_values: Vec::new(),
            target_filter: Properties::new(),
        }
    }

    pub fn from_label(mut self, label: impl Into<String>) -> Self {
        self.from_label = Some(label.into());
        self
    }

    pub fn from_key(mut self, key: impl Into<String>) -> Self {
        self.from_key = Some(key.into());
        self
    }

    pub fn link_label(mut self, label: impl Into<String>) -> Self {
        self.link_label = Some(label.into());
        self
    }

    pub fn target_label(mut self, label: impl Into<String>) -> Self {
        self.target_label = Some(label.into());
        self
    }

    /// Attribute on the target matched against the intended values
    /// (default: the business key).
    pub fn target_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.target_attribute = attribute.into();
        self
    }

    /// Restrict targets to nodes whose `attribute` equals `value`.
    pub fn target_filter(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.target_filter.insert(attribute.into(), value.into());
        self
    }

    /// The complete intended set for this pass.
    pub fn target_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_values = values.into_iter().map(Into::into).collect();
        self.target_values.sort();
        self.target_values.dedup();
        self
    }

    fn request(&self) -> Result<LinkRequest> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ScanError::precondition(format!("relationship {name} not set")))
        };

        let mut request = LinkRequest::new(
            required(&self.from_label, "source label")?,
            required(&self.from_key, "source key")?,
            required(&self.link_label, "type")?,
            required(&self.target_label, "target label")?,
        );
        request.target_attribute = self.target_attribute.clone();
        request.target_values = self.target_values.clone();
        request.target_filter = self.target_filter.clone();
        request
            .validate()
            .map_err(|e| ScanError::precondition(e.to_string()))?;
        Ok(request)
    }

    /// Create-or-refresh intended edges, then drop every other edge of this
    /// type from the source to the target label.
    pub async fn execute(&self) -> Result<ReconcileOutcome> {
        let request = self.request()?;
        let linked = self.store.link_targets(&request).await?;
        let unlinked = self.store.unlink_others(&request).await?;

        tracing::debug!(
            from = %request.from_key,
            rel = %request.link_label,
            target = %request.target_label,
            intended = request.target_values.len(),
            linked,
            unlinked,
            "Reconciled relationships"
        );
        Ok(ReconcileOutcome { linked, unlinked })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_graph::MemoryGraph;
    use serde_json::json;

    fn graph_with_targets() -> Arc<MemoryGraph> {
        let graph = Arc::new(MemoryGraph::new());
        graph.insert_entity("Instance", "i-1", Properties::new(), 1);
        for (key, vpc) in [("sg-1", "vpc-a"), ("sg-2", "vpc-a"), ("sg-3", "vpc-b")] {
            let mut p = Properties::new();
            p.insert("vpcId".into(), json!(vpc));
            p.insert("groupId".into(), json!(key));
            graph.insert_entity("SecurityGroup", key, p, 1);
        }
        graph
    }

    fn reconciler(graph: &Arc<MemoryGraph>) -> RelationshipReconciler {
        RelationshipReconciler::new(graph.clone())
            .from_label("Instance")
            .from_key("i-1")
            .link_label("USES")
            .target_label("SecurityGroup")
    }

    #[tokio::test]
    async fn test_converges_to_intended_intersect_existing() {
        let graph = graph_with_targets();

        let outcome = reconciler(&graph)
            .target_values(["sg-1", "sg-3", "sg-missing"])
            .execute()
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome { linked: 2, unlinked: 0 });
        assert_eq!(graph.linked_keys("Instance", "i-1", "USES"), vec!["sg-1", "sg-3"]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let graph = graph_with_targets();
        let r = reconciler(&graph).target_values(["sg-1", "sg-2"]);

        r.execute().await.unwrap();
        let second = r.execute().await.unwrap();

        assert_eq!(second.unlinked, 0);
        assert_eq!(graph.relationships().len(), 2);
    }

    #[tokio::test]
    async fn test_shrinking_set_removes_exactly_the_difference() {
        let graph = graph_with_targets();
        reconciler(&graph)
            .target_values(["sg-1", "sg-2", "sg-3"])
            .execute()
            .await
            .unwrap();

        let outcome = reconciler(&graph)
            .target_values(["sg-2"])
            .execute()
            .await
            .unwrap();

        assert_eq!(outcome.unlinked, 2);
        assert_eq!(graph.linked_keys("Instance", "i-1", "USES"), vec!["sg-2"]);
    }

    #[tokio::test]
    async fn test_empty_set_removes_all_edges() {
        let graph = graph_with_targets();
        reconciler(&graph)
            .target_values(["sg-1"])
            .execute()
            .await
            .unwrap();

        reconciler(&graph)
            .target_values(Vec::<String>::new())
            .execute()
            .await
            .unwrap();

        assert!(graph.linked_keys("Instance", "i-1", "USES").is_empty());
    }

    #[tokio::test]
    async fn test_custom_attribute_and_filter() {
        let graph = graph_with_targets();

        reconciler(&graph)
            .target_attribute("groupId")
            .target_filter("vpcId", "vpc-a")
            .target_values(["sg-1", "sg-3"])
            .execute()
            .await
            .unwrap();

        assert_eq!(graph.linked_keys("Instance", "i-1", "USES"), vec!["sg-1"]);
    }

    #[tokio::test]
    async fn test_missing_fields_are_preconditions() {
        let graph = graph_with_targets();
        let err = RelationshipReconciler::new(graph.clone())
            .from_label("Instance")
            .link_label("USES")
            .target_label("SecurityGroup")
            .execute()
            .await
            .unwrap_err();
        assert!(err.is_precondition());

        let err = reconciler(&graph)
            .link_label("USES; DROP")
            .execute()
            .await
            .unwrap_err();
        assert!(err.is_precondition());
    }
}
