//! File-backed resource provider.
//!
//! Serves resources from a JSON inventory instead of a provider SDK. Each
//! entry names its label, account, region, identifier, raw provider object and
//! outgoing relationships. The units built from it go through the same
//! paced calls, property mapping, tracked upserts and reconciliation as any
//! other resource type.
//!
//! ```json
//! {
//!   "service": "ec2",
//!   "resources": [
//!     {"label": "Subnet", "account": "1234", "region": "us-east-1", "id": "subnet-1",
//!      "object": {"VpcId": "vpc-1"},
//!      "links": [{"rel": "IN_VPC", "target_label": "Vpc", "values": ["vpc-1"]}]}
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use cartograph_core::{Scope, ACCOUNT_ATTRIBUTE};

use crate::error::{Result, ScanError};
use crate::registry::{ScannerRegistry, ScannerSpec};
use crate::unit::{ResourceScan, ScanContext};

/// Property holding the provider identifier; relationships link on it.
pub const RESOURCE_ID_ATTRIBUTE: &str = "resourceId";

#[derive(Debug, Clone, Deserialize)]
pub struct Inventory {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub resources: Vec<InventoryResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryResource {
    pub label: String,
    pub account: String,
    pub region: String,
    pub id: String,
    /// Raw provider object. Anything but a JSON object fails conversion.
    #[serde(default)]
    pub object: Value,
    #[serde(default)]
    pub links: Vec<InventoryLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryLink {
    pub rel: String,
    pub target_label: String,
    #[serde(default)]
    pub values: Vec<String>,
}

fn default_service() -> String {
    "inventory".to_string()
}

impl Inventory {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ScanError::Inventory(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let inventory = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            resources = inventory.resources.len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| r.label.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Resources of `label` in `scope`, in file order.
    pub fn list(&self, label: &str, scope: &Scope) -> Vec<InventoryResource> {
        self.resources
            .iter()
            .filter(|r| r.label == label && r.account == scope.account && r.region == scope.region)
            .cloned()
            .collect()
    }

    /// Register one resource type per label.
    pub fn register(self: &Arc<Self>, registry: &mut ScannerRegistry) -> Result<()> {
        for label in self.labels() {
            let inventory = Arc::clone(self);
            let unit_label = label.clone();
            registry.register(ScannerSpec::new(label, move |_| {
                Ok(Box::new(InventoryScan {
                    inventory: Arc::clone(&inventory),
                    label: unit_label.clone(),
                }) as Box<dyn ResourceScan>)
            }))?;
        }
        Ok(())
    }
}

/// One label of the inventory on one target.
pub struct InventoryScan {
    inventory: Arc<Inventory>,
    label: String,
}

impl InventoryScan {
    fn convert(&self, ctx: &ScanContext, resource: &InventoryResource) -> Result<cartograph_core::Properties> {
        if !resource.object.is_object() {
            return Err(ScanError::Conversion {
                label: self.label.clone(),
                message: format!("{} is not an object", resource.id),
            });
        }
        let mut properties = ctx.to_properties(&resource.object);
        properties.insert(
            RESOURCE_ID_ATTRIBUTE.to_string(),
            Value::String(resource.id.clone()),
        );
        Ok(properties)
    }

    async fn sync(&self, ctx: &ScanContext, resource: &InventoryResource) -> Result<()> {
        let properties = self.convert(ctx, resource)?;
        let key = ctx.business_key(
            &self.inventory.service,
            &self.label.to_lowercase(),
            &resource.id,
        );
        ctx.upsert(&key, properties).await?;

        for link in &resource.links {
            ctx.reconciler(key.as_str())
                .link_label(link.rel.as_str())
                .target_label(link.target_label.as_str())
                .target_attribute(RESOURCE_ID_ATTRIBUTE)
                .target_filter(ACCOUNT_ATTRIBUTE, ctx.target().account.as_str())
                .target_values(link.values.iter().cloned())
                .execute()
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceScan for InventoryScan {
    async fn full_scan(&self, ctx: &ScanContext) -> Result<()> {
        let scope = ctx.scope();
        let resources = ctx
            .call("list", || {
                let listed = self.inventory.list(&self.label, &scope);
                async move { Ok(listed) }
            })
            .await?;

        for resource in &resources {
            if let Err(e) = self.sync(ctx, resource).await {
                ctx.record_failure(e)?;
            }
        }
        tracing::debug!(count = resources.len(), "Synced inventory resources");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimiter;
    use crate::retry::RetryPolicy;
    use cartograph_core::{ProviderCredentials, Target};
    use cartograph_graph::MemoryGraph;

    const INVENTORY: &str = r#"{
        "service": "ec2",
        "resources": [
            {"label": "Vpc", "account": "1", "region": "r", "id": "vpc-1", "object": {"CidrBlock": "10.0.0.0/16"}},
            {"label": "Subnet", "account": "1", "region": "r", "id": "subnet-1",
             "object": {"VpcId": "vpc-1", "Tags": [{"Key": "Name", "Value": "web"}]},
             "links": [{"rel": "IN_VPC", "target_label": "Vpc", "values": ["vpc-1", "vpc-gone"]}]},
            {"label": "Subnet", "account": "1", "region": "other", "id": "subnet-2", "object": {}}
        ]
    }"#;

    fn ctx(store: Arc<MemoryGraph>, label: &str) -> ScanContext {
        ScanContext::new(
            label,
            Target::new("1", ProviderCredentials::default(), "r"),
            store,
            RateLimiter::unlimited(label),
            RetryPolicy::default(),
            false,
        )
    }

    #[test]
    fn test_labels_and_scope_filter() {
        let inventory = Inventory::from_json(INVENTORY).unwrap();
        assert_eq!(inventory.labels(), vec!["Subnet", "Vpc"]);
        assert_eq!(inventory.list("Subnet", &Scope::new("1", "r")).len(), 1);
        assert!(Inventory::from_json("{\"resources\": 3}").is_err());
    }

    #[test]
    fn test_register_adds_one_type_per_label() {
        let inventory = Arc::new(Inventory::from_json(INVENTORY).unwrap());
        let mut registry = ScannerRegistry::new();
        inventory.register(&mut registry).unwrap();
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["Subnet", "Vpc"]);
    }

    #[tokio::test]
    async fn test_full_scan_upserts_and_links() {
        let inventory = Arc::new(Inventory::from_json(INVENTORY).unwrap());
        let store = Arc::new(MemoryGraph::new());

        let vpcs = InventoryScan { inventory: inventory.clone(), label: "Vpc".into() };
        vpcs.full_scan(&ctx(store.clone(), "Vpc")).await.unwrap();
        let subnets = InventoryScan { inventory, label: "Subnet".into() };
        subnets.full_scan(&ctx(store.clone(), "Subnet")).await.unwrap();

        let key = "ec2:r:1:subnet/subnet-1";
        let subnet = store.entity("Subnet", key).unwrap();
        assert_eq!(subnet.property_str("tag_Name"), Some("web"));
        assert_eq!(subnet.property_str(RESOURCE_ID_ATTRIBUTE), Some("subnet-1"));
        assert_eq!(store.linked_keys("Subnet", key, "IN_VPC"), vec!["ec2:r:1:vpc/vpc-1"]);
        assert_eq!(store.count("Subnet"), 1);
    }
}
