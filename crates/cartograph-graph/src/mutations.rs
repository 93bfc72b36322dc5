//! Write operations for the inventory graph.
//!
//! All entity writes use MERGE on the business key so repeated discovery is
//! idempotent. Timestamps come from the server's `timestamp()` so every
//! scanner process shares one clock.

use async_trait::async_trait;
use neo4rs::{query, Query};
use serde_json::Value;

use cartograph_core::types::validate_identifier;
use cartograph_core::{
    GraphEntity, Properties, Scope, ACCOUNT_ATTRIBUTE, KEY_ATTRIBUTE, REGION_ATTRIBUTE,
};

use crate::client::{GraphClient, GraphError};
use crate::store::{GraphStore, LinkRequest, SCAN_CONTROL_LABEL};

#[async_trait]
impl GraphStore for GraphClient {
    async fn ensure_key_constraint(&self, label: &str) -> Result<(), GraphError> {
        validate_identifier("label", label)?;
        let cypher = format!(
            "CREATE CONSTRAINT {label}_{KEY_ATTRIBUTE}_unique IF NOT EXISTS
             FOR (n:{label}) REQUIRE n.{KEY_ATTRIBUTE} IS UNIQUE"
        );
        self.run(query(&cypher)).await?;
        tracing::debug!(label, "Ensured business key constraint");
        Ok(())
    }

    async fn upsert_entity(
        &self,
        label: &str,
        key: &str,
        properties: &Properties,
    ) -> Result<GraphEntity, GraphError> {
        validate_identifier("label", label)?;
        let props_json = serde_json::to_string(properties)
            .map_err(|e| GraphError::Serialization(e.to_string()))?;

        let cypher = format!(
            "MERGE (n:{label} {{{KEY_ATTRIBUTE}: $key}})
             ON CREATE SET n.createTs = timestamp()
             WITH n, n.createTs AS created
             SET n = apoc.convert.fromJsonMap($props)
             SET n.{KEY_ATTRIBUTE} = $key, n.createTs = created, n.updateTs = timestamp()
             RETURN n.createTs AS create_ts, n.updateTs AS update_ts"
        );

        let q = query(&cypher)
            .param("key", key.to_string())
            .param("props", props_json);

        let row = self.query_one(q).await?.ok_or_else(|| GraphError::NotFound {
            label: label.to_string(),
            key: key.to_string(),
        })?;

        let create_ts = row
            .get::<i64>("create_ts")
            .map_err(|e| GraphError::Serialization(format!("createTs: {e}")))?;
        let update_ts = row
            .get::<i64>("update_ts")
            .map_err(|e| GraphError::Serialization(format!("updateTs: {e}")))?;

        let mut stored = properties.clone();
        stored.insert(KEY_ATTRIBUTE.to_string(), Value::String(key.to_string()));

        Ok(GraphEntity {
            label: label.to_string(),
            key: key.to_string(),
            properties: stored,
            create_ts,
            update_ts,
        })
    }

    async fn delete_stale(
        &self,
        label: &str,
        scope: &Scope,
        watermark: i64,
    ) -> Result<u64, GraphError> {
        validate_identifier("label", label)?;
        let cypher = format!(
            "MATCH (x:{label} {{{ACCOUNT_ATTRIBUTE}: $account, {REGION_ATTRIBUTE}: $region}})
             WHERE x.updateTs < $ts
             DETACH DELETE x
             RETURN count(*) AS cnt"
        );

        let q = query(&cypher)
            .param("account", scope.account.clone())
            .param("region", scope.region.clone())
            .param("ts", watermark);

        self.query_count(q).await
    }

    async fn link_targets(&self, request: &LinkRequest) -> Result<u64, GraphError> {
        request.validate()?;
        let LinkRequest {
            from_label,
            link_label,
            target_label,
            target_attribute,
            ..
        } = request;

        let mut filter = String::new();
        for name in request.target_filter.keys() {
            filter.push_str(&format!(" AND b.{name} = $filter_{name}"));
        }

        let cypher = format!(
            "MATCH (a:{from_label} {{{KEY_ATTRIBUTE}: $from_key}}), (b:{target_label})
             WHERE b.{target_attribute} IN $values{filter}
             MERGE (a)-[r:{link_label}]->(b)
             SET r.updateTs = timestamp()
             RETURN count(r) AS cnt"
        );

        let mut q = query(&cypher)
            .param("from_key", request.from_key.clone())
            .param("values", request.target_values.clone());
        for (name, value) in &request.target_filter {
            q = bind_json(q, &format!("filter_{name}"), value);
        }

        self.query_count(q).await
    }

    async fn unlink_others(&self, request: &LinkRequest) -> Result<u64, GraphError> {
        request.validate()?;
        let LinkRequest {
            from_label,
            link_label,
            target_label,
            target_attribute,
            ..
        } = request;

        let cypher = format!(
            "MATCH (a:{from_label} {{{KEY_ATTRIBUTE}: $from_key}})-[r:{link_label}]->(b:{target_label})
             WHERE b.{target_attribute} IS NULL OR NOT b.{target_attribute} IN $values
             DELETE r
             RETURN count(*) AS cnt"
        );

        let q = query(&cypher)
            .param("from_key", request.from_key.clone())
            .param("values", request.target_values.clone());

        self.query_count(q).await
    }

    async fn last_scan_ts(
        &self,
        scan_type: &str,
        scope_key: &str,
    ) -> Result<Option<i64>, GraphError> {
        let cypher = format!(
            "MATCH (m:{SCAN_CONTROL_LABEL} {{type: $type, scope: $scope}})
             RETURN m.lastScanTs AS ts LIMIT 1"
        );
        let q = query(&cypher)
            .param("type", scan_type.to_string())
            .param("scope", scope_key.to_string());

        match self.query_one(q).await? {
            Some(row) => Ok(row.get::<i64>("ts").ok()),
            None => Ok(None),
        }
    }

    async fn set_last_scan_ts(
        &self,
        scan_type: &str,
        scope_key: &str,
        ts: i64,
    ) -> Result<(), GraphError> {
        let cypher = format!(
            "MERGE (m:{SCAN_CONTROL_LABEL} {{type: $type, scope: $scope}})
             SET m.lastScanTs = $ts"
        );
        let q = query(&cypher)
            .param("type", scan_type.to_string())
            .param("scope", scope_key.to_string())
            .param("ts", ts);

        self.run(q).await
    }
}

/// Bind a JSON scalar as a typed query parameter.
fn bind_json(q: Query, name: &str, value: &Value) -> Query {
    match value {
        Value::Bool(b) => q.param(name, *b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => q.param(name, i),
            None => q.param(name, n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => q.param(name, s.clone()),
        other => q.param(name, other.to_string()),
    }
}
