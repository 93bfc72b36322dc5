//! Read operations for the inventory graph.

use neo4rs::query;

use cartograph_core::types::{validate_identifier, CREATE_TS_ATTRIBUTE, UPDATE_TS_ATTRIBUTE};
use cartograph_core::{GraphEntity, Properties, Scope, ACCOUNT_ATTRIBUTE, KEY_ATTRIBUTE, REGION_ATTRIBUTE};

use crate::client::{GraphClient, GraphError};

impl GraphClient {
    /// Get an entity by label and business key.
    pub async fn get_entity(&self, label: &str, key: &str) -> Result<GraphEntity, GraphError> {
        validate_identifier("label", label)?;
        let cypher = format!(
            "MATCH (n:{label} {{{KEY_ATTRIBUTE}: $key}})
             RETURN apoc.convert.toJson(properties(n)) AS props"
        );

        let q = query(&cypher).param("key", key.to_string());

        match self.query_one(q).await? {
            Some(row) => {
                let json: String = row.get("props").map_err(|e| {
                    GraphError::Serialization(format!("Failed to read properties: {e}"))
                })?;
                entity_from_json(label, key, &json)
            }
            None => Err(GraphError::NotFound {
                label: label.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Count entities of a label, optionally restricted to one scope.
    pub async fn count_entities(
        &self,
        label: &str,
        scope: Option<&Scope>,
    ) -> Result<u64, GraphError> {
        validate_identifier("label", label)?;
        let q = match scope {
            Some(scope) => query(&format!(
                "MATCH (n:{label} {{{ACCOUNT_ATTRIBUTE}: $account, {REGION_ATTRIBUTE}: $region}})
                 RETURN count(n) AS cnt"
            ))
            .param("account", scope.account.clone())
            .param("region", scope.region.clone()),
            None => query(&format!("MATCH (n:{label}) RETURN count(n) AS cnt")),
        };

        self.query_count(q).await
    }

    /// Count edges of one relationship type.
    pub async fn count_relationships(&self, rel_type: &str) -> Result<u64, GraphError> {
        validate_identifier("relationship type", rel_type)?;
        let q = query(&format!("MATCH ()-[r:{rel_type}]->() RETURN count(r) AS cnt"));
        self.query_count(q).await
    }

    /// Keys of the targets an entity links to through `link_label`.
    pub async fn linked_keys(
        &self,
        from_label: &str,
        from_key: &str,
        link_label: &str,
    ) -> Result<Vec<String>, GraphError> {
        validate_identifier("label", from_label)?;
        validate_identifier("relationship type", link_label)?;
        let cypher = format!(
            "MATCH (a:{from_label} {{{KEY_ATTRIBUTE}: $key}})-[:{link_label}]->(b)
             RETURN b.{KEY_ATTRIBUTE} AS key ORDER BY key"
        );
        let q = query(&cypher).param("key", from_key.to_string());

        let rows = self.query_rows(q).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<String>("key").ok())
            .collect())
    }
}

fn entity_from_json(label: &str, key: &str, json: &str) -> Result<GraphEntity, GraphError> {
    let mut properties: Properties =
        serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))?;
    let create_ts = take_ts(&mut properties, CREATE_TS_ATTRIBUTE);
    let update_ts = take_ts(&mut properties, UPDATE_TS_ATTRIBUTE);

    Ok(GraphEntity {
        label: label.to_string(),
        key: key.to_string(),
        properties,
        create_ts,
        update_ts,
    })
}

fn take_ts(properties: &mut Properties, name: &str) -> i64 {
    properties
        .remove(name)
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}
