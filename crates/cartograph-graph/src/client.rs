//! Bolt connection to the inventory graph.

use std::time::Instant;

use neo4rs::{Config, ConfigBuilder, Graph, Query, Row};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Cannot reach graph at {uri}: {message}")]
    Connect { uri: String, message: String },

    #[error("Graph query failed: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("No {label} entity with key {key}")]
    NotFound { label: String, key: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] cartograph_core::CoreError),

    #[error("Malformed graph properties: {0}")]
    Serialization(String),
}

/// `[neo4j]` section, overridable through `CARTOGRAPH_NEO4J__*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Pool size shared by every concurrent scan unit.
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "cartograph-dev".to_string(),
            max_connections: 16,
            fetch_size: 256,
        }
    }
}

impl GraphConfig {
    fn connect_error(&self, e: impl std::fmt::Display) -> GraphError {
        GraphError::Connect {
            uri: self.uri.clone(),
            message: e.to_string(),
        }
    }

    fn bolt(&self) -> Result<Config, GraphError> {
        ConfigBuilder::default()
            .uri(&self.uri)
            .user(&self.user)
            .password(&self.password)
            .max_connections(self.max_connections.max(1) as usize)
            .fetch_size(self.fetch_size)
            .build()
            .map_err(|e| self.connect_error(e))
    }
}

/// Pooled Neo4j client. Each mutation it issues is a single atomic
/// statement, so concurrent units can share one clone each.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let graph = Graph::connect(config.bolt()?)
            .await
            .map_err(|e| config.connect_error(e))?;

        tracing::info!(uri = %config.uri, pool = config.max_connections, "Connected to inventory graph");
        Ok(Self { graph })
    }

    /// Run a statement whose result rows are not needed.
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        let start = Instant::now();
        self.graph.run(query).await?;
        tracing::trace!(elapsed_ms = start.elapsed().as_millis() as u64, "Graph statement run");
        Ok(())
    }

    /// Drain the row stream of a query.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// First row only; the rest of the stream is dropped.
    pub async fn query_one(&self, query: Query) -> Result<Option<Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }

    /// Single `cnt` column, clamped at zero.
    pub(crate) async fn query_count(&self, query: Query) -> Result<u64, GraphError> {
        let Some(row) = self.query_one(query).await? else {
            return Ok(0);
        };
        Ok(row.get::<i64>("cnt").unwrap_or(0).max(0) as u64)
    }
}
