//! In-memory implementation of the graph store contract.
//!
//! Backs `--dry-run` scans and the engine's tests. Timestamps come from a
//! clock that can be pinned so collection thresholds are deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use cartograph_core::types::{now_millis, validate_identifier};
use cartograph_core::{GraphEntity, GraphRelationship, Properties, Scope, KEY_ATTRIBUTE};

use crate::client::GraphError;
use crate::store::{GraphStore, LinkRequest};

type NodeRef = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EdgeKey {
    rel_type: String,
    from: NodeRef,
    to: NodeRef,
}

#[derive(Debug, Default)]
struct State {
    entities: BTreeMap<NodeRef, GraphEntity>,
    edges: BTreeMap<EdgeKey, i64>,
    scan_control: HashMap<(String, String), i64>,
    constraints: BTreeSet<String>,
}

/// A process-local property graph.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<State>,
    pinned_time: AtomicI64,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the store clock to `ts` (epoch millis). Zero restores wall-clock time.
    pub fn set_time(&self, ts: i64) {
        self.pinned_time.store(ts, Ordering::SeqCst);
    }

    fn now(&self) -> i64 {
        match self.pinned_time.load(Ordering::SeqCst) {
            0 => now_millis(),
            pinned => pinned,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite an entity with an explicit `updateTs`.
    pub fn insert_entity(&self, label: &str, key: &str, properties: Properties, update_ts: i64) {
        let mut properties = properties;
        properties.insert(KEY_ATTRIBUTE.to_string(), Value::String(key.to_string()));
        let entity = GraphEntity {
            label: label.to_string(),
            key: key.to_string(),
            properties,
            create_ts: update_ts,
            update_ts,
        };
        self.lock()
            .entities
            .insert((label.to_string(), key.to_string()), entity);
    }

    pub fn entity(&self, label: &str, key: &str) -> Option<GraphEntity> {
        self.lock()
            .entities
            .get(&(label.to_string(), key.to_string()))
            .cloned()
    }

    /// Every entity carrying `label`, ordered by key.
    pub fn entities(&self, label: &str) -> Vec<GraphEntity> {
        self.lock()
            .entities
            .values()
            .filter(|e| e.label == label)
            .cloned()
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.lock()
            .entities
            .keys()
            .filter(|(l, _)| l == label)
            .count()
    }

    /// Keys of the entities `from` links to through `rel_type`, sorted.
    pub fn linked_keys(&self, from_label: &str, from_key: &str, rel_type: &str) -> Vec<String> {
        let from = (from_label.to_string(), from_key.to_string());
        self.lock()
            .edges
            .keys()
            .filter(|e| e.rel_type == rel_type && e.from == from)
            .map(|e| e.to.1.clone())
            .collect()
    }

    pub fn relationships(&self) -> Vec<GraphRelationship> {
        self.lock()
            .edges
            .iter()
            .map(|(e, ts)| GraphRelationship {
                rel_type: e.rel_type.clone(),
                from_label: e.from.0.clone(),
                from_key: e.from.1.clone(),
                to_label: e.to.0.clone(),
                to_key: e.to.1.clone(),
                update_ts: *ts,
            })
            .collect()
    }

    pub fn has_key_constraint(&self, label: &str) -> bool {
        self.lock().constraints.contains(label)
    }
}

/// String form of an entity attribute, as used for link matching.
fn attribute(entity: &GraphEntity, name: &str) -> Option<String> {
    if name == KEY_ATTRIBUTE {
        return Some(entity.key.clone());
    }
    match entity.properties.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn matches_filter(entity: &GraphEntity, filter: &Properties) -> bool {
    filter
        .iter()
        .all(|(name, expected)| entity.properties.get(name) == Some(expected))
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn ensure_key_constraint(&self, label: &str) -> Result<(), GraphError> {
        validate_identifier("label", label)?;
        self.lock().constraints.insert(label.to_string());
        Ok(())
    }

    async fn upsert_entity(
        &self,
        label: &str,
        key: &str,
        properties: &Properties,
    ) -> Result<GraphEntity, GraphError> {
        validate_identifier("label", label)?;
        let now = self.now();
        let mut stored = properties.clone();
        stored.insert(KEY_ATTRIBUTE.to_string(), Value::String(key.to_string()));

        let mut state = self.lock();
        let slot = (label.to_string(), key.to_string());
        let create_ts = state.entities.get(&slot).map_or(now, |e| e.create_ts);
        let entity = GraphEntity {
            label: label.to_string(),
            key: key.to_string(),
            properties: stored,
            create_ts,
            update_ts: now,
        };
        state.entities.insert(slot, entity.clone());
        Ok(entity)
    }

    async fn delete_stale(
        &self,
        label: &str,
        scope: &Scope,
        watermark: i64,
    ) -> Result<u64, GraphError> {
        validate_identifier("label", label)?;
        let mut state = self.lock();
        let stale: Vec<NodeRef> = state
            .entities
            .iter()
            .filter(|(_, e)| e.label == label && e.in_scope(scope) && e.update_ts < watermark)
            .map(|(k, _)| k.clone())
            .collect();

        for node in &stale {
            state.entities.remove(node);
        }
        state
            .edges
            .retain(|e, _| !stale.contains(&e.from) && !stale.contains(&e.to));

        Ok(stale.len() as u64)
    }

    async fn link_targets(&self, request: &LinkRequest) -> Result<u64, GraphError> {
        request.validate()?;
        let now = self.now();
        let mut state = self.lock();
        let from = (request.from_label.clone(), request.from_key.clone());
        if !state.entities.contains_key(&from) {
            return Ok(0);
        }

        let targets: Vec<NodeRef> = state
            .entities
            .iter()
            .filter(|(_, e)| e.label == request.target_label)
            .filter(|(_, e)| {
                attribute(e, &request.target_attribute)
                    .is_some_and(|v| request.target_values.contains(&v))
            })
            .filter(|(_, e)| matches_filter(e, &request.target_filter))
            .map(|(k, _)| k.clone())
            .collect();

        for to in &targets {
            let edge = EdgeKey {
                rel_type: request.link_label.clone(),
                from: from.clone(),
                to: to.clone(),
            };
            state.edges.insert(edge, now);
        }
        Ok(targets.len() as u64)
    }

    async fn unlink_others(&self, request: &LinkRequest) -> Result<u64, GraphError> {
        request.validate()?;
        let mut state = self.lock();
        let from = (request.from_label.clone(), request.from_key.clone());

        let doomed: Vec<EdgeKey> = state
            .edges
            .keys()
            .filter(|e| {
                e.rel_type == request.link_label
                    && e.from == from
                    && e.to.0 == request.target_label
            })
            .filter(|e| {
                let value = state
                    .entities
                    .get(&e.to)
                    .and_then(|t| attribute(t, &request.target_attribute));
                !value.is_some_and(|v| request.target_values.contains(&v))
            })
            .cloned()
            .collect();

        for edge in &doomed {
            state.edges.remove(edge);
        }
        Ok(doomed.len() as u64)
    }

    async fn last_scan_ts(
        &self,
        scan_type: &str,
        scope_key: &str,
    ) -> Result<Option<i64>, GraphError> {
        Ok(self
            .lock()
            .scan_control
            .get(&(scan_type.to_string(), scope_key.to_string()))
            .copied())
    }

    async fn set_last_scan_ts(
        &self,
        scan_type: &str,
        scope_key: &str,
        ts: i64,
    ) -> Result<(), GraphError> {
        self.lock()
            .scan_control
            .insert((scan_type.to_string(), scope_key.to_string()), ts);
        Ok(())
    }
}
