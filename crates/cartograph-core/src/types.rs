//! Core domain types for the Cartograph inventory graph.
//!
//! Entities are nodes keyed by a stable business key within their label;
//! relationships are typed, directed edges between two entities. Both carry
//! epoch-millisecond timestamps that drive stale-entity collection.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Property holding the business key of every entity.
pub const KEY_ATTRIBUTE: &str = "key";
/// Property holding the provider account an entity was scanned from.
pub const ACCOUNT_ATTRIBUTE: &str = "account";
/// Property holding the provider region an entity was scanned from.
pub const REGION_ATTRIBUTE: &str = "region";
/// Set once, when an entity is first created.
pub const CREATE_TS_ATTRIBUTE: &str = "createTs";
/// Refreshed on every successful upsert.
pub const UPDATE_TS_ATTRIBUTE: &str = "updateTs";

/// Flat scalar property map stored on an entity.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Scope ─────────────────────────────────────────────────────────

/// The (account, region) pair a scan pass and its garbage collection cover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub account: String,
    pub region: String,
}

impl Scope {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

// ── Targets ───────────────────────────────────────────────────────

/// Credentials handle passed to resource-type constructors.
///
/// Resolution happens outside the engine; the handle only names what to use.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub profile: Option<String>,
    pub role_arn: Option<String>,
}

/// One (account, credentials, region) combination to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub account: String,
    pub credentials: ProviderCredentials,
    pub region: String,
}

impl Target {
    pub fn new(
        account: impl Into<String>,
        credentials: ProviderCredentials,
        region: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            credentials,
            region: region.into(),
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.account.clone(), self.region.clone())
    }
}

// ── Graph Records ─────────────────────────────────────────────────

/// A node as stored in the graph after an upsert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEntity {
    pub label: String,
    pub key: String,
    pub properties: Properties,
    pub create_ts: i64,
    pub update_ts: i64,
}

impl GraphEntity {
    /// Look up a string property.
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    pub fn in_scope(&self, scope: &Scope) -> bool {
        self.property_str(ACCOUNT_ATTRIBUTE) == Some(scope.account.as_str())
            && self.property_str(REGION_ATTRIBUTE) == Some(scope.region.as_str())
    }
}

/// A directed edge `(from)-[rel_type]->(to)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GraphRelationship {
    pub rel_type: String,
    pub from_label: String,
    pub from_key: String,
    pub to_label: String,
    pub to_key: String,
    pub update_ts: i64,
}

// ── Identifiers ───────────────────────────────────────────────────

/// Check that a label, relationship type, or attribute name is safe to
/// interpolate into a Cypher statement.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), CoreError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}
