//! cartograph-core: Shared types, property mapping, configuration, and error
//! handling for the Cartograph inventory graph.
//!
//! This crate provides the foundational types used across all Cartograph components:
//! - Graph entity and relationship records with their timestamps
//! - Scan scopes and provider targets (account, credentials, region)
//! - The flat-property mapper applied to provider objects
//! - Layered configuration loading
//! - Common error types

pub mod config;
pub mod error;
pub mod properties;
pub mod types;

pub use error::CoreError;
pub use types::{
    GraphEntity, GraphRelationship, Properties, ProviderCredentials, Scope, Target,
    ACCOUNT_ATTRIBUTE, KEY_ATTRIBUTE, REGION_ATTRIBUTE,
};
