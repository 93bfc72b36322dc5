//! Cartograph Graph: the property graph behind the inventory.
//!
//! This crate is the single mutation point for the graph. All writes flow
//! through the [`GraphStore`] contract, implemented for Neo4j by
//! [`GraphClient`] and in process by [`MemoryGraph`].

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;
pub mod store;

pub use client::{GraphClient, GraphConfig, GraphError};
pub use memory::MemoryGraph;
pub use store::{GraphStore, LinkRequest, SCAN_CONTROL_LABEL};
