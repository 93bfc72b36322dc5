//! cartograph-scan: scan orchestration and graph consistency engine.
//!
//! Fans resource-type scanners out across provider accounts and regions,
//! paces and retries their provider calls, and keeps the inventory graph
//! consistent: stale entities are collected only after clean passes and
//! relationship sets converge idempotently.

pub mod config;
pub mod control;
pub mod error;
pub mod gc;
pub mod inventory;
pub mod orchestrator;
pub mod pool;
pub mod rate_limit;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod tree;
pub mod unit;

pub use error::{ProviderError, Result, ScanError};
pub use orchestrator::MultiTargetOrchestrator;
pub use registry::{ScannerRegistry, ScannerSpec};
pub use unit::{ResourceScan, ScanContext};
