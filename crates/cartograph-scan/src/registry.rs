//! Scanner registry.
//!
//! Maps a type tag to either a resource-type record (label, capabilities and
//! a constructor closure) or a composite of other tags. Resolved when a scan
//! tree is built; nothing is constructed at registration time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cartograph_core::types::validate_identifier;
use cartograph_core::Target;

use crate::error::{Result, ScanError};
use crate::unit::ResourceScan;

/// Builds a resource type for one target.
pub type ScanFactory = Arc<dyn Fn(&Target) -> Result<Box<dyn ResourceScan>> + Send + Sync>;

/// A resource type and its capabilities.
#[derive(Clone)]
pub struct ScannerSpec {
    pub label: String,
    /// Calls/second when nothing overrides it.
    pub default_rate_limit: Option<f64>,
    /// Minimum interval between inclusions; `None` means every cycle.
    pub slow_scan: Option<Duration>,
    /// Scanned only in the global region of each account.
    pub global_only: bool,
    factory: ScanFactory,
}

impl ScannerSpec {
    pub fn new<F>(label: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Target) -> Result<Box<dyn ResourceScan>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            default_rate_limit: None,
            slow_scan: None,
            global_only: false,
            factory: Arc::new(factory),
        }
    }

    pub fn with_default_rate_limit(mut self, per_second: f64) -> Self {
        self.default_rate_limit = Some(per_second);
        self
    }

    pub fn with_slow_scan(mut self, min_interval: Duration) -> Self {
        self.slow_scan = Some(min_interval);
        self
    }

    pub fn global_only(mut self) -> Self {
        self.global_only = true;
        self
    }

    pub fn construct(&self, target: &Target) -> Result<Box<dyn ResourceScan>> {
        (self.factory)(target)
    }
}

impl fmt::Debug for ScannerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerSpec")
            .field("label", &self.label)
            .field("default_rate_limit", &self.default_rate_limit)
            .field("slow_scan", &self.slow_scan)
            .field("global_only", &self.global_only)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Registration {
    Unit(ScannerSpec),
    /// Children scanned one after another.
    Group(Vec<String>),
    /// Children scanned concurrently on the pool.
    Parallel(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct ScannerRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, tag: String, registration: Registration) -> Result<()> {
        validate_identifier("scanner type", &tag)
            .map_err(|e| ScanError::precondition(e.to_string()))?;
        if self.entries.contains_key(&tag) {
            return Err(ScanError::precondition(format!(
                "scanner type {tag} registered twice"
            )));
        }
        self.entries.insert(tag, registration);
        Ok(())
    }

    pub fn register(&mut self, spec: ScannerSpec) -> Result<()> {
        self.insert(spec.label.clone(), Registration::Unit(spec))
    }

    pub fn register_group<I, S>(&mut self, tag: impl Into<String>, children: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let children = children.into_iter().map(Into::into).collect();
        self.insert(tag.into(), Registration::Group(children))
    }

    pub fn register_parallel<I, S>(&mut self, tag: impl Into<String>, children: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let children = children.into_iter().map(Into::into).collect();
        self.insert(tag.into(), Registration::Parallel(children))
    }

    pub fn get(&self, tag: &str) -> Option<&Registration> {
        self.entries.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Tags no composite refers to.
    pub fn roots(&self) -> Vec<String> {
        let children: Vec<&String> = self
            .entries
            .values()
            .flat_map(|r| match r {
                Registration::Group(c) | Registration::Parallel(c) => c.iter().collect(),
                Registration::Unit(_) => Vec::new(),
            })
            .collect();
        self.entries
            .keys()
            .filter(|tag| !children.contains(tag))
            .cloned()
            .collect()
    }

    /// Every composite child must resolve and no composite may contain
    /// itself.
    pub fn validate(&self) -> Result<()> {
        for tag in self.entries.keys() {
            self.check_acyclic(tag, &mut Vec::new())?;
        }
        Ok(())
    }

    fn check_acyclic<'a>(&'a self, tag: &'a str, path: &mut Vec<&'a str>) -> Result<()> {
        if path.contains(&tag) {
            return Err(ScanError::precondition(format!(
                "scanner type {tag} contains itself"
            )));
        }
        let registration = self
            .entries
            .get(tag)
            .ok_or_else(|| ScanError::precondition(format!("unknown scanner type {tag}")))?;
        if let Registration::Group(children) | Registration::Parallel(children) = registration {
            path.push(tag);
            for child in children {
                self.check_acyclic(child, path)?;
            }
            path.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::ScanContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ResourceScan for Noop {
        async fn full_scan(&self, _ctx: &ScanContext) -> Result<()> {
            Ok(())
        }
    }

    fn spec(label: &str) -> ScannerSpec {
        ScannerSpec::new(label, |_| Ok(Box::new(Noop) as Box<dyn ResourceScan>))
    }

    #[test]
    fn test_roots_and_validation() {
        let mut registry = ScannerRegistry::new();
        registry.register(spec("Vpc")).unwrap();
        registry.register(spec("Subnet")).unwrap();
        registry.register(spec("Volume").with_slow_scan(Duration::from_secs(300))).unwrap();
        registry.register_parallel("Network", ["Vpc", "Subnet"]).unwrap();

        registry.validate().unwrap();
        assert_eq!(registry.roots(), vec!["Network", "Volume"]);
    }

    #[test]
    fn test_duplicate_and_unknown_are_preconditions() {
        let mut registry = ScannerRegistry::new();
        registry.register(spec("Vpc")).unwrap();
        assert!(registry.register(spec("Vpc")).unwrap_err().is_precondition());
        assert!(registry.register(spec("bad tag")).unwrap_err().is_precondition());

        registry.register_group("Broken", ["Vpc", "Missing"]).unwrap();
        assert!(registry.validate().unwrap_err().is_precondition());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut registry = ScannerRegistry::new();
        registry.register_group("A", ["B"]).unwrap();
        registry.register_parallel("B", ["A"]).unwrap();
        assert!(registry.validate().unwrap_err().is_precondition());
    }

    #[test]
    fn test_construct_uses_target() {
        let spec = ScannerSpec::new("Vpc", |target: &Target| {
            if target.region.is_empty() {
                return Err(ScanError::precondition("region not set"));
            }
            Ok(Box::new(Noop) as Box<dyn ResourceScan>)
        })
        .global_only();

        let target = Target::new("1", Default::default(), "");
        assert!(spec.global_only);
        assert!(spec.construct(&target).is_err());
    }
}
