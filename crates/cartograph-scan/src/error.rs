//! Error types for the cartograph-scan crate.

use thiserror::Error;

/// A failed call against a provider API.
///
/// `code` is the provider's error code (for example `Throttling` or
/// `RequestLimitExceeded`) and drives retry classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}{}: {message}", status_suffix(.status))]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Graph error: {0}")]
    Graph(#[from] cartograph_graph::GraphError),

    #[error("Conversion failed for {label}: {message}")]
    Conversion { label: String, message: String },

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("{message}: {count} failed", count = .causes.len())]
    Aggregate {
        message: String,
        causes: Vec<ScanError>,
    },

    #[error("Scan task failed: {0}")]
    Join(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Config error: {0}")]
    Config(#[from] cartograph_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Missing configuration and similar programming errors. Never swallowed.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// A precondition here or anywhere among the aggregated causes.
    pub fn is_fatal(&self) -> bool {
        self.is_precondition() || self.causes().iter().any(Self::is_fatal)
    }

    /// Child failures carried by an aggregate; empty for any other error.
    pub fn causes(&self) -> &[ScanError] {
        match self {
            Self::Aggregate { causes, .. } => causes,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display_counts_causes() {
        let err = ScanError::Aggregate {
            message: "scanning problems".into(),
            causes: vec![
                ScanError::precondition("label not set"),
                ProviderError::new("AccessDenied", "nope").into(),
            ],
        };
        assert_eq!(err.to_string(), "scanning problems: 2 failed");
        assert_eq!(err.causes().len(), 2);
        assert!(err.causes()[0].is_precondition());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new("Throttling", "Rate exceeded").with_status(400);
        assert_eq!(err.to_string(), "Throttling (400): Rate exceeded");
        assert_eq!(
            ProviderError::new("AccessDenied", "nope").to_string(),
            "AccessDenied: nope"
        );
    }

    #[test]
    fn test_nested_precondition_is_fatal() {
        let nested = ScanError::Aggregate {
            message: "targets scanning problems".into(),
            causes: vec![ScanError::Aggregate {
                message: "1234/us-east-1 scanning problems".into(),
                causes: vec![ScanError::precondition("Role is global-only")],
            }],
        };
        assert!(nested.is_fatal());

        let provider = ScanError::Aggregate {
            message: "targets scanning problems".into(),
            causes: vec![ProviderError::new("AccessDenied", "nope").into()],
        };
        assert!(!provider.is_fatal());
    }
}
