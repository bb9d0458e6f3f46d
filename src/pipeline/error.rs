//! Error taxonomy for the pipeline
//!
//! Run-level failures are [`PipelineError`]. Per-entry failures never abort a
//! batch: they are collected as [`EntryError`]s into the run summary.

use crate::pipeline::ledger::{total_charged, CreditCharge, CreditOperation};
use crate::pipeline::types::RunKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on per-entry errors kept in a summary; the total is still counted.
pub const MAX_REPORTED_ERRORS: usize = 50;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Every page of the discovery feed failed
    #[error("Discovery feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("Coordinator busy: {requested} run requested while {held} run is active")]
    CoordinatorBusy { requested: RunKind, held: RunKind },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_busy(&self) -> bool {
        matches!(self, PipelineError::CoordinatorBusy { .. })
    }
}

/// Per-entry failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    FeedPageFailed,
    /// A listed address whose metrics lookup failed
    CandidateLookupFailed,
    EnrichmentCallFailed,
    RetryCapReached,
    IneligibleTierForPromotion,
    AnalysisWorkflowFailed,
    RefreshFailed,
    /// Re-ingest requested for an entry that is not discarded
    IneligibleTier,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryError {
    pub address: Option<String>,
    pub kind: EntryErrorKind,
    pub message: String,
}

impl EntryError {
    pub fn new(address: impl Into<String>, kind: EntryErrorKind, message: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            kind,
            message: message.into(),
        }
    }

    /// Error not tied to a single address (e.g. a failed feed page)
    pub fn run_level(kind: EntryErrorKind, message: impl Into<String>) -> Self {
        Self {
            address: None,
            kind,
            message: message.into(),
        }
    }
}

/// Bounded list of per-entry errors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorList {
    pub total: usize,
    pub items: Vec<EntryError>,
}

impl ErrorList {
    pub fn push(&mut self, error: EntryError) {
        self.total += 1;
        if self.items.len() < MAX_REPORTED_ERRORS {
            self.items.push(error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn count(&self, kind: EntryErrorKind) -> usize {
        self.items.iter().filter(|e| e.kind == kind).count()
    }
}

/// Discovery feed failure for one page
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FeedError::Parse(err.to_string())
        } else {
            FeedError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichErrorKind {
    Network,
    Api,
    /// The API has no data for the address
    NotFound,
}

/// Enrichment call failure
///
/// `charges` lists the metered calls that were billed before the failure;
/// the caller records them in the ledger.
#[derive(Error, Debug, Clone)]
#[error("{kind:?} error: {message}")]
pub struct EnrichError {
    pub kind: EnrichErrorKind,
    pub message: String,
    pub charges: Vec<CreditCharge>,
}

impl EnrichError {
    pub fn new(kind: EnrichErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            charges: Vec::new(),
        }
    }

    pub fn with_charge(mut self, operation: CreditOperation, credits: u64) -> Self {
        self.charges.push(CreditCharge::new(operation, credits));
        self
    }

    pub fn credits_charged(&self) -> u64 {
        total_charged(&self.charges)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Analysis workflow failed: {0}")]
pub struct AnalysisError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_list_is_bounded() {
        let mut errors = ErrorList::default();
        for i in 0..(MAX_REPORTED_ERRORS + 10) {
            errors.push(EntryError::new(
                format!("mint_{}", i),
                EntryErrorKind::EnrichmentCallFailed,
                "timeout",
            ));
        }

        assert_eq!(errors.total, MAX_REPORTED_ERRORS + 10);
        assert_eq!(errors.items.len(), MAX_REPORTED_ERRORS);
        assert_eq!(errors.count(EntryErrorKind::EnrichmentCallFailed), MAX_REPORTED_ERRORS);
    }

    #[test]
    fn test_busy_error_names_both_kinds() {
        let err = PipelineError::CoordinatorBusy {
            requested: RunKind::Tier1,
            held: RunKind::Tier0,
        };
        assert!(err.is_busy());
        assert_eq!(
            err.to_string(),
            "Coordinator busy: tier1 run requested while tier0 run is active"
        );
    }
}
