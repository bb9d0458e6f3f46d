//! Interfaces of the external systems the pipeline drives
//!
//! Implementations: `dexscreener.rs` (feed), `helius.rs` (enrichment),
//! `analysis.rs` (full analysis). Tests substitute in-memory mocks.

use crate::pipeline::error::{AnalysisError, EnrichError, FeedError};
use crate::pipeline::ledger::{total_charged, CreditCharge};
use crate::pipeline::types::{Candidate, CandidateFilter, MetricSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A listed address the feed could not turn into a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub address: String,
    pub message: String,
}

/// One fetched feed page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    pub candidates: Vec<Candidate>,
    /// Per-address failures on an otherwise usable page
    pub failures: Vec<LookupFailure>,
}

impl From<Vec<Candidate>> for FeedPage {
    fn from(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            failures: Vec::new(),
        }
    }
}

/// Free, high-volume candidate feed
///
/// A run walks pages `0..page_count()`. One failing page does not fail the
/// run; all pages failing does.
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    fn page_count(&self) -> usize;

    /// Candidates on one page. `filter` is a hint: the discoverer re-checks
    /// every candidate. A page whose every lookup failed is an `Err`.
    async fn fetch_page(&self, page: usize, filter: &CandidateFilter) -> Result<FeedPage, FeedError>;
}

/// Result of one successful paid enrichment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub snapshot: MetricSnapshot,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    /// One charge per metered call made
    pub charges: Vec<CreditCharge>,
}

impl Enrichment {
    pub fn credits_charged(&self) -> u64 {
        total_charged(&self.charges)
    }
}

/// Paid, metered enrichment API
#[async_trait]
pub trait EnrichmentApi: Send + Sync {
    /// Upper bound on what one `enrich` call may charge; used for the
    /// before-call budget check.
    fn estimated_cost(&self) -> u64;

    async fn enrich(&self, address: &str) -> Result<Enrichment, EnrichError>;
}

/// Outcome of a successful promotion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analyzed {
    /// Credits the workflow reports having spent
    pub credits_used: u64,
    pub reference: Option<String>,
}

/// Full token-analysis workflow, invoked synchronously per entry
#[async_trait]
pub trait AnalysisWorkflow: Send + Sync {
    async fn promote(&self, address: &str) -> Result<Analyzed, AnalysisError>;
}
