//! # Token Lifecycle Pipeline
//!
//! Moves a discovered token address through
//! `ingested → enriched → analyzed` (or `discarded`), while bounding paid-API
//! spend per run and serializing every writer through one coordinator.
//!
//! ## Architecture
//!
//! ```text
//! DiscoveryFeed ──► Tier0Discoverer ──► queue_entries (ingested)
//!                                            │
//! EnrichmentApi ──► Tier1Enricher ───────────┤──► credit_ledger
//!                                            ▼
//!                                    queue_entries (enriched)
//!                                            │
//! AnalysisWorkflow ◄── PromotionEvaluator ◄──┘
//!                                            ▼
//! EnrichmentApi ──► HotRefresher ──► queue_entries (analyzed, refreshed in place)
//! ```
//!
//! Every run holds a [`coordinator::Lease`]. Only one lease exists at a time;
//! a trigger arriving while one is held gets `CoordinatorBusy` and mutates
//! nothing.
//!
//! ## Schema Reference
//!
//! Tables are created from `sql/*.sql` by [`db::run_schema_migrations`]:
//! - `queue_entries` → [`types::QueueEntry`]
//! - `queue_entry_history` → archived discarded lineages
//! - `pipeline_settings` → [`settings::Settings`]
//! - `credit_ledger` → [`ledger::LedgerEntry`]
//! - `pipeline_runs` → [`coordinator::RunRecord`]
//!
//! ## Module Organization
//!
//! - `types` - Tiers, snapshots, queue entries, run summaries
//! - `error` - Error taxonomy
//! - `db`, `queue`, `settings`, `ledger` - Persisted state
//! - `coordinator` - Mutual exclusion and run history
//! - `collaborators` - External system traits
//! - `dexscreener`, `helius`, `analysis`, `backoff` - HTTP collaborators
//! - `discovery`, `enrichment`, `scoring`, `promotion`, `refresh` - Stages
//! - `service` - Operations exposed to callers
//! - `scheduler` - Recurring triggers

pub mod types;
pub mod error;
pub mod config;
pub mod db;
pub mod queue;
pub mod settings;
pub mod ledger;
pub mod coordinator;
pub mod collaborators;
pub mod backoff;
pub mod dexscreener;
pub mod helius;
pub mod analysis;
pub mod discovery;
pub mod enrichment;
pub mod scoring;
pub mod promotion;
pub mod refresh;
pub mod service;
pub mod scheduler;

// Re-export commonly used types
pub use types::{
    Candidate, CandidateFilter, MetricSnapshot, QueueEntry, RunKind, RunSummary, Status, Tier,
};
pub use error::{EntryError, EntryErrorKind, PipelineError};
pub use config::PipelineConfig;
pub use db::Database;
pub use coordinator::{Lease, RunCoordinator};
pub use collaborators::{AnalysisWorkflow, DiscoveryFeed, EnrichmentApi};
pub use service::{Collaborators, PipelineService};
