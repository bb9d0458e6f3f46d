//! `PipelineService`: the operations exposed to the CLI, runtime and tests
//!
//! Every mutating operation acquires a lease first and releases it with the
//! run summary (or the run-level error). Reads never take a lease.

use crate::pipeline::collaborators::{AnalysisWorkflow, DiscoveryFeed, EnrichmentApi};
use crate::pipeline::coordinator::{ActiveRun, Lease, RunCoordinator, RunRecord};
use crate::pipeline::db::Database;
use crate::pipeline::discovery::Tier0Discoverer;
use crate::pipeline::enrichment::{Tier1Enricher, Tier1Limits};
use crate::pipeline::error::{EntryError, EntryErrorKind, PipelineError};
use crate::pipeline::ledger::{CreditLedger, CreditUsage, LedgerEntry, Reconciliation};
use crate::pipeline::promotion::PromotionEvaluator;
use crate::pipeline::queue::{
    ArchivedEntry, DiscardOutcome, QueuePage, QueueQuery, QueueStore, ReingestOutcome,
};
use crate::pipeline::refresh::HotRefresher;
use crate::pipeline::settings::{Settings, SettingsStore, SettingsUpdate};
use crate::pipeline::types::{
    system_clock, Clock, MaintenanceAction, MaintenanceSummary, PromotionSummary, QueueEntry,
    RefreshSummary, RunKind, RunSummary, Tier0Summary, Tier1Summary,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DISCARD_REASON: &str = "manual";

/// External systems the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn DiscoveryFeed>,
    pub enrichment: Arc<dyn EnrichmentApi>,
    pub analysis: Arc<dyn AnalysisWorkflow>,
}

/// Per-trigger overrides of the Tier-0 settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tier0Params {
    pub max_tokens: Option<usize>,
    pub mc_min: Option<f64>,
    pub volume_min: Option<f64>,
    pub liquidity_min: Option<f64>,
    pub age_max_hours: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tier1Params {
    pub batch_size: Option<usize>,
    pub credit_budget: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotRefreshParams {
    pub max_tokens: Option<usize>,
    pub age_hours: Option<f64>,
}

/// Aggregate queue statistics plus last-run bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub by_tier: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub last_tier0_run_at: Option<i64>,
    pub last_tier1_run_at: Option<i64>,
    pub last_tier1_credits_used: u64,
    pub last_hot_refresh_at: Option<i64>,
    pub last_score_run_at: Option<i64>,
    pub credits_today: u64,
    pub active_run: Option<ActiveRun>,
}

pub struct PipelineService {
    queue: QueueStore,
    settings: SettingsStore,
    ledger: CreditLedger,
    coordinator: RunCoordinator,
    discoverer: Tier0Discoverer,
    enricher: Tier1Enricher,
    promoter: PromotionEvaluator,
    refresher: HotRefresher,
    clock: Clock,
}

impl PipelineService {
    pub fn new(db: Database, collaborators: Collaborators, soft_deadline: Duration) -> Self {
        Self::new_with_clock(db, collaborators, soft_deadline, system_clock())
    }

    pub fn new_with_clock(
        db: Database,
        collaborators: Collaborators,
        soft_deadline: Duration,
        clock: Clock,
    ) -> Self {
        let queue = QueueStore::new(db.clone());
        let ledger = CreditLedger::new(db.clone(), clock.clone());

        Self {
            settings: SettingsStore::new(db.clone(), clock.clone()),
            coordinator: RunCoordinator::new(db, clock.clone(), soft_deadline),
            discoverer: Tier0Discoverer::new(queue.clone(), collaborators.feed, clock.clone()),
            enricher: Tier1Enricher::new(
                queue.clone(),
                ledger.clone(),
                collaborators.enrichment.clone(),
                clock.clone(),
            ),
            promoter: PromotionEvaluator::new(
                queue.clone(),
                ledger.clone(),
                collaborators.analysis,
                clock.clone(),
            ),
            refresher: HotRefresher::new(
                queue.clone(),
                ledger.clone(),
                collaborators.enrichment,
                clock.clone(),
            ),
            queue,
            ledger,
            clock,
        }
    }

    // ---- Settings ----

    pub fn settings(&self) -> Result<Settings, PipelineError> {
        self.settings.load()
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings, PipelineError> {
        self.settings.update(update)
    }

    // ---- Reads ----

    pub fn list_queue(&self, query: &QueueQuery) -> Result<QueuePage, PipelineError> {
        self.queue.list(query)
    }

    pub fn get_entry(&self, address: &str) -> Result<Option<QueueEntry>, PipelineError> {
        self.queue.get(address)
    }

    pub fn entry_history(&self, address: &str) -> Result<Vec<ArchivedEntry>, PipelineError> {
        self.queue.history(address)
    }

    pub fn stats(&self) -> Result<QueueStats, PipelineError> {
        let by_tier = self.queue.counts_by_tier()?;
        let by_status = self.queue.counts_by_status()?;
        let settings = self.settings.load()?;

        Ok(QueueStats {
            total: by_tier.values().sum(),
            by_tier,
            by_status,
            last_tier0_run_at: settings.last_tier0_run_at,
            last_tier1_run_at: settings.last_tier1_run_at,
            last_tier1_credits_used: settings.last_tier1_credits_used,
            last_hot_refresh_at: settings.last_hot_refresh_at,
            last_score_run_at: settings.last_score_run_at,
            credits_today: self.ledger.today_usage()?.total_credits,
            active_run: self.coordinator.active_run()?,
        })
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, PipelineError> {
        self.coordinator.recent_runs(limit)
    }

    pub fn recent_credits(&self, limit: usize) -> Result<Vec<LedgerEntry>, PipelineError> {
        self.ledger.recent(limit)
    }

    pub fn credit_usage_since(&self, since: i64) -> Result<CreditUsage, PipelineError> {
        self.ledger.usage_since(since)
    }

    pub fn credits_for_run(&self, run_id: i64) -> Result<u64, PipelineError> {
        self.ledger.total_for_run(run_id)
    }

    /// Run holding the coordinator slot, from any process on this database
    pub fn active_run(&self) -> Result<Option<ActiveRun>, PipelineError> {
        self.coordinator.active_run()
    }

    /// Fail runs left `running` by a crashed process. Call at startup.
    pub fn recover_interrupted_runs(&self) -> Result<usize, PipelineError> {
        self.coordinator.recover_interrupted()
    }

    // ---- Runs ----

    pub async fn run_tier0(&self, params: &Tier0Params) -> Result<Tier0Summary, PipelineError> {
        let settings = self.settings.load()?;
        let mut filter = settings.candidate_filter();
        filter.mc_min = params.mc_min.unwrap_or(filter.mc_min);
        filter.volume_min = params.volume_min.unwrap_or(filter.volume_min);
        filter.liquidity_min = params.liquidity_min.unwrap_or(filter.liquidity_min);
        filter.age_max_hours = params.age_max_hours.unwrap_or(filter.age_max_hours);
        let max_tokens = params.max_tokens.unwrap_or(settings.tier0_max_per_run);

        let lease = self.coordinator.try_acquire(RunKind::Tier0)?;
        let result = self.discoverer.run(&lease, &filter, max_tokens).await;
        finish(lease, result)
    }

    pub async fn run_tier1(&self, params: &Tier1Params) -> Result<Tier1Summary, PipelineError> {
        let settings = self.settings.load()?;
        let limits = Tier1Limits {
            batch_size: params.batch_size.unwrap_or(settings.tier1_batch_size),
            credit_budget: params
                .credit_budget
                .unwrap_or(settings.tier1_credit_budget_per_run),
            max_attempts: settings.tier1_max_attempts,
        };

        let lease = self.coordinator.try_acquire(RunKind::Tier1)?;
        let result = self.enricher.run(&lease, limits).await;

        if let Ok(summary) = &result {
            match self.ledger.reconcile_run(summary.run_id, summary.credits_used) {
                Reconciliation::Matches => {}
                Reconciliation::Mismatch { recorded } => log::error!(
                    "❌ Tier-1 run #{} ledger mismatch: summary {} vs ledger {}",
                    summary.run_id,
                    summary.credits_used,
                    recorded
                ),
                Reconciliation::Unavailable(e) => log::error!(
                    "❌ Tier-1 run #{} ledger check failed: {}",
                    summary.run_id,
                    e
                ),
            }
        }

        finish(lease, result)
    }

    pub async fn run_auto_promotion(
        &self,
        max_per_run: Option<usize>,
    ) -> Result<PromotionSummary, PipelineError> {
        let settings = self.settings.load()?;
        let max = max_per_run.unwrap_or(settings.auto_promote_max_per_run);

        let lease = self.coordinator.try_acquire(RunKind::Promotion)?;
        let result = self.promoter.run_auto(&lease, &settings, max).await;
        finish(lease, result)
    }

    /// Manual promotion; bypasses scoring, still requires `enriched`
    pub async fn promote(&self, addresses: &[String]) -> Result<PromotionSummary, PipelineError> {
        let lease = self.coordinator.try_acquire(RunKind::Promotion)?;
        let result = self.promoter.promote_manual(&lease, addresses).await;
        finish(lease, result)
    }

    pub async fn run_hot_refresh(
        &self,
        params: &HotRefreshParams,
    ) -> Result<RefreshSummary, PipelineError> {
        let settings = self.settings.load()?;
        let max_tokens = params.max_tokens.unwrap_or(settings.hot_refresh_max_tokens);
        let age_hours = params.age_hours.unwrap_or(settings.hot_refresh_age_hours);

        let lease = self.coordinator.try_acquire(RunKind::HotRefresh)?;
        let result = self.refresher.run(&lease, max_tokens, age_hours).await;
        finish(lease, result)
    }

    // ---- Maintenance ----

    pub fn discard(
        &self,
        addresses: &[String],
        reason: Option<&str>,
    ) -> Result<MaintenanceSummary, PipelineError> {
        let reason = reason.unwrap_or(DEFAULT_DISCARD_REASON);
        let lease = self.coordinator.try_acquire(RunKind::Maintenance)?;
        let result = self.discard_all(&lease, addresses, reason);
        finish(lease, result)
    }

    fn discard_all(
        &self,
        lease: &Lease,
        addresses: &[String],
        reason: &str,
    ) -> Result<MaintenanceSummary, PipelineError> {
        let mut summary = MaintenanceSummary {
            run_id: lease.run_id(),
            action: MaintenanceAction::Discard,
            ..Default::default()
        };

        for address in addresses {
            match self.queue.discard(address, reason, (self.clock)())? {
                DiscardOutcome::Discarded => {
                    log::info!("🗑️  Discarded {} ({})", address, reason);
                    summary.affected += 1;
                }
                DiscardOutcome::AlreadyDiscarded => summary.skipped += 1,
                DiscardOutcome::NotFound => {
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address.as_str(),
                        EntryErrorKind::NotFound,
                        "address not in queue",
                    ));
                }
            }
        }

        Ok(summary)
    }

    /// Restart discarded addresses as fresh `ingested` lineages
    pub fn reingest(&self, addresses: &[String]) -> Result<MaintenanceSummary, PipelineError> {
        let lease = self.coordinator.try_acquire(RunKind::Maintenance)?;
        let result = self.reingest_all(&lease, addresses);
        finish(lease, result)
    }

    fn reingest_all(
        &self,
        lease: &Lease,
        addresses: &[String],
    ) -> Result<MaintenanceSummary, PipelineError> {
        let mut summary = MaintenanceSummary {
            run_id: lease.run_id(),
            action: MaintenanceAction::Reingest,
            ..Default::default()
        };

        for address in addresses {
            match self.queue.reingest(address, (self.clock)())? {
                ReingestOutcome::Reingested { lineage } => {
                    log::info!("♻️  Re-ingested {} as lineage {}", address, lineage);
                    summary.affected += 1;
                }
                ReingestOutcome::NotDiscarded(tier) => {
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address.as_str(),
                        EntryErrorKind::IneligibleTier,
                        format!("not discarded (tier {})", tier),
                    ));
                }
                ReingestOutcome::NotFound => {
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address.as_str(),
                        EntryErrorKind::NotFound,
                        "address not in queue",
                    ));
                }
            }
        }

        Ok(summary)
    }
}

/// Release `lease` with the run's outcome and hand the result back
fn finish<S>(lease: Lease, result: Result<S, PipelineError>) -> Result<S, PipelineError>
where
    S: Clone + Into<RunSummary>,
{
    match result {
        Ok(summary) => {
            lease.complete(&summary.clone().into())?;
            Ok(summary)
        }
        Err(e) => {
            if let Err(release_err) = lease.fail(&e) {
                log::error!("❌ Failed to record run failure: {}", release_err);
            }
            Err(e)
        }
    }
}
