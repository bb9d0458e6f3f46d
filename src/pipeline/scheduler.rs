//! Recurring triggers for the pipeline stages
//!
//! One tokio task per stage. Each cycle sleeps for the stage's interval (read
//! from Settings every cycle so edits apply without a restart), then ticks.
//! A tick is skipped when the stage's feature flag is off or the coordinator
//! is busy; a busy tick is not retried before the next interval.

use crate::pipeline::service::{HotRefreshParams, PipelineService, Tier0Params, Tier1Params};
use crate::pipeline::settings::Settings;
use crate::pipeline::types::RunKind;
use crate::pipeline::PipelineError;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Fallback interval when Settings can't be read
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

pub const SCHEDULED_KINDS: [RunKind; 4] = [
    RunKind::Tier0,
    RunKind::Tier1,
    RunKind::Promotion,
    RunKind::HotRefresh,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Feature flag off (or not a scheduled kind)
    Disabled,
    Busy,
    Ran,
    Failed,
}

pub fn is_enabled(settings: &Settings, kind: RunKind) -> bool {
    match kind {
        RunKind::Tier0 => settings.ingest_enabled,
        RunKind::Tier1 => settings.enrich_enabled,
        RunKind::Promotion => settings.auto_promote_enabled,
        RunKind::HotRefresh => settings.hot_refresh_enabled,
        RunKind::Maintenance => false,
    }
}

pub fn interval_for(settings: &Settings, kind: RunKind) -> Duration {
    let minutes = match kind {
        RunKind::Tier0 => settings.tier0_interval_minutes,
        RunKind::Tier1 => settings.tier1_interval_minutes,
        RunKind::Promotion => settings.promotion_interval_minutes,
        RunKind::HotRefresh => settings.hot_refresh_interval_minutes,
        RunKind::Maintenance => return RETRY_INTERVAL,
    };
    Duration::from_secs(minutes * 60)
}

fn outcome_of<T>(kind: RunKind, result: Result<T, PipelineError>) -> TickOutcome {
    match result {
        Ok(_) => TickOutcome::Ran,
        Err(e) if e.is_busy() => {
            log::info!("⏭️  Scheduled {} run skipped: {}", kind, e);
            TickOutcome::Busy
        }
        Err(e) => {
            log::error!("❌ Scheduled {} run failed: {}", kind, e);
            TickOutcome::Failed
        }
    }
}

/// Run one scheduled trigger for `kind`
pub async fn tick(service: &PipelineService, kind: RunKind) -> TickOutcome {
    let settings = match service.settings() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("❌ Scheduler could not load settings: {}", e);
            return TickOutcome::Failed;
        }
    };

    if !is_enabled(&settings, kind) {
        log::debug!("⏭️  Scheduled {} run disabled", kind);
        return TickOutcome::Disabled;
    }

    match kind {
        RunKind::Tier0 => outcome_of(kind, service.run_tier0(&Tier0Params::default()).await),
        RunKind::Tier1 => {
            let result = service.run_tier1(&Tier1Params::default()).await;
            let chain = matches!(&result, Ok(summary) if summary.enriched > 0)
                && settings.auto_promote_enabled;
            let outcome = outcome_of(kind, result);

            if chain {
                log::info!("🔗 Chaining auto-promotion after Tier-1");
                outcome_of(RunKind::Promotion, service.run_auto_promotion(None).await);
            }
            outcome
        }
        RunKind::Promotion => outcome_of(kind, service.run_auto_promotion(None).await),
        RunKind::HotRefresh => {
            outcome_of(kind, service.run_hot_refresh(&HotRefreshParams::default()).await)
        }
        RunKind::Maintenance => TickOutcome::Disabled,
    }
}

/// Scheduler task for one stage. Runs until the task is aborted.
pub async fn stage_scheduler_task(service: Arc<PipelineService>, kind: RunKind) {
    log::info!("⏰ Starting {} scheduler", kind);

    loop {
        let wait = service
            .settings()
            .map(|s| interval_for(&s, kind))
            .unwrap_or(RETRY_INTERVAL);
        sleep(wait).await;

        tick(&service, kind).await;
    }
}

/// Spawn one scheduler task per stage
pub fn spawn_all(service: Arc<PipelineService>) -> Vec<JoinHandle<()>> {
    SCHEDULED_KINDS
        .iter()
        .map(|kind| tokio::spawn(stage_scheduler_task(service.clone(), *kind)))
        .collect()
}
