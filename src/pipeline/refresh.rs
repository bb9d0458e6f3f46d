//! Hot Refresher: metric-only re-enrichment of stale `analyzed` entries

use crate::pipeline::collaborators::EnrichmentApi;
use crate::pipeline::coordinator::Lease;
use crate::pipeline::error::{EntryError, EntryErrorKind, PipelineError};
use crate::pipeline::ledger::{CreditCharge, CreditLedger, CreditOperation, NewLedgerEntry};
use crate::pipeline::queue::QueueStore;
use crate::pipeline::types::{Clock, RefreshSummary, StopReason};
use std::sync::Arc;

pub struct HotRefresher {
    queue: QueueStore,
    ledger: CreditLedger,
    api: Arc<dyn EnrichmentApi>,
    clock: Clock,
}

impl HotRefresher {
    pub fn new(
        queue: QueueStore,
        ledger: CreditLedger,
        api: Arc<dyn EnrichmentApi>,
        clock: Clock,
    ) -> Self {
        Self {
            queue,
            ledger,
            api,
            clock,
        }
    }

    /// Calls are booked as `hot_refresh`, the underlying call in the context
    fn record_charges(
        &self,
        charges: &[CreditCharge],
        run_id: i64,
        address: &str,
        partial: bool,
    ) -> Result<u64, PipelineError> {
        let mut recorded = 0;
        for charge in charges.iter().filter(|c| c.credits > 0) {
            let mut entry = NewLedgerEntry::new(CreditOperation::HotRefresh, charge.credits)
                .run(run_id)
                .address(address)
                .context("call", charge.operation.as_str());
            if partial {
                entry = entry.context("partial", "true");
            }
            self.ledger.append(&entry)?;
            recorded += charge.credits;
        }
        Ok(recorded)
    }

    /// Refresh up to `max_tokens` entries whose metrics are older than
    /// `age_hours`, stalest first. Tier is never changed.
    pub async fn run(
        &self,
        lease: &Lease,
        max_tokens: usize,
        age_hours: f64,
    ) -> Result<RefreshSummary, PipelineError> {
        let run_id = lease.run_id();
        let cutoff = (self.clock)() - (age_hours * 3600.0) as i64;
        let entries = self.queue.select_stale_analyzed(cutoff, max_tokens)?;

        let mut summary = RefreshSummary {
            run_id,
            selected: entries.len(),
            ..Default::default()
        };

        log::info!(
            "🚀 Hot refresh run #{}: {} stale (>{}h) entries",
            run_id,
            entries.len(),
            age_hours
        );

        for entry in entries {
            if lease.deadline_exceeded() {
                summary.stop_reason = Some(StopReason::DeadlineExceeded);
                break;
            }

            let address = entry.address.as_str();
            match self.api.enrich(address).await {
                Ok(enrichment) => {
                    summary.credits_used +=
                        self.record_charges(&enrichment.charges, run_id, address, false)?;

                    if self.queue.refresh_snapshot(address, &enrichment, (self.clock)())? {
                        summary.refreshed += 1;
                    }
                }
                Err(e) => {
                    summary.credits_used += self.record_charges(&e.charges, run_id, address, true)?;

                    let message = e.to_string();
                    log::warn!("⚠️  Hot refresh failed for {}: {}", address, message);
                    self.queue.record_refresh_failure(address, &message)?;
                    summary.failed += 1;
                    summary
                        .errors
                        .push(EntryError::new(address, EntryErrorKind::RefreshFailed, message));
                }
            }
        }

        log::info!(
            "✅ Hot refresh run #{}: {} refreshed, {} failed, 💳 {} credits",
            run_id,
            summary.refreshed,
            summary.failed,
            summary.credits_used
        );

        Ok(summary)
    }
}
