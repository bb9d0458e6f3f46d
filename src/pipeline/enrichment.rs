//! Tier-1 Enricher: paid enrichment of `ingested` entries under a credit budget
//!
//! The budget check happens before every call: a call is made only if
//! `credits_used + estimated_cost <= budget`. Every charged call, including
//! those billed before a failure, is appended to the ledger under the run id
//! with the operation the API reported.

use crate::pipeline::collaborators::EnrichmentApi;
use crate::pipeline::coordinator::Lease;
use crate::pipeline::error::{EntryError, EntryErrorKind, PipelineError};
use crate::pipeline::ledger::{CreditCharge, CreditLedger, NewLedgerEntry};
use crate::pipeline::queue::QueueStore;
use crate::pipeline::types::{Clock, StopReason, Tier1Summary};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct Tier1Limits {
    pub batch_size: usize,
    pub credit_budget: u64,
    /// 0 = retry forever
    pub max_attempts: u32,
}

pub struct Tier1Enricher {
    queue: QueueStore,
    ledger: CreditLedger,
    api: Arc<dyn EnrichmentApi>,
    clock: Clock,
}

impl Tier1Enricher {
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

    /// One ledger row per metered call; returns the credits recorded
    fn record_charges(
        &self,
        charges: &[CreditCharge],
        run_id: i64,
        address: &str,
        partial: bool,
    ) -> Result<u64, PipelineError> {
        let mut recorded = 0;
        for charge in charges.iter().filter(|c| c.credits > 0) {
            let mut entry = NewLedgerEntry::new(charge.operation, charge.credits)
                .run(run_id)
                .address(address);
            if partial {
                entry = entry.context("partial", "true");
            }
            self.ledger.append(&entry)?;
            recorded += charge.credits;
        }
        Ok(recorded)
    }

    pub async fn run(&self, lease: &Lease, limits: Tier1Limits) -> Result<Tier1Summary, PipelineError> {
        let run_id = lease.run_id();
        let entries = self.queue.select_for_enrichment(limits.batch_size)?;
        let estimate = self.api.estimated_cost();

        let mut summary = Tier1Summary {
            run_id,
            selected: entries.len(),
            ..Default::default()
        };

        log::info!(
            "🚀 Tier-1 run #{}: {} selected, budget {} credits (~{} per call)",
            run_id,
            entries.len(),
            limits.credit_budget,
            estimate
        );

        for entry in entries {
            if lease.deadline_exceeded() {
                summary.stop_reason = Some(StopReason::DeadlineExceeded);
                break;
            }

            if summary.credits_used + estimate > limits.credit_budget {
                log::info!(
                    "💳 Tier-1 run #{} budget reached: {} used, next call ~{}, budget {}",
                    run_id,
                    summary.credits_used,
                    estimate,
                    limits.credit_budget
                );
                summary.stop_reason = Some(StopReason::BudgetExhausted);
                break;
            }

            let address = entry.address.as_str();

            match self.api.enrich(address).await {
                Ok(enrichment) => {
                    summary.credits_used +=
                        self.record_charges(&enrichment.charges, run_id, address, false)?;

                    if self.queue.mark_enriched(address, &enrichment, (self.clock)())? {
                        summary.enriched += 1;
                        log::debug!("   ├─ ✅ Enriched {}", address);
                    } else {
                        log::warn!("⚠️  {} left ingested tier during enrichment", address);
                    }
                }
                Err(e) => {
                    summary.credits_used += self.record_charges(&e.charges, run_id, address, true)?;

                    let message = e.to_string();
                    log::warn!("⚠️  Tier-1 enrichment failed for {}: {}", address, message);

                    let outcome = self.queue.record_enrichment_failure(
                        address,
                        &message,
                        limits.max_attempts,
                        (self.clock)(),
                    )?;
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address,
                        EntryErrorKind::EnrichmentCallFailed,
                        message,
                    ));

                    if outcome.discarded {
                        log::warn!(
                            "⚠️  {} discarded after {} failed enrichment attempts",
                            address,
                            outcome.attempts
                        );
                        summary.discarded += 1;
                        summary.errors.push(EntryError::new(
                            address,
                            EntryErrorKind::RetryCapReached,
                            format!("{} failed attempts", outcome.attempts),
                        ));
                    }
                }
            }
        }

        log::info!(
            "✅ Tier-1 run #{}: {} enriched, {} failed, {} discarded, 💳 {} credits",
            run_id,
            summary.enriched,
            summary.failed,
            summary.discarded,
            summary.credits_used
        );

        Ok(summary)
    }
}
