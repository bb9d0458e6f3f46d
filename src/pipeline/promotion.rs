//! Promotion Evaluator: `enriched → analyzed` through the analysis workflow
//!
//! Auto mode promotes `prime` entries only, best score first, capped per run.
//! Manual mode skips scoring but still requires `tier == enriched`; anything
//! else is reported as a failure and left untouched.

use crate::pipeline::collaborators::AnalysisWorkflow;
use crate::pipeline::coordinator::Lease;
use crate::pipeline::error::{EntryError, EntryErrorKind, PipelineError};
use crate::pipeline::ledger::{CreditLedger, CreditOperation, NewLedgerEntry};
use crate::pipeline::queue::QueueStore;
use crate::pipeline::scoring::{self, ScoreBucket};
use crate::pipeline::settings::Settings;
use crate::pipeline::types::{Clock, PromotionMode, PromotionSummary, StopReason, Tier};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

pub struct PromotionEvaluator {
    queue: QueueStore,
    ledger: CreditLedger,
    workflow: Arc<dyn AnalysisWorkflow>,
    clock: Clock,
}

impl PromotionEvaluator {
    pub fn new(
        queue: QueueStore,
        ledger: CreditLedger,
        workflow: Arc<dyn AnalysisWorkflow>,
        clock: Clock,
    ) -> Self {
        Self {
            queue,
            ledger,
            workflow,
            clock,
        }
    }

    pub async fn run_auto(
        &self,
        lease: &Lease,
        settings: &Settings,
        max_per_run: usize,
    ) -> Result<PromotionSummary, PipelineError> {
        let candidates = self.queue.select_promotion_candidates()?;

        let mut summary = PromotionSummary {
            run_id: lease.run_id(),
            mode: PromotionMode::Auto,
            considered: candidates.len(),
            ..Default::default()
        };

        // Candidates arrive oldest-first; the stable sort keeps that as the tiebreak
        let mut prime: Vec<_> = candidates
            .into_iter()
            .map(|entry| {
                let card = scoring::score(&entry, settings);
                (entry, card)
            })
            .filter(|(_, card)| card.bucket == ScoreBucket::Prime)
            .collect();
        prime.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(Ordering::Equal));

        summary.prime = prime.len();

        log::info!(
            "🚀 Promotion run #{}: {} enriched, {} prime, max {}",
            lease.run_id(),
            summary.considered,
            summary.prime,
            max_per_run
        );

        for (index, (entry, card)) in prime.iter().enumerate() {
            if index >= max_per_run {
                summary.stop_reason = Some(StopReason::MaxTokensReached);
                break;
            }
            if lease.deadline_exceeded() {
                summary.stop_reason = Some(StopReason::DeadlineExceeded);
                break;
            }

            log::debug!(
                "   ├─ {} score {:.1} [{}]",
                entry.address,
                card.score,
                card.rules.join(", ")
            );
            self.promote_entry(lease, &entry.address, &mut summary).await?;
        }

        log_completion(&summary);
        Ok(summary)
    }

    pub async fn promote_manual(
        &self,
        lease: &Lease,
        addresses: &[String],
    ) -> Result<PromotionSummary, PipelineError> {
        let mut summary = PromotionSummary {
            run_id: lease.run_id(),
            mode: PromotionMode::Manual,
            considered: addresses.len(),
            ..Default::default()
        };

        log::info!(
            "🚀 Manual promotion run #{}: {} address(es)",
            lease.run_id(),
            addresses.len()
        );

        let mut seen = HashSet::new();
        for address in addresses {
            if !seen.insert(address.as_str()) {
                continue;
            }
            if lease.deadline_exceeded() {
                summary.stop_reason = Some(StopReason::DeadlineExceeded);
                break;
            }

            match self.queue.get(address)? {
                None => {
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address.as_str(),
                        EntryErrorKind::NotFound,
                        "address not in queue",
                    ));
                }
                Some(entry) if entry.tier != Tier::Enriched => {
                    log::warn!("⚠️  {} not promotable from tier {}", address, entry.tier);
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address.as_str(),
                        EntryErrorKind::IneligibleTierForPromotion,
                        format!("ineligible tier: {}", entry.tier),
                    ));
                }
                Some(_) => self.promote_entry(lease, address, &mut summary).await?,
            }
        }

        log_completion(&summary);
        Ok(summary)
    }

    async fn promote_entry(
        &self,
        lease: &Lease,
        address: &str,
        summary: &mut PromotionSummary,
    ) -> Result<(), PipelineError> {
        match self.workflow.promote(address).await {
            Ok(analyzed) => {
                if analyzed.credits_used > 0 {
                    let mut entry =
                        NewLedgerEntry::new(CreditOperation::TokenAnalysis, analyzed.credits_used)
                            .run(lease.run_id())
                            .address(address);
                    if let Some(reference) = &analyzed.reference {
                        entry = entry.context("analysis", reference.as_str());
                    }
                    self.ledger.append(&entry)?;
                    summary.credits_used += analyzed.credits_used;
                }

                if self.queue.mark_analyzed(address, (self.clock)())? {
                    log::info!("   ├─ ✅ Promoted {}", address);
                    summary.promoted += 1;
                    summary.promoted_addresses.push(address.to_string());
                } else {
                    summary.failed += 1;
                    summary.errors.push(EntryError::new(
                        address,
                        EntryErrorKind::IneligibleTierForPromotion,
                        "entry left enriched tier during analysis",
                    ));
                }
            }
            Err(e) => {
                let message = e.to_string();
                log::warn!("⚠️  Analysis failed for {}: {}", address, message);
                self.queue.record_analysis_failure(address, &message)?;
                summary.failed += 1;
                summary.errors.push(EntryError::new(
                    address,
                    EntryErrorKind::AnalysisWorkflowFailed,
                    message,
                ));
            }
        }
        Ok(())
    }
}

fn log_completion(summary: &PromotionSummary) {
    log::info!(
        "✅ Promotion run #{}: {} promoted, {} failed, 💳 {} analysis credits",
        summary.run_id,
        summary.promoted,
        summary.failed,
        summary.credits_used
    );
}
