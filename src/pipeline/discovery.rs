//! Tier-0 Discoverer: free feed → `ingested` entries

use crate::pipeline::collaborators::DiscoveryFeed;
use crate::pipeline::coordinator::Lease;
use crate::pipeline::error::{EntryError, EntryErrorKind, PipelineError};
use crate::pipeline::queue::{DiscoveryOutcome, QueueStore};
use crate::pipeline::types::{CandidateFilter, Clock, StopReason, Tier0Summary};
use std::sync::Arc;

pub struct Tier0Discoverer {
    queue: QueueStore,
    feed: Arc<dyn DiscoveryFeed>,
    clock: Clock,
}

impl Tier0Discoverer {
    pub fn new(queue: QueueStore, feed: Arc<dyn DiscoveryFeed>, clock: Clock) -> Self {
        Self { queue, feed, clock }
    }

    /// Walk every feed page, inserting candidates that pass `filter` until
    /// `max_tokens` new entries exist.
    ///
    /// A failed page is recorded and skipped, as is each address the feed
    /// could not look up. If every attempted page fails the run fails with
    /// `FeedUnavailable`. No page is fetched once the cap is reached.
    pub async fn run(
        &self,
        lease: &Lease,
        filter: &CandidateFilter,
        max_tokens: usize,
    ) -> Result<Tier0Summary, PipelineError> {
        let mut summary = Tier0Summary {
            run_id: lease.run_id(),
            ..Default::default()
        };

        let pages = self.feed.page_count();
        let mut attempted = 0;
        let mut failed_pages = 0;

        log::info!(
            "🚀 Tier-0 run #{}: {} page(s), max {} new, mc≥{} vol≥{} liq≥{} age≤{}h",
            lease.run_id(),
            pages,
            max_tokens,
            filter.mc_min,
            filter.volume_min,
            filter.liquidity_min,
            filter.age_max_hours
        );

        'pages: for page in 0..pages {
            if lease.deadline_exceeded() {
                summary.stop_reason = Some(StopReason::DeadlineExceeded);
                break;
            }
            if summary.new >= max_tokens {
                summary.stop_reason = Some(StopReason::MaxTokensReached);
                break;
            }

            attempted += 1;
            let fetched = match self.feed.fetch_page(page, filter).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    failed_pages += 1;
                    log::warn!("⚠️  Tier-0 feed page {} failed: {}", page, e);
                    summary.errors.push(EntryError::run_level(
                        EntryErrorKind::FeedPageFailed,
                        format!("page {}: {}", page, e),
                    ));
                    continue;
                }
            };

            for failure in fetched.failures {
                summary.errors.push(EntryError::new(
                    failure.address,
                    EntryErrorKind::CandidateLookupFailed,
                    failure.message,
                ));
            }

            for candidate in fetched.candidates {
                if summary.new >= max_tokens {
                    summary.stop_reason = Some(StopReason::MaxTokensReached);
                    break 'pages;
                }

                summary.fetched += 1;

                if !filter.passes(&candidate.snapshot) {
                    summary.skipped += 1;
                    continue;
                }

                match self.queue.upsert_discovered(&candidate, (self.clock)())? {
                    DiscoveryOutcome::Inserted => summary.new += 1,
                    DiscoveryOutcome::Updated => summary.updated += 1,
                    DiscoveryOutcome::Skipped(tier) => {
                        log::debug!("   ├─ ⏭️  {} already {}", candidate.address, tier);
                        summary.skipped += 1;
                    }
                }
            }
        }

        if attempted > 0 && failed_pages == attempted {
            return Err(PipelineError::FeedUnavailable(format!(
                "all {} feed page(s) failed",
                attempted
            )));
        }

        log::info!(
            "✅ Tier-0 run #{}: {} fetched, {} new, {} updated, {} skipped, {} error(s)",
            lease.run_id(),
            summary.fetched,
            summary.new,
            summary.updated,
            summary.skipped,
            summary.errors.total
        );

        Ok(summary)
    }
}
