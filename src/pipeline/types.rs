//! Core data structures for the token lifecycle pipeline
//!
//! Column mapping for `queue_entries` lives in `queue.rs`; the enums here
//! carry their own SQL text representation.

use crate::pipeline::error::ErrorList;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Unix-seconds time source. Injected so runs are testable without a live timer.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Clock backed by `chrono::Utc::now()`
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// Failure to parse a stored enum value
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `Display`, `FromStr`, `ToSql` and `FromSql` over `as_str()`.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Pipeline stage of a token address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Ingested,
    Enriched,
    Analyzed,
    Discarded,
}

text_enum!(Tier, "tier", {
    Ingested => "ingested",
    Enriched => "enriched",
    Analyzed => "analyzed",
    Discarded => "discarded",
});

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Ingested, Tier::Enriched, Tier::Analyzed, Tier::Discarded];

    /// No automatic transition leaves a terminal tier.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Tier::Discarded)
    }

    /// Forward-only along ingested → enriched → analyzed; discard is reachable
    /// from any non-terminal tier.
    pub fn can_transition_to(self, next: Tier) -> bool {
        match (self, next) {
            (Tier::Discarded, _) => false,
            (_, Tier::Discarded) => true,
            (Tier::Ingested, Tier::Enriched) | (Tier::Enriched, Tier::Analyzed) => true,
            _ => false,
        }
    }
}

/// Outcome of the most recent transition attempt on an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Completed,
    Failed,
}

text_enum!(Status, "status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

impl Status {
    pub const ALL: [Status; 3] = [Status::Pending, Status::Completed, Status::Failed];
}

/// Kind of run guarded by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Tier0,
    Tier1,
    Promotion,
    HotRefresh,
    /// Manual discard / re-ingest
    Maintenance,
}

text_enum!(RunKind, "run kind", {
    Tier0 => "tier0",
    Tier1 => "tier1",
    Promotion => "promotion",
    HotRefresh => "hot_refresh",
    Maintenance => "maintenance",
});

/// Last-known market metrics for a token
///
/// All fields are optional: the free feed and the paid API each fill a
/// different subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
    pub age_hours: Option<f64>,
    /// Share of supply held by the largest holder (0.0 - 1.0)
    pub top_holder_share: Option<f64>,
}

impl MetricSnapshot {
    /// Fields present in `newer` win; absent ones keep the current value.
    pub fn merged_with(&self, newer: &MetricSnapshot) -> MetricSnapshot {
        MetricSnapshot {
            market_cap_usd: newer.market_cap_usd.or(self.market_cap_usd),
            volume_24h_usd: newer.volume_24h_usd.or(self.volume_24h_usd),
            liquidity_usd: newer.liquidity_usd.or(self.liquidity_usd),
            age_hours: newer.age_hours.or(self.age_hours),
            top_holder_share: newer.top_holder_share.or(self.top_holder_share),
        }
    }
}

/// One row of `queue_entries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub address: String,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    pub source: String,
    pub tier: Tier,
    pub status: Status,
    /// Incremented by each manual re-ingestion
    pub lineage: i64,
    pub snapshot: MetricSnapshot,
    /// Market cap when this lineage was first seen (momentum baseline)
    pub first_mc_usd: Option<f64>,
    /// Liquidity when this lineage was first seen
    pub first_liquidity_usd: Option<f64>,
    pub metrics_updated_at: i64,
    pub first_seen_at: i64,
    pub ingested_at: Option<i64>,
    pub enriched_at: Option<i64>,
    pub analyzed_at: Option<i64>,
    pub discarded_at: Option<i64>,
    pub discard_reason: Option<String>,
    /// Failed Tier-1 attempts in this lineage
    pub enrich_attempts: u32,
    pub last_error: Option<String>,
}

/// Token returned by the discovery feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    /// Feed source label, e.g. `dexscreener:profiles`
    pub source: String,
    pub snapshot: MetricSnapshot,
}

/// Tier-0 inclusion thresholds (all AND-ed)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateFilter {
    pub mc_min: f64,
    pub volume_min: f64,
    pub liquidity_min: f64,
    pub age_max_hours: f64,
}

impl CandidateFilter {
    /// Missing metrics count as zero; a missing age passes.
    pub fn passes(&self, snapshot: &MetricSnapshot) -> bool {
        snapshot.market_cap_usd.unwrap_or(0.0) >= self.mc_min
            && snapshot.volume_24h_usd.unwrap_or(0.0) >= self.volume_min
            && snapshot.liquidity_usd.unwrap_or(0.0) >= self.liquidity_min
            && snapshot.age_hours.map_or(true, |age| age <= self.age_max_hours)
    }
}

/// Why a run stopped before exhausting its selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxTokensReached,
    /// Next call would exceed the per-run credit budget
    BudgetExhausted,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tier0Summary {
    pub run_id: i64,
    pub fetched: usize,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: ErrorList,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tier1Summary {
    pub run_id: i64,
    pub selected: usize,
    pub enriched: usize,
    pub failed: usize,
    /// Entries discarded by the retry cap during this run
    pub discarded: usize,
    pub credits_used: u64,
    pub errors: ErrorList,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub run_id: i64,
    pub mode: PromotionMode,
    /// Enriched entries scored (auto) or addresses requested (manual)
    pub considered: usize,
    /// Entries classified prime (auto mode only)
    pub prime: usize,
    pub promoted: usize,
    pub failed: usize,
    pub promoted_addresses: Vec<String>,
    /// Credits reported by the analysis workflow
    pub credits_used: u64,
    pub errors: ErrorList,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub run_id: i64,
    pub selected: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub credits_used: u64,
    pub errors: ErrorList,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceAction {
    #[default]
    Discard,
    Reingest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceSummary {
    pub run_id: i64,
    pub action: MaintenanceAction,
    pub affected: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: ErrorList,
}

/// Summary persisted with a run record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSummary {
    Tier0(Tier0Summary),
    Tier1(Tier1Summary),
    Promotion(PromotionSummary),
    HotRefresh(RefreshSummary),
    Maintenance(MaintenanceSummary),
}

impl RunSummary {
    pub fn credits_used(&self) -> u64 {
        match self {
            RunSummary::Tier1(s) => s.credits_used,
            RunSummary::Promotion(s) => s.credits_used,
            RunSummary::HotRefresh(s) => s.credits_used,
            RunSummary::Tier0(_) | RunSummary::Maintenance(_) => 0,
        }
    }
}

impl From<Tier0Summary> for RunSummary {
    fn from(s: Tier0Summary) -> Self {
        RunSummary::Tier0(s)
    }
}

impl From<Tier1Summary> for RunSummary {
    fn from(s: Tier1Summary) -> Self {
        RunSummary::Tier1(s)
    }
}

impl From<PromotionSummary> for RunSummary {
    fn from(s: PromotionSummary) -> Self {
        RunSummary::Promotion(s)
    }
}

impl From<RefreshSummary> for RunSummary {
    fn from(s: RefreshSummary) -> Self {
        RunSummary::HotRefresh(s)
    }
}

impl From<MaintenanceSummary> for RunSummary {
    fn from(s: MaintenanceSummary) -> Self {
        RunSummary::Maintenance(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(mc: f64, vol: f64, liq: f64, age: Option<f64>) -> MetricSnapshot {
        MetricSnapshot {
            market_cap_usd: Some(mc),
            volume_24h_usd: Some(vol),
            liquidity_usd: Some(liq),
            age_hours: age,
            top_holder_share: None,
        }
    }

    #[test]
    fn test_tier_transitions_are_forward_only() {
        assert!(Tier::Ingested.can_transition_to(Tier::Enriched));
        assert!(Tier::Enriched.can_transition_to(Tier::Analyzed));
        assert!(!Tier::Ingested.can_transition_to(Tier::Analyzed));
        assert!(!Tier::Enriched.can_transition_to(Tier::Ingested));
        assert!(!Tier::Analyzed.can_transition_to(Tier::Enriched));

        for tier in [Tier::Ingested, Tier::Enriched, Tier::Analyzed] {
            assert!(tier.can_transition_to(Tier::Discarded));
        }
        for tier in Tier::ALL {
            assert!(!Tier::Discarded.can_transition_to(tier));
        }
    }

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!("hot_refresh".parse::<RunKind>().unwrap(), RunKind::HotRefresh);
        assert_eq!(Tier::Discarded.to_string(), "discarded");
        assert!("archived".parse::<Tier>().is_err());
    }

    #[test]
    fn test_filter_requires_all_thresholds() {
        let filter = CandidateFilter {
            mc_min: 10_000.0,
            volume_min: 5_000.0,
            liquidity_min: 5_000.0,
            age_max_hours: 48.0,
        };

        assert!(filter.passes(&snapshot(20_000.0, 6_000.0, 7_000.0, Some(3.0))));
        assert!(filter.passes(&snapshot(10_000.0, 5_000.0, 5_000.0, Some(48.0))));
        assert!(!filter.passes(&snapshot(9_999.0, 6_000.0, 7_000.0, Some(3.0))));
        assert!(!filter.passes(&snapshot(20_000.0, 4_000.0, 7_000.0, Some(3.0))));
        assert!(!filter.passes(&snapshot(20_000.0, 6_000.0, 1_000.0, Some(3.0))));
        assert!(!filter.passes(&snapshot(20_000.0, 6_000.0, 7_000.0, Some(49.0))));

        // Unknown age passes, unknown market cap does not
        assert!(filter.passes(&snapshot(20_000.0, 6_000.0, 7_000.0, None)));
        assert!(!filter.passes(&MetricSnapshot::default()));
    }

    #[test]
    fn test_snapshot_merge_keeps_missing_fields() {
        let current = snapshot(1.0, 2.0, 3.0, Some(4.0));
        let newer = MetricSnapshot {
            market_cap_usd: Some(10.0),
            top_holder_share: Some(0.2),
            ..Default::default()
        };

        let merged = current.merged_with(&newer);
        assert_eq!(merged.market_cap_usd, Some(10.0));
        assert_eq!(merged.volume_24h_usd, Some(2.0));
        assert_eq!(merged.liquidity_usd, Some(3.0));
        assert_eq!(merged.age_hours, Some(4.0));
        assert_eq!(merged.top_holder_share, Some(0.2));
    }
}
