//! Rule-based promotion scoring
//!
//! Score = 50 + sum of the weights of every triggered rule, clamped to 0..=100.
//! Momentum rules compare the current snapshot with the first-seen baseline of
//! the entry's lineage. Weights are configurable per rule name; unknown
//! metrics never trigger a rule.

use crate::pipeline::settings::Settings;
use crate::pipeline::types::QueueEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const BASE_SCORE: f64 = 50.0;

pub const MC_UP_50PCT: &str = "mc_up_50pct";
pub const MC_UP_30PCT: &str = "mc_up_30pct";
pub const DRAWDOWN_35PCT: &str = "drawdown_35pct";
pub const LIQUIDITY_UP_30PCT: &str = "liquidity_up_30pct";
pub const LIQUIDITY_DOWN_40PCT: &str = "liquidity_down_40pct";
pub const VOLUME_24H_100K: &str = "volume_24h_100k";
pub const VOLUME_24H_10K: &str = "volume_24h_10k";
pub const TOP_HOLDER_CONCENTRATED: &str = "top_holder_concentrated";

const DEFAULT_WEIGHTS: [(&str, f64); 8] = [
    (MC_UP_50PCT, 15.0),
    (MC_UP_30PCT, 10.0),
    (DRAWDOWN_35PCT, -10.0),
    (LIQUIDITY_UP_30PCT, 10.0),
    (LIQUIDITY_DOWN_40PCT, -15.0),
    (VOLUME_24H_100K, 10.0),
    (VOLUME_24H_10K, -10.0),
    (TOP_HOLDER_CONCENTRATED, -8.0),
];

pub fn default_weights() -> BTreeMap<String, f64> {
    DEFAULT_WEIGHTS
        .iter()
        .map(|(rule, weight)| (rule.to_string(), *weight))
        .collect()
}

pub fn is_known_rule(rule: &str) -> bool {
    DEFAULT_WEIGHTS.iter().any(|(name, _)| *name == rule)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBucket {
    Prime,
    Monitor,
    Cull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreCard {
    pub score: f64,
    pub bucket: ScoreBucket,
    /// Triggered rule names, in evaluation order
    pub rules: Vec<String>,
}

fn ratio(current: Option<f64>, baseline: Option<f64>) -> Option<f64> {
    let baseline = baseline.filter(|b| *b > 0.0)?;
    Some(current? / baseline)
}

/// Rules triggered by an entry's metrics
pub fn triggered_rules(entry: &QueueEntry) -> Vec<&'static str> {
    let snap = &entry.snapshot;
    let mut rules = Vec::new();

    if let Some(r) = ratio(snap.market_cap_usd, entry.first_mc_usd) {
        if r >= 1.5 {
            rules.push(MC_UP_50PCT);
        } else if r >= 1.3 {
            rules.push(MC_UP_30PCT);
        }
        if r <= 0.65 {
            rules.push(DRAWDOWN_35PCT);
        }
    }

    if let Some(r) = ratio(snap.liquidity_usd, entry.first_liquidity_usd) {
        if r >= 1.3 {
            rules.push(LIQUIDITY_UP_30PCT);
        } else if r < 0.6 {
            rules.push(LIQUIDITY_DOWN_40PCT);
        }
    }

    if let Some(volume) = snap.volume_24h_usd {
        if volume >= 100_000.0 {
            rules.push(VOLUME_24H_100K);
        } else if volume < 10_000.0 {
            rules.push(VOLUME_24H_10K);
        }
    }

    if snap.top_holder_share.is_some_and(|share| share > 0.45) {
        rules.push(TOP_HOLDER_CONCENTRATED);
    }

    rules
}

pub fn score(entry: &QueueEntry, settings: &Settings) -> ScoreCard {
    let defaults = default_weights();
    let rules = triggered_rules(entry);

    let total: f64 = rules
        .iter()
        .map(|rule| {
            settings
                .score_weights
                .get(*rule)
                .or_else(|| defaults.get(*rule))
                .copied()
                .unwrap_or(0.0)
        })
        .sum();

    let score = (BASE_SCORE + total).clamp(0.0, 100.0);

    let bucket = if score >= settings.prime_threshold {
        ScoreBucket::Prime
    } else if score >= settings.monitor_threshold {
        ScoreBucket::Monitor
    } else {
        ScoreBucket::Cull
    };

    ScoreCard {
        score,
        bucket,
        rules: rules.into_iter().map(String::from).collect(),
    }
}
