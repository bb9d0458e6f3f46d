//! Settings Store: singleton `pipeline_settings` row holding a JSON document
//!
//! SQL reference: `/sql/01_pipeline_settings.sql`
//!
//! Thresholds, budgets and flags are edited through [`SettingsUpdate`]
//! (partial merge, validated atomically). Last-run bookkeeping is written only
//! by the Run Coordinator when a lease is released.

use crate::pipeline::db::Database;
use crate::pipeline::error::PipelineError;
use crate::pipeline::scoring;
use crate::pipeline::types::{CandidateFilter, Clock, RunKind};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smallest allowed scheduler interval
pub const MIN_INTERVAL_MINUTES: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Tier-0 inclusion thresholds
    pub mc_min: f64,
    pub volume_min: f64,
    pub liquidity_min: f64,
    pub age_max_hours: f64,

    // Batch sizes and budgets
    pub tier0_max_per_run: usize,
    pub tier1_batch_size: usize,
    pub tier1_credit_budget_per_run: u64,
    /// Failed Tier-1 attempts before an entry is discarded (0 = unbounded)
    pub tier1_max_attempts: u32,
    pub auto_promote_max_per_run: usize,
    pub hot_refresh_max_tokens: usize,
    pub hot_refresh_age_hours: f64,

    // Feature flags (scheduled triggers only)
    pub ingest_enabled: bool,
    pub enrich_enabled: bool,
    pub auto_promote_enabled: bool,
    pub hot_refresh_enabled: bool,

    pub tier0_interval_minutes: u64,
    pub tier1_interval_minutes: u64,
    pub promotion_interval_minutes: u64,
    pub hot_refresh_interval_minutes: u64,

    // Scoring
    pub prime_threshold: f64,
    pub monitor_threshold: f64,
    pub score_weights: BTreeMap<String, f64>,

    // Bookkeeping
    pub last_tier0_run_at: Option<i64>,
    pub last_tier1_run_at: Option<i64>,
    pub last_tier1_credits_used: u64,
    pub last_hot_refresh_at: Option<i64>,
    pub last_score_run_at: Option<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mc_min: 10_000.0,
            volume_min: 5_000.0,
            liquidity_min: 5_000.0,
            age_max_hours: 48.0,

            tier0_max_per_run: 50,
            tier1_batch_size: 10,
            tier1_credit_budget_per_run: 100,
            tier1_max_attempts: 5,
            auto_promote_max_per_run: 5,
            hot_refresh_max_tokens: 100,
            hot_refresh_age_hours: 48.0,

            ingest_enabled: false,
            enrich_enabled: false,
            auto_promote_enabled: false,
            hot_refresh_enabled: false,

            tier0_interval_minutes: 60,
            tier1_interval_minutes: 30,
            promotion_interval_minutes: 30,
            hot_refresh_interval_minutes: 60,

            prime_threshold: 65.0,
            monitor_threshold: 40.0,
            score_weights: scoring::default_weights(),

            last_tier0_run_at: None,
            last_tier1_run_at: None,
            last_tier1_credits_used: 0,
            last_hot_refresh_at: None,
            last_score_run_at: None,
        }
    }
}

impl Settings {
    pub fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter {
            mc_min: self.mc_min,
            volume_min: self.volume_min,
            liquidity_min: self.liquidity_min,
            age_max_hours: self.age_max_hours,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidSettings(msg));

        for (name, value) in [
            ("mc_min", self.mc_min),
            ("volume_min", self.volume_min),
            ("liquidity_min", self.liquidity_min),
        ] {
            // Negated so NaN is rejected too
            if !(value >= 0.0) || value.is_infinite() {
                return invalid(format!("{} must be >= 0 (got {})", name, value));
            }
        }

        for (name, value) in [
            ("age_max_hours", self.age_max_hours),
            ("hot_refresh_age_hours", self.hot_refresh_age_hours),
        ] {
            if !(value >= 1.0) || value.is_infinite() {
                return invalid(format!("{} must be >= 1 (got {})", name, value));
            }
        }

        for (name, value) in [
            ("tier0_max_per_run", self.tier0_max_per_run as u64),
            ("tier1_batch_size", self.tier1_batch_size as u64),
            ("tier1_credit_budget_per_run", self.tier1_credit_budget_per_run),
            ("auto_promote_max_per_run", self.auto_promote_max_per_run as u64),
            ("hot_refresh_max_tokens", self.hot_refresh_max_tokens as u64),
        ] {
            if value < 1 {
                return invalid(format!("{} must be >= 1", name));
            }
        }

        for (name, value) in [
            ("tier0_interval_minutes", self.tier0_interval_minutes),
            ("tier1_interval_minutes", self.tier1_interval_minutes),
            ("promotion_interval_minutes", self.promotion_interval_minutes),
            ("hot_refresh_interval_minutes", self.hot_refresh_interval_minutes),
        ] {
            if value < MIN_INTERVAL_MINUTES {
                return invalid(format!(
                    "{} must be >= {} (got {})",
                    name, MIN_INTERVAL_MINUTES, value
                ));
            }
        }

        for (name, value) in [
            ("prime_threshold", self.prime_threshold),
            ("monitor_threshold", self.monitor_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return invalid(format!("{} must be within 0..=100 (got {})", name, value));
            }
        }

        if self.monitor_threshold > self.prime_threshold {
            return invalid(format!(
                "monitor_threshold ({}) must not exceed prime_threshold ({})",
                self.monitor_threshold, self.prime_threshold
            ));
        }

        for (rule, weight) in &self.score_weights {
            if !scoring::is_known_rule(rule) {
                return invalid(format!("unknown score rule: {}", rule));
            }
            if !weight.is_finite() {
                return invalid(format!("weight for {} must be finite", rule));
            }
        }

        Ok(())
    }
}

/// Partial settings update; absent fields keep their current value.
///
/// Bookkeeping fields are not part of this type, so a document naming them is
/// rejected at parse time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsUpdate {
    pub mc_min: Option<f64>,
    pub volume_min: Option<f64>,
    pub liquidity_min: Option<f64>,
    pub age_max_hours: Option<f64>,
    pub tier0_max_per_run: Option<usize>,
    pub tier1_batch_size: Option<usize>,
    pub tier1_credit_budget_per_run: Option<u64>,
    pub tier1_max_attempts: Option<u32>,
    pub auto_promote_max_per_run: Option<usize>,
    pub hot_refresh_max_tokens: Option<usize>,
    pub hot_refresh_age_hours: Option<f64>,
    pub ingest_enabled: Option<bool>,
    pub enrich_enabled: Option<bool>,
    pub auto_promote_enabled: Option<bool>,
    pub hot_refresh_enabled: Option<bool>,
    pub tier0_interval_minutes: Option<u64>,
    pub tier1_interval_minutes: Option<u64>,
    pub promotion_interval_minutes: Option<u64>,
    pub hot_refresh_interval_minutes: Option<u64>,
    pub prime_threshold: Option<f64>,
    pub monitor_threshold: Option<f64>,
    /// Merged key by key into the current weights
    pub score_weights: Option<BTreeMap<String, f64>>,
}

macro_rules! merge_fields {
    ($target:expr, $update:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if let Some(value) = $update.$field {
                $target.$field = value;
            }
        )+
    };
}

impl SettingsUpdate {
    pub fn apply(&self, settings: &mut Settings) {
        merge_fields!(settings, self, [
            mc_min,
            volume_min,
            liquidity_min,
            age_max_hours,
            tier0_max_per_run,
            tier1_batch_size,
            tier1_credit_budget_per_run,
            tier1_max_attempts,
            auto_promote_max_per_run,
            hot_refresh_max_tokens,
            hot_refresh_age_hours,
            ingest_enabled,
            enrich_enabled,
            auto_promote_enabled,
            hot_refresh_enabled,
            tier0_interval_minutes,
            tier1_interval_minutes,
            promotion_interval_minutes,
            hot_refresh_interval_minutes,
            prime_threshold,
            monitor_threshold,
        ]);

        if let Some(weights) = &self.score_weights {
            for (rule, weight) in weights {
                settings.score_weights.insert(rule.clone(), *weight);
            }
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
    clock: Clock,
}

impl SettingsStore {
    pub fn new(db: Database, clock: Clock) -> Self {
        Self { db, clock }
    }

    /// Current settings; defaults if the row was never written
    pub fn load(&self) -> Result<Settings, PipelineError> {
        let conn = self.db.lock();
        load_settings(&conn)
    }

    /// Merge `update` into the stored settings. Nothing is written if the
    /// merged document fails validation.
    pub fn update(&self, update: &SettingsUpdate) -> Result<Settings, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let mut settings = load_settings(&tx)?;
        update.apply(&mut settings);
        settings.validate()?;

        save_settings(&tx, &settings, (self.clock)())?;
        tx.commit()?;

        log::info!("⚙️  Pipeline settings updated");
        Ok(settings)
    }
}

fn load_settings(conn: &Connection) -> Result<Settings, PipelineError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT settings_json FROM pipeline_settings WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Settings::default()),
    }
}

fn save_settings(conn: &Connection, settings: &Settings, now: i64) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO pipeline_settings (id, settings_json, updated_at) VALUES (1, ?1, ?2) \
         ON CONFLICT(id) DO UPDATE SET settings_json = excluded.settings_json, \
         updated_at = excluded.updated_at",
        params![serde_json::to_string(settings)?, now],
    )?;
    Ok(())
}

/// Stamp the last-run field for `kind`. Called by the coordinator inside the
/// transaction that finalises the run.
pub(crate) fn record_run_bookkeeping(
    conn: &Connection,
    kind: RunKind,
    now: i64,
    credits_used: u64,
) -> Result<(), PipelineError> {
    let mut settings = load_settings(conn)?;

    match kind {
        RunKind::Tier0 => settings.last_tier0_run_at = Some(now),
        RunKind::Tier1 => {
            settings.last_tier1_run_at = Some(now);
            settings.last_tier1_credits_used = credits_used;
        }
        RunKind::Promotion => settings.last_score_run_at = Some(now),
        RunKind::HotRefresh => settings.last_hot_refresh_at = Some(now),
        RunKind::Maintenance => return Ok(()),
    }

    save_settings(conn, &settings, now)
}
