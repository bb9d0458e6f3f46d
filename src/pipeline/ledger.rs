//! Credit Ledger: append-only log of metered API operations
//!
//! SQL reference: `/sql/02_credit_ledger.sql` (UPDATE/DELETE abort via triggers)
//!
//! The ledger is the only source of truth for what a run has spent; summaries
//! are checked against `total_for_run`.

use crate::pipeline::db::Database;
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::Clock;
use chrono::NaiveDate;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOperation {
    Enrichment,
    HotRefresh,
    TokenAnalysis,
    TokenMetadata,
    TopHoldersFetch,
}

impl CreditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditOperation::Enrichment => "enrichment",
            CreditOperation::HotRefresh => "hot_refresh",
            CreditOperation::TokenAnalysis => "token_analysis",
            CreditOperation::TokenMetadata => "token_metadata",
            CreditOperation::TopHoldersFetch => "top_holders_fetch",
        }
    }
}

/// Credits charged by one metered call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCharge {
    pub operation: CreditOperation,
    pub credits: u64,
}

impl CreditCharge {
    pub fn new(operation: CreditOperation, credits: u64) -> Self {
        Self { operation, credits }
    }
}

/// Sum of a list of charges
pub fn total_charged(charges: &[CreditCharge]) -> u64 {
    charges.iter().map(|c| c.credits).sum()
}

/// Run summary checked against the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Matches,
    Mismatch { recorded: u64 },
    /// The ledger could not be read
    Unavailable(String),
}

/// Entry to append
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub run_id: Option<i64>,
    pub operation: CreditOperation,
    pub credits: u64,
    pub address: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl NewLedgerEntry {
    pub fn new(operation: CreditOperation, credits: u64) -> Self {
        Self {
            run_id: None,
            operation,
            credits,
            address: None,
            context: BTreeMap::new(),
        }
    }

    pub fn run(mut self, run_id: i64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stored ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub run_id: Option<i64>,
    pub operation: String,
    pub credits: u64,
    pub address: Option<String>,
    pub context: BTreeMap<String, String>,
    pub created_at: i64,
}

/// Aggregated spend over a period
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditUsage {
    pub total_credits: u64,
    pub transaction_count: u64,
    pub by_operation: BTreeMap<String, u64>,
    pub period_start: i64,
    pub period_end: i64,
}

#[derive(Clone)]
pub struct CreditLedger {
    db: Database,
    clock: Clock,
}

impl CreditLedger {
    pub fn new(db: Database, clock: Clock) -> Self {
        Self { db, clock }
    }

    /// Append one entry; returns its id
    pub fn append(&self, entry: &NewLedgerEntry) -> Result<i64, PipelineError> {
        let context_json = if entry.context.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&entry.context)?)
        };

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO credit_ledger (run_id, operation, credits, address, context_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.run_id,
                entry.operation.as_str(),
                entry.credits as i64,
                entry.address,
                context_json,
                (self.clock)(),
            ],
        )?;

        log::debug!(
            "💳 Ledger: {} credits for {} ({})",
            entry.credits,
            entry.operation.as_str(),
            entry.address.as_deref().unwrap_or("-")
        );

        Ok(conn.last_insert_rowid())
    }

    pub fn total_for_run(&self, run_id: i64) -> Result<u64, PipelineError> {
        let conn = self.db.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(credits), 0) FROM credit_ledger WHERE run_id = ?",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Compare a summary's credit count with what the ledger holds for the run
    pub fn reconcile_run(&self, run_id: i64, summary_credits: u64) -> Reconciliation {
        match self.total_for_run(run_id) {
            Ok(recorded) if recorded == summary_credits => Reconciliation::Matches,
            Ok(recorded) => Reconciliation::Mismatch { recorded },
            Err(e) => Reconciliation::Unavailable(e.to_string()),
        }
    }

    /// Spend in `[start, end)`, broken down by operation
    pub fn usage_between(&self, start: i64, end: i64) -> Result<CreditUsage, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT operation, COALESCE(SUM(credits), 0), COUNT(*) FROM credit_ledger \
             WHERE created_at >= ?1 AND created_at < ?2 GROUP BY operation",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut usage = CreditUsage {
            period_start: start,
            period_end: end,
            ..Default::default()
        };
        for row in rows {
            let (operation, credits, count) = row?;
            usage.total_credits += credits as u64;
            usage.transaction_count += count as u64;
            usage.by_operation.insert(operation, credits as u64);
        }
        Ok(usage)
    }

    /// Spend since `start` up to now
    pub fn usage_since(&self, start: i64) -> Result<CreditUsage, PipelineError> {
        self.usage_between(start, (self.clock)() + 1)
    }

    /// Spend on a UTC calendar day
    pub fn daily_usage(&self, day: NaiveDate) -> Result<CreditUsage, PipelineError> {
        let start = day
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| PipelineError::Config(format!("invalid date: {}", day)))?;
        self.usage_between(start, start + 86_400)
    }

    /// Spend on the current UTC day
    pub fn today_usage(&self) -> Result<CreditUsage, PipelineError> {
        let today = chrono::DateTime::from_timestamp((self.clock)(), 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| PipelineError::Config("clock out of range".to_string()))?;
        self.daily_usage(today)
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, operation, credits, address, context_json, created_at \
             FROM credit_ledger ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_raw)?;

        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, context_json) = row?;
            if let Some(json) = context_json {
                entry.context = serde_json::from_str(&json)?;
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<(LedgerEntry, Option<String>)> {
    Ok((
        LedgerEntry {
            id: row.get(0)?,
            run_id: row.get(1)?,
            operation: row.get(2)?,
            credits: row.get::<_, i64>(3)? as u64,
            address: row.get(4)?,
            context: BTreeMap::new(),
            created_at: row.get(6)?,
        },
        row.get(5)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_database;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    // 2024-03-10 12:00:00 UTC
    const NOON: i64 = 1_710_072_000;

    fn ledger_at(now: Arc<AtomicI64>) -> (tempfile::NamedTempFile, CreditLedger) {
        let (temp, db) = test_database();
        let clock: Clock = Arc::new(move || now.load(Ordering::SeqCst));
        (temp, CreditLedger::new(db, clock))
    }

    #[test]
    fn test_append_and_run_totals() {
        let now = Arc::new(AtomicI64::new(NOON));
        let (_temp, ledger) = ledger_at(now);

        ledger
            .append(
                &NewLedgerEntry::new(CreditOperation::Enrichment, 2)
                    .run(1)
                    .address("mint_a")
                    .context("calls", "getAsset,getTokenLargestAccounts"),
            )
            .unwrap();
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 1).run(1))
            .unwrap();
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::HotRefresh, 5).run(2))
            .unwrap();

        assert_eq!(ledger.total_for_run(1).unwrap(), 3);
        assert_eq!(ledger.total_for_run(2).unwrap(), 5);
        assert_eq!(ledger.total_for_run(99).unwrap(), 0);

        let recent = ledger.recent(10).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].operation, "hot_refresh");
        assert_eq!(recent[2].address.as_deref(), Some("mint_a"));
        assert_eq!(
            recent[2].context.get("calls").map(String::as_str),
            Some("getAsset,getTokenLargestAccounts")
        );
    }

    #[test]
    fn test_ledger_rejects_update_and_delete() {
        let now = Arc::new(AtomicI64::new(NOON));
        let (_temp, ledger) = ledger_at(now);
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 2))
            .unwrap();

        let conn = ledger.db.lock();
        assert!(conn.execute("UPDATE credit_ledger SET credits = 0", []).is_err());
        assert!(conn.execute("DELETE FROM credit_ledger", []).is_err());
    }

    #[test]
    fn test_daily_usage_breakdown() {
        let now = Arc::new(AtomicI64::new(NOON - 86_400));
        let (_temp, ledger) = ledger_at(now.clone());

        // Yesterday
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 10))
            .unwrap();

        now.store(NOON, Ordering::SeqCst);
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 2))
            .unwrap();
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 2))
            .unwrap();
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::TokenAnalysis, 7))
            .unwrap();

        let today = ledger.today_usage().unwrap();
        assert_eq!(today.total_credits, 11);
        assert_eq!(today.transaction_count, 3);
        assert_eq!(today.by_operation["enrichment"], 4);
        assert_eq!(today.by_operation["token_analysis"], 7);

        let since = ledger.usage_since(NOON - 86_400).unwrap();
        assert_eq!(since.total_credits, 21);
    }

    #[test]
    fn test_reconcile_run() {
        let (_temp, db) = test_database();
        let ledger = CreditLedger::new(db.clone(), Arc::new(|| NOON));

        ledger
            .append(&NewLedgerEntry::new(CreditOperation::TokenMetadata, 1).run(4))
            .unwrap();
        ledger
            .append(&NewLedgerEntry::new(CreditOperation::TopHoldersFetch, 1).run(4))
            .unwrap();

        assert_eq!(ledger.reconcile_run(4, 2), Reconciliation::Matches);
        assert_eq!(
            ledger.reconcile_run(4, 3),
            Reconciliation::Mismatch { recorded: 2 }
        );

        db.lock().execute_batch("DROP TABLE credit_ledger").unwrap();
        assert!(matches!(
            ledger.reconcile_run(4, 2),
            Reconciliation::Unavailable(_)
        ));
    }

    #[test]
    fn test_total_charged() {
        let charges = [
            CreditCharge::new(CreditOperation::TokenMetadata, 1),
            CreditCharge::new(CreditOperation::TopHoldersFetch, 2),
        ];
        assert_eq!(total_charged(&charges), 3);
        assert_eq!(total_charged(&[]), 0);
    }
}
