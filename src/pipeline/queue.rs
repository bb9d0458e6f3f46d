//! Queue Store: one row per token address in `queue_entries`
//!
//! SQL reference: `/sql/00_queue_entries.sql`
//!
//! Every tier-changing write is guarded by a `WHERE tier = ...` clause, so a
//! stale caller can never move an entry backwards or out of `discarded`.
//! Rows are never deleted.

use crate::pipeline::collaborators::Enrichment;
use crate::pipeline::db::Database;
use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{Candidate, MetricSnapshot, QueueEntry, Status, Tier};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discard reason written when the Tier-1 retry cap is hit
pub const RETRY_CAP_REASON: &str = "enrichment retry cap reached";

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 500;

const ENTRY_COLUMNS: &str = "address, token_name, token_symbol, source, tier, status, lineage, \
     last_mc_usd, last_volume_usd, last_liquidity_usd, age_hours, top_holder_share, \
     first_mc_usd, first_liquidity_usd, metrics_updated_at, first_seen_at, \
     ingested_at, enriched_at, analyzed_at, discarded_at, discard_reason, \
     enrich_attempts, last_error";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        address: row.get(0)?,
        token_name: row.get(1)?,
        token_symbol: row.get(2)?,
        source: row.get(3)?,
        tier: row.get(4)?,
        status: row.get(5)?,
        lineage: row.get(6)?,
        snapshot: MetricSnapshot {
            market_cap_usd: row.get(7)?,
            volume_24h_usd: row.get(8)?,
            liquidity_usd: row.get(9)?,
            age_hours: row.get(10)?,
            top_holder_share: row.get(11)?,
        },
        first_mc_usd: row.get(12)?,
        first_liquidity_usd: row.get(13)?,
        metrics_updated_at: row.get(14)?,
        first_seen_at: row.get(15)?,
        ingested_at: row.get(16)?,
        enriched_at: row.get(17)?,
        analyzed_at: row.get(18)?,
        discarded_at: row.get(19)?,
        discard_reason: row.get(20)?,
        enrich_attempts: row.get(21)?,
        last_error: row.get(22)?,
    })
}

/// Result of offering a feed candidate to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Inserted,
    /// Known and still `ingested`: snapshot overwritten
    Updated,
    /// Known in a later tier: left untouched
    Skipped(Tier),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: u32,
    /// The retry cap was reached and the entry was discarded
    pub discarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    Discarded,
    AlreadyDiscarded,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReingestOutcome {
    Reingested { lineage: i64 },
    NotDiscarded(Tier),
    NotFound,
}

/// Filter and pagination for queue reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueQuery {
    pub tier: Option<Tier>,
    pub status: Option<Status>,
    /// Clamped to 1..=500, default 100
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl QueueQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePage {
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
    pub entries: Vec<QueueEntry>,
}

/// Archived lineage from `queue_entry_history`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedEntry {
    pub lineage: i64,
    pub archived_at: i64,
    pub entry: QueueEntry,
}

#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, address: &str) -> Result<Option<QueueEntry>, PipelineError> {
        let conn = self.db.lock();
        Ok(fetch_entry(&conn, address)?)
    }

    /// Insert an unknown address as `ingested`, refresh an `ingested` one in
    /// place, skip anything later (including `discarded`).
    pub fn upsert_discovered(
        &self,
        candidate: &Candidate,
        now: i64,
    ) -> Result<DiscoveryOutcome, PipelineError> {
        let conn = self.db.lock();

        let current: Option<Tier> = conn
            .query_row(
                "SELECT tier FROM queue_entries WHERE address = ?",
                [&candidate.address],
                |row| row.get(0),
            )
            .optional()?;

        let snap = &candidate.snapshot;

        match current {
            None => {
                conn.execute(
                    r#"
                    INSERT INTO queue_entries (
                        address, token_name, token_symbol, source, tier, status, lineage,
                        last_mc_usd, last_volume_usd, last_liquidity_usd, age_hours, top_holder_share,
                        first_mc_usd, first_liquidity_usd, metrics_updated_at,
                        first_seen_at, ingested_at, enrich_attempts
                    ) VALUES (?1, ?2, ?3, ?4, 'ingested', 'pending', 1,
                              ?5, ?6, ?7, ?8, ?9, ?5, ?7, ?10, ?10, ?10, 0)
                    "#,
                    params![
                        candidate.address,
                        candidate.token_name,
                        candidate.token_symbol,
                        candidate.source,
                        snap.market_cap_usd,
                        snap.volume_24h_usd,
                        snap.liquidity_usd,
                        snap.age_hours,
                        snap.top_holder_share,
                        now,
                    ],
                )?;
                Ok(DiscoveryOutcome::Inserted)
            }
            Some(Tier::Ingested) => {
                conn.execute(
                    r#"
                    UPDATE queue_entries SET
                        token_name = COALESCE(?2, token_name),
                        token_symbol = COALESCE(?3, token_symbol),
                        last_mc_usd = COALESCE(?4, last_mc_usd),
                        last_volume_usd = COALESCE(?5, last_volume_usd),
                        last_liquidity_usd = COALESCE(?6, last_liquidity_usd),
                        age_hours = COALESCE(?7, age_hours),
                        top_holder_share = COALESCE(?8, top_holder_share),
                        first_mc_usd = COALESCE(first_mc_usd, ?4),
                        first_liquidity_usd = COALESCE(first_liquidity_usd, ?6),
                        metrics_updated_at = ?9
                    WHERE address = ?1 AND tier = 'ingested'
                    "#,
                    params![
                        candidate.address,
                        candidate.token_name,
                        candidate.token_symbol,
                        snap.market_cap_usd,
                        snap.volume_24h_usd,
                        snap.liquidity_usd,
                        snap.age_hours,
                        snap.top_holder_share,
                        now,
                    ],
                )?;
                Ok(DiscoveryOutcome::Updated)
            }
            Some(tier) => Ok(DiscoveryOutcome::Skipped(tier)),
        }
    }

    /// `ingested` entries, oldest `first_seen_at` first
    pub fn select_for_enrichment(&self, limit: usize) -> Result<Vec<QueueEntry>, PipelineError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE tier = 'ingested' \
             ORDER BY first_seen_at ASC, rowid ASC LIMIT ?",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `ingested → enriched`. Returns false if the entry was no longer `ingested`.
    pub fn mark_enriched(
        &self,
        address: &str,
        enrichment: &Enrichment,
        now: i64,
    ) -> Result<bool, PipelineError> {
        let conn = self.db.lock();
        let snap = &enrichment.snapshot;
        let changed = conn.execute(
            r#"
            UPDATE queue_entries SET
                tier = 'enriched',
                status = 'completed',
                token_name = COALESCE(?2, token_name),
                token_symbol = COALESCE(?3, token_symbol),
                last_mc_usd = COALESCE(?4, last_mc_usd),
                last_volume_usd = COALESCE(?5, last_volume_usd),
                last_liquidity_usd = COALESCE(?6, last_liquidity_usd),
                age_hours = COALESCE(?7, age_hours),
                top_holder_share = COALESCE(?8, top_holder_share),
                first_mc_usd = COALESCE(first_mc_usd, ?4),
                first_liquidity_usd = COALESCE(first_liquidity_usd, ?6),
                metrics_updated_at = ?9,
                enriched_at = ?9,
                last_error = NULL
            WHERE address = ?1 AND tier = 'ingested'
            "#,
            params![
                address,
                enrichment.token_name,
                enrichment.token_symbol,
                snap.market_cap_usd,
                snap.volume_24h_usd,
                snap.liquidity_usd,
                snap.age_hours,
                snap.top_holder_share,
                now,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record a failed Tier-1 call. Tier stays `ingested` unless `max_attempts`
    /// (0 = unbounded) is reached, in which case the entry is discarded.
    pub fn record_enrichment_failure(
        &self,
        address: &str,
        error: &str,
        max_attempts: u32,
        now: i64,
    ) -> Result<FailureOutcome, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE queue_entries SET status = 'failed', last_error = ?2, \
             enrich_attempts = enrich_attempts + 1 \
             WHERE address = ?1 AND tier = 'ingested'",
            params![address, error],
        )?;

        let attempts: u32 = tx
            .query_row(
                "SELECT enrich_attempts FROM queue_entries WHERE address = ?",
                [address],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let discarded = max_attempts > 0 && attempts >= max_attempts;
        if discarded {
            tx.execute(
                "UPDATE queue_entries SET tier = 'discarded', discarded_at = ?2, \
                 discard_reason = ?3 WHERE address = ?1 AND tier = 'ingested'",
                params![address, now, RETRY_CAP_REASON],
            )?;
        }

        tx.commit()?;
        Ok(FailureOutcome {
            attempts,
            discarded,
        })
    }

    pub fn select_promotion_candidates(&self) -> Result<Vec<QueueEntry>, PipelineError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE tier = 'enriched' \
             ORDER BY first_seen_at ASC, rowid ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `enriched → analyzed`. Returns false if the entry was no longer `enriched`.
    pub fn mark_analyzed(&self, address: &str, now: i64) -> Result<bool, PipelineError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE queue_entries SET tier = 'analyzed', status = 'completed', \
             analyzed_at = ?2, last_error = NULL \
             WHERE address = ?1 AND tier = 'enriched'",
            params![address, now],
        )?;
        Ok(changed == 1)
    }

    /// Failed promotion: entry stays `enriched` and remains eligible.
    pub fn record_analysis_failure(&self, address: &str, error: &str) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE queue_entries SET status = 'failed', last_error = ?2 \
             WHERE address = ?1 AND tier = 'enriched'",
            params![address, error],
        )?;
        Ok(())
    }

    /// `analyzed` entries whose metrics are older than `cutoff`, stalest first
    pub fn select_stale_analyzed(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, PipelineError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE tier = 'analyzed' AND metrics_updated_at < ? \
             ORDER BY metrics_updated_at ASC, rowid ASC LIMIT ?",
            ENTRY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff, limit as i64], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Metric-only update of an `analyzed` entry; tier is never touched.
    pub fn refresh_snapshot(
        &self,
        address: &str,
        enrichment: &Enrichment,
        now: i64,
    ) -> Result<bool, PipelineError> {
        let conn = self.db.lock();
        let snap = &enrichment.snapshot;
        let changed = conn.execute(
            r#"
            UPDATE queue_entries SET
                token_name = COALESCE(?2, token_name),
                token_symbol = COALESCE(?3, token_symbol),
                last_mc_usd = COALESCE(?4, last_mc_usd),
                last_volume_usd = COALESCE(?5, last_volume_usd),
                last_liquidity_usd = COALESCE(?6, last_liquidity_usd),
                age_hours = COALESCE(?7, age_hours),
                top_holder_share = COALESCE(?8, top_holder_share),
                metrics_updated_at = ?9,
                last_error = NULL
            WHERE address = ?1 AND tier = 'analyzed'
            "#,
            params![
                address,
                enrichment.token_name,
                enrichment.token_symbol,
                snap.market_cap_usd,
                snap.volume_24h_usd,
                snap.liquidity_usd,
                snap.age_hours,
                snap.top_holder_share,
                now,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn record_refresh_failure(&self, address: &str, error: &str) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE queue_entries SET last_error = ?2 WHERE address = ?1 AND tier = 'analyzed'",
            params![address, error],
        )?;
        Ok(())
    }

    /// Move any non-terminal entry to `discarded`
    pub fn discard(
        &self,
        address: &str,
        reason: &str,
        now: i64,
    ) -> Result<DiscardOutcome, PipelineError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE queue_entries SET tier = 'discarded', status = 'completed', \
             discarded_at = ?2, discard_reason = ?3 \
             WHERE address = ?1 AND tier != 'discarded'",
            params![address, now, reason],
        )?;

        if changed == 1 {
            return Ok(DiscardOutcome::Discarded);
        }

        let exists = conn
            .prepare("SELECT 1 FROM queue_entries WHERE address = ?")?
            .exists([address])?;

        Ok(if exists {
            DiscardOutcome::AlreadyDiscarded
        } else {
            DiscardOutcome::NotFound
        })
    }

    /// Archive a discarded entry and restart it as a fresh `ingested` lineage
    pub fn reingest(&self, address: &str, now: i64) -> Result<ReingestOutcome, PipelineError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let entry = match fetch_entry(&tx, address)? {
            Some(entry) => entry,
            None => return Ok(ReingestOutcome::NotFound),
        };

        if entry.tier != Tier::Discarded {
            return Ok(ReingestOutcome::NotDiscarded(entry.tier));
        }

        tx.execute(
            "INSERT INTO queue_entry_history (address, lineage, entry_json, archived_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![address, entry.lineage, serde_json::to_string(&entry)?, now],
        )?;

        let lineage = entry.lineage + 1;
        tx.execute(
            r#"
            UPDATE queue_entries SET
                tier = 'ingested',
                status = 'pending',
                lineage = ?2,
                first_mc_usd = last_mc_usd,
                first_liquidity_usd = last_liquidity_usd,
                first_seen_at = ?3,
                ingested_at = ?3,
                enriched_at = NULL,
                analyzed_at = NULL,
                discarded_at = NULL,
                discard_reason = NULL,
                enrich_attempts = 0,
                last_error = NULL
            WHERE address = ?1 AND tier = 'discarded'
            "#,
            params![address, lineage, now],
        )?;

        tx.commit()?;
        Ok(ReingestOutcome::Reingested { lineage })
    }

    /// Filtered page ordered by `first_seen_at` descending
    pub fn list(&self, query: &QueueQuery) -> Result<QueuePage, PipelineError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(tier) = query.tier {
            clauses.push("tier = ?");
            values.push(Value::Text(tier.as_str().to_string()));
        }
        if let Some(status) = query.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let limit = query.effective_limit();
        let conn = self.db.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM queue_entries {}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM queue_entries {} ORDER BY first_seen_at DESC, rowid DESC \
             LIMIT {} OFFSET {}",
            ENTRY_COLUMNS, where_sql, limit, query.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values.iter()), row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueuePage {
            total: total as u64,
            limit,
            offset: query.offset,
            entries,
        })
    }

    /// Count per tier; every tier is present, zero if empty
    pub fn counts_by_tier(&self) -> Result<BTreeMap<String, u64>, PipelineError> {
        let mut counts: BTreeMap<String, u64> =
            Tier::ALL.iter().map(|t| (t.to_string(), 0)).collect();
        self.group_counts("tier", &mut counts)?;
        Ok(counts)
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<String, u64>, PipelineError> {
        let mut counts: BTreeMap<String, u64> =
            Status::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        self.group_counts("status", &mut counts)?;
        Ok(counts)
    }

    fn group_counts(
        &self,
        column: &str,
        counts: &mut BTreeMap<String, u64>,
    ) -> Result<(), PipelineError> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {col}, COUNT(*) FROM queue_entries GROUP BY {col}",
            col = column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (key, count) = row?;
            counts.insert(key, count as u64);
        }
        Ok(())
    }

    /// Archived lineages for an address, oldest first
    pub fn history(&self, address: &str) -> Result<Vec<ArchivedEntry>, PipelineError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT lineage, archived_at, entry_json FROM queue_entry_history \
             WHERE address = ? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([address], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut archived = Vec::new();
        for row in rows {
            let (lineage, archived_at, json) = row?;
            archived.push(ArchivedEntry {
                lineage,
                archived_at,
                entry: serde_json::from_str(&json)?,
            });
        }
        Ok(archived)
    }
}

fn fetch_entry(conn: &Connection, address: &str) -> rusqlite::Result<Option<QueueEntry>> {
    let sql = format!("SELECT {} FROM queue_entries WHERE address = ?", ENTRY_COLUMNS);
    conn.query_row(&sql, [address], row_to_entry).optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_database;

    fn candidate(address: &str, mc: f64) -> Candidate {
        Candidate {
            address: address.to_string(),
            token_name: Some(format!("{} token", address)),
            token_symbol: Some(address.to_uppercase()),
            source: "test".to_string(),
            snapshot: MetricSnapshot {
                market_cap_usd: Some(mc),
                volume_24h_usd: Some(20_000.0),
                liquidity_usd: Some(8_000.0),
                age_hours: Some(2.0),
                top_holder_share: None,
            },
        }
    }

    fn enrichment(mc: f64) -> Enrichment {
        Enrichment {
            snapshot: MetricSnapshot {
                market_cap_usd: Some(mc),
                top_holder_share: Some(0.12),
                ..Default::default()
            },
            token_name: None,
            token_symbol: None,
            charges: Vec::new(),
        }
    }

    #[test]
    fn test_upsert_inserts_updates_and_skips() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);

        assert_eq!(
            queue.upsert_discovered(&candidate("mint_a", 10_000.0), 100).unwrap(),
            DiscoveryOutcome::Inserted
        );
        assert_eq!(
            queue.upsert_discovered(&candidate("mint_a", 12_000.0), 200).unwrap(),
            DiscoveryOutcome::Updated
        );

        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Ingested);
        assert_eq!(entry.status, Status::Pending);
        assert_eq!(entry.snapshot.market_cap_usd, Some(12_000.0));
        assert_eq!(entry.first_mc_usd, Some(10_000.0));
        assert_eq!(entry.first_seen_at, 100);
        assert_eq!(entry.ingested_at, Some(100));
        assert_eq!(entry.metrics_updated_at, 200);

        assert!(queue.mark_enriched("mint_a", &enrichment(15_000.0), 300).unwrap());
        assert_eq!(
            queue.upsert_discovered(&candidate("mint_a", 1.0), 400).unwrap(),
            DiscoveryOutcome::Skipped(Tier::Enriched)
        );
        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.snapshot.market_cap_usd, Some(15_000.0));
    }

    #[test]
    fn test_enrichment_selection_is_oldest_first() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);

        queue.upsert_discovered(&candidate("newer", 1.0), 300).unwrap();
        queue.upsert_discovered(&candidate("oldest", 1.0), 100).unwrap();
        queue.upsert_discovered(&candidate("middle", 1.0), 200).unwrap();

        let selected: Vec<_> = queue
            .select_for_enrichment(2)
            .unwrap()
            .into_iter()
            .map(|e| e.address)
            .collect();
        assert_eq!(selected, vec!["oldest", "middle"]);
    }

    #[test]
    fn test_mark_enriched_merges_snapshot() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);
        queue.upsert_discovered(&candidate("mint_a", 10_000.0), 100).unwrap();
        queue.record_enrichment_failure("mint_a", "timeout", 0, 150).unwrap();

        assert!(queue.mark_enriched("mint_a", &enrichment(11_000.0), 200).unwrap());
        assert!(!queue.mark_enriched("mint_a", &enrichment(11_000.0), 250).unwrap());

        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Enriched);
        assert_eq!(entry.status, Status::Completed);
        assert_eq!(entry.enriched_at, Some(200));
        assert_eq!(entry.last_error, None);
        assert_eq!(entry.snapshot.market_cap_usd, Some(11_000.0));
        assert_eq!(entry.snapshot.volume_24h_usd, Some(20_000.0));
        assert_eq!(entry.snapshot.top_holder_share, Some(0.12));
    }

    #[test]
    fn test_enrichment_failure_retry_cap() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);
        queue.upsert_discovered(&candidate("mint_a", 10_000.0), 100).unwrap();

        let first = queue.record_enrichment_failure("mint_a", "boom", 2, 110).unwrap();
        assert_eq!(first, FailureOutcome { attempts: 1, discarded: false });

        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Ingested);
        assert_eq!(entry.status, Status::Failed);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));

        let second = queue.record_enrichment_failure("mint_a", "boom", 2, 120).unwrap();
        assert_eq!(second, FailureOutcome { attempts: 2, discarded: true });

        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Discarded);
        assert_eq!(entry.discarded_at, Some(120));
        assert_eq!(entry.discard_reason.as_deref(), Some(RETRY_CAP_REASON));
    }

    #[test]
    fn test_discard_and_reingest_lineage() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);
        queue.upsert_discovered(&candidate("mint_a", 10_000.0), 100).unwrap();

        assert_eq!(queue.discard("mint_a", "rug", 200).unwrap(), DiscardOutcome::Discarded);
        assert_eq!(
            queue.discard("mint_a", "rug", 210).unwrap(),
            DiscardOutcome::AlreadyDiscarded
        );
        assert_eq!(queue.discard("unknown", "rug", 210).unwrap(), DiscardOutcome::NotFound);

        // Feed sightings don't resurrect a discarded entry
        assert_eq!(
            queue.upsert_discovered(&candidate("mint_a", 50_000.0), 300).unwrap(),
            DiscoveryOutcome::Skipped(Tier::Discarded)
        );

        assert_eq!(
            queue.reingest("mint_a", 400).unwrap(),
            ReingestOutcome::Reingested { lineage: 2 }
        );
        let entry = queue.get("mint_a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Ingested);
        assert_eq!(entry.status, Status::Pending);
        assert_eq!(entry.first_seen_at, 400);
        assert_eq!(entry.discarded_at, None);
        assert_eq!(entry.discard_reason, None);

        let history = queue.history("mint_a").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].lineage, 1);
        assert_eq!(history[0].entry.tier, Tier::Discarded);
        assert_eq!(history[0].entry.discard_reason.as_deref(), Some("rug"));

        assert_eq!(
            queue.reingest("mint_a", 500).unwrap(),
            ReingestOutcome::NotDiscarded(Tier::Ingested)
        );
        assert_eq!(queue.reingest("unknown", 500).unwrap(), ReingestOutcome::NotFound);
    }

    #[test]
    fn test_stale_selection_and_refresh_keeps_tier() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);

        for (addr, seen) in [("a", 100), ("b", 200)] {
            queue.upsert_discovered(&candidate(addr, 10_000.0), seen).unwrap();
            queue.mark_enriched(addr, &enrichment(10_000.0), seen + 1).unwrap();
            queue.mark_analyzed(addr, seen + 2).unwrap();
        }

        let stale = queue.select_stale_analyzed(150, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].address, "a");

        assert!(queue.refresh_snapshot("a", &enrichment(20_000.0), 1_000).unwrap());
        let entry = queue.get("a").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Analyzed);
        assert_eq!(entry.analyzed_at, Some(102));
        assert_eq!(entry.metrics_updated_at, 1_000);
        assert_eq!(entry.snapshot.market_cap_usd, Some(20_000.0));

        // Not analyzed: refresh is a no-op
        queue.upsert_discovered(&candidate("c", 1.0), 300).unwrap();
        assert!(!queue.refresh_snapshot("c", &enrichment(5.0), 1_000).unwrap());
    }

    #[test]
    fn test_list_filters_and_paginates() {
        let (_temp, db) = test_database();
        let queue = QueueStore::new(db);

        for i in 0..5 {
            queue
                .upsert_discovered(&candidate(&format!("mint_{}", i), 1.0), 100 + i)
                .unwrap();
        }
        queue.discard("mint_0", "manual", 200).unwrap();

        let page = queue
            .list(&QueueQuery {
                tier: Some(Tier::Ingested),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].address, "mint_4");
        assert_eq!(page.entries[1].address, "mint_3");

        let page = queue
            .list(&QueueQuery {
                tier: Some(Tier::Ingested),
                limit: Some(2),
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.entries[0].address, "mint_2");

        let page = queue
            .list(&QueueQuery {
                status: Some(Status::Completed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.limit, DEFAULT_PAGE_LIMIT);

        let counts = queue.counts_by_tier().unwrap();
        assert_eq!(counts["ingested"], 4);
        assert_eq!(counts["discarded"], 1);
        assert_eq!(counts["analyzed"], 0);
        assert_eq!(queue.counts_by_status().unwrap()["pending"], 4);
    }

    #[test]
    fn test_query_limit_is_clamped() {
        let query = QueueQuery {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(query.effective_limit(), MAX_PAGE_LIMIT);

        let query = QueueQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(query.effective_limit(), 1);
    }
}
