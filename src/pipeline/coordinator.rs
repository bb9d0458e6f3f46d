//! Run Coordinator: single-slot mutual exclusion over every pipeline writer
//!
//! SQL reference: `/sql/03_pipeline_runs.sql`
//!
//! The slot is the `running` row of `pipeline_runs`, so it is shared by every
//! process that opens the same database file. `try_acquire` never waits for
//! the slot: the check and the insert run in one `BEGIN IMMEDIATE`
//! transaction, and while any run is `running` every other request (same kind
//! or not) gets `CoordinatorBusy`. A unique partial index allows at most one
//! `running` row.
//!
//! Releasing a lease finalises its row and stamps the Settings bookkeeping in
//! one transaction.
//!
//! A `running` row whose deadline passed more than one soft-deadline ago is
//! treated as abandoned by a crashed process and failed as `interrupted`.

use crate::pipeline::db::Database;
use crate::pipeline::error::PipelineError;
use crate::pipeline::settings::record_run_bookkeeping;
use crate::pipeline::types::{Clock, RunKind, RunSummary};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEADLINE_EXCEEDED: &str = "soft deadline exceeded";
pub const INTERRUPTED: &str = "interrupted";
pub const LEASE_DROPPED: &str = "lease dropped without release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: i64,
    pub kind: RunKind,
    pub started_at: i64,
}

/// How a released lease was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Finished after its soft deadline; recorded as failed
    TimedOut,
    Failed,
}

/// Row of `pipeline_runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub kind: RunKind,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub deadline_at: i64,
    pub summary: Option<serde_json::Value>,
    pub error: Option<String>,
}

struct CoordinatorInner {
    db: Database,
    clock: Clock,
    soft_deadline_secs: i64,
}

#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RunCoordinator {
    pub fn new(db: Database, clock: Clock, soft_deadline: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                db,
                clock,
                soft_deadline_secs: soft_deadline.as_secs() as i64,
            }),
        }
    }

    /// Take the slot or fail immediately with `CoordinatorBusy`
    pub fn try_acquire(&self, kind: RunKind) -> Result<Lease, PipelineError> {
        let started_at = (self.inner.clock)();
        let deadline_at = started_at + self.inner.soft_deadline_secs;

        let run_id = {
            let mut conn = self.inner.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            expire_abandoned(&tx, started_at, self.inner.soft_deadline_secs)?;

            if let Some(held) = running_run(&tx)? {
                log::info!(
                    "⏭️  {} run refused: {} run #{} is active",
                    kind,
                    held.kind,
                    held.run_id
                );
                return Err(PipelineError::CoordinatorBusy {
                    requested: kind,
                    held: held.kind,
                });
            }

            tx.execute(
                "INSERT INTO pipeline_runs (kind, status, started_at, deadline_at) \
                 VALUES (?1, 'running', ?2, ?3)",
                params![kind, started_at, deadline_at],
            )?;
            let run_id = tx.last_insert_rowid();
            tx.commit()?;
            run_id
        };

        log::debug!("🔒 Lease acquired: {} run #{}", kind, run_id);

        Ok(Lease {
            run_id,
            kind,
            started_at,
            deadline_at,
            clock: self.inner.clock.clone(),
            db: self.inner.db.clone(),
            released: false,
        })
    }

    /// The run holding the slot, in this process or another
    pub fn active_run(&self) -> Result<Option<ActiveRun>, PipelineError> {
        let conn = self.inner.db.lock();
        running_run(&conn)
    }

    /// Fail runs abandoned by a crashed process. Call once at startup.
    ///
    /// Only rows a full soft deadline past their own deadline are touched, so
    /// a live run in another process is left alone.
    pub fn recover_interrupted(&self) -> Result<usize, PipelineError> {
        let conn = self.inner.db.lock();
        expire_abandoned(&conn, (self.inner.clock)(), self.inner.soft_deadline_secs)
    }

    /// Most recent runs first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, PipelineError> {
        let conn = self.inner.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, status, started_at, completed_at, deadline_at, summary_json, error \
             FROM pipeline_runs ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            let (mut record, summary_json) = row?;
            if let Some(json) = summary_json {
                record.summary = Some(serde_json::from_str(&json)?);
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn running_run(conn: &Connection) -> Result<Option<ActiveRun>, PipelineError> {
    let active = conn
        .query_row(
            "SELECT id, kind, started_at FROM pipeline_runs WHERE status = 'running' \
             ORDER BY id LIMIT 1",
            [],
            |row| {
                Ok(ActiveRun {
                    run_id: row.get(0)?,
                    kind: row.get(1)?,
                    started_at: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(active)
}

/// Fail `running` rows whose deadline passed more than `grace_secs` ago
fn expire_abandoned(conn: &Connection, now: i64, grace_secs: i64) -> Result<usize, PipelineError> {
    let expired = conn.execute(
        "UPDATE pipeline_runs SET status = 'failed', completed_at = ?1, error = ?2 \
         WHERE status = 'running' AND deadline_at + ?3 < ?1",
        params![now, INTERRUPTED, grace_secs],
    )?;

    if expired > 0 {
        log::warn!("⚠️  Marked {} abandoned run(s) as interrupted", expired);
    }
    Ok(expired)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(RunRecord, Option<String>)> {
    Ok((
        RunRecord {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            deadline_at: row.get(5)?,
            summary: None,
            error: row.get(7)?,
        },
        row.get(6)?,
    ))
}

/// Exclusive right to mutate the queue for one run
///
/// Release with [`Lease::complete`] or [`Lease::fail`]. A lease that is
/// dropped unreleased is recorded as failed.
pub struct Lease {
    run_id: i64,
    kind: RunKind,
    started_at: i64,
    deadline_at: i64,
    clock: Clock,
    db: Database,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("run_id", &self.run_id)
            .field("kind", &self.kind)
            .field("deadline_at", &self.deadline_at)
            .finish()
    }
}

impl Lease {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn deadline_at(&self) -> i64 {
        self.deadline_at
    }

    /// Checked between entries; an in-flight call is never interrupted.
    pub fn deadline_exceeded(&self) -> bool {
        (self.clock)() > self.deadline_at
    }

    /// Release with a summary. Recorded as failed if the soft deadline passed.
    pub fn complete(mut self, summary: &RunSummary) -> Result<RunOutcome, PipelineError> {
        let summary_json = serde_json::to_string(summary)?;

        let outcome = if self.deadline_exceeded() {
            RunOutcome::TimedOut
        } else {
            RunOutcome::Completed
        };

        match outcome {
            RunOutcome::TimedOut => {
                log::warn!(
                    "⚠️  {} run #{} exceeded its soft deadline, recording as failed",
                    self.kind,
                    self.run_id
                );
                self.finalize("failed", Some(summary_json), Some(DEADLINE_EXCEEDED.to_string()))?;
            }
            _ => self.finalize("completed", Some(summary_json), None)?,
        }

        Ok(outcome)
    }

    /// Release with a run-level error
    pub fn fail(mut self, error: &PipelineError) -> Result<RunOutcome, PipelineError> {
        log::error!("❌ {} run #{} failed: {}", self.kind, self.run_id, error);
        self.finalize("failed", None, Some(error.to_string()))?;
        Ok(RunOutcome::Failed)
    }

    fn finalize(
        &mut self,
        status: &str,
        summary_json: Option<String>,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        self.released = true;
        let result = self.write_release(status, summary_json, error);
        log::debug!("🔓 Lease released: {} run #{} ({})", self.kind, self.run_id, status);
        result
    }

    fn write_release(
        &self,
        status: &str,
        summary_json: Option<String>,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        let now = (self.clock)();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE pipeline_runs SET status = ?2, completed_at = ?3, summary_json = ?4, error = ?5 \
             WHERE id = ?1 AND status = 'running'",
            params![self.run_id, status, now, summary_json, error],
        )?;
        if updated == 0 {
            log::warn!(
                "⚠️  {} run #{} was already marked interrupted; keeping that record",
                self.kind,
                self.run_id
            );
        }

        let credits: i64 = tx.query_row(
            "SELECT COALESCE(SUM(credits), 0) FROM credit_ledger WHERE run_id = ?",
            [self.run_id],
            |row| row.get(0),
        )?;
        record_run_bookkeeping(&tx, self.kind, now, credits as u64)?;

        tx.commit()?;
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "⚠️  {} run #{} lease dropped without release",
            self.kind,
            self.run_id
        );
        if let Err(e) = self.finalize("failed", None, Some(LEASE_DROPPED.to_string())) {
            log::error!("❌ Failed to record dropped lease #{}: {}", self.run_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::test_database;
    use crate::pipeline::settings::SettingsStore;
    use crate::pipeline::types::{Tier0Summary, Tier1Summary};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn coordinator() -> (tempfile::NamedTempFile, Database, Arc<AtomicI64>, RunCoordinator) {
        let (temp, db) = test_database();
        let now = Arc::new(AtomicI64::new(1_000));
        let clock_now = now.clone();
        let clock: Clock = Arc::new(move || clock_now.load(Ordering::SeqCst));
        let coordinator = RunCoordinator::new(db.clone(), clock, Duration::from_secs(60));
        (temp, db, now, coordinator)
    }

    fn settings(db: &Database) -> crate::pipeline::settings::Settings {
        SettingsStore::new(db.clone(), Arc::new(|| 0)).load().unwrap()
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let (_temp, _db, _now, coordinator) = coordinator();

        let lease = coordinator.try_acquire(RunKind::Tier1).unwrap();

        for kind in [RunKind::Tier1, RunKind::Tier0, RunKind::Maintenance] {
            match coordinator.try_acquire(kind) {
                Err(PipelineError::CoordinatorBusy { requested, held }) => {
                    assert_eq!(requested, kind);
                    assert_eq!(held, RunKind::Tier1);
                }
                other => panic!("expected busy, got {:?}", other),
            }
        }

        lease
            .complete(&Tier1Summary::default().into())
            .unwrap();
        assert!(coordinator.active_run().unwrap().is_none());
        assert!(coordinator.try_acquire(RunKind::Tier0).is_ok());
    }

    #[test]
    fn test_complete_stamps_bookkeeping_and_history() {
        let (_temp, db, now, coordinator) = coordinator();

        let lease = coordinator.try_acquire(RunKind::Tier0).unwrap();
        let run_id = lease.run_id();
        now.store(1_010, Ordering::SeqCst);

        let summary = Tier0Summary {
            run_id,
            new: 2,
            ..Default::default()
        };
        assert_eq!(lease.complete(&summary.into()).unwrap(), RunOutcome::Completed);

        assert_eq!(settings(&db).last_tier0_run_at, Some(1_010));

        let runs = coordinator.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].kind, RunKind::Tier0);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].started_at, 1_000);
        assert_eq!(runs[0].completed_at, Some(1_010));
        assert_eq!(runs[0].summary.as_ref().unwrap()["new"], 2);
    }

    #[test]
    fn test_late_completion_is_recorded_as_failed() {
        let (_temp, db, now, coordinator) = coordinator();

        let lease = coordinator.try_acquire(RunKind::HotRefresh).unwrap();
        assert!(!lease.deadline_exceeded());
        now.store(1_061, Ordering::SeqCst);
        assert!(lease.deadline_exceeded());

        let outcome = lease
            .complete(&crate::pipeline::types::RefreshSummary::default().into())
            .unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);

        let run = &coordinator.recent_runs(1).unwrap()[0];
        assert_eq!(run.status, "failed");
        assert_eq!(run.error.as_deref(), Some(DEADLINE_EXCEEDED));
        assert!(run.summary.is_some());
        assert_eq!(settings(&db).last_hot_refresh_at, Some(1_061));
    }

    #[test]
    fn test_fail_and_dropped_lease() {
        let (_temp, _db, _now, coordinator) = coordinator();

        let lease = coordinator.try_acquire(RunKind::Tier0).unwrap();
        lease
            .fail(&PipelineError::FeedUnavailable("all pages failed".to_string()))
            .unwrap();

        {
            let _lease = coordinator.try_acquire(RunKind::Promotion).unwrap();
        }
        assert!(coordinator.active_run().unwrap().is_none());

        let runs = coordinator.recent_runs(10).unwrap();
        assert_eq!(runs[0].kind, RunKind::Promotion);
        assert_eq!(runs[0].error.as_deref(), Some(LEASE_DROPPED));
        assert_eq!(runs[1].status, "failed");
        assert!(runs[1].error.as_deref().unwrap().contains("all pages failed"));
    }

    #[test]
    fn test_recover_interrupted_runs() {
        let (_temp, db, _now, coordinator) = coordinator();
        db.lock()
            .execute(
                "INSERT INTO pipeline_runs (kind, status, started_at, deadline_at) \
                 VALUES ('tier1', 'running', 10, 70)",
                [],
            )
            .unwrap();

        assert_eq!(coordinator.recover_interrupted().unwrap(), 1);
        assert_eq!(coordinator.recover_interrupted().unwrap(), 0);

        let run = &coordinator.recent_runs(1).unwrap()[0];
        assert_eq!(run.status, "failed");
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED));
    }

    #[test]
    fn test_tier1_credits_come_from_ledger() {
        use crate::pipeline::ledger::{CreditLedger, CreditOperation, NewLedgerEntry};

        let (_temp, db, _now, coordinator) = coordinator();
        let ledger = CreditLedger::new(db.clone(), Arc::new(|| 1_000));

        let lease = coordinator.try_acquire(RunKind::Tier1).unwrap();
        for _ in 0..3 {
            ledger
                .append(&NewLedgerEntry::new(CreditOperation::Enrichment, 2).run(lease.run_id()))
                .unwrap();
        }
        lease.complete(&Tier1Summary::default().into()).unwrap();

        assert_eq!(settings(&db).last_tier1_credits_used, 6);
    }

    #[test]
    fn test_slot_is_shared_between_connections() {
        let (temp, _db, now, first) = coordinator();
        let other_db = Database::open(temp.path().to_str().unwrap(), "sql").unwrap();
        let clock_now = now.clone();
        let second = RunCoordinator::new(
            other_db,
            Arc::new(move || clock_now.load(Ordering::SeqCst)),
            Duration::from_secs(60),
        );

        let lease = first.try_acquire(RunKind::Tier1).unwrap();
        match second.try_acquire(RunKind::Tier1) {
            Err(PipelineError::CoordinatorBusy { held, .. }) => assert_eq!(held, RunKind::Tier1),
            other => panic!("expected busy, got {:?}", other),
        }
        assert_eq!(
            second.active_run().unwrap().map(|a| a.run_id),
            Some(lease.run_id())
        );

        // Past its deadline but within the grace period: still live
        now.store(1_100, Ordering::SeqCst);
        assert_eq!(second.recover_interrupted().unwrap(), 0);
        assert_eq!(second.recent_runs(1).unwrap()[0].status, "running");

        lease.complete(&Tier1Summary::default().into()).unwrap();

        let next = second.try_acquire(RunKind::Tier0).unwrap();
        assert!(first.try_acquire(RunKind::Tier0).unwrap_err().is_busy());
        next.complete(&Tier0Summary::default().into()).unwrap();
        assert!(first.active_run().unwrap().is_none());
    }

    #[test]
    fn test_abandoned_run_is_expired_on_acquire() {
        let (_temp, db, now, coordinator) = coordinator();
        db.lock()
            .execute(
                "INSERT INTO pipeline_runs (kind, status, started_at, deadline_at) \
                 VALUES ('tier1', 'running', 990, 1050)",
                [],
            )
            .unwrap();

        // Within deadline + grace the row still holds the slot
        assert!(coordinator.try_acquire(RunKind::Tier0).unwrap_err().is_busy());

        now.store(1_111, Ordering::SeqCst);
        let lease = coordinator.try_acquire(RunKind::Tier0).unwrap();

        let runs = coordinator.recent_runs(2).unwrap();
        assert_eq!(runs[0].id, lease.run_id());
        assert_eq!(runs[1].status, "failed");
        assert_eq!(runs[1].error.as_deref(), Some(INTERRUPTED));
        lease.complete(&Tier0Summary::default().into()).unwrap();
    }

    #[test]
    fn test_release_keeps_interrupted_record() {
        let (temp, _db, now, first) = coordinator();
        let lease = first.try_acquire(RunKind::Tier1).unwrap();

        let other_db = Database::open(temp.path().to_str().unwrap(), "sql").unwrap();
        let clock_now = now.clone();
        let second = RunCoordinator::new(
            other_db,
            Arc::new(move || clock_now.load(Ordering::SeqCst)),
            Duration::from_secs(60),
        );

        now.store(1_200, Ordering::SeqCst);
        assert_eq!(second.recover_interrupted().unwrap(), 1);

        lease.complete(&Tier1Summary::default().into()).unwrap();
        let run = &first.recent_runs(1).unwrap()[0];
        assert_eq!(run.status, "failed");
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED));
    }
}
