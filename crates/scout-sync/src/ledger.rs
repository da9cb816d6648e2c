//! Append-only sync history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{SyncId, SyncRecord, SyncStatus};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("unknown sync {0}")]
    UnknownSync(SyncId),
    #[error("sync {0} already has an outcome")]
    AlreadyFinalized(SyncId),
    #[error("{0} is not a terminal sync status")]
    NotTerminal(SyncStatus),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// Open a `started` record and return its id.
    async fn append_start(&self, league: &str, source_scope: &str) -> Result<SyncId, LedgerError>;

    /// Fill in the terminal fields of a started record. Allowed once per record.
    async fn append_outcome(
        &self,
        id: SyncId,
        status: SyncStatus,
        records_synced: usize,
        error: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Most recent records first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncRecord>, LedgerError>;
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<SyncRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncLedger for MemoryLedger {
    async fn append_start(&self, league: &str, source_scope: &str) -> Result<SyncId, LedgerError> {
        let mut records = self.records.lock().await;
        let id = SyncId(records.len() as i64 + 1);
        records.push(SyncRecord {
            id,
            league: league.to_string(),
            source_scope: source_scope.to_string(),
            status: SyncStatus::Started,
            records_synced: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        });
        Ok(id)
    }

    async fn append_outcome(
        &self,
        id: SyncId,
        status: SyncStatus,
        records_synced: usize,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NotTerminal(status));
        }
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(LedgerError::UnknownSync(id))?;
        if record.completed_at.is_some() {
            return Err(LedgerError::AlreadyFinalized(id));
        }
        record.status = status;
        record.records_synced = records_synced;
        record.error = error.map(str::to_string);
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRecord>, LedgerError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, FromRow)]
struct DbSyncRecord {
    id: i64,
    league: String,
    source_scope: String,
    status: String,
    records_synced: i64,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbSyncRecord> for SyncRecord {
    type Error = LedgerError;

    fn try_from(row: DbSyncRecord) -> Result<Self, Self::Error> {
        Ok(SyncRecord {
            id: SyncId(row.id),
            league: row.league,
            source_scope: row.source_scope,
            status: row.status.parse().map_err(LedgerError::Corrupt)?,
            records_synced: usize::try_from(row.records_synced)
                .map_err(|_| LedgerError::Corrupt(format!("negative count {}", row.records_synced)))?,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// `sync_history` table ledger.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncLedger for PgLedger {
    async fn append_start(&self, league: &str, source_scope: &str) -> Result<SyncId, LedgerError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO sync_history (league, source_scope, status, started_at)
               VALUES ($1, $2, $3, $4)
               RETURNING id"#,
        )
        .bind(league)
        .bind(source_scope)
        .bind(SyncStatus::Started.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(SyncId(id))
    }

    async fn append_outcome(
        &self,
        id: SyncId,
        status: SyncStatus,
        records_synced: usize,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NotTerminal(status));
        }
        let updated = sqlx::query(
            r#"UPDATE sync_history
               SET status = $2, records_synced = $3, error = $4, completed_at = $5
               WHERE id = $1 AND completed_at IS NULL"#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(records_synced as i64)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 1 {
            return Ok(());
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sync_history WHERE id = $1")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        if exists == 0 {
            Err(LedgerError::UnknownSync(id))
        } else {
            Err(LedgerError::AlreadyFinalized(id))
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, DbSyncRecord>(
            r#"SELECT id, league, source_scope, status, records_synced, error, started_at, completed_at
               FROM sync_history
               ORDER BY started_at DESC, id DESC
               LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_outcome_fills_terminal_fields() {
        let ledger = MemoryLedger::new();
        let id = ledger.append_start("MLS", "fbref,transfermarkt").await.unwrap();

        let open = ledger.recent(1).await.unwrap();
        assert_eq!(open[0].status, SyncStatus::Started);
        assert!(open[0].completed_at.is_none());

        ledger
            .append_outcome(id, SyncStatus::Completed, 42, None)
            .await
            .unwrap();
        let closed = &ledger.recent(1).await.unwrap()[0];
        assert_eq!(closed.id, id);
        assert_eq!(closed.status, SyncStatus::Completed);
        assert_eq!(closed.records_synced, 42);
        assert_eq!(closed.source_scope, "fbref,transfermarkt");
        assert!(closed.completed_at.unwrap() >= closed.started_at);
    }

    #[tokio::test]
    async fn outcome_is_accepted_once() {
        let ledger = MemoryLedger::new();
        let id = ledger.append_start("MLS", "all").await.unwrap();
        ledger
            .append_outcome(id, SyncStatus::Failed, 0, Some("boom"))
            .await
            .unwrap();

        let again = ledger.append_outcome(id, SyncStatus::Completed, 3, None).await;
        assert!(matches!(again, Err(LedgerError::AlreadyFinalized(_))));
        let record = &ledger.recent(1).await.unwrap()[0];
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn rejects_unknown_ids_and_non_terminal_status() {
        let ledger = MemoryLedger::new();
        let id = ledger.append_start("MLS", "all").await.unwrap();
        assert!(matches!(
            ledger.append_outcome(SyncId(99), SyncStatus::Completed, 0, None).await,
            Err(LedgerError::UnknownSync(SyncId(99)))
        ));
        assert!(matches!(
            ledger.append_outcome(id, SyncStatus::Started, 0, None).await,
            Err(LedgerError::NotTerminal(SyncStatus::Started))
        ));
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let ledger = MemoryLedger::new();
        for league in ["MLS", "USL Championship", "NWSL"] {
            ledger.append_start(league, "all").await.unwrap();
        }
        let recent = ledger.recent(2).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.league.as_str()).collect::<Vec<_>>(),
            vec!["NWSL", "USL Championship"]
        );
    }
}
