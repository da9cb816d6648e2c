//! Idempotent canonical record upsert.

use std::collections::BTreeMap;

use async_trait::async_trait;
use scout_core::CanonicalRecord;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("record {id} rejected: {reason}")]
    Rejected { id: Uuid, reason: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Storage boundary for canonical records. Writing the same id twice must leave one row.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    rows: Mutex<BTreeMap<Uuid, CanonicalRecord>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn get(&self, id: &Uuid) -> Option<CanonicalRecord> {
        self.rows.lock().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<CanonicalRecord> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PersistenceError> {
        if record.name.is_empty() {
            return Err(PersistenceError::Rejected {
                id: record.id,
                reason: "empty name".to_string(),
            });
        }
        self.rows.lock().await.insert(record.id, record.clone());
        Ok(())
    }
}

/// `players` table gateway; the latest sync overwrites every column.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PersistenceError> {
        if record.name.is_empty() {
            return Err(PersistenceError::Rejected {
                id: record.id,
                reason: "empty name".to_string(),
            });
        }
        let sources = record.sources.iter().cloned().collect::<Vec<_>>();
        sqlx::query(
            r#"INSERT INTO players
                 (id, league, name, club, external_ids, attributes, market_value, rating, sources, last_updated)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (id) DO UPDATE SET
                 league = EXCLUDED.league,
                 name = EXCLUDED.name,
                 club = EXCLUDED.club,
                 external_ids = EXCLUDED.external_ids,
                 attributes = EXCLUDED.attributes,
                 market_value = EXCLUDED.market_value,
                 rating = EXCLUDED.rating,
                 sources = EXCLUDED.sources,
                 last_updated = EXCLUDED.last_updated"#,
        )
        .bind(record.id)
        .bind(&record.league)
        .bind(&record.name)
        .bind(record.club.as_deref())
        .bind(Json(&record.external_ids))
        .bind(Json(&record.attributes))
        .bind(record.market_value)
        .bind(record.rating)
        .bind(&sources)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scout_core::canonical_record_id;
    use std::collections::BTreeSet;

    fn record(name: &str, market_value: Option<f64>) -> CanonicalRecord {
        CanonicalRecord {
            id: canonical_record_id(name, "FC X", "MLS"),
            league: "MLS".into(),
            name: name.into(),
            club: Some("FC X".into()),
            external_ids: BTreeMap::new(),
            attributes: BTreeMap::new(),
            market_value,
            rating: None,
            sources: BTreeSet::from(["fbref".to_string()]),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn same_id_upserts_to_one_row_latest_wins() {
        let gateway = MemoryGateway::new();
        gateway.upsert(&record("John Smith", Some(100.0))).await.unwrap();
        gateway.upsert(&record("John Smith", Some(250.0))).await.unwrap();

        assert_eq!(gateway.len().await, 1);
        let id = canonical_record_id("John Smith", "FC X", "MLS");
        assert_eq!(gateway.get(&id).await.unwrap().market_value, Some(250.0));
    }

    #[tokio::test]
    async fn nameless_records_are_rejected() {
        let gateway = MemoryGateway::new();
        let err = gateway.upsert(&record("", None)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Rejected { .. }));
        assert!(gateway.is_empty().await);
    }
}
