//! Durable event store on PostgreSQL.
//!
//! Every write runs in one transaction that first takes a
//! transaction-scoped advisory lock per aggregate, then reads the current
//! versions and inserts the new rows. The unique constraint on
//! `(aggregate_id, aggregate_type, version)` backs this up against writers
//! that bypass the lock; a violation rolls the transaction back and the
//! whole batch is retried with freshly read versions.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use metrics::counter;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};

use super::{AggregateKey, EventStore, EventStoreError, StoredEvent};
use crate::config::{is_identifier, EventStoreConfig};
use crate::error::{ErrorCode, ModulithError};
use crate::events::{DomainEvent, EventMetadata};

const COLUMNS: &str =
    "id, aggregate_id, aggregate_type, event_type, event_data, metadata, version, occurred_at, stored_at";

/// PostgreSQL-backed [`EventStore`].
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    table: String,
    max_version_retries: u32,
}

impl PostgresEventStore {
    /// Create a store on the default `event_store` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "event_store".to_string(),
            max_version_retries: 3,
        }
    }

    /// Use a different table. The name must be a plain SQL identifier.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, ModulithError> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(ModulithError::new(
                ErrorCode::InvalidConfiguration,
                format!("'{}' is not a valid table name", table),
            ));
        }
        self.table = table;
        Ok(self)
    }

    pub fn with_max_version_retries(mut self, retries: u32) -> Self {
        self.max_version_retries = retries;
        self
    }

    /// Connect using the configuration, creating the schema if configured to.
    pub async fn from_config(config: &EventStoreConfig) -> Result<Self, ModulithError> {
        let pool = crate::db::connect(config).await?;
        let store = Self::new(pool)
            .with_table(config.table.clone())?
            .with_max_version_retries(config.max_version_retries);

        if config.auto_create {
            store.ensure_schema().await?;
        }
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the events table and its indexes if they do not exist.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        let t = &self.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id UUID PRIMARY KEY,
                    aggregate_id TEXT NOT NULL,
                    aggregate_type TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    event_data JSONB NOT NULL,
                    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    version BIGINT NOT NULL CHECK (version >= 1),
                    occurred_at TIMESTAMPTZ NOT NULL,
                    stored_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    CONSTRAINT {t}_aggregate_version_key UNIQUE (aggregate_id, aggregate_type, version)
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS {t}_aggregate_idx ON {t} (aggregate_id, aggregate_type)"),
            format!("CREATE INDEX IF NOT EXISTS {t}_event_type_idx ON {t} (event_type)"),
            format!("CREATE INDEX IF NOT EXISTS {t}_occurred_at_idx ON {t} (occurred_at)"),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| EventStoreError::Schema(format!("{}: {}", t, e)))?;
        }

        info!(table = %t, "Event store schema ready");
        Ok(())
    }

    async fn lock_aggregate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &AggregateKey,
    ) -> Result<(), EventStoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}:{}", self.table, key.aggregate_type, key.aggregate_id))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn read_version(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &AggregateKey,
    ) -> Result<i64, EventStoreError> {
        let version: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(version), 0) FROM {} WHERE aggregate_id = $1 AND aggregate_type = $2",
            self.table
        ))
        .bind(&key.aggregate_id)
        .bind(&key.aggregate_type)
        .fetch_one(&mut **tx)
        .await?;
        Ok(version)
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &StoredEvent,
    ) -> Result<(), EventStoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table
        ))
        .bind(record.id)
        .bind(&record.aggregate_id)
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(&record.event_data)
        .bind(&record.metadata)
        .bind(record.version)
        .bind(record.occurred_at)
        .bind(record.stored_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => EventStoreError::VersionConflict {
                aggregate_id: record.aggregate_id.clone(),
                aggregate_type: record.aggregate_type.clone(),
                version: record.version,
            },
            _ => EventStoreError::Database(e),
        })?;
        Ok(())
    }

    async fn try_store_many(
        &self,
        events: &[DomainEvent],
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self.pool.begin().await?;

        let keys: BTreeSet<AggregateKey> = events.iter().map(AggregateKey::of).collect();
        let mut next: BTreeMap<AggregateKey, i64> = BTreeMap::new();
        for key in keys {
            self.lock_aggregate(&mut tx, &key).await?;
            let version = self.read_version(&mut tx, &key).await?;
            next.insert(key, version);
        }

        let stored_at = Utc::now();
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let version = next.entry(AggregateKey::of(event)).or_insert(0);
            *version += 1;
            records.push(StoredEvent::from_domain(event, *version, metadata, stored_at));
        }

        for record in &records {
            self.insert(&mut tx, record).await?;
        }

        tx.commit().await?;
        Ok(records)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, events, metadata), fields(batch = events.len(), table = %self.table))]
    async fn store_many(
        &self,
        events: &[DomainEvent],
        metadata: &EventMetadata,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0;
        loop {
            match self.try_store_many(events, metadata).await {
                Err(e) if e.is_version_conflict() && attempt < self.max_version_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Version conflict, retrying with fresh versions");
                }
                Ok(records) => {
                    counter!("modulith_events_stored_total", "backend" => "postgres")
                        .increment(records.len() as u64);
                    debug!(count = records.len(), attempt, "Events stored");
                    return Ok(records);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} \
             WHERE aggregate_id = $1 AND ($2::TEXT IS NULL OR aggregate_type = $2) \
             ORDER BY version ASC, stored_at ASC",
            self.table
        );
        Ok(sqlx::query_as::<_, StoredEvent>(&query)
            .bind(aggregate_id)
            .bind(aggregate_type)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_events_from_version(
        &self,
        aggregate_id: &str,
        from_version: i64,
        aggregate_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} \
             WHERE aggregate_id = $1 AND ($2::TEXT IS NULL OR aggregate_type = $2) AND version >= $3 \
             ORDER BY version ASC, stored_at ASC",
            self.table
        );
        Ok(sqlx::query_as::<_, StoredEvent>(&query)
            .bind(aggregate_id)
            .bind(aggregate_type)
            .bind(from_version)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} WHERE event_type = $1 ORDER BY occurred_at ASC, stored_at ASC",
            self.table
        );
        Ok(sqlx::query_as::<_, StoredEvent>(&query)
            .bind(event_type)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_events_by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} WHERE occurred_at >= $1 AND occurred_at <= $2 \
             ORDER BY occurred_at ASC, stored_at ASC",
            self.table
        );
        Ok(sqlx::query_as::<_, StoredEvent>(&query)
            .bind(from.trunc_subsecs(6))
            .bind(to.trunc_subsecs(6))
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_aggregate_version(
        &self,
        aggregate_id: &str,
        aggregate_type: Option<&str>,
    ) -> Result<i64, EventStoreError> {
        let version: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX(version), 0) FROM {} \
             WHERE aggregate_id = $1 AND ($2::TEXT IS NULL OR aggregate_type = $2)",
            self.table
        ))
        .bind(aggregate_id)
        .bind(aggregate_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    async fn get_event_count(&self) -> Result<u64, EventStoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn get_events_paginated(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM {} ORDER BY stored_at ASC, id ASC LIMIT $1 OFFSET $2",
            self.table
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        Ok(sqlx::query_as::<_, StoredEvent>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), EventStoreError> {
        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await?;
        warn!(table = %self.table, "Event store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unsafe_table_name() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/modulith")
            .unwrap();
        assert!(PostgresEventStore::new(pool.clone()).with_table("events; DROP TABLE x").is_err());
        let store = PostgresEventStore::new(pool).with_table("audit_events").unwrap();
        assert_eq!(store.table(), "audit_events");
    }
}
