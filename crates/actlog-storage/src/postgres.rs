//! Postgres-backed event store.

use std::time::Duration;

use actlog_core::{
    EventKind, EventSource, IdempotencyKey, NewEventRecord, Provider, ResourceType,
    StoredEventRecord,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::store::{BulkInsertOutcome, EventFilter, EventStore, StoreError};

const COLUMNS: &str = "id, provider, source, resource_type, resource_id, event_kind, payload, \
                       received_at, delivery_id, event_key";

const MARK_SEEN: &str = "INSERT INTO seen_deliveries (provider, delivery_id) VALUES ($1, $2) \
                         ON CONFLICT DO NOTHING";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Malformed {
                message: err.to_string(),
            },
            _ => StoreError::Unavailable {
                message: err.to_string(),
            },
        }
    }
}

pub async fn connect(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running migrations")
}

#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decoded<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|err: T::Err| StoreError::Malformed {
        message: format!("{column}: {err}"),
    })
}

fn map_row(row: &PgRow) -> Result<StoredEventRecord, StoreError> {
    let resource_type: String = row.try_get("resource_type")?;
    let event_key: Option<String> = row.try_get("event_key")?;
    Ok(StoredEventRecord {
        seq: row.try_get("id")?,
        provider: decoded::<Provider>(row, "provider")?,
        source: decoded::<EventSource>(row, "source")?,
        resource_type: ResourceType::parse_lenient(&resource_type),
        resource_id: row.try_get("resource_id")?,
        kind: decoded::<EventKind>(row, "event_kind")?,
        payload: row.try_get("payload")?,
        received_at: row.try_get::<DateTime<Utc>, _>("received_at")?,
        delivery_id: row.try_get("delivery_id")?,
        event_key: event_key.map(IdempotencyKey::from_raw),
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, record: NewEventRecord) -> Result<StoredEventRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO events
                (provider, source, resource_type, resource_id, event_kind, payload,
                 received_at, delivery_id, event_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(record.provider.as_str())
        .bind(record.source.as_str())
        .bind(record.resource_type.as_str())
        .bind(&record.resource_id)
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(record.received_at)
        .bind(&record.delivery_id)
        .bind(record.event_key.as_str())
        .fetch_one(&self.pool)
        .await?;

        let seq: i64 = row.try_get("id")?;
        Ok(StoredEventRecord::from_new(seq, record))
    }

    async fn bulk_insert(
        &self,
        batch: &[NewEventRecord],
    ) -> Result<BulkInsertOutcome, StoreError> {
        let mut outcome = BulkInsertOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for record in batch {
            // No conflict target: a hit on either unique index is a skipped row.
            let inserted = sqlx::query(
                r#"
                INSERT INTO events
                    (provider, source, resource_type, resource_id, event_kind, payload,
                     received_at, delivery_id, event_key)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(record.provider.as_str())
            .bind(record.source.as_str())
            .bind(record.resource_type.as_str())
            .bind(&record.resource_id)
            .bind(record.kind.as_str())
            .bind(&record.payload)
            .bind(record.received_at)
            .bind(&record.delivery_id)
            .bind(record.event_key.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(_) => outcome.inserted.push(record.event_key.clone()),
                None => {
                    debug!(key = %record.event_key, "bulk row skipped as duplicate");
                    if let Some(delivery_id) = &record.delivery_id {
                        sqlx::query(MARK_SEEN)
                            .bind(record.provider.as_str())
                            .bind(delivery_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    outcome.duplicates += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_by_delivery(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM events WHERE provider = $1 AND delivery_id = $2");
        let row = sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<StoredEventRecord>, StoreError> {
        let mut query: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM events WHERE TRUE"));
        if let Some(provider) = filter.provider {
            query.push(" AND provider = ").push_bind(provider.as_str());
        }
        if let Some(kind) = filter.kind {
            query.push(" AND event_kind = ").push_bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            query.push(" AND received_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            query.push(" AND received_at < ").push_bind(until);
        }
        query
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(map_row).collect()
    }

    async fn exists(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM events WHERE event_key = $1) AS found")
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn find_lost_deliveries(
        &self,
        provider: Provider,
        guids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if guids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT t.guid
              FROM (
                    SELECT guid, MIN(ord) AS ord
                      FROM UNNEST($2::text[]) WITH ORDINALITY AS u(guid, ord)
                     GROUP BY guid
                   ) t
             WHERE NOT EXISTS (
                    SELECT 1 FROM events e
                     WHERE e.provider = $1
                       AND e.delivery_id = t.guid
                   )
               AND NOT EXISTS (
                    SELECT 1 FROM seen_deliveries s
                     WHERE s.provider = $1
                       AND s.delivery_id = t.guid
                   )
             ORDER BY t.ord
            "#,
        )
        .bind(provider.as_str())
        .bind(guids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("guid").map_err(StoreError::from))
            .collect()
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn mark_delivery_seen(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(MARK_SEEN)
            .bind(provider.as_str())
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// These run only against a real database: set `DATABASE_URL` to enable them.
#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::{CanonicalEvent, EventPayload, IssueOpened, RepositoryRef};

    async fn test_store() -> Option<PgEventStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = connect(&url, Duration::from_secs(5)).await.ok()?;
        migrate(&pool).await.ok()?;
        Some(PgEventStore::new(pool))
    }

    fn issue(issue_id: i64) -> CanonicalEvent {
        CanonicalEvent::new(
            Provider::Github,
            Utc::now(),
            RepositoryRef {
                id: 1,
                full_name: "acme/widgets".into(),
            },
            EventPayload::IssueOpened(IssueOpened {
                issue_id,
                number: 1,
                title: "bug".into(),
                author: "octocat".into(),
                html_url: String::new(),
            }),
        )
    }

    fn unique_id() -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }

    #[tokio::test]
    async fn live_and_historical_share_one_identity_space() {
        let Some(store) = test_store().await else {
            return;
        };
        let id = unique_id();
        let event = issue(id);
        let delivery = format!("pg-test-{id}");

        store.save(&event, Some(&delivery)).await.unwrap();
        let err = store
            .save_historical(&event, ResourceType::Issue, &id.to_string())
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        assert!(store.exists(&event.idempotency_key()).await.unwrap());

        let found = store
            .find_by_delivery(Provider::Github, &delivery)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.decode_event().unwrap(), event);

        let lost = store
            .find_lost_deliveries(Provider::Github, &[delivery.clone(), format!("{delivery}-x")])
            .await
            .unwrap();
        assert_eq!(lost, vec![format!("{delivery}-x")]);
    }

    #[tokio::test]
    async fn bulk_insert_skips_conflicts_inside_the_transaction() {
        let Some(store) = test_store().await else {
            return;
        };
        let base = unique_id();
        store.save(&issue(base), None).await.unwrap();
        let batch: Vec<_> = [base, base + 1, base + 2, base + 1]
            .iter()
            .map(|id| NewEventRecord::webhook(&issue(*id), None, Utc::now()).unwrap())
            .collect();
        let outcome = store.bulk_insert(&batch).await.unwrap();
        assert_eq!(outcome.inserted.len(), 2);
        assert_eq!(outcome.duplicates, 2);
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_not_reported_lost() {
        let Some(store) = test_store().await else {
            return;
        };
        let id = unique_id();
        let first = format!("pg-seen-{id}-a");
        let repeat = format!("pg-seen-{id}-b");
        let queued = format!("pg-seen-{id}-c");

        store.save(&issue(id), Some(&first)).await.unwrap();
        assert!(store
            .save(&issue(id), Some(&repeat))
            .await
            .unwrap_err()
            .is_duplicate());
        let record = NewEventRecord::webhook(&issue(id), Some(queued.clone()), Utc::now()).unwrap();
        assert_eq!(store.bulk_insert(&[record]).await.unwrap().duplicates, 1);

        let lost = store
            .find_lost_deliveries(Provider::Github, &[first, repeat, queued])
            .await
            .unwrap();
        assert!(lost.is_empty());
    }
}
