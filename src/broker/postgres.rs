use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::Instant;

use super::{Broker, EntryId, Fields, StreamEntry};
use crate::error::BrokerError;

/// Broker backed by PostgreSQL tables, for agents running as separate processes.
///
/// Blocking reads are bounded polls at `poll_interval`.
pub struct PostgresBroker {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresBroker {
    pub async fn connect(database_url: &str) -> Result<Self, BrokerError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run_migrations(&self) -> Result<(), BrokerError> {
        sqlx::raw_sql(include_str!("../../migrations/V001__broker_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn decode_entry(stream: &str, row: &PgRow) -> Result<StreamEntry, BrokerError> {
        let id: i64 = row.try_get("id")?;
        let raw: serde_json::Value = row.try_get("fields")?;
        let fields: Fields = serde_json::from_value(raw)
            .map_err(|e| BrokerError::malformed(stream, id, e.to_string()))?;
        Ok(StreamEntry {
            id: id as EntryId,
            fields,
        })
    }

    async fn fetch_after(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, fields
            FROM broker_entries
            WHERE stream = $1 AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(after.unwrap_or(0) as i64)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Self::decode_entry(stream, r)).collect()
    }

    async fn deliver_to_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT last_delivered
            FROM broker_groups
            WHERE stream = $1 AND group_name = $2
            FOR UPDATE
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BrokerError::Misconfigured(format!("no group {} on {}", group, stream)))?;
        let last_delivered: i64 = row.try_get("last_delivered")?;

        let rows = sqlx::query(
            r#"
            SELECT id, fields
            FROM broker_entries
            WHERE stream = $1 AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(last_delivered)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let entries = rows
            .iter()
            .map(|r| Self::decode_entry(stream, r))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(last) = entries.last() {
            sqlx::query(
                r#"
                UPDATE broker_groups
                SET last_delivered = $3
                WHERE stream = $1 AND group_name = $2
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(last.id as i64)
            .execute(&mut *tx)
            .await?;

            for entry in &entries {
                sqlx::query(
                    r#"
                    INSERT INTO broker_pending (stream, group_name, entry_id, consumer, delivered_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (stream, group_name, entry_id)
                    DO UPDATE SET consumer = EXCLUDED.consumer, delivered_at = NOW()
                    "#,
                )
                .bind(stream)
                .bind(group)
                .bind(entry.id as i64)
                .bind(consumer)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(entries)
    }

    /// Sleeps one poll step; false once the wait budget is spent.
    async fn poll_step(&self, remaining: Duration) -> bool {
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(self.poll_interval.min(remaining)).await;
        true
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO broker_entries (stream, id, fields, created_at)
            SELECT $1, COALESCE(MAX(id), 0) + 1, $2, NOW()
            FROM broker_entries
            WHERE stream = $1
            RETURNING id
            "#,
        )
        .bind(stream)
        .bind(serde_json::to_value(&fields)?)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let id: i64 = row.try_get("id")?;
        Ok(id as EntryId)
    }

    async fn range(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.fetch_after(stream, after, count).await
    }

    async fn read_blocking(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let entries = self.fetch_after(stream, after, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if !self
                .poll_step(deadline.saturating_duration_since(Instant::now()))
                .await
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM broker_entries WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO broker_groups (stream, group_name, last_delivered)
            VALUES ($1, $2, 0)
            ON CONFLICT (stream, group_name) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let entries = self.deliver_to_group(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if !self
                .poll_step(deadline.saturating_duration_since(Instant::now()))
                .await
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.fields
            FROM broker_pending p
            JOIN broker_entries e ON e.stream = p.stream AND e.id = p.entry_id
            WHERE p.stream = $1 AND p.group_name = $2 AND p.consumer = $3
            ORDER BY e.id
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Self::decode_entry(stream, r)).collect()
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            DELETE FROM broker_pending
            WHERE stream = $1 AND group_name = $2 AND entry_id = $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO broker_records (key, fields, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET fields = broker_records.fields || EXCLUDED.fields, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(serde_json::to_value(&fields)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
        let row = sqlx::query("SELECT fields FROM broker_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let raw: serde_json::Value = r.try_get("fields")?;
                let fields = serde_json::from_value(raw)
                    .map_err(|e| BrokerError::malformed(key, "record", e.to_string()))?;
                Ok(Some(fields))
            }
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO broker_sets (key, member)
            VALUES ($1, $2)
            ON CONFLICT (key, member) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, BrokerError> {
        let result = sqlx::query("DELETE FROM broker_sets WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let rows = sqlx::query("SELECT member FROM broker_sets WHERE key = $1 ORDER BY member")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("member").map_err(BrokerError::from))
            .collect()
    }
}
