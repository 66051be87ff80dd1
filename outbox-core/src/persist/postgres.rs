//! Postgres 版 Outbox 存储（PgOutboxStore）
//!
//! 表结构见 `migrations/0001_outbox.sql`。认领分三条语句在同一事务内完成：
//! 1. 以 `FOR UPDATE SKIP LOCKED` 锁住有可认领记录的聚合计数器行，
//!    并发投递器因此按聚合互斥，不会在同一聚合上交错认领；
//! 2. 对这些聚合的未终结记录加行锁，等待并发中的标记操作提交；
//! 3. 在新语句中（READ COMMITTED 下看到最新快照）只认领各聚合的"头部连续段"，
//!    UPDATE 自身再次校验可认领条件，行被并发修改时按最新版本重新判断。
//!
use crate::{
    error::{DomainError, DomainResult as Result},
    persist::{
        AggregateState, ClaimRequest, OutboxRecord, OutboxStatus, OutboxStore, StateReader,
        StatusCounts, StoreTransaction, TransactionalStore,
    },
    value_object::{ClaimToken, MessageId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

const CLAIMABLE: &str = "((o.status IN ('pending', 'failed') \
       AND o.claim_token IS NULL AND o.available_at <= $1) \
     OR (o.status = 'claimed' AND o.lease_expires_at < $1))";

/// 基于 sqlx 连接池的存储；克隆共享同一个池
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行内置迁移
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| DomainError::validation(format!("{what} out of range")))
}

#[derive(FromRow)]
struct OutboxRow {
    message_id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    sequence_number: i64,
    event_type: String,
    payload: Value,
    occurred_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    claim_token: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(Self {
            message_id: MessageId::from(row.message_id),
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            sequence_number: u64::try_from(row.sequence_number).map_err(|_| DomainError::Parse {
                reason: format!("negative sequence number {}", row.sequence_number),
            })?,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            claim_token: row.claim_token.map(ClaimToken::from),
            lease_expires_at: row.lease_expires_at,
            available_at: row.available_at,
            dispatched_at: row.dispatched_at,
        })
    }
}

fn into_records(rows: Vec<OutboxRow>) -> Result<Vec<OutboxRecord>> {
    rows.into_iter().map(OutboxRecord::try_from).collect()
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TransactionalStore for PgOutboxStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn save_state(&mut self, state: &AggregateState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_aggregate_state (aggregate_type, aggregate_id, state, is_deleted)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, aggregate_id) DO UPDATE
            SET state = EXCLUDED.state,
                is_deleted = EXCLUDED.is_deleted,
                updated_at = now()
            "#,
        )
        .bind(state.aggregate_type())
        .bind(state.aggregate_id())
        .bind(state.state())
        .bind(state.is_deleted())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn allocate_sequences(
        &mut self,
        aggregate_type: &str,
        aggregate_id: &str,
        count: u64,
    ) -> Result<u64> {
        if count == 0 {
            return Err(DomainError::validation("cannot allocate zero sequence numbers"));
        }

        let last: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_sequences (aggregate_type, aggregate_id, last_sequence)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_type, aggregate_id) DO UPDATE
            SET last_sequence = outbox_sequences.last_sequence + EXCLUDED.last_sequence
            RETURNING last_sequence
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(to_i64(count, "sequence count")?)
        .fetch_one(&mut *self.tx)
        .await?;

        let last = u64::try_from(last).map_err(|_| DomainError::Parse {
            reason: format!("negative sequence counter {last}"),
        })?;
        Ok(last - count + 1)
    }

    async fn insert_outbox(&mut self, records: &[OutboxRecord]) -> Result<()> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO outbox (
                    message_id, aggregate_type, aggregate_id, sequence_number, event_type,
                    payload, occurred_at, status, attempts, available_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9)
                "#,
            )
            .bind(record.message_id.as_uuid())
            .bind(&record.aggregate_type)
            .bind(&record.aggregate_id)
            .bind(to_i64(record.sequence_number, "sequence number")?)
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(record.occurred_at)
            .bind(record.status.as_str())
            .bind(record.available_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl PgOutboxStore {
    async fn update_held(
        &self,
        set_clause: &str,
        message_id: MessageId,
        token: ClaimToken,
        bind_error: Option<&str>,
        bind_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE outbox SET {set_clause}, claim_token = NULL, lease_expires_at = NULL \
             WHERE message_id = $1 AND status = 'claimed' AND claim_token = $2"
        );
        let mut query = sqlx::query(&sql)
            .bind(message_id.as_uuid())
            .bind(token.as_uuid());
        if let Some(error) = bind_error {
            query = query.bind(error);
        }
        if let Some(at) = bind_at {
            query = query.bind(at);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<OutboxRecord>> {
        let batch_size = to_i64(request.batch_size as u64, "batch size")?;
        let mut tx = self.pool.begin().await?;

        let locked: Vec<(String, String)> = sqlx::query_as(&format!(
            r#"
            SELECT s.aggregate_type, s.aggregate_id
            FROM outbox_sequences s
            WHERE EXISTS (
                SELECT 1 FROM outbox o
                WHERE o.aggregate_type = s.aggregate_type
                  AND o.aggregate_id = s.aggregate_id
                  AND {CLAIMABLE}
            )
            ORDER BY s.aggregate_type, s.aggregate_id
            LIMIT $2
            FOR UPDATE OF s SKIP LOCKED
            "#
        ))
        .bind(request.now)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if locked.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let (types, ids): (Vec<String>, Vec<String>) = locked.into_iter().unzip();

        // 持有旧租约的投递器可能正在标记记录；先拿到行锁，让其提交后再判断头部连续段
        sqlx::query(
            r#"
            SELECT o.message_id
            FROM outbox o
            JOIN UNNEST($1::text[], $2::text[]) AS l(aggregate_type, aggregate_id)
              ON l.aggregate_type = o.aggregate_type AND l.aggregate_id = o.aggregate_id
            WHERE o.status NOT IN ('dispatched', 'dead_lettered')
            ORDER BY o.aggregate_type, o.aggregate_id, o.sequence_number
            FOR UPDATE OF o
            "#,
        )
        .bind(&types)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r#"
            WITH locked AS (
                SELECT * FROM UNNEST($2::text[], $3::text[]) AS l(aggregate_type, aggregate_id)
            ),
            ranked AS (
                SELECT o.message_id, o.aggregate_type, o.aggregate_id, o.sequence_number,
                       bool_and({CLAIMABLE}) OVER (
                           PARTITION BY o.aggregate_type, o.aggregate_id
                           ORDER BY o.sequence_number
                       ) AS head_run
                FROM outbox o
                JOIN locked l
                  ON l.aggregate_type = o.aggregate_type AND l.aggregate_id = o.aggregate_id
                WHERE o.status NOT IN ('dispatched', 'dead_lettered')
            ),
            picked AS (
                SELECT message_id FROM ranked
                WHERE head_run
                ORDER BY aggregate_type, aggregate_id, sequence_number
                LIMIT $4
            )
            UPDATE outbox o
            SET status = 'claimed', claim_token = $5, lease_expires_at = $6
            FROM picked p
            WHERE o.message_id = p.message_id
              AND {CLAIMABLE}
            RETURNING o.message_id, o.aggregate_type, o.aggregate_id, o.sequence_number,
                      o.event_type, o.payload, o.occurred_at, o.status, o.attempts,
                      o.last_error, o.claim_token, o.lease_expires_at, o.available_at,
                      o.dispatched_at
            "#
        ))
        .bind(request.now)
        .bind(&types)
        .bind(&ids)
        .bind(batch_size)
        .bind(request.token.as_uuid())
        .bind(request.lease_expires_at())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut records = into_records(rows)?;
        records.sort_by(|a, b| {
            (a.aggregate_key(), a.sequence_number).cmp(&(b.aggregate_key(), b.sequence_number))
        });
        Ok(records)
    }

    async fn mark_dispatched(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_held(
            "status = 'dispatched', dispatched_at = $3",
            message_id,
            token,
            None,
            Some(now),
        )
        .await
    }

    async fn mark_failed(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_held(
            "status = 'failed', attempts = attempts + 1, last_error = $3, available_at = $4",
            message_id,
            token,
            Some(error),
            Some(retry_at),
        )
        .await
    }

    async fn mark_dead_lettered(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
    ) -> Result<bool> {
        self.update_held(
            "status = 'dead_lettered', attempts = attempts + 1, last_error = $3",
            message_id,
            token,
            Some(error),
            None,
        )
        .await
    }

    async fn release(&self, message_id: MessageId, token: ClaimToken) -> Result<bool> {
        self.update_held("status = 'pending'", message_id, token, None, None)
            .await
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', claim_token = NULL, lease_expires_at = NULL
            WHERE message_id IN (
                SELECT message_id FROM outbox
                WHERE status = 'claimed' AND lease_expires_at < $1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'claimed' AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, message_id: MessageId) -> Result<Option<OutboxRecord>> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox WHERE message_id = $1")
            .bind(message_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxRecord::try_from).transpose()
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT * FROM outbox
            WHERE status = 'dead_lettered'
            ORDER BY aggregate_type, aggregate_id, sequence_number
            LIMIT $1
            "#,
        )
        .bind(to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn requeue_dead_lettered(
        &self,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', attempts = 0, last_error = NULL,
                claim_token = NULL, lease_expires_at = NULL, available_at = $2
            WHERE message_id = $1 AND status = 'dead_lettered'
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status: OutboxStatus = status.parse()?;
            counts.set(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE status = 'dispatched' AND dispatched_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StateReader for PgOutboxStore {
    async fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        include_deleted: bool,
    ) -> Result<Option<AggregateState>> {
        let row: Option<(Value, bool, i64)> = sqlx::query_as(
            r#"
            SELECT s.state, s.is_deleted, COALESCE(q.last_sequence, 0)
            FROM outbox_aggregate_state s
            LEFT JOIN outbox_sequences q
              ON q.aggregate_type = s.aggregate_type AND q.aggregate_id = s.aggregate_id
            WHERE s.aggregate_type = $1 AND s.aggregate_id = $2
              AND ($3 OR NOT s.is_deleted)
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(include_deleted)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(state, is_deleted, last_sequence)| {
            AggregateState::builder()
                .aggregate_type(aggregate_type)
                .aggregate_id(aggregate_id)
                .state(state)
                .is_deleted(is_deleted)
                .last_sequence(u64::try_from(last_sequence).unwrap_or(0))
                .build()
        }))
    }
}
