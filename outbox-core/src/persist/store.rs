//! 存储协议
//!
//! - `TransactionalStore`/`StoreTransaction`：提交管道在单个原子事务中写入状态与 Outbox 记录；
//! - `OutboxStore`：投递器一侧的认领与状态推进，全部为以 `status`/`claim_token` 为条件的更新；
//! - `StateReader`：读取业务状态，软删除谓词由调用方显式给出。
//!
use crate::{
    error::DomainResult as Result,
    persist::{AggregateState, OutboxRecord, OutboxStatus},
    value_object::{ClaimToken, MessageId},
};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};

/// 可开启原子事务的存储
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// 一次原子事务。
///
/// 丢弃未提交的事务等价于回滚：状态变更与 Outbox 记录要么一起落盘，要么都不存在。
#[async_trait]
pub trait StoreTransaction: Send {
    /// 写入（插入或覆盖）业务状态
    async fn save_state(&mut self, state: &AggregateState) -> Result<()>;

    /// 为聚合原子地分配 `count` 个连续序列号，返回第一个。
    ///
    /// 计数器按聚合隔离，争用只发生在同一聚合内。
    async fn allocate_sequences(
        &mut self,
        aggregate_type: &str,
        aggregate_id: &str,
        count: u64,
    ) -> Result<u64>;

    /// 批量插入 Outbox 记录；违反 `(aggregate_type, aggregate_id, sequence_number)` 唯一约束时报 `Conflict`
    async fn insert_outbox(&mut self, records: &[OutboxRecord]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// 一次认领请求
#[derive(Debug, Clone, Builder)]
pub struct ClaimRequest {
    /// 本批次的新令牌
    #[builder(default)]
    pub token: ClaimToken,
    pub batch_size: usize,
    /// 租约时长
    pub lease: chrono::Duration,
    #[builder(default = Utc::now())]
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.now + self.lease
    }
}

/// 各状态的记录数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    counts: HashMap<OutboxStatus, u64>,
}

impl StatusCounts {
    pub fn get(&self, status: OutboxStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub(crate) fn set(&mut self, status: OutboxStatus, count: u64) {
        self.counts.insert(status, count);
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// 投递器一侧的 Outbox 访问
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 认领至多 `batch_size` 条可认领记录，按 `(聚合, 序列号)` 排序返回。
    ///
    /// 可认领：`Pending`/`Failed` 且无令牌、退避已结束；或 `Claimed` 且租约已过期。
    /// 只有当同一聚合中所有更早的未终结记录也在本批次中被认领时，一条记录才会被认领。
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<OutboxRecord>>;

    /// `Claimed`+令牌匹配 → `Dispatched`；返回是否生效
    async fn mark_dispatched(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Claimed`+令牌匹配 → `Failed`，尝试次数加一，`retry_at` 之前不可认领
    async fn mark_failed(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Claimed`+令牌匹配 → `DeadLettered`（终态），尝试次数加一
    async fn mark_dead_lettered(
        &self,
        message_id: MessageId,
        token: ClaimToken,
        error: &str,
    ) -> Result<bool>;

    /// 放弃认领但不计入尝试次数（`Claimed` → `Pending`）
    async fn release(&self, message_id: MessageId, token: ClaimToken) -> Result<bool>;

    /// 将租约已过期的 `Claimed` 记录退回 `Pending`，按旧令牌匹配；返回回收数量
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, message_id: MessageId) -> Result<Option<OutboxRecord>>;

    /// 列出死信记录（按聚合与序列号排序）
    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// 人工重新入队：`DeadLettered` → `Pending`，尝试次数清零
    async fn requeue_dead_lettered(&self, message_id: MessageId, now: DateTime<Utc>)
    -> Result<bool>;

    async fn status_counts(&self) -> Result<StatusCounts>;

    /// 清理 `dispatched_at` 早于 `older_than` 的已投递记录；返回删除数量
    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// 业务状态读取
#[async_trait]
pub trait StateReader: Send + Sync {
    /// `include_deleted = false` 时软删除的行不可见
    async fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        include_deleted: bool,
    ) -> Result<Option<AggregateState>>;
}

#[async_trait]
impl<T> TransactionalStore for Arc<T>
where
    T: TransactionalStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        (**self).begin().await
    }
}

#[async_trait]
impl<T> StateReader for Arc<T>
where
    T: StateReader + ?Sized,
{
    async fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        include_deleted: bool,
    ) -> Result<Option<AggregateState>> {
        (**self)
            .load_state(aggregate_type, aggregate_id, include_deleted)
            .await
    }
}
